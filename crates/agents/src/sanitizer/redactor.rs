//! Secret replacement with stable semantic placeholders.

use super::patterns::{is_high_entropy, SecretMatch};
use neverdown_models::Severity;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// A single replacement applied to file content.
#[derive(Debug, Clone)]
pub struct RedactionEntry {
    pub original_text: String,
    pub replacement: String,
    pub line_number: u32,
    pub pattern_name: String,
    pub severity: Severity,
}

/// Result of redacting one file's content.
#[derive(Debug, Clone)]
pub struct RedactionResult {
    pub redacted_content: String,
    pub entries: Vec<RedactionEntry>,
}

static ENV_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)=(.*)$").expect("env regex compiles"));

/// Env var key substrings that mark the value as a secret.
const SECRET_KEY_INDICATORS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "token",
    "key",
    "auth",
    "credential",
    "private",
    "access_key",
    "secret_key",
];

/// Replaces matched secrets with placeholders.
///
/// The cache guarantees that one literal secret maps to the same
/// placeholder for the whole sanitization pass, which keeps downstream
/// diffs stable when a secret appears in several files.
pub struct Redactor {
    cache: HashMap<String, String>,
    entropy_threshold: f64,
    min_entropy_length: usize,
}

impl Redactor {
    #[must_use]
    pub fn new(entropy_threshold: f64, min_entropy_length: usize) -> Self {
        Self {
            cache: HashMap::new(),
            entropy_threshold,
            min_entropy_length,
        }
    }

    /// Redact all matches in `content`. Matches are applied back-to-front
    /// so earlier byte offsets stay valid while replacing.
    pub fn redact(&mut self, content: &str, matches: &[SecretMatch]) -> RedactionResult {
        if matches.is_empty() {
            return RedactionResult {
                redacted_content: content.to_string(),
                entries: Vec::new(),
            };
        }

        let mut sorted: Vec<&SecretMatch> = matches.iter().collect();
        sorted.sort_by(|a, b| b.start.cmp(&a.start));

        let mut redacted = content.to_string();
        let mut entries = Vec::new();

        for m in &sorted {
            let replacement = self.replacement_for(m);
            redacted.replace_range(m.start..m.end, &replacement);
            entries.push(RedactionEntry {
                original_text: m.text.clone(),
                replacement,
                line_number: m.line_number,
                pattern_name: m.pattern_name.clone(),
                severity: m.severity,
            });
        }

        entries.reverse();
        RedactionResult {
            redacted_content: redacted,
            entries,
        }
    }

    fn replacement_for(&mut self, m: &SecretMatch) -> String {
        let cache_key = format!("{}:{}", m.pattern_name, m.text);
        if let Some(cached) = self.cache.get(&cache_key) {
            return cached.clone();
        }
        self.cache.insert(cache_key, m.placeholder.clone());
        m.placeholder.clone()
    }

    /// Redact a `.env`-style file line by line, preserving key names and
    /// surrounding quotes. Values that already carry a placeholder are
    /// left alone so a second pass finds nothing new.
    pub fn redact_env_file(&mut self, content: &str) -> RedactionResult {
        let mut redacted_lines = Vec::new();
        let mut entries = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            let stripped = line.trim();
            if stripped.is_empty() || stripped.starts_with('#') {
                redacted_lines.push(line.to_string());
                continue;
            }

            let Some(caps) = ENV_LINE.captures(stripped) else {
                redacted_lines.push(line.to_string());
                continue;
            };
            let key = &caps[1];
            let value = &caps[2];

            if !self.is_secret_env_entry(key, value) {
                redacted_lines.push(line.to_string());
                continue;
            }

            let redacted_value = if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
                "\"<REDACTED>\"".to_string()
            } else if value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2 {
                "'<REDACTED>'".to_string()
            } else {
                "<REDACTED>".to_string()
            };

            redacted_lines.push(format!("{key}={redacted_value}"));
            entries.push(RedactionEntry {
                original_text: value.to_string(),
                replacement: redacted_value,
                line_number: idx as u32 + 1,
                pattern_name: "env_file_value".to_string(),
                severity: Severity::High,
            });
        }

        // Preserve a trailing newline if the input had one
        let mut redacted_content = redacted_lines.join("\n");
        if content.ends_with('\n') {
            redacted_content.push('\n');
        }

        RedactionResult {
            redacted_content,
            entries,
        }
    }

    fn is_secret_env_entry(&self, key: &str, value: &str) -> bool {
        let bare = value.trim_matches(|c| c == '"' || c == '\'');

        // Empty values and placeholders (ours or the project's own) are
        // not secrets
        if bare.is_empty() || bare.starts_with('<') || bare == "xxx" {
            return false;
        }

        let key_lower = key.to_lowercase();
        if SECRET_KEY_INDICATORS.iter().any(|s| key_lower.contains(s)) {
            return true;
        }

        if ["postgresql://", "postgres://", "mysql://", "mongodb://"]
            .iter()
            .any(|p| bare.starts_with(p))
        {
            return true;
        }

        bare.len() > 20
            && bare.chars().all(|c| c.is_ascii_alphanumeric() || "+/=-_".contains(c))
            && is_high_entropy(bare, self.entropy_threshold, self.min_entropy_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret_match(text: &str, start: usize, placeholder: &str) -> SecretMatch {
        SecretMatch {
            pattern_name: "test_pattern".to_string(),
            text: text.to_string(),
            start,
            end: start + text.len(),
            line_number: 1,
            placeholder: placeholder.to_string(),
            severity: Severity::High,
            confidence: 1.0,
        }
    }

    #[test]
    fn test_back_to_front_replacement_keeps_offsets_valid() {
        let content = "first SECRET1 then SECRET2 end";
        let matches = vec![
            secret_match("SECRET1", 6, "<REDACTED_A>"),
            secret_match("SECRET2", 19, "<REDACTED_B>"),
        ];
        let mut redactor = Redactor::new(4.5, 16);
        let result = redactor.redact(content, &matches);
        assert_eq!(result.redacted_content, "first <REDACTED_A> then <REDACTED_B> end");
        assert_eq!(result.entries.len(), 2);
        // Entries come back in original order
        assert_eq!(result.entries[0].original_text, "SECRET1");
    }

    #[test]
    fn test_same_secret_gets_same_placeholder() {
        let mut redactor = Redactor::new(4.5, 16);
        let m = secret_match("tok", 0, "<REDACTED_X>");
        let first = redactor.replacement_for(&m);
        let second = redactor.replacement_for(&m);
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_matches_leaves_content_untouched() {
        let mut redactor = Redactor::new(4.5, 16);
        let result = redactor.redact("clean content", &[]);
        assert_eq!(result.redacted_content, "clean content");
        assert!(result.entries.is_empty());
    }

    #[test]
    fn test_env_secret_key_redacted_with_quotes_preserved() {
        let mut redactor = Redactor::new(4.5, 16);
        let result = redactor.redact_env_file("DB_PASSWORD=\"hunter2\"\nAPP_NAME=widget\n");
        assert!(result.redacted_content.contains("DB_PASSWORD=\"<REDACTED>\""));
        assert!(result.redacted_content.contains("APP_NAME=widget"));
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].line_number, 1);
    }

    #[test]
    fn test_env_comments_and_blanks_untouched() {
        let mut redactor = Redactor::new(4.5, 16);
        let content = "# comment\n\nTOKEN=abc\n";
        let result = redactor.redact_env_file(content);
        assert!(result.redacted_content.starts_with("# comment\n\n"));
        assert!(result.redacted_content.contains("TOKEN=<REDACTED>"));
    }

    #[test]
    fn test_env_database_url_value_redacted() {
        let mut redactor = Redactor::new(4.5, 16);
        let result = redactor.redact_env_file("DB=postgresql://u:p@h/d\n");
        assert!(result.redacted_content.contains("DB=<REDACTED>"));
    }

    #[test]
    fn test_env_placeholder_values_not_redacted_again() {
        let mut redactor = Redactor::new(4.5, 16);
        let content = "AWS_SECRET_ACCESS_KEY=<REDACTED_AWS_SECRET_KEY>\n";
        let result = redactor.redact_env_file(content);
        assert_eq!(result.redacted_content, content);
        assert!(result.entries.is_empty());
    }

    #[test]
    fn test_env_plain_values_left_alone() {
        let mut redactor = Redactor::new(4.5, 16);
        let result = redactor.redact_env_file("PORT=8080\nDEBUG=true\n");
        assert!(result.entries.is_empty());
    }
}
