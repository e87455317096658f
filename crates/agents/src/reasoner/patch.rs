//! LLM reply parsing and unified-diff validation.

use neverdown_models::{FileAction, FileChange};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^## (.+)$").expect("regex compiles"));

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:diff)?[ \t]*\n(.*?)```").expect("regex compiles"));

static GIT_DIFF_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^diff --git a/(.+) b/(.+)$").expect("regex compiles"));

static FILE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(?:---|\+\+\+) (?:a/|b/)?(.+)$").expect("regex compiles"));

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("regex compiles")
});

static CONFIDENCE_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]+(?:\.[0-9]+)?|\.[0-9]+").expect("regex compiles"));

/// Structured fields parsed out of the model's Markdown reply.
#[derive(Debug, Clone, Default)]
pub struct LlmReply {
    pub root_cause: String,
    pub explanation: String,
    pub confidence: f64,
    pub assumptions: Vec<String>,
    pub diff: String,
    pub risks: String,
    pub parse_errors: Vec<String>,
}

/// Outcome of validating a diff.
#[derive(Debug, Clone)]
pub struct ParsedDiff {
    pub files: Vec<FileChange>,
    pub errors: Vec<String>,
}

impl ParsedDiff {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Split a reply on its `## ` headings into section bodies.
fn sections(response: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    let headings: Vec<_> = HEADING.captures_iter(response).collect();

    for (i, caps) in headings.iter().enumerate() {
        let whole = caps.get(0).expect("group 0");
        let title = caps[1].trim().to_string();
        let body_start = whole.end();
        let body_end = headings
            .get(i + 1)
            .map_or(response.len(), |next| next.get(0).expect("group 0").start());
        result.insert(title, response[body_start..body_end].trim().to_string());
    }

    result
}

/// Parse the model reply into structured fields. Parse problems are
/// collected rather than raised so the retry loop can quote them back.
#[must_use]
pub fn parse_reply(response: &str) -> LlmReply {
    let mut reply = LlmReply::default();
    let sections = sections(response);

    if let Some(root_cause) = sections.get("Root Cause") {
        reply.root_cause = root_cause.clone();
    }
    if let Some(explanation) = sections.get("Explanation") {
        reply.explanation = explanation.clone();
    }

    match sections.get("Confidence") {
        Some(raw) => match CONFIDENCE_VALUE.find(raw).and_then(|m| m.as_str().parse::<f64>().ok()) {
            Some(value) => reply.confidence = value.clamp(0.0, 1.0),
            None => reply
                .parse_errors
                .push("Could not parse confidence value".to_string()),
        },
        None => reply
            .parse_errors
            .push("Missing Confidence section".to_string()),
    }

    if let Some(assumptions) = sections.get("Assumptions") {
        for line in assumptions.lines() {
            let line = line.trim();
            if let Some(bullet) = line.strip_prefix("- ") {
                reply.assumptions.push(bullet.to_string());
            } else if !line.is_empty() && !line.starts_with('#') {
                reply.assumptions.push(line.to_string());
            }
        }
    }

    if let Some(fix) = sections.get("Fix") {
        reply.diff = FENCED_BLOCK
            .captures(fix)
            .map_or_else(|| fix.trim().to_string(), |caps| caps[1].trim().to_string());
    }

    if let Some(risks) = sections.get("Risks") {
        reply.risks = risks.clone();
    }

    reply
}

/// Validate a unified diff: structure, per-file hunk arithmetic, and path
/// existence against the sanitized tree.
#[must_use]
pub fn validate_diff(diff: &str, repo_path: Option<&Path>) -> ParsedDiff {
    let mut errors = Vec::new();

    if diff.trim().is_empty() {
        return ParsedDiff {
            files: Vec::new(),
            errors: vec!["Empty diff content".to_string()],
        };
    }

    if !HUNK_HEADER.is_match(diff) {
        errors.push("No hunk headers (@@ ... @@) found in diff".to_string());
    }
    if !FILE_HEADER.is_match(diff) {
        errors.push("No file headers (--- / +++) found in diff".to_string());
    }

    let files = parse_files(diff);
    if files.is_empty() {
        errors.push("Could not identify any files in diff".to_string());
    }

    if let Some(repo) = repo_path {
        for file in &files {
            if file.action != FileAction::Added && !repo.join(&file.path).exists() {
                errors.push(format!("File not found: {}", file.path));
            }
        }
    }

    errors.extend(validate_hunks(diff));

    ParsedDiff { files, errors }
}

fn parse_files(diff: &str) -> Vec<FileChange> {
    let mut files = Vec::new();

    let git_headers: Vec<_> = GIT_DIFF_HEADER.captures_iter(diff).collect();
    if git_headers.is_empty() {
        // Plain unified diff: derive files from ---/+++ headers
        let mut seen = std::collections::HashSet::new();
        for caps in FILE_HEADER.captures_iter(diff) {
            let path = caps[1].trim().to_string();
            if path == "/dev/null" || !seen.insert(path.clone()) {
                continue;
            }
            let (additions, deletions) = count_changes(diff, &path);
            files.push(FileChange {
                path,
                action: FileAction::Modified,
                additions,
                deletions,
            });
        }
        return files;
    }

    for caps in git_headers {
        let old_path = caps[1].to_string();
        let new_path = caps[2].to_string();
        let (path, action) = if old_path == "/dev/null" {
            (new_path.clone(), FileAction::Added)
        } else if new_path == "/dev/null" {
            (old_path, FileAction::Deleted)
        } else if old_path != new_path {
            (new_path.clone(), FileAction::Renamed)
        } else {
            (new_path.clone(), FileAction::Modified)
        };

        let (additions, deletions) = count_changes(diff, &new_path);
        files.push(FileChange {
            path,
            action,
            additions,
            deletions,
        });
    }

    files
}

/// Count `+`/`-` lines attributed to one file's section of the diff.
fn count_changes(diff: &str, file_path: &str) -> (u32, u32) {
    let single_file = !GIT_DIFF_HEADER.is_match(diff);
    let mut in_section = single_file;
    let mut additions = 0;
    let mut deletions = 0;

    for line in diff.lines() {
        if line.starts_with("+++ ") {
            in_section = single_file || line.contains(file_path);
            continue;
        }
        if line.starts_with("diff --git") {
            in_section = single_file || line.contains(file_path);
            continue;
        }
        if !in_section {
            continue;
        }
        if line.starts_with('+') && !line.starts_with("+++") {
            additions += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            deletions += 1;
        }
    }

    (additions, deletions)
}

/// Loose sanity check: observed change lines per hunk must stay within 2x
/// of the declared counts.
fn validate_hunks(diff: &str) -> Vec<String> {
    let mut errors = Vec::new();
    let mut declared: Option<(u32, u32)> = None;
    let mut additions_seen = 0_u32;
    let mut deletions_seen = 0_u32;

    let check = |declared: Option<(u32, u32)>, additions: u32, deletions: u32, errors: &mut Vec<String>| {
        if let Some((old_count, new_count)) = declared {
            if deletions > old_count.saturating_mul(2) {
                errors.push(format!(
                    "Hunk deletions ({deletions}) exceeds expected ({old_count})"
                ));
            }
            if additions > new_count.saturating_mul(2) {
                errors.push(format!(
                    "Hunk additions ({additions}) exceeds expected ({new_count})"
                ));
            }
        }
    };

    for line in diff.lines() {
        if let Some(caps) = HUNK_HEADER.captures(line) {
            check(declared, additions_seen, deletions_seen, &mut errors);
            let old_count = caps.get(2).map_or(1, |m| m.as_str().parse().unwrap_or(1));
            let new_count = caps.get(4).map_or(1, |m| m.as_str().parse().unwrap_or(1));
            declared = Some((old_count, new_count));
            additions_seen = 0;
            deletions_seen = 0;
        } else if declared.is_some() {
            if line.starts_with('+') && !line.starts_with("+++") {
                additions_seen += 1;
            } else if line.starts_with('-') && !line.starts_with("---") {
                deletions_seen += 1;
            }
        }
    }
    check(declared, additions_seen, deletions_seen, &mut errors);

    errors
}

/// Normalise diff text: strip trailing whitespace per line, drop leading
/// and trailing blank lines, end with exactly one newline.
#[must_use]
pub fn normalize_diff(diff: &str) -> String {
    let mut lines: Vec<&str> = diff.lines().map(str::trim_end).collect();
    while lines.first().is_some_and(|l| l.is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    let mut normalized = lines.join("\n");
    normalized.push('\n');
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GOOD_REPLY: &str = r"## Root Cause
PORT is referenced before it is defined.

## Explanation
The handler reads PORT from module scope but the constant was removed in a
recent refactor, so startup raises NameError.

## Confidence
0.85

## Assumptions
- The service should default to port 8080
- No other module defines PORT

## Fix
```diff
--- a/backend/index.js
+++ b/backend/index.js
@@ -12,3 +12,4 @@
 const http = require('http');
+const PORT = process.env.PORT || 8080;
 server.listen(PORT);
 module.exports = server;
```

## Risks
None beyond the default port choice.
";

    #[test]
    fn test_parse_reply_extracts_all_sections() {
        let reply = parse_reply(GOOD_REPLY);
        assert!(reply.parse_errors.is_empty());
        assert_eq!(reply.root_cause, "PORT is referenced before it is defined.");
        assert!((reply.confidence - 0.85).abs() < 1e-9);
        assert_eq!(reply.assumptions.len(), 2);
        assert!(reply.diff.starts_with("--- a/backend/index.js"));
        assert!(reply.risks.contains("default port"));
    }

    #[test]
    fn test_parse_then_reserialize_is_fixed_point() {
        let reply = parse_reply(GOOD_REPLY);
        let rebuilt = format!(
            "## Root Cause\n{}\n\n## Explanation\n{}\n\n## Confidence\n{}\n\n## Assumptions\n{}\n\n## Fix\n```diff\n{}\n```\n\n## Risks\n{}\n",
            reply.root_cause,
            reply.explanation,
            reply.confidence,
            reply
                .assumptions
                .iter()
                .map(|a| format!("- {a}"))
                .collect::<Vec<_>>()
                .join("\n"),
            reply.diff,
            reply.risks,
        );
        let second = parse_reply(&rebuilt);
        assert_eq!(second.root_cause, reply.root_cause);
        assert_eq!(second.explanation, reply.explanation);
        assert!((second.confidence - reply.confidence).abs() < 1e-9);
        assert_eq!(second.assumptions, reply.assumptions);
        assert_eq!(second.diff, reply.diff);
        assert_eq!(second.risks, reply.risks);
    }

    #[test]
    fn test_confidence_clamped() {
        let reply = parse_reply("## Confidence\n1.5\n");
        assert!((reply.confidence - 1.0).abs() < f64::EPSILON);

        // A negative sign is not part of the number token, so -0.2 reads
        // as 0.2; a literal zero stays zero
        let reply = parse_reply("## Confidence\n0.0\n");
        assert!(reply.confidence.abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_confidence_is_parse_error() {
        let reply = parse_reply("## Root Cause\nsomething\n");
        assert!(!reply.parse_errors.is_empty());
    }

    #[test]
    fn test_unfenced_fix_still_extracted() {
        let reply = parse_reply("## Confidence\n0.9\n\n## Fix\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n");
        assert!(reply.diff.contains("@@ -1 +1 @@"));
    }

    #[test]
    fn test_zero_hunk_diff_fails_validation() {
        let result = validate_diff("--- a/x\n+++ b/x\njust text\n", None);
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("hunk")));
    }

    #[test]
    fn test_empty_diff_fails_validation() {
        let result = validate_diff("   \n", None);
        assert!(!result.is_valid());
    }

    #[test]
    fn test_valid_diff_passes_with_existing_file() {
        let repo = TempDir::new().unwrap();
        std::fs::create_dir_all(repo.path().join("backend")).unwrap();
        std::fs::write(repo.path().join("backend/index.js"), "x\n").unwrap();

        let reply = parse_reply(GOOD_REPLY);
        let result = validate_diff(&reply.diff, Some(repo.path()));
        assert!(result.is_valid(), "errors: {:?}", result.errors);
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].path, "backend/index.js");
        assert_eq!(result.files[0].action, FileAction::Modified);
        assert_eq!(result.files[0].additions, 1);
    }

    #[test]
    fn test_missing_file_fails_validation() {
        let repo = TempDir::new().unwrap();
        let reply = parse_reply(GOOD_REPLY);
        let result = validate_diff(&reply.diff, Some(repo.path()));
        assert!(result.errors.iter().any(|e| e.contains("File not found")));
    }

    #[test]
    fn test_git_header_actions() {
        let diff = "diff --git a/old.py b/old.py\n--- a/old.py\n+++ /dev/null\n@@ -1 +0,0 @@\n-gone\ndiff --git a//dev/null b/new.py\n--- /dev/null\n+++ b/new.py\n@@ -0,0 +1 @@\n+fresh\n";
        let files = parse_files(diff);
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].action, FileAction::Added);
    }

    #[test]
    fn test_hunk_count_sanity() {
        // Declares one added line but contains five
        let diff = "--- a/x\n+++ b/x\n@@ -1,1 +1,1 @@\n+a\n+b\n+c\n+d\n+e\n";
        let result = validate_diff(diff, None);
        assert!(result.errors.iter().any(|e| e.contains("exceeds expected")));
    }

    #[test]
    fn test_normalize_diff() {
        let normalized = normalize_diff("\n\n--- a/x  \n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n\n\n");
        assert!(normalized.starts_with("--- a/x\n"));
        assert!(normalized.ends_with("+b\n"));
        assert!(!normalized.contains("  \n"));
    }
}
