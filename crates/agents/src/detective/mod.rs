//! Detective stage: deterministic failure localisation.
//!
//! Produces ranked suspect files and a failure category from raw log text
//! plus the sanitized working tree. Never invokes a language model: all
//! analysis here is regex parsing, scoring arithmetic and git history.

pub mod git_analyzer;
pub mod log_parser;

use chrono::Utc;
use git_analyzer::GitAnalyzer;
use log_parser::{is_library_path, LogParser};
use neverdown_common::{AgentFailure, ErrorCode};
use neverdown_models::{
    DetectiveReport, ErrorInfo, FailureCategory, RecentChange, SuspectedFile, SuspectedFunction,
};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;
use uuid::Uuid;

/// Error kinds that almost always point at a real code bug.
const DEFINITE_BUG_KINDS: &[&str] = &["nameerror", "typeerror", "syntaxerror", "attributeerror"];

static PY_FUNC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"File "([^"]+)", line (\d+), in (\w+)"#).expect("regex compiles")
});

static JS_FUNC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"at (\w+) \(([^:]+):(\d+)").expect("regex compiles"));

/// Input for the Detective stage.
#[derive(Debug, Default)]
pub struct DetectiveInput {
    pub logs: Option<String>,
    pub stack_trace: Option<String>,
    pub ci_output: Option<String>,
}

/// The detective agent.
pub struct Detective {
    commit_window: usize,
}

impl Detective {
    #[must_use]
    pub fn new() -> Self {
        Self { commit_window: 10 }
    }

    /// Analyse the failure and rank suspects.
    pub async fn analyze(
        &self,
        incident_id: Uuid,
        sanitized_path: &Path,
        input: &DetectiveInput,
    ) -> Result<DetectiveReport, AgentFailure> {
        if !sanitized_path.is_dir() {
            return Err(AgentFailure::new(
                ErrorCode::DetectiveError,
                format!("repository path does not exist: {}", sanitized_path.display()),
            ));
        }

        let mut errors: Vec<ErrorInfo> = Vec::new();
        for source in [&input.logs, &input.stack_trace, &input.ci_output]
            .into_iter()
            .flatten()
        {
            errors.extend(parse_source(source));
        }

        if errors.is_empty() {
            warn!("No errors found in provided logs");
            return Ok(DetectiveReport {
                incident_id,
                errors: Vec::new(),
                failure_category: FailureCategory::Unknown,
                suspected_files: Vec::new(),
                suspected_functions: Vec::new(),
                recent_changes: Vec::new(),
                evidence: vec!["No errors found in logs".to_string()],
                overall_confidence: 0.0,
                created_at: Utc::now(),
            });
        }

        let primary = errors[0].clone();
        let failure_category = LogParser::categorize(&primary);

        let mut suspected_files: Vec<SuspectedFile> = Vec::new();
        let mut suspected_functions: Vec<SuspectedFunction> = Vec::new();

        for error in &errors {
            let Some(path) = &error.file_path else {
                continue;
            };

            if let Some(existing) = suspected_files.iter_mut().find(|f| &f.path == path) {
                // Another error in the same file compounds the suspicion
                existing.confidence = (existing.confidence + 0.2).min(1.0);
                if let Some(line) = error.line {
                    if !existing.line_numbers.contains(&line) {
                        existing.line_numbers.push(line);
                    }
                }
                existing.evidence.push(format!("{}: {}", error.kind, error.message));
            } else {
                suspected_files.push(SuspectedFile {
                    path: path.clone(),
                    confidence: file_confidence(error),
                    line_numbers: error.line.into_iter().collect(),
                    evidence: vec![format!("{}: {}", error.kind, error.message)],
                });
            }

            if let Some(func) = function_from_trace(error) {
                suspected_functions.push(func);
            }
        }

        // Git history enrichment against the sanitized tree
        let analyzer = GitAnalyzer::new(sanitized_path);
        let commits = analyzer.recent_commits(self.commit_window).await;

        let mut relevant_changes: Vec<RecentChange> = Vec::new();
        for suspect in &mut suspected_files {
            let changes = GitAnalyzer::relevant_changes(&suspect.path, &commits);
            if let Some(top) = changes.first() {
                suspect.confidence = (suspect.confidence + 0.2).min(1.0);
                let message: String = top.message.chars().take(50).collect();
                suspect
                    .evidence
                    .push(format!("Recently changed in commit: {message}"));
            }
            relevant_changes.extend(changes);
        }

        let mut seen_shas = HashSet::new();
        relevant_changes.retain(|c| seen_shas.insert(c.commit_sha.clone()));
        relevant_changes.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        relevant_changes.truncate(5);

        suspected_files.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let overall_confidence = suspected_files.first().map_or(0.0, |f| f.confidence);

        let mut evidence = vec![
            format!("Found {} error(s) in logs", errors.len()),
            format!("Primary error: {}: {}", primary.kind, primary.message),
        ];
        if let Some(top) = suspected_files.first() {
            evidence.push(format!(
                "Top suspect: {} (confidence: {:.2})",
                top.path, top.confidence
            ));
        }
        if !relevant_changes.is_empty() {
            evidence.push(format!(
                "Found {} potentially relevant recent commit(s)",
                relevant_changes.len()
            ));
        }

        suspected_files.truncate(10);
        suspected_functions.truncate(10);

        Ok(DetectiveReport {
            incident_id,
            errors,
            failure_category,
            suspected_files,
            suspected_functions,
            recent_changes: relevant_changes,
            evidence,
            overall_confidence,
            created_at: Utc::now(),
        })
    }
}

impl Default for Detective {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one log source, trying JSON-lines first when the content looks
/// structured.
fn parse_source(content: &str) -> Vec<ErrorInfo> {
    let looks_structured = content
        .lines()
        .find(|l| !l.trim().is_empty())
        .is_some_and(|l| l.trim_start().starts_with('{'));

    if looks_structured {
        let errors = LogParser::parse_json_lines(content);
        if !errors.is_empty() {
            return errors;
        }
    }
    LogParser::parse(content)
}

/// Base confidence that a file contains the bug.
fn file_confidence(error: &ErrorInfo) -> f64 {
    let mut confidence: f64 = 0.5;

    if error.line.is_some() {
        confidence += 0.2;
    }
    if DEFINITE_BUG_KINDS.contains(&error.kind.to_lowercase().as_str()) {
        confidence += 0.2;
    }
    if error
        .file_path
        .as_deref()
        .is_some_and(|p| is_library_path(&p.to_lowercase()))
    {
        confidence -= 0.3;
    }

    confidence.clamp(0.1, 1.0)
}

/// Pull the most specific function name out of a stack trace.
fn function_from_trace(error: &ErrorInfo) -> Option<SuspectedFunction> {
    let trace = error.stack_trace.as_deref()?;
    error.file_path.as_deref()?;

    if let Some(caps) = PY_FUNC.captures_iter(trace).last() {
        return Some(SuspectedFunction {
            name: caps[3].to_string(),
            file_path: caps[1].to_string(),
            start_line: caps[2].parse().unwrap_or(0),
            confidence: 0.8,
        });
    }

    if let Some(caps) = JS_FUNC.captures_iter(trace).last() {
        return Some(SuspectedFunction {
            name: caps[1].to_string(),
            file_path: caps[2].to_string(),
            start_line: caps[3].parse().unwrap_or(0),
            confidence: 0.8,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn input_with_logs(logs: &str) -> DetectiveInput {
        DetectiveInput {
            logs: Some(logs.to_string()),
            stack_trace: None,
            ci_output: None,
        }
    }

    #[tokio::test]
    async fn test_name_error_scenario() {
        let repo = TempDir::new().unwrap();
        let logs = "Traceback (most recent call last):\n  File \"backend/index.js\", line 15, in start\n    bind(PORT)\nNameError: name 'PORT' is not defined\n";

        let report = Detective::new()
            .analyze(Uuid::new_v4(), repo.path(), &input_with_logs(logs))
            .await
            .unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, "NameError");
        assert_eq!(report.failure_category, FailureCategory::Name);
        assert_eq!(report.suspected_files.len(), 1);
        let suspect = &report.suspected_files[0];
        assert_eq!(suspect.path, "backend/index.js");
        assert!(suspect.confidence >= 0.7);
        assert!(suspect.line_numbers.contains(&15));
    }

    #[tokio::test]
    async fn test_no_errors_yields_empty_report() {
        let repo = TempDir::new().unwrap();
        let report = Detective::new()
            .analyze(Uuid::new_v4(), repo.path(), &input_with_logs("all fine here"))
            .await
            .unwrap();
        assert!(report.errors.is_empty());
        assert!(report.suspected_files.is_empty());
        assert!((report.overall_confidence).abs() < f64::EPSILON);
        assert_eq!(report.failure_category, FailureCategory::Unknown);
    }

    #[tokio::test]
    async fn test_missing_tree_is_an_error() {
        let err = Detective::new()
            .analyze(
                Uuid::new_v4(),
                Path::new("/nope/nothing"),
                &DetectiveInput::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DetectiveError);
    }

    #[tokio::test]
    async fn test_repeated_errors_compound_confidence() {
        let repo = TempDir::new().unwrap();
        let logs = "Traceback (most recent call last):\n  File \"svc/api.py\", line 3, in a\n    x\nTypeError: bad one\nTraceback (most recent call last):\n  File \"svc/api.py\", line 9, in b\n    y\nTypeError: bad two\n";

        let report = Detective::new()
            .analyze(Uuid::new_v4(), repo.path(), &input_with_logs(logs))
            .await
            .unwrap();

        assert_eq!(report.suspected_files.len(), 1);
        let suspect = &report.suspected_files[0];
        // 0.9 base (line + definite kind) + 0.2 compound, capped at 1.0
        assert!((suspect.confidence - 1.0).abs() < 1e-9);
        assert_eq!(suspect.line_numbers, vec![3, 9]);
        assert_eq!(suspect.evidence.len(), 2);
    }

    #[tokio::test]
    async fn test_library_paths_score_lower() {
        let repo = TempDir::new().unwrap();
        let logs = "Traceback (most recent call last):\n  File \"/venv/lib/site-packages/lib.py\", line 5, in f\n    z\nValueError: inner\n";

        let report = Detective::new()
            .analyze(Uuid::new_v4(), repo.path(), &input_with_logs(logs))
            .await
            .unwrap();

        let suspect = &report.suspected_files[0];
        // 0.5 + 0.2 (line) - 0.3 (library path)
        assert!((suspect.confidence - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_json_logs_supported() {
        let repo = TempDir::new().unwrap();
        let logs = "{\"level\": \"error\", \"message\": \"boom\", \"filename\": \"svc/worker.py\", \"lineno\": 7}\n";

        let report = Detective::new()
            .analyze(Uuid::new_v4(), repo.path(), &input_with_logs(logs))
            .await
            .unwrap();

        assert_eq!(report.suspected_files[0].path, "svc/worker.py");
    }

    #[tokio::test]
    async fn test_function_extraction() {
        let repo = TempDir::new().unwrap();
        let logs = "Traceback (most recent call last):\n  File \"svc/api.py\", line 3, in handle\n    x\nTypeError: bad\n";

        let report = Detective::new()
            .analyze(Uuid::new_v4(), repo.path(), &input_with_logs(logs))
            .await
            .unwrap();

        assert_eq!(report.suspected_functions.len(), 1);
        assert_eq!(report.suspected_functions[0].name, "handle");
        assert_eq!(report.suspected_functions[0].start_line, 3);
    }

    #[test]
    fn test_evidence_lines_present() {
        // Pure check on the confidence helper used for ranking
        let error = ErrorInfo {
            kind: "NameError".to_string(),
            message: "x".to_string(),
            file_path: Some("app.py".to_string()),
            line: Some(3),
            stack_trace: None,
        };
        assert!((file_confidence(&error) - 0.9).abs() < 1e-9);
    }
}
