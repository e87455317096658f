//! Artifacts produced by the Sanitizer and Detective stages.

use crate::incident::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Closed classification of failures assigned by the Detective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Logic,
    Database,
    Timeout,
    ConfigMismatch,
    DependencyVersion,
    Type,
    Name,
    Import,
    Syntax,
    Permission,
    Connection,
    Unknown,
}

impl FailureCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logic => "logic",
            Self::Database => "database",
            Self::Timeout => "timeout",
            Self::ConfigMismatch => "config_mismatch",
            Self::DependencyVersion => "dependency_version",
            Self::Type => "type",
            Self::Name => "name",
            Self::Import => "import",
            Self::Syntax => "syntax",
            Self::Permission => "permission",
            Self::Connection => "connection",
            Self::Unknown => "unknown",
        }
    }
}

/// A single error extracted from log text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Exception or error kind name, e.g. `NameError`
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub stack_trace: Option<String>,
}

/// A file suspected to contain the fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspectedFile {
    pub path: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub line_numbers: Vec<u32>,
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// A function suspected to contain the fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspectedFunction {
    pub name: String,
    pub file_path: String,
    pub start_line: u32,
    pub confidence: f64,
}

/// A recent commit scored for relevance to a suspect file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentChange {
    pub commit_sha: String,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Relevance in [0, 1]
    pub relevance: f64,
}

/// Output of the Detective stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectiveReport {
    pub incident_id: Uuid,
    pub errors: Vec<ErrorInfo>,
    pub failure_category: FailureCategory,
    pub suspected_files: Vec<SuspectedFile>,
    #[serde(default)]
    pub suspected_functions: Vec<SuspectedFunction>,
    #[serde(default)]
    pub recent_changes: Vec<RecentChange>,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub overall_confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl DetectiveReport {
    /// Highest-confidence suspect, if any.
    #[must_use]
    pub fn top_suspect(&self) -> Option<&SuspectedFile> {
        self.suspected_files
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

/// One redaction performed by the Sanitizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizationEntry {
    pub file_path: String,
    pub line_number: u32,
    /// Pattern name, `high_entropy`, or `env_file_value`
    pub secret_kind: String,
    pub placeholder: String,
    pub severity: Severity,
}

/// Output of the Sanitizer stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizationReport {
    pub incident_id: Uuid,
    pub sanitized_path: String,
    pub total_files_scanned: usize,
    pub total_secrets_found: usize,
    pub entries: Vec<SanitizationEntry>,
    pub entropy_detections: usize,
    pub pattern_matches: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<String, usize>,
    pub halted: bool,
    pub created_at: DateTime<Utc>,
}

impl SanitizationReport {
    /// Empty report for a freshly scanned tree.
    #[must_use]
    pub fn empty(incident_id: Uuid, sanitized_path: impl Into<String>) -> Self {
        Self {
            incident_id,
            sanitized_path: sanitized_path.into(),
            total_files_scanned: 0,
            total_secrets_found: 0,
            entries: Vec::new(),
            entropy_detections: 0,
            pattern_matches: 0,
            by_severity: BTreeMap::new(),
            by_kind: BTreeMap::new(),
            halted: false,
            created_at: Utc::now(),
        }
    }

    /// Record one redaction entry and update the counters.
    pub fn record(&mut self, entry: SanitizationEntry) {
        *self
            .by_severity
            .entry(entry.severity.as_str().to_string())
            .or_insert(0) += 1;
        *self.by_kind.entry(entry.secret_kind.clone()).or_insert(0) += 1;
        if entry.secret_kind == "high_entropy" {
            self.entropy_detections += 1;
        } else {
            self.pattern_matches += 1;
        }
        self.entries.push(entry);
        self.total_secrets_found = self.entries.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_serialization() {
        assert_eq!(
            serde_json::to_string(&FailureCategory::ConfigMismatch).unwrap(),
            "\"config_mismatch\""
        );
        assert_eq!(serde_json::to_string(&FailureCategory::Name).unwrap(), "\"name\"");
    }

    #[test]
    fn test_top_suspect_is_highest_confidence() {
        let report = DetectiveReport {
            incident_id: Uuid::new_v4(),
            errors: vec![],
            failure_category: FailureCategory::Unknown,
            suspected_files: vec![
                SuspectedFile {
                    path: "a.py".to_string(),
                    confidence: 0.4,
                    line_numbers: vec![],
                    evidence: vec![],
                },
                SuspectedFile {
                    path: "b.py".to_string(),
                    confidence: 0.9,
                    line_numbers: vec![],
                    evidence: vec![],
                },
            ],
            suspected_functions: vec![],
            recent_changes: vec![],
            evidence: vec![],
            overall_confidence: 0.9,
            created_at: Utc::now(),
        };
        assert_eq!(report.top_suspect().unwrap().path, "b.py");
    }

    #[test]
    fn test_report_counters() {
        let mut report = SanitizationReport::empty(Uuid::new_v4(), "/tmp/sanitized");
        report.record(SanitizationEntry {
            file_path: "config.env".to_string(),
            line_number: 3,
            secret_kind: "aws_secret_access_key".to_string(),
            placeholder: "<REDACTED_AWS_SECRET_KEY>".to_string(),
            severity: Severity::Critical,
        });
        report.record(SanitizationEntry {
            file_path: "app.py".to_string(),
            line_number: 10,
            secret_kind: "high_entropy".to_string(),
            placeholder: "<REDACTED_HIGH_ENTROPY>".to_string(),
            severity: Severity::Medium,
        });
        assert_eq!(report.total_secrets_found, 2);
        assert_eq!(report.pattern_matches, 1);
        assert_eq!(report.entropy_detections, 1);
        assert_eq!(report.by_severity["critical"], 1);
        assert_eq!(report.by_kind["high_entropy"], 1);
    }
}
