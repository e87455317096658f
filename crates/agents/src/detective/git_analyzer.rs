//! Git history analysis: recent commits scored for relevance to suspects.

use chrono::{DateTime, Utc};
use neverdown_models::RecentChange;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::warn;

/// A recent commit with its changed file list.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub sha: String,
    pub author: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub files_changed: Vec<String>,
}

/// Reads history out of the sanitized working tree's git metadata.
pub struct GitAnalyzer {
    repo_path: PathBuf,
}

impl GitAnalyzer {
    #[must_use]
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    /// The most recent `count` commits. Git failures degrade to an empty
    /// list; history is an enrichment, not a requirement.
    pub async fn recent_commits(&self, count: usize) -> Vec<CommitInfo> {
        let output = Command::new("git")
            .args(["log", &format!("-n{count}"), "--format=%H|%an|%ae|%at|%s"])
            .current_dir(&self.repo_path)
            .output()
            .await;

        let output = match output {
            Ok(o) if o.status.success() => o,
            Ok(o) => {
                warn!(
                    "git log failed: {}",
                    String::from_utf8_lossy(&o.stderr).trim()
                );
                return Vec::new();
            }
            Err(e) => {
                warn!("git log failed to spawn: {e}");
                return Vec::new();
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut commits = Vec::new();
        for line in stdout.lines() {
            let Some(mut commit) = parse_log_line(line) else {
                continue;
            };
            commit.files_changed = self.commit_files(&commit.sha).await;
            commits.push(commit);
        }
        commits
    }

    async fn commit_files(&self, sha: &str) -> Vec<String> {
        let output = Command::new("git")
            .args(["diff-tree", "--no-commit-id", "--name-only", "-r", sha])
            .current_dir(&self.repo_path)
            .output()
            .await;

        match output {
            Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout)
                .lines()
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Score commits against a suspect file. Direct touches score 1.0;
    /// otherwise relatedness of the changed set decides. Scores below 0.3
    /// are discarded and the top five survive, sorted descending.
    #[must_use]
    pub fn relevant_changes(file_path: &str, commits: &[CommitInfo]) -> Vec<RecentChange> {
        let mut relevant: Vec<RecentChange> = commits
            .iter()
            .filter_map(|commit| {
                let relevance = if commit.files_changed.iter().any(|f| f == file_path) {
                    1.0
                } else {
                    let score = relatedness(file_path, &commit.files_changed);
                    if score < 0.3 {
                        return None;
                    }
                    score
                };

                Some(RecentChange {
                    commit_sha: commit.sha.clone(),
                    author: commit.author.clone(),
                    message: commit.message.clone(),
                    timestamp: commit.timestamp,
                    files_changed: commit.files_changed.clone(),
                    relevance,
                })
            })
            .collect();

        relevant.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        relevant.truncate(5);
        relevant
    }
}

fn parse_log_line(line: &str) -> Option<CommitInfo> {
    let mut parts = line.splitn(5, '|');
    let sha = parts.next()?.to_string();
    let author = parts.next()?.to_string();
    let email = parts.next()?.to_string();
    let timestamp = parts.next()?.parse::<i64>().ok()?;
    let message = parts.next()?.to_string();
    if sha.is_empty() {
        return None;
    }
    Some(CommitInfo {
        sha,
        author,
        email,
        timestamp: DateTime::from_timestamp(timestamp, 0)?,
        message,
        files_changed: Vec::new(),
    })
}

/// How related a changed-file set is to a target file.
///
/// Per changed file: 0.6 for the same directory, 0.4 for the same parent
/// directory, +0.2 for a shared extension, +0.3 for a test/source name
/// relationship in either direction. The best-scoring file wins, capped
/// at 1.0.
#[must_use]
pub fn relatedness(target_file: &str, changed_files: &[String]) -> f64 {
    let target = Path::new(target_file);
    let target_dir = target.parent().unwrap_or_else(|| Path::new(""));
    let target_ext = target.extension().and_then(|e| e.to_str());
    let target_stem = target
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();

    let mut max_score: f64 = 0.0;

    for changed in changed_files {
        let changed_path = Path::new(changed);
        let changed_dir = changed_path.parent().unwrap_or_else(|| Path::new(""));
        let changed_stem = changed_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();

        let mut score = 0.0;
        if changed_dir == target_dir {
            score = 0.6;
        } else if changed_dir.parent() == target_dir.parent() {
            score = 0.4;
        }

        if changed_path.extension().and_then(|e| e.to_str()) == target_ext {
            score += 0.2;
        }

        // test_x <-> x relationship, both directions
        let target_is_test = target_file.to_lowercase().contains("test");
        let changed_is_test = changed.to_lowercase().contains("test");
        if target_is_test && changed_stem.contains(&target_stem.replace("test_", "")) {
            score += 0.3;
        } else if changed_is_test && target_stem.contains(&changed_stem.replace("test_", "")) {
            score += 0.3;
        }

        max_score = max_score.max(score);
    }

    max_score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(sha: &str, files: &[&str]) -> CommitInfo {
        CommitInfo {
            sha: sha.to_string(),
            author: "dev".to_string(),
            email: "dev@example.com".to_string(),
            timestamp: Utc::now(),
            message: format!("commit {sha}"),
            files_changed: files.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_direct_touch_scores_one() {
        let commits = vec![commit("aaa", &["src/app.py", "README.md"])];
        let changes = GitAnalyzer::relevant_changes("src/app.py", &commits);
        assert_eq!(changes.len(), 1);
        assert!((changes[0].relevance - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_same_directory_scores() {
        // Same dir (0.6) + same extension (0.2)
        let score = relatedness("src/app.py", &["src/util.py".to_string()]);
        assert!((score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_parent_directory_scores() {
        // Sibling dirs under src/: parent-dir rule (0.4) + extension (0.2)
        let score = relatedness("src/api/app.py", &["src/db/models.py".to_string()]);
        assert!((score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_test_source_relationship() {
        let score = relatedness("tests/test_app.py", &["src/app.py".to_string()]);
        // extension match (0.2) + test relationship (0.3)
        assert!(score >= 0.5 - 1e-9);
    }

    #[test]
    fn test_low_scores_discarded() {
        let commits = vec![commit("bbb", &["docs/assets/logo.png"])];
        let changes = GitAnalyzer::relevant_changes("src/api/app.py", &commits);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_top_five_sorted_descending() {
        let commits = vec![
            commit("c1", &["src/other.py"]),
            commit("c2", &["src/app.py"]),
            commit("c3", &["src/more.py"]),
            commit("c4", &["src/again.py"]),
            commit("c5", &["src/extra.py"]),
            commit("c6", &["src/final.py"]),
        ];
        let changes = GitAnalyzer::relevant_changes("src/app.py", &commits);
        assert_eq!(changes.len(), 5);
        assert!((changes[0].relevance - 1.0).abs() < f64::EPSILON);
        for pair in changes.windows(2) {
            assert!(pair[0].relevance >= pair[1].relevance);
        }
    }

    #[test]
    fn test_parse_log_line() {
        let commit =
            parse_log_line("deadbeef|Ada|ada@example.com|1700000000|fix: handle nulls").unwrap();
        assert_eq!(commit.sha, "deadbeef");
        assert_eq!(commit.author, "Ada");
        assert_eq!(commit.message, "fix: handle nulls");
    }

    #[test]
    fn test_parse_log_line_with_pipes_in_message() {
        let commit = parse_log_line("abc|Bo|bo@x.io|1700000000|feat: a | b | c").unwrap();
        assert_eq!(commit.message, "feat: a | b | c");
    }

    #[test]
    fn test_malformed_log_line_rejected() {
        assert!(parse_log_line("not-a-commit-line").is_none());
        assert!(parse_log_line("sha|author|email|not-a-timestamp|msg").is_none());
    }
}
