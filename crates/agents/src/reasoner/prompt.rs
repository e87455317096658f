//! Deterministic prompt construction for the Reasoner.
//!
//! The builder reads only the sanitized tree. Output shape is fixed so the
//! response parser can rely on the heading skeleton.

use neverdown_models::{DetectiveReport, SuspectedFile};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// System instruction: sanitization notice, untouchable placeholders, and
/// the exact response skeleton.
pub const SYSTEM_PROMPT: &str = r"You are an expert software engineer analyzing a bug in a codebase.
You are given SANITIZED code where all secrets have been replaced with placeholders like <REDACTED_PASSWORD>.
This is intentional - do NOT try to guess or replace these placeholders.

Your task:
1. Analyze the error and code to identify the root cause
2. Propose a minimal fix as a unified diff patch
3. Explain your reasoning clearly
4. Provide a confidence score (0.0-1.0) for your analysis

IMPORTANT RULES:
- Only propose changes to files mentioned in the analysis
- Keep fixes minimal - change only what's necessary
- Do NOT modify any <REDACTED_*> placeholders
- Include the complete fix, not partial changes
- If you're uncertain, express that in your confidence score

Output your response in this EXACT format:

## Root Cause
<One-line summary of the root cause>

## Explanation
<Detailed explanation of why this bug occurs>

## Confidence
<A decimal number between 0.0 and 1.0>

## Assumptions
<List any assumptions you made, one per line, starting with - >

## Fix
```diff
<Your unified diff patch here>
```

## Risks
<Any potential risks or side effects of this fix>
";

/// Extensions considered source when building the fallback file listing.
const SOURCE_EXTENSIONS: &[&str] = &[
    "js", "ts", "jsx", "tsx", "py", "java", "go", "rb", "php", "c", "cpp", "h", "cs", "swift",
    "kt", "rs", "vue", "svelte", "json", "yml", "yaml",
];

/// Conventional entry points, most interesting first.
const PRIORITY_FILES: &[&str] = &[
    "index.js", "index.ts", "main.js", "main.ts", "main.py", "app.py", "server.js", "server.ts",
    "src/index.js", "src/index.ts", "src/App.js", "src/App.jsx", "src/App.tsx",
];

const SKIP_DIRS: &[&str] = &[
    "node_modules/", ".git/", "vendor/", "__pycache__/", "venv/", ".venv/", "dist/", "build/",
];

/// Builds analysis and retry prompts from the sanitized tree.
pub struct PromptBuilder {
    repo_path: PathBuf,
}

impl PromptBuilder {
    #[must_use]
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    #[must_use]
    pub fn system_prompt(&self) -> &'static str {
        SYSTEM_PROMPT
    }

    /// Assemble the user message: errors, category, suspect excerpts (or
    /// the project fallback), recent changes and evidence.
    #[must_use]
    pub fn build_analysis_prompt(&self, report: &DetectiveReport, max_code_lines: usize) -> String {
        let mut prompt = String::new();

        prompt.push_str("# Error Information\n\n");
        for (i, error) in report.errors.iter().take(5).enumerate() {
            let _ = writeln!(prompt, "## Error {}", i + 1);
            let _ = writeln!(prompt, "**Type**: {}", error.kind);
            let _ = writeln!(prompt, "**Message**: {}", error.message);
            if let Some(path) = &error.file_path {
                let _ = writeln!(prompt, "**File**: {path}");
            }
            if let Some(line) = error.line {
                let _ = writeln!(prompt, "**Line**: {line}");
            }
            if let Some(trace) = &error.stack_trace {
                let excerpt: String = trace.chars().take(1000).collect();
                let _ = writeln!(prompt, "**Stack Trace**:\n```\n{excerpt}\n```");
            }
            prompt.push('\n');
        }

        let _ = writeln!(
            prompt,
            "**Failure Category**: {}\n",
            report.failure_category.as_str()
        );

        if report.suspected_files.is_empty() {
            prompt.push_str("# Project Overview\n\n");
            prompt.push_str(
                "No specific files identified from error logs. Here is the project structure:\n\n",
            );
            let _ = writeln!(prompt, "```\n{}\n```\n", self.project_file_listing(50));

            prompt.push_str("# Key Source Files\n\n");
            for (path, content) in self.key_source_files(max_code_lines) {
                let _ = writeln!(prompt, "## {path}");
                let _ = writeln!(prompt, "```\n{content}\n```\n");
            }
        } else {
            prompt.push_str("# Suspected Files\n\n");
            let mut total_lines = 0;
            for suspect in report.suspected_files.iter().take(5) {
                if total_lines >= max_code_lines {
                    break;
                }

                let _ = writeln!(
                    prompt,
                    "## {} (Confidence: {:.2})",
                    suspect.path, suspect.confidence
                );
                if !suspect.line_numbers.is_empty() {
                    let _ = writeln!(prompt, "Suspected lines: {:?}", suspect.line_numbers);
                }
                if !suspect.evidence.is_empty() {
                    prompt.push_str("Evidence:\n");
                    for evidence in suspect.evidence.iter().take(3) {
                        let excerpt: String = evidence.chars().take(200).collect();
                        let _ = writeln!(prompt, "- {excerpt}");
                    }
                }

                if let Some(code) = self.file_excerpt(suspect, 20) {
                    total_lines += code.lines().count();
                    let _ = writeln!(prompt, "```\n{code}\n```");
                }
                prompt.push('\n');
            }
        }

        if !report.recent_changes.is_empty() {
            prompt.push_str("# Recent Changes\n\n");
            for change in report.recent_changes.iter().take(3) {
                let sha: String = change.commit_sha.chars().take(8).collect();
                let _ = writeln!(prompt, "- **{sha}**: {}", change.message);
                let files: Vec<&str> = change
                    .files_changed
                    .iter()
                    .take(5)
                    .map(String::as_str)
                    .collect();
                let _ = writeln!(prompt, "  Files: {}", files.join(", "));
            }
            prompt.push('\n');
        }

        prompt.push_str("# Evidence Summary\n");
        for evidence in &report.evidence {
            let _ = writeln!(prompt, "- {evidence}");
        }

        prompt.push_str("\n---\n");
        prompt.push_str("Analyze this information and provide your response in the specified format.\n");
        prompt.push_str(
            "IMPORTANT: Only reference files that actually exist in the project structure shown above.\n",
        );

        prompt
    }

    /// Quote the failed attempt and the machine-visible reason, then
    /// restate the original request.
    #[must_use]
    pub fn build_retry_prompt(
        original_prompt: &str,
        previous_response: &str,
        reason: &str,
    ) -> String {
        let previous: String = previous_response.chars().take(1000).collect();
        format!(
            "# Previous Attempt Failed\n\n\
             Your previous response could not be used. Error: {reason}\n\n\
             ## Your Previous Response\n{previous}\n\n\
             ## Instructions for Retry\n\
             Please provide a new response that addresses this issue. Make sure:\n\
             1. Your diff is valid unified diff format\n\
             2. File paths in the diff match the actual files\n\
             3. The patch can be applied with standard tools\n\n\
             ---\n\n\
             {original_prompt}"
        )
    }

    /// Excerpt a suspect file with context around the flagged lines, the
    /// flagged lines themselves marked `>>>`.
    fn file_excerpt(&self, suspect: &SuspectedFile, context_lines: usize) -> Option<String> {
        let full_path = self.repo_path.join(&suspect.path);
        let content = std::fs::read_to_string(full_path).ok()?;
        let lines: Vec<&str> = content.lines().collect();

        if suspect.line_numbers.is_empty() {
            let shown = lines.len().min(100);
            return Some(
                lines[..shown]
                    .iter()
                    .enumerate()
                    .map(|(i, line)| format!("{:4}    {line}", i + 1))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        }

        let min_flagged = *suspect.line_numbers.iter().min()? as usize;
        let max_flagged = *suspect.line_numbers.iter().max()? as usize;
        let start = min_flagged.saturating_sub(context_lines).max(1);
        let end = (max_flagged + context_lines).min(lines.len());

        let mut excerpt = Vec::new();
        for line_no in start..=end {
            let Some(line) = lines.get(line_no - 1) else {
                break;
            };
            let marker = if suspect.line_numbers.contains(&(line_no as u32)) {
                ">>> "
            } else {
                "    "
            };
            excerpt.push(format!("{line_no:4}{marker}{line}"));
        }
        Some(excerpt.join("\n"))
    }

    /// Sorted listing of project source files, capped.
    fn project_file_listing(&self, max_files: usize) -> String {
        let mut files: Vec<String> = walkdir::WalkDir::new(&self.repo_path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let rel = e
                    .path()
                    .strip_prefix(&self.repo_path)
                    .ok()?
                    .to_string_lossy()
                    .replace('\\', "/");
                if SKIP_DIRS.iter().any(|skip| rel.contains(skip)) {
                    return None;
                }
                let name = e.file_name().to_string_lossy();
                let by_ext = Path::new(&rel)
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext));
                let by_name = matches!(
                    name.as_ref(),
                    "package.json" | "Dockerfile" | "Makefile" | "requirements.txt"
                        | "Cargo.toml" | "go.mod"
                );
                (by_ext || by_name).then_some(rel)
            })
            .collect();

        files.sort();
        if files.len() > max_files {
            let extra = files.len() - max_files;
            files.truncate(max_files);
            files.push(format!("... and {extra} more files"));
        }
        files.join("\n")
    }

    /// Entry-point-ordered source files for the no-suspects fallback.
    fn key_source_files(&self, max_lines: usize) -> Vec<(String, String)> {
        let mut candidates: Vec<String> = walkdir::WalkDir::new(&self.repo_path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let rel = e
                    .path()
                    .strip_prefix(&self.repo_path)
                    .ok()?
                    .to_string_lossy()
                    .replace('\\', "/");
                if SKIP_DIRS.iter().any(|skip| rel.contains(skip)) || rel.contains("test") {
                    return None;
                }
                Path::new(&rel)
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| {
                        matches!(ext, "js" | "ts" | "jsx" | "tsx" | "py" | "java" | "go")
                    })
                    .then_some(rel)
            })
            .collect();

        candidates.sort_by_key(|rel| {
            PRIORITY_FILES
                .iter()
                .position(|p| rel.ends_with(p) || rel.contains(p))
                .unwrap_or(100)
        });

        let mut result = Vec::new();
        let mut total_lines = 0;
        for rel in candidates.into_iter().take(5) {
            if total_lines >= max_lines {
                break;
            }
            let Ok(content) = std::fs::read_to_string(self.repo_path.join(&rel)) else {
                continue;
            };
            let lines: Vec<&str> = content.lines().collect();
            let budget = 50.min(max_lines - total_lines);
            let shown = if lines.len() > budget {
                format!("{}\n... (truncated)", lines[..budget].join("\n"))
            } else {
                content.clone()
            };
            total_lines += lines.len().min(budget);
            result.push((rel, shown));
        }
        result
    }
}
