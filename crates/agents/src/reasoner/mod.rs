//! Reasoner stage: LLM-backed root-cause analysis and patch generation.
//!
//! The only component that talks to a language-model endpoint. Receives
//! exclusively sanitized code. Parse and validation failures are retried
//! with a prompt that quotes the failing attempt; a low-confidence reply
//! is a final answer and is never retried.

pub mod llm;
pub mod patch;
pub mod prompt;

use chrono::Utc;
use llm::ChatProvider;
use neverdown_common::{AgentFailure, ErrorCode};
use neverdown_config::Settings;
use neverdown_models::{DetectiveReport, Patch, ReasonerOutput};
use prompt::PromptBuilder;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

/// Code-line budget for suspect excerpts in the analysis prompt.
const MAX_CODE_LINES: usize = 200;

/// The reasoner agent.
pub struct Reasoner {
    provider: Box<dyn ChatProvider>,
    model: String,
    max_retries: u32,
    confidence_threshold: f64,
}

impl Reasoner {
    /// Build with the provider named in configuration.
    pub fn from_settings(settings: &Settings) -> Result<Self, AgentFailure> {
        let provider = llm::provider_from_settings(settings)
            .map_err(|e| AgentFailure::new(ErrorCode::LlmError, e.to_string()))?;
        Ok(Self::with_provider(provider, settings))
    }

    /// Build with an explicit provider (tests inject a mock here).
    #[must_use]
    pub fn with_provider(provider: Box<dyn ChatProvider>, settings: &Settings) -> Self {
        Self {
            provider,
            model: settings.llm_model.clone(),
            max_retries: settings.reasoner_max_retries,
            confidence_threshold: settings.reasoner_confidence_threshold,
        }
    }

    /// Produce a validated patch from the detective report and the
    /// sanitized tree.
    pub async fn generate(
        &self,
        incident_id: Uuid,
        sanitized_path: &Path,
        report: &DetectiveReport,
    ) -> Result<ReasonerOutput, AgentFailure> {
        let builder = PromptBuilder::new(sanitized_path);
        let system_prompt = builder.system_prompt();
        let original_prompt = builder.build_analysis_prompt(report, MAX_CODE_LINES);
        let mut user_prompt = original_prompt.clone();

        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            let response = match self.provider.chat(system_prompt, &user_prompt).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(attempt = attempt + 1, "LLM call failed: {e}");
                    last_error = e.to_string();
                    continue;
                }
            };

            let reply = patch::parse_reply(&response.content);

            if !reply.parse_errors.is_empty() {
                warn!(
                    attempt = attempt + 1,
                    errors = ?reply.parse_errors,
                    "LLM response parse errors"
                );
                last_error = format!("Parse errors: {}", reply.parse_errors.join(", "));
                user_prompt = PromptBuilder::build_retry_prompt(
                    &original_prompt,
                    &response.content,
                    &last_error,
                );
                continue;
            }

            if reply.diff.is_empty() {
                last_error = "No diff/patch provided in response".to_string();
                user_prompt = PromptBuilder::build_retry_prompt(
                    &original_prompt,
                    &response.content,
                    &last_error,
                );
                continue;
            }

            let validated = patch::validate_diff(&reply.diff, Some(sanitized_path));
            if !validated.is_valid() {
                warn!(
                    attempt = attempt + 1,
                    errors = ?validated.errors,
                    "Invalid patch generated"
                );
                last_error = format!("Invalid diff: {}", validated.errors.join(", "));
                user_prompt = PromptBuilder::build_retry_prompt(
                    &original_prompt,
                    &response.content,
                    &last_error,
                );
                continue;
            }

            // A confident-but-wrong threshold miss will not improve by
            // re-prompting: report it as final
            if reply.confidence < self.confidence_threshold {
                return Err(AgentFailure::new(
                    ErrorCode::LowConfidence,
                    format!(
                        "confidence {:.2} below threshold {:.2}",
                        reply.confidence, self.confidence_threshold
                    ),
                )
                .with_details(serde_json::json!({
                    "confidence": reply.confidence,
                    "threshold": self.confidence_threshold,
                    "root_cause": reply.root_cause,
                })));
            }

            info!(
                confidence = reply.confidence,
                files = validated.files.len(),
                "Reasoner produced a validated patch"
            );

            let patch = Patch {
                id: Uuid::new_v4(),
                incident_id,
                diff: patch::normalize_diff(&reply.diff),
                reasoning: reply.explanation.clone(),
                confidence: reply.confidence,
                assumptions: reply.assumptions.clone(),
                files_changed: validated.files,
                verified: false,
                token_usage: Some(response.usage),
                retry_count: attempt,
                created_at: Utc::now(),
            };

            return Ok(ReasonerOutput {
                incident_id,
                patch,
                root_cause_summary: reply.root_cause,
                detailed_explanation: reply.explanation,
                confidence: reply.confidence,
                assumptions: reply.assumptions,
                risk_assessment: reply.risks,
                token_usage: response.usage,
                llm_model: self.model.clone(),
            });
        }

        Err(AgentFailure::new(
            ErrorCode::ReasonerError,
            format!("failed after {} attempts: {last_error}", self.max_retries),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::llm::{ChatResponse, MockChatProvider};
    use neverdown_models::{ErrorInfo, FailureCategory, SuspectedFile, TokenUsage};
    use tempfile::TempDir;

    fn report(incident_id: Uuid) -> DetectiveReport {
        DetectiveReport {
            incident_id,
            errors: vec![ErrorInfo {
                kind: "NameError".to_string(),
                message: "name 'PORT' is not defined".to_string(),
                file_path: Some("backend/index.js".to_string()),
                line: Some(2),
                stack_trace: None,
            }],
            failure_category: FailureCategory::Name,
            suspected_files: vec![SuspectedFile {
                path: "backend/index.js".to_string(),
                confidence: 0.9,
                line_numbers: vec![2],
                evidence: vec![],
            }],
            suspected_functions: vec![],
            recent_changes: vec![],
            evidence: vec![],
            overall_confidence: 0.9,
            created_at: Utc::now(),
        }
    }

    fn sanitized_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("backend")).unwrap();
        std::fs::write(
            dir.path().join("backend/index.js"),
            "const http = require('http');\nserver.listen(PORT);\n",
        )
        .unwrap();
        dir
    }

    fn reply_with_confidence(confidence: f64) -> String {
        format!(
            "## Root Cause\nPORT missing\n\n## Explanation\nRemoved in refactor.\n\n## Confidence\n{confidence}\n\n## Assumptions\n- default port 8080\n\n## Fix\n```diff\n--- a/backend/index.js\n+++ b/backend/index.js\n@@ -1,2 +1,3 @@\n const http = require('http');\n+const PORT = 8080;\n server.listen(PORT);\n```\n\n## Risks\nnone\n"
        )
    }

    fn chat_ok(content: String) -> Result<ChatResponse, llm::LlmError> {
        Ok(ChatResponse {
            content,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
        })
    }

    fn reasoner(provider: MockChatProvider) -> Reasoner {
        Reasoner::with_provider(Box::new(provider), &Settings::default())
    }

    #[tokio::test]
    async fn test_happy_path_yields_patch() {
        let tree = sanitized_tree();
        let incident_id = Uuid::new_v4();

        let mut provider = MockChatProvider::new();
        provider
            .expect_chat()
            .times(1)
            .returning(|_, _| chat_ok(reply_with_confidence(0.92)));

        let output = reasoner(provider)
            .generate(incident_id, tree.path(), &report(incident_id))
            .await
            .unwrap();

        assert!((output.confidence - 0.92).abs() < 1e-9);
        assert_eq!(output.patch.files_changed.len(), 1);
        assert_eq!(output.patch.retry_count, 0);
        assert!(output.patch.diff.ends_with('\n'));
        assert_eq!(output.root_cause_summary, "PORT missing");
    }

    #[tokio::test]
    async fn test_low_confidence_is_final_and_not_retried() {
        let tree = sanitized_tree();
        let incident_id = Uuid::new_v4();

        let mut provider = MockChatProvider::new();
        // Exactly one call: low confidence must not trigger a retry
        provider
            .expect_chat()
            .times(1)
            .returning(|_, _| chat_ok(reply_with_confidence(0.5)));

        let err = reasoner(provider)
            .generate(incident_id, tree.path(), &report(incident_id))
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::LowConfidence);
        assert!((err.details["confidence"].as_f64().unwrap() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_diff_retried_then_succeeds() {
        let tree = sanitized_tree();
        let incident_id = Uuid::new_v4();

        let mut provider = MockChatProvider::new();
        let mut call = 0;
        provider.expect_chat().times(2).returning(move |_, user| {
            call += 1;
            if call == 1 {
                chat_ok("## Root Cause\nx\n\n## Explanation\ny\n\n## Confidence\n0.9\n\n## Fix\n\n## Risks\nnone\n".to_string())
            } else {
                // The retry prompt quotes the failure reason back
                assert!(user.contains("No diff/patch provided"));
                chat_ok(reply_with_confidence(0.9))
            }
        });

        let output = reasoner(provider)
            .generate(incident_id, tree.path(), &report(incident_id))
            .await
            .unwrap();
        assert_eq!(output.patch.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let tree = sanitized_tree();
        let incident_id = Uuid::new_v4();

        let mut provider = MockChatProvider::new();
        provider
            .expect_chat()
            .times(3)
            .returning(|_, _| chat_ok("not even close to the format".to_string()));

        let err = reasoner(provider)
            .generate(incident_id, tree.path(), &report(incident_id))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ReasonerError);
        assert!(err.message.contains("3 attempts"));
    }

    #[tokio::test]
    async fn test_invalid_file_path_in_diff_retried() {
        let tree = sanitized_tree();
        let incident_id = Uuid::new_v4();

        let bad = "## Root Cause\nx\n\n## Explanation\ny\n\n## Confidence\n0.9\n\n## Assumptions\n\n## Fix\n```diff\n--- a/ghost.py\n+++ b/ghost.py\n@@ -1 +1 @@\n-a\n+b\n```\n\n## Risks\nnone\n";

        let mut provider = MockChatProvider::new();
        let mut call = 0;
        provider.expect_chat().times(2).returning(move |_, user| {
            call += 1;
            if call == 1 {
                chat_ok(bad.to_string())
            } else {
                assert!(user.contains("File not found: ghost.py"));
                chat_ok(reply_with_confidence(0.95))
            }
        });

        let output = reasoner(provider)
            .generate(incident_id, tree.path(), &report(incident_id))
            .await
            .unwrap();
        assert!((output.confidence - 0.95).abs() < 1e-9);
    }
}
