//! Error taxonomy shared by every pipeline stage.
//!
//! Stages never panic across their boundary: they return
//! `Result<Output, AgentFailure>` where the failure carries a closed
//! [`ErrorCode`], a short human-readable message, and structured details.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of failure codes surfaced by the pipeline and the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Security
    /// Sanitizer found more secrets than the configured halt threshold
    TooManySecrets,
    /// Sanitizer could not produce a sanitized tree
    SanitizationFailed,
    /// Repository is not on the configured allow-list
    UnauthorizedRepo,

    // Agents
    /// Detective analysis failed
    DetectiveError,
    /// Reasoner failed after exhausting retries
    ReasonerError,
    /// Reasoner confidence below threshold (never retried)
    LowConfidence,
    /// Generated diff failed validation or could not be applied
    InvalidPatch,
    /// Sandbox infrastructure error
    SandboxError,
    /// Sandbox exceeded its wall-clock budget
    SandboxTimeout,
    /// Tests failed inside the sandbox
    TestFailed,
    /// Verification could not complete
    VerificationFailed,
    /// Git host rejected a request
    GithubApiError,

    // Orchestration
    /// Requested state transition is not in the transition table
    InvalidStateTransition,
    /// Retry budget exhausted
    MaxRetriesExceeded,
    /// An external operation exceeded its deadline
    Timeout,
    /// Circuit breaker refused the operation
    CircuitBreakerOpen,

    // Data
    /// Incident does not exist
    IncidentNotFound,
    /// Patch does not exist
    PatchNotFound,

    // External
    /// Language-model endpoint error
    LlmError,
    /// Container runtime error
    DockerError,
}

impl ErrorCode {
    /// Stable snake_case identifier used in API envelopes and audit rows.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TooManySecrets => "too_many_secrets",
            Self::SanitizationFailed => "sanitization_failed",
            Self::UnauthorizedRepo => "unauthorized_repo",
            Self::DetectiveError => "detective_error",
            Self::ReasonerError => "reasoner_error",
            Self::LowConfidence => "low_confidence",
            Self::InvalidPatch => "invalid_patch",
            Self::SandboxError => "sandbox_error",
            Self::SandboxTimeout => "sandbox_timeout",
            Self::TestFailed => "test_failed",
            Self::VerificationFailed => "verification_failed",
            Self::GithubApiError => "github_api_error",
            Self::InvalidStateTransition => "invalid_state_transition",
            Self::MaxRetriesExceeded => "max_retries_exceeded",
            Self::Timeout => "timeout",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::IncidentNotFound => "incident_not_found",
            Self::PatchNotFound => "patch_not_found",
            Self::LlmError => "llm_error",
            Self::DockerError => "docker_error",
        }
    }

    /// HTTP status the API layer maps this code to.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::IncidentNotFound | Self::PatchNotFound => 404,
            Self::UnauthorizedRepo => 401,
            Self::InvalidStateTransition | Self::MaxRetriesExceeded | Self::InvalidPatch => 400,
            Self::CircuitBreakerOpen => 429,
            _ => 500,
        }
    }

    /// Whether the orchestrator may re-queue the incident after this failure.
    ///
    /// Sanitizer halts are always terminal; low confidence is a final answer,
    /// not a transient fault.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            Self::TooManySecrets
                | Self::LowConfidence
                | Self::UnauthorizedRepo
                | Self::IncidentNotFound
                | Self::PatchNotFound
                | Self::InvalidStateTransition
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure returned across every stage boundary.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct AgentFailure {
    /// Taxonomy code
    pub code: ErrorCode,
    /// Short human-readable reason
    pub message: String,
    /// Structured context (never contains secret literals)
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AgentFailure {
    /// Create a failure with empty details.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        let json = serde_json::to_string(&ErrorCode::TooManySecrets).unwrap();
        assert_eq!(json, "\"too_many_secrets\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::TooManySecrets);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorCode::IncidentNotFound.http_status(), 404);
        assert_eq!(ErrorCode::UnauthorizedRepo.http_status(), 401);
        assert_eq!(ErrorCode::InvalidStateTransition.http_status(), 400);
        assert_eq!(ErrorCode::CircuitBreakerOpen.http_status(), 429);
        assert_eq!(ErrorCode::LlmError.http_status(), 500);
    }

    #[test]
    fn test_terminal_codes_not_retryable() {
        assert!(!ErrorCode::TooManySecrets.is_retryable());
        assert!(!ErrorCode::LowConfidence.is_retryable());
        assert!(ErrorCode::SandboxTimeout.is_retryable());
        assert!(ErrorCode::TestFailed.is_retryable());
    }

    #[test]
    fn test_failure_display() {
        let f = AgentFailure::new(ErrorCode::LowConfidence, "confidence 0.50 below threshold 0.70");
        assert_eq!(
            f.to_string(),
            "low_confidence: confidence 0.50 below threshold 0.70"
        );
    }
}
