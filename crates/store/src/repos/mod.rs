//! Repository-pattern accessors over the NeverDown tables.

mod analyses;
mod incidents;
mod patches;
mod pull_requests;
mod verifications;

pub use analyses::AnalysisRepository;
pub use incidents::IncidentRepository;
pub use patches::PatchRepository;
pub use pull_requests::PullRequestRepository;
pub use verifications::VerificationRepository;

use crate::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Render a unit enum to its serde string form for a TEXT column.
pub(crate) fn enum_to_str<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default()
}

/// Parse a TEXT column back into a serde unit enum.
pub(crate) fn enum_from_str<T: DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use neverdown_models::{IncidentStatus, Severity, VerificationStatus};

    #[test]
    fn test_enum_text_round_trip() {
        assert_eq!(enum_to_str(&IncidentStatus::AwaitingReview), "awaiting_review");
        let back: IncidentStatus = enum_from_str("awaiting_review").unwrap();
        assert_eq!(back, IncidentStatus::AwaitingReview);

        assert_eq!(enum_to_str(&Severity::Critical), "critical");
        assert_eq!(enum_to_str(&VerificationStatus::NoTests), "no_tests");
    }

    #[test]
    fn test_unknown_text_is_an_error() {
        assert!(enum_from_str::<IncidentStatus>("does_not_exist").is_err());
    }
}
