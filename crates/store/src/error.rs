//! Storage error type.

use neverdown_common::{AgentFailure, ErrorCode};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    #[must_use]
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Map a lookup failure onto the taxonomy; other storage errors stay
    /// infrastructure-level and are wrapped by the caller with its own
    /// stage code.
    #[must_use]
    pub fn as_not_found(&self) -> Option<AgentFailure> {
        match self {
            Self::NotFound { entity, id } => {
                let code = if *entity == "patch" {
                    ErrorCode::PatchNotFound
                } else {
                    ErrorCode::IncidentNotFound
                };
                Some(AgentFailure::new(code, format!("{entity} {id} not found")))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_taxonomy() {
        let id = Uuid::new_v4();
        let failure = StoreError::not_found("patch", id).as_not_found().unwrap();
        assert_eq!(failure.code, ErrorCode::PatchNotFound);

        let failure = StoreError::not_found("incident", id).as_not_found().unwrap();
        assert_eq!(failure.code, ErrorCode::IncidentNotFound);

        assert!(StoreError::Serialization(serde_json::from_str::<i32>("x").unwrap_err())
            .as_not_found()
            .is_none());
    }
}
