//! Lock error definitions

use crate::types::EntityId;
use thiserror::Error;

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Lock errors
#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// The mapping store or the lock broker could not be reached
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Another caller created the mapping for this entity first
    #[error("Mapping conflict: entity '{0}' was assigned a lock id concurrently")]
    MappingConflict(EntityId),

    /// Release attempted on a session that does not hold the lock, or on a
    /// closed or failed session
    #[error("Session mismatch: {0}")]
    SessionMismatch(String),

    /// The caller-supplied deadline expired before the broker granted the lock
    #[error("Lock timeout: entity '{entity_id}' was not granted within {waited_ms} ms")]
    Timeout { entity_id: EntityId, waited_ms: u64 },

    /// Configuration could not be used to build a store or broker
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LockError {
    /// Get error code for this lock error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "E300",
            Self::SessionMismatch(_) => "E301",
            Self::MappingConflict(_) => "E302",
            Self::StorageUnavailable(_) => "E400",
            Self::Config(_) => "E600",
        }
    }

    /// Whether retrying the whole operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Timeout { .. })
    }
}

impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_codes() {
        let entity_id = Uuid::nil();
        assert_eq!(
            LockError::Timeout {
                entity_id,
                waited_ms: 10
            }
            .code(),
            "E300"
        );
        assert_eq!(LockError::SessionMismatch("x".into()).code(), "E301");
        assert_eq!(LockError::MappingConflict(entity_id).code(), "E302");
        assert_eq!(LockError::StorageUnavailable("down".into()).code(), "E400");
        assert_eq!(LockError::Config("bad".into()).code(), "E600");
    }

    #[test]
    fn test_timeout_message_names_entity() {
        let entity_id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let err = LockError::Timeout {
            entity_id,
            waited_ms: 250,
        };
        let message = err.to_string();
        assert!(message.contains("11111111-1111-1111-1111-111111111111"));
        assert!(message.contains("250"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_sqlx_errors_are_storage_unavailable() {
        let err: LockError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, LockError::StorageUnavailable(_)));
        assert!(!LockError::SessionMismatch("x".into()).is_transient());
    }
}
