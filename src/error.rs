//! Caller-facing error taxonomy.

use thiserror::Error;

use crate::storage::StoreError;
use crate::transport::TransportError;
use crate::{ConflictId, SessionId};

/// Result type for session operations
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors returned by the session coordinator and its handle
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    #[error("Unauthenticated: no caller identity")]
    Unauthenticated,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflict already resolved: {0}")]
    AlreadyResolved(ConflictId),

    #[error("Invalid comment hierarchy: {0}")]
    InvalidHierarchy(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid anchor: {0}")]
    InvalidAnchor(String),

    #[error("Session is full: {0}")]
    SessionFull(SessionId),

    #[error("Session has ended: {0}")]
    SessionEnded(SessionId),

    #[error("Not joined to a session")]
    NotJoined,

    /// Network or row store failure
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl CollabError {
    pub fn session_not_found(id: impl Into<String>) -> Self {
        CollabError::NotFound {
            kind: "Session",
            id: id.into(),
        }
    }

    pub fn comment_not_found(id: impl Into<String>) -> Self {
        CollabError::NotFound {
            kind: "Comment",
            id: id.into(),
        }
    }

    pub fn conflict_not_found(id: impl Into<String>) -> Self {
        CollabError::NotFound {
            kind: "Conflict",
            id: id.into(),
        }
    }

    /// Whether a retry could succeed without the caller changing anything
    pub fn is_transient(&self) -> bool {
        matches!(self, CollabError::TransportFailure(_) | CollabError::Storage(_))
    }
}

impl From<StoreError> for CollabError {
    fn from(err: StoreError) -> Self {
        CollabError::Storage(err.to_string())
    }
}

impl From<TransportError> for CollabError {
    fn from(err: TransportError) -> Self {
        CollabError::TransportFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CollabError::session_not_found("sess-123");
        assert_eq!(err.to_string(), "Session not found: sess-123");

        let err = CollabError::AlreadyResolved("c-1".to_string());
        assert_eq!(err.to_string(), "Conflict already resolved: c-1");
    }

    #[test]
    fn test_store_error_maps_to_storage() {
        let err: CollabError = StoreError::Backend("disk full".to_string()).into();
        assert!(matches!(err, CollabError::Storage(_)));
        assert!(err.is_transient());
        assert!(!CollabError::Unauthenticated.is_transient());
    }
}
