//! Error types for remote backends.

use thiserror::Error;

use syllabus_core::types::{ExternalId, Version};

/// Failure classes a Remote Client call can end in.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure, timeout, 5xx or rate limiting. Safe to retry.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Authentication or schema failure. Retrying cannot help.
    #[error("permanent remote failure: {0}")]
    Permanent(String),

    /// Optimistic-concurrency token was stale.
    #[error("version conflict on {external_id}: expected {expected}, found {actual}")]
    VersionConflict {
        external_id: ExternalId,
        expected: Version,
        actual: Version,
    },

    #[error("remote record {0} not found")]
    NotFound(ExternalId),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(RemoteError::Transient("timeout".into()).is_retryable());
        assert!(!RemoteError::Permanent("401".into()).is_retryable());
        assert!(!RemoteError::NotFound(ExternalId::from("x")).is_retryable());
        assert!(!RemoteError::VersionConflict {
            external_id: ExternalId::from("x"),
            expected: Version(1),
            actual: Version(2),
        }
        .is_retryable());
    }

    #[test]
    fn version_conflict_message_names_both_versions() {
        let err = RemoteError::VersionConflict {
            external_id: ExternalId::from("cms-1"),
            expected: Version(1),
            actual: Version(4),
        };
        let msg = err.to_string();
        assert!(msg.contains("v1") && msg.contains("v4") && msg.contains("cms-1"));
    }
}
