//! Error types for syllabus-sync.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use syllabus_core::types::ContentId;
use syllabus_core::{ConfigError, ContentError};
use syllabus_remote::RemoteError;

/// All errors that can end a sync cycle. Every one of them leaves the
/// Sync State Store as it was before the cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed local content; raised before any network call.
    #[error("validation error: {0}")]
    Validation(#[from] ContentError),

    /// A retryable remote failure that outlived its retries.
    #[error("transient remote failure after {attempts} attempt(s): {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    #[error("permanent remote failure: {0}")]
    Permanent(RemoteError),

    /// A stale version that re-resolution could not settle.
    #[error("unresolved version conflict: {0}")]
    VersionConflict(RemoteError),

    #[error("sync state at {path} is corrupt: {reason}; repair or remove it manually")]
    StateCorruption { path: PathBuf, reason: String },

    #[error("sync cycle cancelled")]
    Cancelled,

    #[error("another sync cycle is running (lock held at {path})")]
    Locked { path: PathBuf },

    #[error("no parked conflict for '{0}'")]
    UnknownConflict(ContentId),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse error class, used for exit codes and status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Transient,
    Permanent,
    VersionConflict,
    StateCorruption,
    Cancelled,
    Locked,
    Usage,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::VersionConflict => "version-conflict",
            ErrorKind::StateCorruption => "state-corruption",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Locked => "locked",
            ErrorKind::Usage => "usage",
            ErrorKind::Io => "io",
        };
        f.write_str(s)
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Transient { .. } => ErrorKind::Transient,
            SyncError::Permanent(_) => ErrorKind::Permanent,
            SyncError::VersionConflict(_) => ErrorKind::VersionConflict,
            SyncError::StateCorruption { .. } => ErrorKind::StateCorruption,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Locked { .. } => ErrorKind::Locked,
            SyncError::UnknownConflict(_) | SyncError::Config(_) => ErrorKind::Usage,
            SyncError::Io { .. } | SyncError::Json(_) => ErrorKind::Io,
        }
    }

    /// Classify a remote failure that will not be retried any further.
    pub fn from_remote(err: RemoteError, attempts: u32) -> Self {
        match err {
            RemoteError::Transient(_) => SyncError::Transient {
                attempts,
                source: err,
            },
            RemoteError::VersionConflict { .. } => SyncError::VersionConflict(err),
            RemoteError::Permanent(_) | RemoteError::NotFound(_) => SyncError::Permanent(err),
        }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> SyncError {
    SyncError::StateCorruption {
        path: path.into(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syllabus_core::types::ExternalId;

    #[test]
    fn remote_errors_map_onto_the_taxonomy() {
        let t = SyncError::from_remote(RemoteError::Transient("503".into()), 5);
        assert_eq!(t.kind(), ErrorKind::Transient);
        assert!(t.to_string().contains("5 attempt"));

        let p = SyncError::from_remote(RemoteError::Permanent("401".into()), 1);
        assert_eq!(p.kind(), ErrorKind::Permanent);

        let n = SyncError::from_remote(RemoteError::NotFound(ExternalId::from("x")), 1);
        assert_eq!(n.kind(), ErrorKind::Permanent);
    }
}
