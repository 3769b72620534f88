//! Error types for syllabus-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from loading, saving, or validating `.syllabus/config.yaml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load; carries the file path and serde_yaml's
    /// line context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config not found at {path}; run `syllabus init` first")]
    NotFound { path: PathBuf },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("no conflict policy configured; set `policy` in config.yaml or pass --policy")]
    MissingPolicy,
}

/// Malformed local or remote content. Always fatal for the cycle.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: content is not valid UTF-8")]
    NotUtf8 { path: String },

    #[error("{path}: malformed content: {reason}")]
    Malformed { path: String, reason: String },

    #[error("{path}: invalid content id '{id}'")]
    InvalidId { path: String, id: String },

    #[error("duplicate content id '{id}' at {first} and {second}")]
    DuplicateId {
        id: String,
        first: String,
        second: String,
    },
}

pub(crate) fn config_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
