//! Syllabus core library: domain types, canonical hashing, configuration.
//!
//! - [`types`]: newtypes, records, change operations
//! - [`canonical`]: payload normalization, content hashing, id derivation
//! - [`config`]: `.syllabus/config.yaml` load / save / init
//! - [`paths`]: on-disk layout under a repository root
//! - [`error`]: [`ConfigError`], [`ContentError`]

pub mod canonical;
pub mod config;
pub mod error;
pub mod paths;
pub mod types;

pub use config::{HierarchyRule, RemoteConfig, RetrySettings, StrapiConfig, SyncConfig};
pub use error::{ConfigError, ContentError};
pub use types::{
    ChangeKind, ChangeOp, Conflict, ConflictPolicy, ContentHash, ContentId, ContentPayload,
    ContentRecord, ExternalId, Origin, RemoteRecord, Revision, SyncStateEntry, Version,
};
