//! Remote content store access.
//!
//! - [`client`]: the [`RemoteClient`] capability and pagination types
//! - [`memory`]: process-local backend with fault injection
//! - [`file`]: JSON-file CMS emulator
//! - [`http`]: Strapi-style REST backend
//! - [`error`]: [`RemoteError`]

pub mod client;
pub mod error;
pub mod file;
pub mod http;
pub mod memory;
pub mod table;

use std::path::Path;

use syllabus_core::config::RemoteConfig;

pub use client::{Cursor, Page, RemoteClient};
pub use error::RemoteError;
pub use file::FileRemote;
pub use http::StrapiRemote;
pub use memory::{FaultTiming, MemoryRemote, RemoteOp};
pub use table::{RemoteTable, StoredRecord};

/// Build the configured backend. Relative file paths resolve against `root`.
pub fn connect(root: &Path, config: &RemoteConfig) -> Box<dyn RemoteClient> {
    match config {
        RemoteConfig::Strapi(strapi) => Box::new(StrapiRemote::from_env(strapi)),
        RemoteConfig::File { path } => Box::new(FileRemote::open(root.join(path))),
        RemoteConfig::Memory => {
            tracing::warn!("memory backend selected; remote contents last only for this process");
            Box::new(MemoryRemote::new())
        }
    }
}
