//! The capability every remote backend implements.

use std::fmt;

use serde::{Deserialize, Serialize};

use syllabus_core::types::{ContentId, ContentPayload, ExternalId, RemoteRecord, Version};

use crate::error::RemoteError;

/// Opaque pagination position. Only the backend that issued it can
/// interpret it; a listing can be resumed from any cursor it returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(pub String);

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RemoteRecord>,
    /// `None` when this was the last page.
    pub next: Option<Cursor>,
}

/// Read/write access to the remote content store.
///
/// Implementations are shared across prefetch workers, so they must be
/// `Send + Sync`. Every call may block on I/O.
pub trait RemoteClient: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// One page of records, starting at `cursor` (the beginning when `None`).
    ///
    /// Records may omit `body`; callers use [`RemoteClient::fetch`] for those.
    fn list_since(&self, cursor: Option<&Cursor>) -> Result<Page, RemoteError>;

    /// A single record, always with `body` filled in.
    fn fetch(&self, external_id: &ExternalId) -> Result<RemoteRecord, RemoteError>;

    /// Create a record. `key` is the idempotency key: repeating a create with
    /// a key that already exists returns the existing record unchanged.
    fn create(&self, key: &ContentId, payload: &ContentPayload)
        -> Result<RemoteRecord, RemoteError>;

    /// Replace a record's payload if its version is still `expected`.
    /// Returns the new version.
    fn update(
        &self,
        external_id: &ExternalId,
        payload: &ContentPayload,
        expected: Version,
    ) -> Result<Version, RemoteError>;

    /// Remove a record. Deleting an absent record succeeds.
    fn delete(&self, external_id: &ExternalId) -> Result<(), RemoteError>;
}

impl<T: RemoteClient + ?Sized> RemoteClient for Box<T> {
    fn backend(&self) -> &'static str {
        (**self).backend()
    }

    fn list_since(&self, cursor: Option<&Cursor>) -> Result<Page, RemoteError> {
        (**self).list_since(cursor)
    }

    fn fetch(&self, external_id: &ExternalId) -> Result<RemoteRecord, RemoteError> {
        (**self).fetch(external_id)
    }

    fn create(
        &self,
        key: &ContentId,
        payload: &ContentPayload,
    ) -> Result<RemoteRecord, RemoteError> {
        (**self).create(key, payload)
    }

    fn update(
        &self,
        external_id: &ExternalId,
        payload: &ContentPayload,
        expected: Version,
    ) -> Result<Version, RemoteError> {
        (**self).update(external_id, payload, expected)
    }

    fn delete(&self, external_id: &ExternalId) -> Result<(), RemoteError> {
        (**self).delete(external_id)
    }
}
