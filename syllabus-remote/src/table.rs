//! In-process record table shared by the memory and file backends.
//!
//! Emulates the parts of a headless CMS the engine relies on: server-assigned
//! external ids, monotonically increasing versions with optimistic
//! concurrency, idempotent creates keyed by content id, and stable
//! cursor pagination ordered by external id.

use std::collections::BTreeMap;
use std::ops::Bound;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use syllabus_core::canonical;
use syllabus_core::types::{
    ContentHash, ContentId, ContentPayload, ExternalId, RemoteRecord, Version,
};

use crate::client::{Cursor, Page};
use crate::error::RemoteError;

/// One record as the emulated CMS stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub external_id: ExternalId,
    pub content_id: ContentId,
    pub path: String,
    pub body: String,
    pub content_hash: ContentHash,
    pub version: Version,
    pub modified_at: DateTime<Utc>,
}

impl StoredRecord {
    fn to_record(&self, with_body: bool) -> RemoteRecord {
        RemoteRecord {
            external_id: self.external_id.clone(),
            content_id: self.content_id.clone(),
            path: self.path.clone(),
            content_hash: self.content_hash.clone(),
            remote_modified_at: self.modified_at,
            version: self.version,
            body: with_body.then(|| self.body.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTable {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    records: BTreeMap<ExternalId, StoredRecord>,
}

impl RemoteTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, external_id: &ExternalId) -> Option<&StoredRecord> {
        self.records.get(external_id)
    }

    pub fn find_by_content_id(&self, id: &ContentId) -> Option<&StoredRecord> {
        self.records.values().find(|r| &r.content_id == id)
    }

    // -----------------------------------------------------------------------
    // Client-facing operations
    // -----------------------------------------------------------------------

    pub fn list_page(&self, after: Option<&Cursor>, page_size: usize, with_body: bool) -> Page {
        let start = match after {
            Some(cursor) => Bound::Excluded(ExternalId(cursor.0.clone())),
            None => Bound::Unbounded,
        };
        let mut iter = self.records.range((start, Bound::Unbounded));
        let records: Vec<RemoteRecord> = iter
            .by_ref()
            .take(page_size.max(1))
            .map(|(_, r)| r.to_record(with_body))
            .collect();
        let next = match iter.next() {
            Some(_) => records.last().map(|r| Cursor(r.external_id.0.clone())),
            None => None,
        };
        Page { records, next }
    }

    pub fn fetch(&self, external_id: &ExternalId) -> Result<RemoteRecord, RemoteError> {
        self.records
            .get(external_id)
            .map(|r| r.to_record(true))
            .ok_or_else(|| RemoteError::NotFound(external_id.clone()))
    }

    pub fn create(
        &mut self,
        key: &ContentId,
        payload: &ContentPayload,
        now: DateTime<Utc>,
    ) -> Result<RemoteRecord, RemoteError> {
        if let Some(existing) = self.find_by_content_id(key) {
            return Ok(existing.to_record(true));
        }
        let hash = hash_payload(payload)?;
        let external_id = self.allocate_id();
        let stored = StoredRecord {
            external_id: external_id.clone(),
            content_id: key.clone(),
            path: payload.path.clone(),
            body: payload.body.clone(),
            content_hash: hash,
            version: Version(1),
            modified_at: now,
        };
        let record = stored.to_record(true);
        self.records.insert(external_id, stored);
        Ok(record)
    }

    pub fn update(
        &mut self,
        external_id: &ExternalId,
        payload: &ContentPayload,
        expected: Version,
        now: DateTime<Utc>,
    ) -> Result<Version, RemoteError> {
        let hash = hash_payload(payload)?;
        let stored = self
            .records
            .get_mut(external_id)
            .ok_or_else(|| RemoteError::NotFound(external_id.clone()))?;
        if stored.version != expected {
            return Err(RemoteError::VersionConflict {
                external_id: external_id.clone(),
                expected,
                actual: stored.version,
            });
        }
        stored.path = payload.path.clone();
        stored.body = payload.body.clone();
        stored.content_hash = hash;
        stored.version = stored.version.next();
        stored.modified_at = now;
        Ok(stored.version)
    }

    pub fn delete(&mut self, external_id: &ExternalId) {
        self.records.remove(external_id);
    }

    // -----------------------------------------------------------------------
    // Editor operations: changes made directly in the CMS
    // -----------------------------------------------------------------------

    /// Author a new record in the CMS. Its content id is derived from path
    /// and body the same way local files derive theirs.
    pub fn author(
        &mut self,
        path: &str,
        body: &str,
        at: DateTime<Utc>,
    ) -> Result<ExternalId, RemoteError> {
        let payload = ContentPayload {
            path: path.to_string(),
            body: canonical::normalize_body(body),
        };
        let content_id = canonical::derive_id(&payload.path, &payload.body)
            .map_err(|e| RemoteError::Permanent(e.to_string()))?;
        let record = self.create(&content_id, &payload, at)?;
        Ok(record.external_id)
    }

    /// Replace a record's body as an editor would, bumping its version.
    pub fn edit(
        &mut self,
        external_id: &ExternalId,
        body: &str,
        at: DateTime<Utc>,
    ) -> Result<Version, RemoteError> {
        let (path, version) = match self.records.get(external_id) {
            Some(r) => (r.path.clone(), r.version),
            None => return Err(RemoteError::NotFound(external_id.clone())),
        };
        let payload = ContentPayload {
            path,
            body: canonical::normalize_body(body),
        };
        self.update(external_id, &payload, version, at)
    }

    fn allocate_id(&mut self) -> ExternalId {
        self.next_id += 1;
        ExternalId(format!("cms-{:06}", self.next_id))
    }
}

fn hash_payload(payload: &ContentPayload) -> Result<ContentHash, RemoteError> {
    canonical::validate_path(&payload.path)
        .and_then(|_| canonical::content_hash(&payload.path, &payload.body))
        .map_err(|e| RemoteError::Permanent(format!("rejected payload: {e}")))
}
