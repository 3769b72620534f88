//! JSON-file CMS emulator.
//!
//! The whole table lives in one JSON document that is re-read on every call
//! and rewritten atomically after every mutation, so separate processes see
//! each other's changes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use syllabus_core::types::{ContentId, ContentPayload, ExternalId, RemoteRecord, Version};

use crate::client::{Cursor, Page, RemoteClient};
use crate::error::RemoteError;
use crate::table::RemoteTable;

const DEFAULT_PAGE_SIZE: usize = 100;

pub struct FileRemote {
    path: PathBuf,
    page_size: usize,
    guard: Mutex<()>,
}

impl FileRemote {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            guard: Mutex::new(()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current table contents.
    pub fn read(&self) -> Result<RemoteTable, RemoteError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        self.load()
    }

    /// Load, mutate, and persist the table in one step.
    pub fn modify<T>(
        &self,
        f: impl FnOnce(&mut RemoteTable, DateTime<Utc>) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut table = self.load()?;
        let out = f(&mut table, Utc::now())?;
        self.save(&table)?;
        Ok(out)
    }

    fn load(&self) -> Result<RemoteTable, RemoteError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                RemoteError::Permanent(format!("corrupt remote file {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RemoteTable::default()),
            Err(e) => Err(RemoteError::Transient(format!(
                "reading {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, table: &RemoteTable) -> Result<(), RemoteError> {
        let io = |e: std::io::Error| {
            RemoteError::Transient(format!("writing {}: {e}", self.path.display()))
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }
        let json = serde_json::to_string_pretty(table)
            .map_err(|e| RemoteError::Permanent(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(io)?;
            file.write_all(json.as_bytes()).map_err(io)?;
            file.sync_all().map_err(io)?;
        }
        fs::rename(&tmp, &self.path).map_err(io)
    }
}

impl RemoteClient for FileRemote {
    fn backend(&self) -> &'static str {
        "file"
    }

    fn list_since(&self, cursor: Option<&Cursor>) -> Result<Page, RemoteError> {
        Ok(self.read()?.list_page(cursor, self.page_size, true))
    }

    fn fetch(&self, external_id: &ExternalId) -> Result<RemoteRecord, RemoteError> {
        self.read()?.fetch(external_id)
    }

    fn create(
        &self,
        key: &ContentId,
        payload: &ContentPayload,
    ) -> Result<RemoteRecord, RemoteError> {
        self.modify(|t, now| t.create(key, payload, now))
    }

    fn update(
        &self,
        external_id: &ExternalId,
        payload: &ContentPayload,
        expected: Version,
    ) -> Result<Version, RemoteError> {
        self.modify(|t, now| t.update(external_id, payload, expected, now))
    }

    fn delete(&self, external_id: &ExternalId) -> Result<(), RemoteError> {
        self.modify(|t, _| {
            t.delete(external_id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_an_empty_remote() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = FileRemote::open(dir.path().join("cms.json"));
        let page = remote.list_since(None).expect("list");
        assert!(page.records.is_empty());
        assert!(page.next.is_none());
    }

    #[test]
    fn changes_persist_across_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cms.json");
        let ext = FileRemote::open(&path)
            .modify(|t, now| t.author("a.md", "alpha\n", now))
            .expect("author");

        let reopened = FileRemote::open(&path);
        let rec = reopened.fetch(&ext).expect("fetch");
        assert_eq!(rec.body.as_deref(), Some("alpha\n"));
        let page = reopened.list_since(None).expect("list");
        assert_eq!(page.records[0].body.as_deref(), Some("alpha\n"));
    }

    #[test]
    fn corrupt_file_is_permanent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cms.json");
        fs::write(&path, "{ nope").expect("write");
        let err = FileRemote::open(&path).list_since(None).unwrap_err();
        assert!(matches!(err, RemoteError::Permanent(_)));
    }
}
