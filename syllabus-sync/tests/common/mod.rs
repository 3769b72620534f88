#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use filetime::{set_file_mtime, FileTime};
use tempfile::TempDir;

use syllabus_core::config::{HierarchyRule, RemoteConfig, RetrySettings, SyncConfig};
use syllabus_core::paths;
use syllabus_core::types::{ConflictPolicy, ContentId, ExternalId, Version};
use syllabus_remote::MemoryRemote;
use syllabus_sync::pipeline::{run_cycle, CycleOptions, CycleReport, Quiet};
use syllabus_sync::state_store;
use syllabus_sync::{SyncError, SyncState};

/// A repository root with a content tree and an in-memory CMS.
pub struct Repo {
    pub dir: TempDir,
    pub config: SyncConfig,
    pub remote: MemoryRemote,
}

impl Repo {
    pub fn new(policy: ConflictPolicy) -> Self {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir_all(dir.path().join("content")).expect("content root");
        let mut config = SyncConfig::new(RemoteConfig::Memory, HierarchyRule::PathDepth)
            .with_policy(policy);
        config.retry = RetrySettings::immediate(3);
        Self {
            dir,
            config,
            remote: MemoryRemote::new(),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn file(&self, rel: &str) -> PathBuf {
        self.root().join("content").join(rel)
    }

    pub fn write(&self, rel: &str, body: &str) -> PathBuf {
        let path = self.file(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, body).expect("write content");
        path
    }

    pub fn write_at(&self, rel: &str, body: &str, at: DateTime<Utc>) -> PathBuf {
        let path = self.write(rel, body);
        set_file_mtime(&path, FileTime::from_unix_time(at.timestamp(), 0)).expect("set mtime");
        path
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.file(rel)).expect("read content")
    }

    pub fn cycle(&self) -> Result<CycleReport, SyncError> {
        self.cycle_with(&CycleOptions::default())
    }

    pub fn cycle_with(&self, opts: &CycleOptions) -> Result<CycleReport, SyncError> {
        run_cycle(self.root(), &self.config, &self.remote, opts, &Quiet)
    }

    pub fn state(&self) -> SyncState {
        state_store::load_at(self.root()).expect("load state")
    }

    /// Raw state file, or `None` when nothing was ever committed.
    pub fn state_bytes(&self) -> Option<Vec<u8>> {
        fs::read(paths::state_path(self.root())).ok()
    }

    pub fn external_id(&self, id: &str) -> ExternalId {
        self.remote
            .find(&ContentId::from(id))
            .map(|r| r.external_id)
            .expect("remote record present")
    }

    pub fn remote_body(&self, id: &str) -> Option<String> {
        self.remote.find(&ContentId::from(id)).map(|r| r.body)
    }

    /// No staging leftovers anywhere under the content root.
    pub fn staging_files(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![self.root().join("content")];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.to_string_lossy().ends_with(paths::STAGING_SUFFIX) {
                    out.push(path);
                }
            }
        }
        out
    }
}

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

pub fn hash(path: &str, body: &str) -> syllabus_core::types::ContentHash {
    syllabus_core::canonical::content_hash(path, body).expect("hash")
}

/// State entries without timestamps, for comparing runs.
pub fn fingerprint(state: &SyncState) -> Vec<(String, String, String, String, Version)> {
    state
        .entries
        .values()
        .map(|e| {
            (
                e.id.0.clone(),
                e.path.clone(),
                e.last_local_hash.0.clone(),
                e.last_remote_hash.0.clone(),
                e.remote_version,
            )
        })
        .collect()
}
