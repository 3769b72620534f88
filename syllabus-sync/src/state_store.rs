//! Sync State Store: the last mutually agreed state per content item.
//!
//! Persists a [`SyncState`] JSON document at `<root>/.syllabus/state.json`.
//! The file is read once at the start of a cycle and replaced once at the
//! end with a `.tmp` write, fsync, and rename, so readers only ever see a
//! fully committed state.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use syllabus_core::paths;
use syllabus_core::types::{ContentId, ExternalId, SyncStateEntry};

use crate::error::{corrupt, io_err, SyncError};

pub const STATE_VERSION: u32 = 1;

/// On-disk Sync State payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncState {
    pub version: u32,
    /// Incremented by every committed cycle that changed the state.
    pub sequence: u64,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: BTreeMap<ContentId, SyncStateEntry>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            sequence: 0,
            synced_at: None,
            entries: BTreeMap::new(),
        }
    }
}

impl SyncState {
    pub fn get(&self, id: &ContentId) -> Option<&SyncStateEntry> {
        self.entries.get(id)
    }

    pub fn by_external_id(&self, external_id: &ExternalId) -> Option<&SyncStateEntry> {
        self.entries.values().find(|e| &e.external_id == external_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check internal consistency. Any violation is corruption; nothing is
    /// repaired automatically.
    fn check(&self, path: &Path) -> Result<(), SyncError> {
        if self.version != STATE_VERSION {
            return Err(corrupt(
                path,
                format!("unsupported state version {}", self.version),
            ));
        }
        let mut external_ids = BTreeSet::new();
        for (key, entry) in &self.entries {
            if key != &entry.id {
                return Err(corrupt(
                    path,
                    format!("entry key '{key}' does not match its id '{}'", entry.id),
                ));
            }
            if entry.sequence > self.sequence {
                return Err(corrupt(
                    path,
                    format!(
                        "entry '{key}' has sequence {} beyond store sequence {}",
                        entry.sequence, self.sequence
                    ),
                ));
            }
            if !external_ids.insert(&entry.external_id) {
                return Err(corrupt(
                    path,
                    format!("external id '{}' is mapped twice", entry.external_id),
                ));
            }
        }
        Ok(())
    }
}

/// Load the state for the repository at `root`.
///
/// A missing file is an empty state (nothing agreed yet). An unreadable or
/// inconsistent file is [`SyncError::StateCorruption`].
pub fn load_at(root: &Path) -> Result<SyncState, SyncError> {
    let path = paths::state_path(root);
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SyncState::default()),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            return Err(corrupt(&path, "file is not valid UTF-8"))
        }
        Err(e) => return Err(io_err(&path, e)),
    };
    let state: SyncState =
        serde_json::from_str(&contents).map_err(|e| corrupt(&path, e.to_string()))?;
    state.check(&path)?;
    Ok(state)
}

/// Replace the state atomically.
///
/// Writes `<path>.tmp`, fsyncs it, then renames over `<path>`.
pub fn save_at(root: &Path, state: &SyncState) -> Result<(), SyncError> {
    let path = paths::state_path(root);
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("invalid state path")));
    };
    fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| io_err(&tmp, e))?;
    }
    if let Err(e) = fs::rename(&tmp, &path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(&path, e));
    }
    tracing::debug!(sequence = state.sequence, entries = state.len(), "state committed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use syllabus_core::types::{ContentHash, Version};
    use tempfile::TempDir;

    fn entry(id: &str, ext: &str, sequence: u64) -> SyncStateEntry {
        SyncStateEntry {
            id: ContentId::from(id),
            external_id: ExternalId::from(ext),
            path: format!("{id}.md"),
            last_local_hash: ContentHash::from("aa"),
            last_remote_hash: ContentHash::from("aa"),
            remote_version: Version(1),
            last_synced_at: Utc::now(),
            sequence,
        }
    }

    fn state_with(entries: Vec<SyncStateEntry>, sequence: u64) -> SyncState {
        SyncState {
            sequence,
            synced_at: Some(Utc::now()),
            entries: entries.into_iter().map(|e| (e.id.clone(), e)).collect(),
            ..SyncState::default()
        }
    }

    #[test]
    fn empty_state_when_file_missing() {
        let tmp = TempDir::new().expect("tmp");
        let state = load_at(tmp.path()).expect("load");
        assert!(state.is_empty());
        assert_eq!(state.sequence, 0);
    }

    #[test]
    fn roundtrip_save_load() {
        let tmp = TempDir::new().expect("tmp");
        let state = state_with(vec![entry("intro", "cms-1", 1)], 1);
        save_at(tmp.path(), &state).expect("save");
        assert_eq!(load_at(tmp.path()).expect("load"), state);
        assert!(!paths::state_path(tmp.path()).with_extension("json.tmp").exists());
    }

    #[test]
    fn unparsable_file_is_corruption() {
        let tmp = TempDir::new().expect("tmp");
        let path = paths::state_path(tmp.path());
        fs::create_dir_all(path.parent().expect("dir")).expect("mkdir");
        fs::write(&path, "{ \"version\": 1, \"sequence\": ").expect("write");
        let err = load_at(tmp.path()).unwrap_err();
        assert!(matches!(err, SyncError::StateCorruption { .. }), "got: {err}");
    }

    #[test]
    fn inconsistent_entries_are_corruption() {
        let tmp = TempDir::new().expect("tmp");

        let ahead = state_with(vec![entry("a", "cms-1", 5)], 2);
        save_at(tmp.path(), &ahead).expect("save");
        assert!(matches!(
            load_at(tmp.path()),
            Err(SyncError::StateCorruption { .. })
        ));

        let shared = state_with(vec![entry("a", "cms-1", 1), entry("b", "cms-1", 1)], 1);
        save_at(tmp.path(), &shared).expect("save");
        assert!(matches!(
            load_at(tmp.path()),
            Err(SyncError::StateCorruption { .. })
        ));

        let mut rekeyed = state_with(vec![entry("a", "cms-1", 1)], 1);
        let e = rekeyed.entries.remove(&ContentId::from("a")).expect("entry");
        rekeyed.entries.insert(ContentId::from("z"), e);
        save_at(tmp.path(), &rekeyed).expect("save");
        assert!(matches!(
            load_at(tmp.path()),
            Err(SyncError::StateCorruption { .. })
        ));
    }
}
