//! Conflict queue: parked conflicts awaiting an operator.
//!
//! Stored at `<root>/.syllabus/conflicts.json`. A cycle rewrites the queue
//! with exactly the conflicts it parked; an operator decision recorded with
//! [`resolve_at`] is applied by the next cycle and the entry then leaves the
//! queue.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;

use syllabus_core::paths;
use syllabus_core::types::{Conflict, ContentId, Origin};

use crate::error::{corrupt, io_err, SyncError};
use crate::lock::SyncLock;

const QUEUE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedConflict {
    pub conflict: Conflict,
    pub parked_at: DateTime<Utc>,
    /// Side the operator chose to keep; applied by the next cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Origin>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictQueue {
    pub version: u32,
    #[serde(default)]
    pub conflicts: BTreeMap<ContentId, ParkedConflict>,
}

impl Default for ConflictQueue {
    fn default() -> Self {
        Self {
            version: QUEUE_VERSION,
            conflicts: BTreeMap::new(),
        }
    }
}

impl ConflictQueue {
    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Operator decisions waiting to be applied.
    pub fn decisions(&self) -> BTreeMap<ContentId, Origin> {
        self.conflicts
            .iter()
            .filter_map(|(id, p)| p.resolution.map(|side| (id.clone(), side)))
            .collect()
    }

    /// Queue holding exactly `parked`. Entries that were already parked keep
    /// their original `parked_at`; decisions are not carried over because
    /// an id parked again was not decided this cycle.
    pub fn rebuild(&self, parked: &[Conflict], now: DateTime<Utc>) -> Self {
        let conflicts = parked
            .iter()
            .map(|c| {
                let parked_at = self
                    .conflicts
                    .get(&c.id)
                    .map(|p| p.parked_at)
                    .unwrap_or(now);
                let entry = ParkedConflict {
                    conflict: c.clone(),
                    parked_at,
                    resolution: None,
                };
                (c.id.clone(), entry)
            })
            .collect();
        Self {
            version: QUEUE_VERSION,
            conflicts,
        }
    }
}

pub fn load_at(root: &Path) -> Result<ConflictQueue, SyncError> {
    let path = paths::conflicts_path(root);
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConflictQueue::default()),
        Err(e) => return Err(io_err(&path, e)),
    };
    let queue: ConflictQueue =
        serde_json::from_str(&contents).map_err(|e| corrupt(&path, e.to_string()))?;
    if queue.version != QUEUE_VERSION {
        return Err(corrupt(
            &path,
            format!("unsupported conflict queue version {}", queue.version),
        ));
    }
    Ok(queue)
}

/// Save the queue atomically. An empty queue removes the file.
pub fn save_at(root: &Path, queue: &ConflictQueue) -> Result<(), SyncError> {
    let path = paths::conflicts_path(root);
    if queue.is_empty() {
        return match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        };
    }
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("invalid queue path")));
    };
    fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(queue)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| io_err(&tmp, e))?;
    }
    fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))
}

/// Record which side to keep for a parked conflict.
///
/// Takes the sync lock so a running cycle cannot overwrite the decision.
pub fn resolve_at(root: &Path, id: &ContentId, keep: Origin) -> Result<ParkedConflict, SyncError> {
    let _lock = SyncLock::acquire(root)?;
    let mut queue = load_at(root)?;
    let entry = queue
        .conflicts
        .get_mut(id)
        .ok_or_else(|| SyncError::UnknownConflict(id.clone()))?;
    entry.resolution = Some(keep);
    let updated = entry.clone();
    save_at(root, &queue)?;
    tracing::info!(id = %id, keep = %keep, "operator decision recorded");
    Ok(updated)
}

/// Unified diff from the local body to the remote body. A deleted side
/// diffs as empty.
pub fn render_diff(conflict: &Conflict) -> String {
    let local = conflict
        .local
        .revision()
        .map(|r| r.body.as_str())
        .unwrap_or("");
    let remote = conflict
        .remote
        .revision()
        .map(|r| r.body.as_str())
        .unwrap_or("");
    let old_header = format!("local/{}", conflict.local.path);
    let new_header = format!("remote/{}", conflict.remote.path);
    TextDiff::from_lines(local, remote)
        .unified_diff()
        .header(&old_header, &new_header)
        .context_radius(3)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use syllabus_core::types::{ChangeKind, ChangeOp, ContentHash, Revision};
    use tempfile::TempDir;

    fn side(origin: Origin, body: &str) -> ChangeOp {
        ChangeOp {
            id: ContentId::from("intro"),
            origin,
            path: "intro.md".to_string(),
            kind: ChangeKind::Update(Revision {
                hash: ContentHash::from(body),
                body: body.to_string(),
                modified_at: Utc::now(),
            }),
        }
    }

    fn conflict() -> Conflict {
        Conflict {
            id: ContentId::from("intro"),
            local: side(Origin::Local, "# Intro\nlocal line\n"),
            remote: side(Origin::Remote, "# Intro\nremote line\n"),
        }
    }

    #[test]
    fn rebuild_keeps_parked_at_and_drops_vanished_entries() {
        let earlier = Utc::now() - chrono::Duration::hours(1);
        let first = ConflictQueue::default().rebuild(&[conflict()], earlier);
        let again = first.rebuild(&[conflict()], Utc::now());
        assert_eq!(again.conflicts[&ContentId::from("intro")].parked_at, earlier);

        let cleared = again.rebuild(&[], Utc::now());
        assert!(cleared.is_empty());
    }

    #[test]
    fn resolve_records_decision_and_persists() {
        let tmp = TempDir::new().expect("tmp");
        let queue = ConflictQueue::default().rebuild(&[conflict()], Utc::now());
        save_at(tmp.path(), &queue).expect("save");

        resolve_at(tmp.path(), &ContentId::from("intro"), Origin::Remote).expect("resolve");
        let loaded = load_at(tmp.path()).expect("load");
        assert_eq!(
            loaded.decisions().get(&ContentId::from("intro")),
            Some(&Origin::Remote)
        );
    }

    #[test]
    fn resolving_unknown_id_fails() {
        let tmp = TempDir::new().expect("tmp");
        let err = resolve_at(tmp.path(), &ContentId::from("nope"), Origin::Local).unwrap_err();
        assert!(matches!(err, SyncError::UnknownConflict(_)));
    }

    #[test]
    fn empty_queue_removes_the_file() {
        let tmp = TempDir::new().expect("tmp");
        let queue = ConflictQueue::default().rebuild(&[conflict()], Utc::now());
        save_at(tmp.path(), &queue).expect("save");
        assert!(paths::conflicts_path(tmp.path()).exists());
        save_at(tmp.path(), &ConflictQueue::default()).expect("save empty");
        assert!(!paths::conflicts_path(tmp.path()).exists());
    }

    #[test]
    fn diff_shows_both_sides() {
        let diff = render_diff(&conflict());
        assert!(diff.contains("--- local/intro.md"));
        assert!(diff.contains("+++ remote/intro.md"));
        assert!(diff.contains("-local line"));
        assert!(diff.contains("+remote line"));
    }
}
