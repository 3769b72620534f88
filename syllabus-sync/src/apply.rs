//! Apply Engine: executes a resolved batch against both stores.
//!
//! Ops run strictly sequentially in the order given. Local-origin ops are
//! pushed through the Remote Client; remote-origin ops are staged as
//! `<file>.syllabus.tmp` next to their target and only moved into place by
//! [`Staging::commit`]. A failed batch removes everything it staged, so the
//! content tree is left as it was.
//!
//! A stale version on update is treated as a conflict discovered late: the
//! current remote record is fetched and the conflict goes back through the
//! resolver.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use syllabus_core::paths::STAGING_SUFFIX;
use syllabus_core::types::{
    ChangeKind, ChangeOp, Conflict, ConflictPolicy, ContentHash, ContentId, ContentPayload,
    ExternalId, Origin, RemoteRecord, Revision, Version,
};
use syllabus_remote::{RemoteClient, RemoteError};

use crate::diff::{remote_revision, RemoteView};
use crate::error::{io_err, SyncError};
use crate::extractor::{absolute_path, Snapshot};
use crate::resolver::{decide, ResolvedConflict};
use crate::retry::Retrier;
use crate::state_store::SyncState;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Both sides now hold the same content for an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Agreement {
    pub external_id: ExternalId,
    pub path: String,
    pub local_hash: ContentHash,
    pub remote_hash: ContentHash,
    pub remote_version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Agreed(Agreement),
    /// The item no longer exists on either side.
    Removed,
    /// A late conflict that policy left for an operator.
    Parked(Conflict),
}

/// Result of a fully applied batch, ready to commit.
#[derive(Debug)]
pub struct AppliedBatch {
    pub outcomes: Vec<(ContentId, Outcome)>,
    /// Conflicts discovered through stale versions and settled by policy.
    pub rediscovered: Vec<ResolvedConflict>,
    pub staging: Staging,
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// Local writes and removals held back until commit.
#[derive(Debug, Default)]
pub struct Staging {
    writes: Vec<(PathBuf, PathBuf)>,
    removals: Vec<PathBuf>,
    created_dirs: Vec<PathBuf>,
}

impl Staging {
    fn stage_write(&mut self, target: PathBuf, body: &str) -> Result<(), SyncError> {
        if let Some(parent) = target.parent() {
            self.ensure_dir(parent)?;
        }
        let tmp = PathBuf::from(format!("{}{STAGING_SUFFIX}", target.display()));
        fs::write(&tmp, body).map_err(|e| io_err(&tmp, e))?;
        self.writes.push((tmp, target));
        Ok(())
    }

    fn stage_removal(&mut self, target: PathBuf) {
        self.removals.push(target);
    }

    fn ensure_dir(&mut self, dir: &Path) -> Result<(), SyncError> {
        let mut missing = Vec::new();
        let mut cur = Some(dir);
        while let Some(d) = cur {
            if d.exists() {
                break;
            }
            missing.push(d.to_path_buf());
            cur = d.parent();
        }
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        self.created_dirs.extend(missing);
        Ok(())
    }

    /// Move staged writes into place, then perform staged removals, both in
    /// staging order.
    ///
    /// A failed rename discards the writes not yet moved, along with any
    /// directory left empty by them.
    pub fn commit(mut self) -> Result<(), SyncError> {
        let writes = std::mem::take(&mut self.writes);
        for (i, (tmp, target)) in writes.iter().enumerate() {
            if let Err(e) = fs::rename(tmp, target) {
                self.writes = writes[i..].to_vec();
                self.rollback();
                return Err(io_err(target, e));
            }
            tracing::info!("wrote: {}", target.display());
        }
        for target in &self.removals {
            match fs::remove_file(target) {
                Ok(()) => tracing::info!("removed: {}", target.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(target, e)),
            }
        }
        Ok(())
    }

    /// Discard every staged file and any directory created for one.
    pub fn rollback(self) {
        for (tmp, _) in &self.writes {
            let _ = fs::remove_file(tmp);
        }
        let mut dirs = self.created_dirs;
        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        for dir in dirs {
            let _ = fs::remove_dir(dir);
        }
    }
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

pub struct ApplyContext<'a> {
    pub content_root: &'a Path,
    pub remote: &'a dyn RemoteClient,
    pub retrier: &'a Retrier,
    pub local: &'a Snapshot,
    pub view: &'a RemoteView,
    pub state: &'a SyncState,
    pub policy: ConflictPolicy,
}

/// Apply `ops` in order. On error everything staged is rolled back and the
/// error is returned; remote mutations already made stay made and show up
/// as convergent changes in the next cycle.
pub fn apply(ops: &[ChangeOp], ctx: &ApplyContext<'_>) -> Result<AppliedBatch, SyncError> {
    let mut batch = AppliedBatch {
        outcomes: Vec::with_capacity(ops.len()),
        rediscovered: Vec::new(),
        staging: Staging::default(),
    };
    for op in ops {
        let result = match op.origin {
            Origin::Local => ctx.push(op, &mut batch),
            Origin::Remote => ctx.pull(op, &mut batch.staging),
        };
        match result {
            Ok(outcome) => {
                tracing::debug!(id = %op.id, origin = ?op.origin, op = op.verb(), "applied");
                batch.outcomes.push((op.id.clone(), outcome));
            }
            Err(e) => {
                tracing::warn!(id = %op.id, error = %e, "batch aborted; rolling back staged writes");
                batch.staging.rollback();
                return Err(e);
            }
        }
    }
    Ok(batch)
}

enum Recheck {
    Retry(Version),
    Recreate,
    Done(Outcome),
}

impl ApplyContext<'_> {
    // -----------------------------------------------------------------------
    // Local origin: write to the remote
    // -----------------------------------------------------------------------

    fn push(&self, op: &ChangeOp, batch: &mut AppliedBatch) -> Result<Outcome, SyncError> {
        let rev = match &op.kind {
            ChangeKind::Delete => {
                if let Some(ext) = self.known_external_id(&op.id) {
                    self.retrier.call("delete", || self.remote.delete(&ext))?;
                }
                return Ok(Outcome::Removed);
            }
            ChangeKind::Create(rev) | ChangeKind::Update(rev) => rev,
        };
        let payload = ContentPayload {
            path: op.path.clone(),
            body: rev.body.clone(),
        };

        let (ext, mut expected) = match self.known_target(&op.id) {
            Some(target) => target,
            None => match self.create(op, rev, &payload)? {
                Ok(outcome) => return Ok(outcome),
                Err(target) => target,
            },
        };

        let mut rechecked = false;
        loop {
            let err = match self
                .retrier
                .call("update", || self.remote.update(&ext, &payload, expected))
            {
                Ok(version) => return Ok(agreed(&ext, &op.path, &rev.hash, version)),
                Err(e) => e,
            };
            let late = matches!(
                err,
                SyncError::VersionConflict(_) | SyncError::Permanent(RemoteError::NotFound(_))
            );
            if !late || rechecked {
                return Err(err);
            }
            rechecked = true;
            match self.recheck(op, rev, &ext, batch)? {
                Recheck::Retry(version) => expected = version,
                Recheck::Recreate => {
                    return match self.create(op, rev, &payload)? {
                        Ok(outcome) => Ok(outcome),
                        Err((ext, version)) => {
                            let version = self
                                .retrier
                                .call("update", || self.remote.update(&ext, &payload, version))?;
                            Ok(agreed(&ext, &op.path, &rev.hash, version))
                        }
                    };
                }
                Recheck::Done(outcome) => return Ok(outcome),
            }
        }
    }

    /// Create with the content id as idempotency key. `Ok` when the remote
    /// now holds exactly this revision; `Err(target)` when the key already
    /// named a record with other content, which must then be updated.
    fn create(
        &self,
        op: &ChangeOp,
        rev: &Revision,
        payload: &ContentPayload,
    ) -> Result<Result<Outcome, (ExternalId, Version)>, SyncError> {
        let record = self
            .retrier
            .call("create", || self.remote.create(&op.id, payload))?;
        if record.content_hash == rev.hash {
            return Ok(Ok(agreed(
                &record.external_id,
                &op.path,
                &rev.hash,
                record.version,
            )));
        }
        tracing::debug!(id = %op.id, external_id = %record.external_id, "create key already in use");
        Ok(Err((record.external_id, record.version)))
    }

    /// Re-resolve after the remote moved on since it was listed.
    fn recheck(
        &self,
        op: &ChangeOp,
        rev: &Revision,
        ext: &ExternalId,
        batch: &mut AppliedBatch,
    ) -> Result<Recheck, SyncError> {
        let current = match self.retrier.call("fetch", || self.remote.fetch(ext)) {
            Ok(record) => Some(record),
            Err(SyncError::Permanent(RemoteError::NotFound(_))) => None,
            Err(e) => return Err(e),
        };
        if let Some(record) = &current {
            if record.content_hash == rev.hash {
                return Ok(Recheck::Done(agreed(ext, &op.path, &rev.hash, record.version)));
            }
            // Version moved but content did not: nothing new to reconcile.
            let agreed_hash = self.state.get(&op.id).map(|e| &e.last_remote_hash);
            let listed_hash = self.view.get(&op.id).map(|r| &r.content_hash);
            if [agreed_hash, listed_hash].contains(&Some(&record.content_hash)) {
                tracing::debug!(
                    id = %op.id,
                    version = %record.version,
                    "remote version moved without a content change; retrying"
                );
                return Ok(Recheck::Retry(record.version));
            }
        }
        let remote_op = match &current {
            Some(record) => ChangeOp {
                id: op.id.clone(),
                origin: Origin::Remote,
                path: record.path.clone(),
                kind: ChangeKind::Update(remote_revision(record)?),
            },
            None => ChangeOp {
                id: op.id.clone(),
                origin: Origin::Remote,
                path: op.path.clone(),
                kind: ChangeKind::Delete,
            },
        };
        let conflict = Conflict {
            id: op.id.clone(),
            local: op.clone(),
            remote: remote_op,
        };
        tracing::info!(id = %op.id, "remote changed during apply; re-resolving");
        let Some(resolved) = decide(&conflict, self.policy, None, Some(ext)) else {
            return Ok(Recheck::Done(Outcome::Parked(conflict)));
        };
        let winner = resolved.winner;
        batch.rediscovered.push(resolved);
        match (winner, current) {
            (Origin::Local, Some(record)) => Ok(Recheck::Retry(record.version)),
            (Origin::Local, None) => Ok(Recheck::Recreate),
            (Origin::Remote, Some(record)) => {
                let outcome = self.write_local(&conflict.remote, &record, &mut batch.staging)?;
                Ok(Recheck::Done(outcome))
            }
            (Origin::Remote, None) => Ok(Recheck::Done(self.remove_local(&op.id, &mut batch.staging))),
        }
    }

    // -----------------------------------------------------------------------
    // Remote origin: write to the content tree
    // -----------------------------------------------------------------------

    fn pull(&self, op: &ChangeOp, staging: &mut Staging) -> Result<Outcome, SyncError> {
        if op.is_delete() {
            return Ok(self.remove_local(&op.id, staging));
        }
        let record = self.view.get(&op.id).ok_or_else(|| {
            SyncError::Permanent(RemoteError::Permanent(format!(
                "remote record for '{}' missing from listing",
                op.id
            )))
        })?;
        self.write_local(op, record, staging)
    }

    fn write_local(
        &self,
        op: &ChangeOp,
        record: &RemoteRecord,
        staging: &mut Staging,
    ) -> Result<Outcome, SyncError> {
        let Some(rev) = op.revision() else {
            return Ok(self.remove_local(&op.id, staging));
        };
        if let Some(other) = self
            .local
            .values()
            .find(|r| r.path == op.path && r.id != op.id)
        {
            return Err(SyncError::Permanent(RemoteError::Permanent(format!(
                "remote item '{}' targets {}, which holds local item '{}'",
                op.id, op.path, other.id
            ))));
        }
        staging.stage_write(absolute_path(self.content_root, &op.path), &rev.body)?;
        if let Some(previous) = self.local.get(&op.id) {
            if previous.path != op.path {
                staging.stage_removal(absolute_path(self.content_root, &previous.path));
            }
        }
        Ok(agreed(&record.external_id, &op.path, &rev.hash, record.version))
    }

    fn remove_local(&self, id: &ContentId, staging: &mut Staging) -> Outcome {
        if let Some(current) = self.local.get(id) {
            staging.stage_removal(absolute_path(self.content_root, &current.path));
        }
        Outcome::Removed
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Remote record and version to update: the listing when it has the id,
    /// else the last agreement.
    fn known_target(&self, id: &ContentId) -> Option<(ExternalId, Version)> {
        self.view
            .get(id)
            .map(|r| (r.external_id.clone(), r.version))
            .or_else(|| {
                self.state
                    .get(id)
                    .map(|e| (e.external_id.clone(), e.remote_version))
            })
    }

    fn known_external_id(&self, id: &ContentId) -> Option<ExternalId> {
        self.known_target(id).map(|(ext, _)| ext)
    }
}

fn agreed(ext: &ExternalId, path: &str, hash: &ContentHash, version: Version) -> Outcome {
    Outcome::Agreed(Agreement {
        external_id: ext.clone(),
        path: path.to_string(),
        local_hash: hash.clone(),
        remote_hash: hash.clone(),
        remote_version: version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use syllabus_core::config::RetrySettings;
    use syllabus_core::types::SyncStateEntry;
    use syllabus_remote::{MemoryRemote, RemoteOp};
    use tempfile::TempDir;

    use crate::retry::CancelFlag;

    #[test]
    fn rollback_removes_staged_files_and_created_dirs() {
        let tmp = TempDir::new().expect("tmp");
        let mut staging = Staging::default();
        let target = tmp.path().join("new/dir/item.md");
        staging.stage_write(target.clone(), "x\n").expect("stage");
        assert!(PathBuf::from(format!("{}{STAGING_SUFFIX}", target.display())).exists());

        staging.rollback();
        assert!(!tmp.path().join("new").exists());
    }

    #[test]
    fn commit_moves_writes_then_removes() {
        let tmp = TempDir::new().expect("tmp");
        let old = tmp.path().join("old.md");
        fs::write(&old, "x\n").expect("write");
        let mut staging = Staging::default();
        staging
            .stage_write(tmp.path().join("moved.md"), "x\n")
            .expect("stage");
        staging.stage_removal(old.clone());
        assert!(!tmp.path().join("moved.md").exists());

        staging.commit().expect("commit");
        assert_eq!(fs::read_to_string(tmp.path().join("moved.md")).expect("read"), "x\n");
        assert!(!old.exists());
    }

    #[test]
    fn failed_rename_discards_remaining_writes_and_created_dirs() {
        let tmp = TempDir::new().expect("tmp");
        let blocked = tmp.path().join("blocked.md");
        fs::create_dir(&blocked).expect("mkdir");
        fs::write(blocked.join("keep.md"), "x\n").expect("write");

        let mut staging = Staging::default();
        staging.stage_write(blocked.clone(), "x\n").expect("stage");
        staging
            .stage_write(tmp.path().join("new/dir/item.md"), "y\n")
            .expect("stage");

        assert!(staging.commit().is_err());
        assert!(blocked.join("keep.md").exists());
        assert!(!PathBuf::from(format!("{}{STAGING_SUFFIX}", blocked.display())).exists());
        assert!(!tmp.path().join("new").exists());
    }

    fn local_update(body: &str) -> ChangeOp {
        ChangeOp {
            id: ContentId::from("intro"),
            origin: Origin::Local,
            path: "intro.md".to_string(),
            kind: ChangeKind::Update(Revision {
                hash: syllabus_core::canonical::content_hash("intro.md", body).expect("hash"),
                body: body.to_string(),
                modified_at: chrono::Utc::now(),
            }),
        }
    }

    #[rstest]
    #[case(ConflictPolicy::Manual)]
    #[case(ConflictPolicy::LastWriterWins)]
    #[case(ConflictPolicy::PreferRemote)]
    fn version_bump_without_content_change_pushes_local_edit(#[case] policy: ConflictPolicy) {
        let tmp = TempDir::new().expect("tmp");
        let remote = MemoryRemote::new();
        let ext = remote.author("intro.md", "v1\n").expect("author");
        let synced = remote.fetch(&ext).expect("fetch");
        remote.edit(&ext, "v1\n").expect("edit");

        let mut state = SyncState::default();
        state.entries.insert(
            ContentId::from("intro"),
            SyncStateEntry {
                id: ContentId::from("intro"),
                external_id: ext.clone(),
                path: "intro.md".to_string(),
                last_local_hash: synced.content_hash.clone(),
                last_remote_hash: synced.content_hash.clone(),
                remote_version: synced.version,
                last_synced_at: chrono::Utc::now(),
                sequence: 1,
            },
        );
        let view = RemoteView::new();
        let retrier = Retrier::new(&RetrySettings::immediate(3), CancelFlag::new());
        let local = Snapshot::new();
        let ctx = ApplyContext {
            content_root: tmp.path(),
            remote: &remote,
            retrier: &retrier,
            local: &local,
            view: &view,
            state: &state,
            policy,
        };

        let batch = apply(&[local_update("local edit\n")], &ctx).expect("apply");
        assert!(batch.rediscovered.is_empty());
        assert!(matches!(
            &batch.outcomes[0].1,
            Outcome::Agreed(a) if a.remote_version == Version(3)
        ));
        assert_eq!(remote.calls(RemoteOp::Update), 2);
        assert_eq!(
            remote.fetch(&ext).expect("fetch").body.as_deref(),
            Some("local edit\n")
        );
    }

    #[test]
    fn stale_version_under_prefer_local_retries_with_current_version() {
        let tmp = TempDir::new().expect("tmp");
        let remote = MemoryRemote::new();
        let ext = remote.author("intro.md", "v1\n").expect("author");
        let listed = remote.fetch(&ext).expect("fetch");
        remote.edit(&ext, "edited elsewhere\n").expect("edit");

        let mut view = RemoteView::new();
        view.insert(ContentId::from("intro"), listed);
        let retrier = Retrier::new(&RetrySettings::immediate(3), CancelFlag::new());
        let local = Snapshot::new();
        let state = SyncState::default();
        let ctx = ApplyContext {
            content_root: tmp.path(),
            remote: &remote,
            retrier: &retrier,
            local: &local,
            view: &view,
            state: &state,
            policy: ConflictPolicy::PreferLocal,
        };
        let body = "local wins\n".to_string();
        let op = ChangeOp {
            id: ContentId::from("intro"),
            origin: Origin::Local,
            path: "intro.md".to_string(),
            kind: ChangeKind::Update(Revision {
                hash: syllabus_core::canonical::content_hash("intro.md", &body).expect("hash"),
                body,
                modified_at: chrono::Utc::now(),
            }),
        };

        let batch = apply(&[op], &ctx).expect("apply");
        assert_eq!(batch.rediscovered.len(), 1);
        assert!(matches!(
            &batch.outcomes[0].1,
            Outcome::Agreed(a) if a.remote_version == Version(3)
        ));
        assert_eq!(remote.calls(RemoteOp::Update), 2);
        assert_eq!(
            remote.fetch(&ext).expect("fetch").body.as_deref(),
            Some("local wins\n")
        );
    }
}
