//! Diff Engine: per-side change detection against the Sync State.
//!
//! A side is unchanged for an id when its current hash equals the hash
//! stored for that side; changed when it differs or nothing is stored yet;
//! deleted when the state knows the id but the side no longer has it.

use std::collections::{BTreeMap, BTreeSet};

use syllabus_core::config::HierarchyRule;
use syllabus_core::types::{
    ChangeKind, ChangeOp, ContentId, ContentRecord, Origin, RemoteRecord, Revision,
    SyncStateEntry,
};
use syllabus_remote::RemoteError;

use crate::error::SyncError;
use crate::extractor::Snapshot;
use crate::order::sort_ops;
use crate::state_store::SyncState;

/// Current remote listing keyed by local content id.
pub type RemoteView = BTreeMap<ContentId, RemoteRecord>;

/// Two independent, dependency-ordered change sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSets {
    pub local: Vec<ChangeOp>,
    pub remote: Vec<ChangeOp>,
}

impl ChangeSets {
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }
}

/// Whether a listed remote record differs from the last agreement. Used to
/// decide which bodies must be fetched before diffing.
pub fn remote_side_changed(record: &RemoteRecord, entry: Option<&SyncStateEntry>) -> bool {
    entry.map_or(true, |e| e.last_remote_hash != record.content_hash)
}

pub fn local_change(
    id: &ContentId,
    current: Option<&ContentRecord>,
    entry: Option<&SyncStateEntry>,
) -> Option<ChangeOp> {
    let kind = match (current, entry) {
        (Some(rec), Some(e)) if rec.content_hash == e.last_local_hash => return None,
        (Some(rec), Some(_)) => ChangeKind::Update(local_revision(rec)),
        (Some(rec), None) => ChangeKind::Create(local_revision(rec)),
        (None, Some(_)) => ChangeKind::Delete,
        (None, None) => return None,
    };
    let path = current
        .map(|r| r.path.clone())
        .or_else(|| entry.map(|e| e.path.clone()))
        .unwrap_or_default();
    Some(ChangeOp {
        id: id.clone(),
        origin: Origin::Local,
        path,
        kind,
    })
}

pub fn remote_change(
    id: &ContentId,
    current: Option<&RemoteRecord>,
    entry: Option<&SyncStateEntry>,
) -> Result<Option<ChangeOp>, SyncError> {
    let kind = match (current, entry) {
        (Some(rec), e) if !remote_side_changed(rec, e) => return Ok(None),
        (Some(rec), Some(_)) => ChangeKind::Update(remote_revision(rec)?),
        (Some(rec), None) => ChangeKind::Create(remote_revision(rec)?),
        (None, Some(_)) => ChangeKind::Delete,
        (None, None) => return Ok(None),
    };
    let path = current
        .map(|r| r.path.clone())
        .or_else(|| entry.map(|e| e.path.clone()))
        .unwrap_or_default();
    Ok(Some(ChangeOp {
        id: id.clone(),
        origin: Origin::Remote,
        path,
        kind,
    }))
}

/// Compare both current views against `state` for every id any of the three
/// knows about.
pub fn compute(
    local: &Snapshot,
    remote: &RemoteView,
    state: &SyncState,
    rule: HierarchyRule,
) -> Result<ChangeSets, SyncError> {
    let ids: BTreeSet<&ContentId> = local
        .keys()
        .chain(remote.keys())
        .chain(state.entries.keys())
        .collect();

    let mut changes = ChangeSets::default();
    for id in ids {
        let entry = state.get(id);
        if let Some(op) = local_change(id, local.get(id), entry) {
            changes.local.push(op);
        }
        if let Some(op) = remote_change(id, remote.get(id), entry)? {
            changes.remote.push(op);
        }
    }
    sort_ops(&mut changes.local, rule);
    sort_ops(&mut changes.remote, rule);
    tracing::debug!(
        local = changes.local.len(),
        remote = changes.remote.len(),
        "diff computed"
    );
    Ok(changes)
}

fn local_revision(rec: &ContentRecord) -> Revision {
    Revision {
        hash: rec.content_hash.clone(),
        body: rec.payload.clone(),
        modified_at: rec.local_modified_at,
    }
}

pub(crate) fn remote_revision(rec: &RemoteRecord) -> Result<Revision, SyncError> {
    let body = rec.body.clone().ok_or_else(|| {
        SyncError::Permanent(RemoteError::Permanent(format!(
            "remote record {} arrived without a body",
            rec.external_id
        )))
    })?;
    Ok(Revision {
        hash: rec.content_hash.clone(),
        body,
        modified_at: rec.remote_modified_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use syllabus_core::types::{ContentHash, ExternalId, Version};

    fn local(id: &str, hash: &str) -> ContentRecord {
        ContentRecord {
            id: ContentId::from(id),
            path: format!("{id}.md"),
            payload: format!("{hash}\n"),
            content_hash: ContentHash::from(hash),
            local_modified_at: Utc::now(),
        }
    }

    fn remote(id: &str, hash: &str) -> RemoteRecord {
        RemoteRecord {
            external_id: ExternalId(format!("cms-{id}")),
            content_id: ContentId::from(id),
            path: format!("{id}.md"),
            content_hash: ContentHash::from(hash),
            remote_modified_at: Utc::now(),
            version: Version(1),
            body: Some(format!("{hash}\n")),
        }
    }

    fn agreed(id: &str, local: &str, remote: &str) -> SyncStateEntry {
        SyncStateEntry {
            id: ContentId::from(id),
            external_id: ExternalId(format!("cms-{id}")),
            path: format!("{id}.md"),
            last_local_hash: ContentHash::from(local),
            last_remote_hash: ContentHash::from(remote),
            remote_version: Version(1),
            last_synced_at: Utc::now(),
            sequence: 1,
        }
    }

    fn state(entries: Vec<SyncStateEntry>) -> SyncState {
        SyncState {
            sequence: 1,
            entries: entries.into_iter().map(|e| (e.id.clone(), e)).collect(),
            ..SyncState::default()
        }
    }

    fn view(records: Vec<RemoteRecord>) -> RemoteView {
        records.into_iter().map(|r| (r.content_id.clone(), r)).collect()
    }

    fn snap(records: Vec<ContentRecord>) -> Snapshot {
        records.into_iter().map(|r| (r.id.clone(), r)).collect()
    }

    #[test]
    fn unchanged_sides_produce_nothing() {
        let changes = compute(
            &snap(vec![local("a", "h1")]),
            &view(vec![remote("a", "h1")]),
            &state(vec![agreed("a", "h1", "h1")]),
            HierarchyRule::Flat,
        )
        .expect("diff");
        assert!(changes.is_empty());
    }

    #[test]
    fn new_local_item_is_a_local_create() {
        let changes = compute(
            &snap(vec![local("a", "h1")]),
            &RemoteView::new(),
            &SyncState::default(),
            HierarchyRule::Flat,
        )
        .expect("diff");
        assert_eq!(changes.local.len(), 1);
        assert_eq!(changes.local[0].verb(), "create");
        assert!(changes.remote.is_empty());
    }

    #[test]
    fn remote_edit_is_a_remote_update() {
        let changes = compute(
            &snap(vec![local("a", "h1")]),
            &view(vec![remote("a", "h2")]),
            &state(vec![agreed("a", "h1", "h1")]),
            HierarchyRule::Flat,
        )
        .expect("diff");
        assert!(changes.local.is_empty());
        assert_eq!(changes.remote[0].verb(), "update");
        assert_eq!(changes.remote[0].hash(), Some(&ContentHash::from("h2")));
    }

    #[test]
    fn absence_after_agreement_is_a_delete() {
        let changes = compute(
            &Snapshot::new(),
            &view(vec![remote("a", "h1")]),
            &state(vec![agreed("a", "h1", "h1")]),
            HierarchyRule::Flat,
        )
        .expect("diff");
        assert_eq!(changes.local.len(), 1);
        assert!(changes.local[0].is_delete());
        assert_eq!(changes.local[0].path, "a.md");
        assert!(changes.remote.is_empty());
    }

    #[test]
    fn both_sides_are_reported_independently() {
        let changes = compute(
            &snap(vec![local("a", "h2")]),
            &view(vec![remote("a", "h3")]),
            &state(vec![agreed("a", "h1", "h1")]),
            HierarchyRule::Flat,
        )
        .expect("diff");
        assert_eq!(changes.local.len(), 1);
        assert_eq!(changes.remote.len(), 1);
    }

    #[test]
    fn missing_body_on_changed_remote_record_is_an_error() {
        let mut rec = remote("a", "h2");
        rec.body = None;
        let err = compute(
            &Snapshot::new(),
            &view(vec![rec]),
            &SyncState::default(),
            HierarchyRule::Flat,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Permanent(_)));
    }
}
