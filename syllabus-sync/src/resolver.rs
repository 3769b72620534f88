//! Conflict Resolver: merges the two change sets into one ordered batch.
//!
//! An id is in conflict when both sides changed it since the last agreement
//! and the changes differ. Changes that already agree (same new hash, or
//! deleted on both sides) are convergent and need no write.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use syllabus_core::config::HierarchyRule;
use syllabus_core::types::{
    ChangeOp, Conflict, ConflictPolicy, ContentId, ExternalId, Origin,
};

use crate::diff::{ChangeSets, RemoteView};
use crate::order::sort_ops;
use crate::state_store::SyncState;

/// Who settled a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "by", content = "policy")]
pub enum DecidedBy {
    Policy(ConflictPolicy),
    Operator,
}

impl fmt::Display for DecidedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecidedBy::Policy(p) => write!(f, "{p}"),
            DecidedBy::Operator => write!(f, "operator"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConflict {
    pub id: ContentId,
    pub winner: Origin,
    pub decided_by: DecidedBy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Convergence {
    /// Both sides hold the same new content.
    Agreed { id: ContentId },
    /// Both sides deleted the item.
    Deleted { id: ContentId },
}

impl Convergence {
    pub fn id(&self) -> &ContentId {
        match self {
            Convergence::Agreed { id } | Convergence::Deleted { id } => id,
        }
    }
}

/// Output of one resolution pass.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Merged batch in dependency order.
    pub ops: Vec<ChangeOp>,
    pub converged: Vec<Convergence>,
    pub resolved: Vec<ResolvedConflict>,
    /// Conflicts left for an operator; excluded from `ops`.
    pub parked: Vec<Conflict>,
}

pub struct ResolveContext<'a> {
    pub policy: ConflictPolicy,
    pub hierarchy: HierarchyRule,
    /// One-shot operator decisions, applied regardless of policy.
    pub decisions: &'a BTreeMap<ContentId, Origin>,
    pub remote: &'a RemoteView,
    pub state: &'a SyncState,
}

impl ResolveContext<'_> {
    fn external_id(&self, id: &ContentId) -> Option<&ExternalId> {
        self.remote
            .get(id)
            .map(|r| &r.external_id)
            .or_else(|| self.state.get(id).map(|e| &e.external_id))
    }
}

pub fn resolve(changes: ChangeSets, ctx: &ResolveContext<'_>) -> Resolution {
    let mut remote_by_id: BTreeMap<ContentId, ChangeOp> = changes
        .remote
        .into_iter()
        .map(|op| (op.id.clone(), op))
        .collect();

    let mut out = Resolution::default();
    for local in changes.local {
        let Some(remote) = remote_by_id.remove(&local.id) else {
            out.ops.push(local);
            continue;
        };
        if let Some(c) = convergence(&local, &remote) {
            tracing::debug!(id = %local.id, "changes converged");
            out.converged.push(c);
            continue;
        }
        let conflict = Conflict {
            id: local.id.clone(),
            local,
            remote,
        };
        let operator = ctx.decisions.get(&conflict.id).copied();
        match decide(&conflict, ctx.policy, operator, ctx.external_id(&conflict.id)) {
            Some(resolved) => {
                tracing::info!(
                    id = %conflict.id,
                    winner = %resolved.winner,
                    by = %resolved.decided_by,
                    "conflict resolved"
                );
                out.ops.push(match resolved.winner {
                    Origin::Local => conflict.local,
                    Origin::Remote => conflict.remote,
                });
                out.resolved.push(resolved);
            }
            None => {
                tracing::warn!(id = %conflict.id, "conflict parked for operator review");
                out.parked.push(conflict);
            }
        }
    }
    out.ops.extend(remote_by_id.into_values());
    sort_ops(&mut out.ops, ctx.hierarchy);
    out
}

/// Settle one conflict. `None` means park it.
///
/// An operator decision wins over any policy. `external_id` is the tie-break
/// partner for `last-writer-wins`.
pub fn decide(
    conflict: &Conflict,
    policy: ConflictPolicy,
    operator: Option<Origin>,
    external_id: Option<&ExternalId>,
) -> Option<ResolvedConflict> {
    let (winner, decided_by) = match (operator, policy) {
        (Some(side), _) => (side, DecidedBy::Operator),
        (None, ConflictPolicy::Manual) => return None,
        (None, ConflictPolicy::PreferLocal) => (Origin::Local, DecidedBy::Policy(policy)),
        (None, ConflictPolicy::PreferRemote) => (Origin::Remote, DecidedBy::Policy(policy)),
        (None, ConflictPolicy::LastWriterWins) => {
            (last_writer(conflict, external_id), DecidedBy::Policy(policy))
        }
    };
    Some(ResolvedConflict {
        id: conflict.id.clone(),
        winner,
        decided_by,
    })
}

/// Later modification wins. A surviving edit beats a delete, which carries
/// no timestamp.
pub fn last_writer(conflict: &Conflict, external_id: Option<&ExternalId>) -> Origin {
    match (conflict.local.revision(), conflict.remote.revision()) {
        (Some(l), Some(r)) => match l.modified_at.cmp(&r.modified_at) {
            std::cmp::Ordering::Greater => Origin::Local,
            std::cmp::Ordering::Less => Origin::Remote,
            std::cmp::Ordering::Equal => tie_break(&conflict.id, external_id),
        },
        (Some(_), None) => Origin::Local,
        (None, Some(_)) => Origin::Remote,
        (None, None) => Origin::Local,
    }
}

/// Exact-tie rule: local wins iff its id sorts at or before the remote
/// external id.
///
/// The comparison is byte-wise against whatever id format the backend
/// assigns (`cms-000001` for file and memory stores, numeric ids for
/// Strapi), so the same content id may break a tie differently on
/// different backends. For a fixed backend it is stable across runs.
pub fn tie_break(id: &ContentId, external_id: Option<&ExternalId>) -> Origin {
    let other = external_id.map(|e| e.as_str()).unwrap_or("");
    if id.as_str() <= other {
        Origin::Local
    } else {
        Origin::Remote
    }
}

fn convergence(local: &ChangeOp, remote: &ChangeOp) -> Option<Convergence> {
    match (local.hash(), remote.hash()) {
        (None, None) => Some(Convergence::Deleted {
            id: local.id.clone(),
        }),
        (Some(l), Some(r)) if l == r => Some(Convergence::Agreed {
            id: local.id.clone(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use rstest::rstest;
    use syllabus_core::types::{ChangeKind, ContentHash, Revision};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).single().expect("time")
    }

    fn upsert(id: &str, origin: Origin, hash: &str, minute: u32) -> ChangeOp {
        ChangeOp {
            id: ContentId::from(id),
            origin,
            path: format!("{id}.md"),
            kind: ChangeKind::Update(Revision {
                hash: ContentHash::from(hash),
                body: format!("{hash}\n"),
                modified_at: at(minute),
            }),
        }
    }

    fn delete(id: &str, origin: Origin) -> ChangeOp {
        ChangeOp {
            id: ContentId::from(id),
            origin,
            path: format!("{id}.md"),
            kind: ChangeKind::Delete,
        }
    }

    fn run(changes: ChangeSets, policy: ConflictPolicy) -> Resolution {
        let decisions = BTreeMap::new();
        let remote = RemoteView::new();
        let state = SyncState::default();
        resolve(
            changes,
            &ResolveContext {
                policy,
                hierarchy: HierarchyRule::Flat,
                decisions: &decisions,
                remote: &remote,
                state: &state,
            },
        )
    }

    #[test]
    fn non_conflicting_changes_pass_through_merged() {
        let res = run(
            ChangeSets {
                local: vec![upsert("b", Origin::Local, "h1", 0)],
                remote: vec![upsert("a", Origin::Remote, "h2", 0)],
            },
            ConflictPolicy::Manual,
        );
        let ids: Vec<_> = res.ops.iter().map(|o| (o.id.as_str(), o.origin)).collect();
        assert_eq!(ids, vec![("a", Origin::Remote), ("b", Origin::Local)]);
        assert!(res.parked.is_empty());
    }

    #[rstest]
    #[case(ConflictPolicy::LastWriterWins, Some(Origin::Remote))]
    #[case(ConflictPolicy::PreferLocal, Some(Origin::Local))]
    #[case(ConflictPolicy::PreferRemote, Some(Origin::Remote))]
    #[case(ConflictPolicy::Manual, None)]
    fn policy_decides_true_conflicts(
        #[case] policy: ConflictPolicy,
        #[case] expected: Option<Origin>,
    ) {
        let res = run(
            ChangeSets {
                local: vec![upsert("intro", Origin::Local, "h2", 2)],
                remote: vec![upsert("intro", Origin::Remote, "h3", 5)],
            },
            policy,
        );
        match expected {
            Some(winner) => {
                assert_eq!(res.ops.len(), 1);
                assert_eq!(res.ops[0].origin, winner);
                assert_eq!(res.resolved[0].winner, winner);
            }
            None => {
                assert!(res.ops.is_empty());
                assert_eq!(res.parked.len(), 1);
                assert_eq!(res.parked[0].id.as_str(), "intro");
            }
        }
    }

    #[test]
    fn identical_changes_converge() {
        let res = run(
            ChangeSets {
                local: vec![upsert("a", Origin::Local, "h2", 1), delete("b", Origin::Local)],
                remote: vec![upsert("a", Origin::Remote, "h2", 3), delete("b", Origin::Remote)],
            },
            ConflictPolicy::Manual,
        );
        assert!(res.ops.is_empty());
        assert!(res.parked.is_empty());
        assert_eq!(res.converged.len(), 2);
    }

    #[test]
    fn exact_tie_is_a_pure_function_of_ids() {
        let conflict = Conflict {
            id: ContentId::from("intro"),
            local: upsert("intro", Origin::Local, "h2", 4),
            remote: upsert("intro", Origin::Remote, "h3", 4),
        };
        let low = ExternalId::from("cms-000001");
        let high = ExternalId::from("zz-1");
        for _ in 0..3 {
            assert_eq!(last_writer(&conflict, Some(&low)), Origin::Remote);
            assert_eq!(last_writer(&conflict, Some(&high)), Origin::Local);
        }
    }

    #[test]
    fn exact_tie_follows_backend_external_id_format() {
        let id = ContentId::from("abc");
        assert_eq!(tie_break(&id, Some(&ExternalId::from("cms-000001"))), Origin::Local);
        assert_eq!(tie_break(&id, Some(&ExternalId::from("7"))), Origin::Remote);
        assert_eq!(tie_break(&id, None), Origin::Remote);
    }

    #[test]
    fn edit_beats_delete_under_last_writer_wins() {
        let conflict = Conflict {
            id: ContentId::from("a"),
            local: delete("a", Origin::Local),
            remote: upsert("a", Origin::Remote, "h2", 0),
        };
        assert_eq!(last_writer(&conflict, None), Origin::Remote);
    }

    #[test]
    fn operator_decision_overrides_manual_policy() {
        let mut decisions = BTreeMap::new();
        decisions.insert(ContentId::from("intro"), Origin::Local);
        let remote = RemoteView::new();
        let state = SyncState::default();
        let res = resolve(
            ChangeSets {
                local: vec![upsert("intro", Origin::Local, "h2", 2)],
                remote: vec![upsert("intro", Origin::Remote, "h3", 5)],
            },
            &ResolveContext {
                policy: ConflictPolicy::Manual,
                hierarchy: HierarchyRule::Flat,
                decisions: &decisions,
                remote: &remote,
                state: &state,
            },
        );
        assert_eq!(res.ops[0].origin, Origin::Local);
        assert_eq!(res.resolved[0].decided_by, DecidedBy::Operator);
    }
}
