//! Shared sync cycle entrypoint used by CLI and daemon.
//!
//! One cycle: lock → load state → extract → list + prefetch → diff →
//! resolve → apply → commit. The Sync State is an explicit value: it is read
//! once at the start and, when anything changed, replaced once at the end.

use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use syllabus_core::config::SyncConfig;
use syllabus_core::types::{
    ChangeOp, ConflictPolicy, ContentId, Origin, SyncStateEntry,
};
use syllabus_remote::RemoteClient;

use crate::apply::{self, Agreement, ApplyContext, Outcome};
use crate::conflict_queue;
use crate::diff::{self, RemoteView};
use crate::error::SyncError;
use crate::extractor::{self, Snapshot};
use crate::gather;
use crate::lock::SyncLock;
use crate::resolver::{self, Convergence, ResolveContext, ResolvedConflict};
use crate::retry::{CancelFlag, Retrier};
use crate::state_store::{self, SyncState};

// ---------------------------------------------------------------------------
// Options, observer, report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    /// Plan only: no remote mutation, no local write, no state change.
    pub dry_run: bool,
    /// Overrides the configured conflict policy.
    pub policy: Option<ConflictPolicy>,
    pub cancel: CancelFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Committing,
    RollingBack,
}

/// Receives phase transitions of a cycle.
pub trait CycleObserver {
    fn phase(&self, _phase: Phase) {}
}

/// Observer that ignores every transition.
pub struct Quiet;

impl CycleObserver for Quiet {}

/// One op of the batch, without its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedOp {
    pub id: ContentId,
    pub origin: Origin,
    pub op: String,
    pub path: String,
}

impl From<&ChangeOp> for PlannedOp {
    fn from(op: &ChangeOp) -> Self {
        Self {
            id: op.id.clone(),
            origin: op.origin,
            op: op.verb().to_string(),
            path: op.path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    /// Nothing left unresolved.
    Clean,
    /// Completed with conflicts parked for an operator.
    Parked,
}

impl CycleStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            CycleStatus::Clean => 0,
            CycleStatus::Parked => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub dry_run: bool,
    pub policy: ConflictPolicy,
    /// State sequence after the cycle.
    pub sequence: u64,
    /// Ops applied, or planned in a dry run, in execution order.
    pub ops: Vec<PlannedOp>,
    pub converged: Vec<Convergence>,
    pub resolved: Vec<ResolvedConflict>,
    pub parked: Vec<ContentId>,
    /// Whether the state file was rewritten.
    pub committed: bool,
    pub retries: u32,
    pub duration_ms: u64,
}

impl CycleReport {
    pub fn status(&self) -> CycleStatus {
        if self.parked.is_empty() {
            CycleStatus::Clean
        } else {
            CycleStatus::Parked
        }
    }

    pub fn is_noop(&self) -> bool {
        self.ops.is_empty() && self.converged.is_empty() && self.parked.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

/// Run one sync cycle for the repository at `root`.
///
/// Any error leaves the Sync State Store and the conflict queue exactly as
/// they were.
pub fn run_cycle(
    root: &Path,
    config: &SyncConfig,
    remote: &dyn RemoteClient,
    opts: &CycleOptions,
    observer: &dyn CycleObserver,
) -> Result<CycleReport, SyncError> {
    let started = Instant::now();
    observer.phase(Phase::Running);
    let result = run_inner(root, config, remote, opts, observer, started);
    match &result {
        Ok(report) => tracing::info!(
            ops = report.ops.len(),
            converged = report.converged.len(),
            parked = report.parked.len(),
            dry_run = report.dry_run,
            duration_ms = report.duration_ms,
            "sync cycle finished"
        ),
        Err(e) => {
            observer.phase(Phase::RollingBack);
            tracing::warn!(kind = %e.kind(), error = %e, "sync cycle failed; state unchanged");
        }
    }
    result
}

fn run_inner(
    root: &Path,
    config: &SyncConfig,
    remote: &dyn RemoteClient,
    opts: &CycleOptions,
    observer: &dyn CycleObserver,
    started: Instant,
) -> Result<CycleReport, SyncError> {
    let policy = config.resolve_policy(opts.policy)?;
    let lock = SyncLock::acquire(root)?;
    tracing::debug!("holding sync lock {}", lock.path().display());

    let state = state_store::load_at(root)?;
    let queue = conflict_queue::load_at(root)?;
    let content_root = config.content_root_at(root);
    let local = extractor::extract(&content_root, config)?;

    let retrier = Retrier::new(&config.retry, opts.cancel.clone());
    let mut view = gather::list_remote(remote, &retrier, &state)?;
    gather::prefetch(remote, &retrier, &mut view, &state, config.workers)?;

    let changes = diff::compute(&local, &view, &state, config.hierarchy)?;
    let decisions = queue.decisions();
    let resolution = resolver::resolve(
        changes,
        &ResolveContext {
            policy,
            hierarchy: config.hierarchy,
            decisions: &decisions,
            remote: &view,
            state: &state,
        },
    );

    let mut report = CycleReport {
        dry_run: opts.dry_run,
        policy,
        sequence: state.sequence,
        ops: resolution.ops.iter().map(PlannedOp::from).collect(),
        converged: resolution.converged.clone(),
        resolved: resolution.resolved.clone(),
        parked: resolution.parked.iter().map(|c| c.id.clone()).collect(),
        committed: false,
        retries: 0,
        duration_ms: 0,
    };
    if opts.dry_run {
        report.retries = retrier.retries();
        report.duration_ms = started.elapsed().as_millis() as u64;
        return Ok(report);
    }

    let batch = apply::apply(
        &resolution.ops,
        &ApplyContext {
            content_root: &content_root,
            remote,
            retrier: &retrier,
            local: &local,
            view: &view,
            state: &state,
            policy,
        },
    )?;
    if let Err(e) = opts.cancel.check() {
        batch.staging.rollback();
        return Err(e);
    }

    observer.phase(Phase::Committing);
    let now = Utc::now();
    let mut parked = resolution.parked;
    for (_, outcome) in &batch.outcomes {
        if let Outcome::Parked(conflict) = outcome {
            parked.push(conflict.clone());
        }
    }
    report.resolved.extend(batch.rediscovered.iter().cloned());
    report.ops = batch
        .outcomes
        .iter()
        .zip(&resolution.ops)
        .filter(|((_, outcome), _)| !matches!(outcome, Outcome::Parked(_)))
        .map(|(_, op)| PlannedOp::from(op))
        .collect();
    report.parked = parked.iter().map(|c| c.id.clone()).collect();

    let next_queue = queue.rebuild(&parked, now);
    let next = next_state(&state, &batch.outcomes, &resolution.converged, &local, &view, now);

    batch.staging.commit()?;
    if let Some(next) = &next {
        state_store::save_at(root, next)?;
        report.sequence = next.sequence;
        report.committed = true;
    }
    if next_queue != queue {
        match conflict_queue::save_at(root, &next_queue) {
            Ok(()) => {}
            // State has moved on; the next cycle rediscovers the same conflicts.
            Err(e) if report.committed => {
                tracing::warn!(error = %e, "conflict queue not saved after state commit");
            }
            Err(e) => return Err(e),
        }
    }

    report.retries = retrier.retries();
    report.duration_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}

/// State after a successful batch, or `None` when no entry changes.
fn next_state(
    prev: &SyncState,
    outcomes: &[(ContentId, Outcome)],
    converged: &[Convergence],
    local: &Snapshot,
    view: &RemoteView,
    now: DateTime<Utc>,
) -> Option<SyncState> {
    let touches = converged.len()
        + outcomes
            .iter()
            .filter(|(_, o)| !matches!(o, Outcome::Parked(_)))
            .count();
    if touches == 0 {
        return None;
    }

    let mut next = prev.clone();
    next.sequence += 1;
    next.synced_at = Some(now);
    let sequence = next.sequence;

    for (id, outcome) in outcomes {
        match outcome {
            Outcome::Agreed(agreement) => {
                next.entries
                    .insert(id.clone(), entry(id, agreement, now, sequence));
            }
            Outcome::Removed => {
                next.entries.remove(id);
            }
            Outcome::Parked(_) => {}
        }
    }
    for c in converged {
        match c {
            Convergence::Deleted { id } => {
                next.entries.remove(id);
            }
            Convergence::Agreed { id } => {
                if let (Some(l), Some(r)) = (local.get(id), view.get(id)) {
                    let agreement = Agreement {
                        external_id: r.external_id.clone(),
                        path: l.path.clone(),
                        local_hash: l.content_hash.clone(),
                        remote_hash: r.content_hash.clone(),
                        remote_version: r.version,
                    };
                    next.entries
                        .insert(id.clone(), entry(id, &agreement, now, sequence));
                }
            }
        }
    }
    Some(next)
}

fn entry(
    id: &ContentId,
    agreement: &Agreement,
    now: DateTime<Utc>,
    sequence: u64,
) -> SyncStateEntry {
    SyncStateEntry {
        id: id.clone(),
        external_id: agreement.external_id.clone(),
        path: agreement.path.clone(),
        last_local_hash: agreement.local_hash.clone(),
        last_remote_hash: agreement.remote_hash.clone(),
        remote_version: agreement.remote_version,
        last_synced_at: now,
        sequence,
    }
}
