//! Sync Scheduler: single-flight cycle execution with trigger coalescing.
//!
//! ```text
//! Idle → Running → Committing → Idle
//!              ╰──→ RollingBack → Idle
//! ```
//!
//! A trigger that arrives while a cycle is in flight is remembered (at most
//! one) and handed back through [`Scheduler::take_pending`] once the
//! scheduler is idle again, so bursts collapse into one follow-up cycle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use syllabus_core::config::SyncConfig;
use syllabus_core::types::ConflictPolicy;
use syllabus_remote::RemoteClient;

use crate::error::SyncError;
use crate::pipeline::{self, CycleObserver, CycleOptions, CycleReport, Phase};
use crate::retry::CancelFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerState {
    Idle,
    Running,
    Committing,
    RollingBack,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Committing => "committing",
            SchedulerState::RollingBack => "rolling-back",
        };
        f.write_str(s)
    }
}

/// What asked for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Manual,
    Interval,
    Watch,
    Webhook,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Trigger::Manual => "manual",
            Trigger::Interval => "interval",
            Trigger::Watch => "watch",
            Trigger::Webhook => "webhook",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "result")]
pub enum CycleOutcome {
    Clean { ops: usize },
    Parked { ops: usize, parked: usize },
    Failed { kind: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
}

impl CycleSummary {
    fn new(trigger: Trigger, started_at: DateTime<Utc>, result: &Result<CycleReport, SyncError>) -> Self {
        let outcome = match result {
            Ok(report) if report.parked.is_empty() => CycleOutcome::Clean {
                ops: report.ops.len(),
            },
            Ok(report) => CycleOutcome::Parked {
                ops: report.ops.len(),
                parked: report.parked.len(),
            },
            Err(e) => CycleOutcome::Failed {
                kind: e.kind().to_string(),
                message: e.to_string(),
            },
        };
        Self {
            trigger,
            started_at,
            finished_at: Utc::now(),
            outcome,
        }
    }
}

/// Point-in-time view for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub pending: Option<Trigger>,
    pub cycles: u64,
    pub last: Option<CycleSummary>,
}

#[derive(Debug)]
struct Inner {
    state: SchedulerState,
    pending: Option<Trigger>,
    cancel: Option<CancelFlag>,
    cycles: u64,
    last: Option<CycleSummary>,
}

#[derive(Debug)]
pub struct Scheduler {
    root: PathBuf,
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inner: Mutex::new(Inner {
                state: SchedulerState::Idle,
                pending: None,
                cancel: None,
                cycles: 0,
                last: None,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> SchedulerState {
        self.lock().state
    }

    pub fn status(&self) -> SchedulerStatus {
        let inner = self.lock();
        SchedulerStatus {
            state: inner.state,
            pending: inner.pending,
            cycles: inner.cycles,
            last: inner.last.clone(),
        }
    }

    /// Request cancellation of the in-flight cycle. Returns `false` when idle.
    pub fn cancel(&self) -> bool {
        match &self.lock().cancel {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }

    /// Remember `trigger` for one follow-up cycle. A slot that is already
    /// filled keeps its first trigger.
    pub fn coalesce(&self, trigger: Trigger) {
        let mut inner = self.lock();
        tracing::debug!(%trigger, state = %inner.state, "trigger coalesced");
        inner.pending.get_or_insert(trigger);
    }

    /// Trigger that arrived during the last cycle, if any.
    pub fn take_pending(&self) -> Option<Trigger> {
        let mut inner = self.lock();
        if inner.state != SchedulerState::Idle {
            return None;
        }
        inner.pending.take()
    }

    /// Run one cycle unless one is already in flight.
    ///
    /// Returns `None` when the trigger was coalesced into the pending slot.
    pub fn run(
        &self,
        trigger: Trigger,
        config: &SyncConfig,
        remote: &dyn RemoteClient,
        policy: Option<ConflictPolicy>,
    ) -> Option<Result<CycleReport, SyncError>> {
        let cancel = {
            let mut inner = self.lock();
            if inner.state != SchedulerState::Idle {
                drop(inner);
                self.coalesce(trigger);
                return None;
            }
            let cancel = CancelFlag::new();
            inner.state = SchedulerState::Running;
            inner.cancel = Some(cancel.clone());
            cancel
        };

        let started_at = Utc::now();
        tracing::info!(%trigger, "sync cycle starting");
        let opts = CycleOptions {
            dry_run: false,
            policy,
            cancel,
        };
        let result = pipeline::run_cycle(&self.root, config, remote, &opts, self);

        let mut inner = self.lock();
        inner.state = SchedulerState::Idle;
        inner.cancel = None;
        inner.cycles += 1;
        inner.last = Some(CycleSummary::new(trigger, started_at, &result));
        Some(result)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CycleObserver for Scheduler {
    fn phase(&self, phase: Phase) {
        let next = match phase {
            Phase::Running => SchedulerState::Running,
            Phase::Committing => SchedulerState::Committing,
            Phase::RollingBack => SchedulerState::RollingBack,
        };
        let mut inner = self.lock();
        tracing::debug!(from = %inner.state, to = %next, "scheduler transition");
        inner.state = next;
    }
}
