//! # syllabus-sync
//!
//! Bidirectional sync engine between a local content tree and a headless
//! CMS collection.
//!
//! Call [`run_cycle`] for one lock-guarded cycle, or drive cycles through a
//! [`Scheduler`] to get single-flight execution and trigger coalescing.

pub mod apply;
pub mod conflict_queue;
pub mod diff;
pub mod error;
pub mod extractor;
pub mod gather;
pub mod lock;
pub mod order;
pub mod pipeline;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod state_store;

pub use conflict_queue::{ConflictQueue, ParkedConflict};
pub use error::{ErrorKind, SyncError};
pub use pipeline::{run_cycle, CycleOptions, CycleReport, CycleStatus, PlannedOp, Quiet};
pub use retry::CancelFlag;
pub use scheduler::{CycleOutcome, CycleSummary, Scheduler, SchedulerState, SchedulerStatus, Trigger};
pub use state_store::SyncState;
