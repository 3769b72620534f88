//! Long-running sync daemon: interval ticker + content watcher + socket
//! triggers, feeding one single-flight cycle processor.

mod error;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_cancel, request_status, request_stop, request_sync, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{run, start_blocking, SyncSummary, DEBOUNCE_WINDOW};
