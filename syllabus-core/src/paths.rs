//! On-disk layout under a repository root.
//!
//! ```text
//! <root>/.syllabus/
//!   config.yaml      engine configuration
//!   state.json       last agreed Sync State
//!   conflicts.json   parked conflicts awaiting an operator
//!   sync.lock        single-flight advisory lock
//!   run/daemon.sock  daemon control socket
//! ```

use std::path::{Path, PathBuf};

pub const SYLLABUS_DIR: &str = ".syllabus";
pub const CONFIG_FILE: &str = "config.yaml";
pub const STATE_FILE: &str = "state.json";
pub const CONFLICTS_FILE: &str = "conflicts.json";
pub const LOCK_FILE: &str = "sync.lock";
pub const DAEMON_SOCKET: &str = "daemon.sock";

/// Suffix for staged writes; the extractor ignores files carrying it.
pub const STAGING_SUFFIX: &str = ".syllabus.tmp";

pub fn syllabus_dir(root: &Path) -> PathBuf {
    root.join(SYLLABUS_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    syllabus_dir(root).join(CONFIG_FILE)
}

pub fn state_path(root: &Path) -> PathBuf {
    syllabus_dir(root).join(STATE_FILE)
}

pub fn conflicts_path(root: &Path) -> PathBuf {
    syllabus_dir(root).join(CONFLICTS_FILE)
}

pub fn lock_path(root: &Path) -> PathBuf {
    syllabus_dir(root).join(LOCK_FILE)
}

pub fn run_dir(root: &Path) -> PathBuf {
    syllabus_dir(root).join("run")
}

pub fn socket_path(root: &Path) -> PathBuf {
    run_dir(root).join(DAEMON_SOCKET)
}
