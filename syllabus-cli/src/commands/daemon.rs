//! `syllabus daemon`: background trigger runtime lifecycle.

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::Value;

use syllabus_core::paths::socket_path;
use syllabus_core::types::ConflictPolicy;
use syllabus_daemon::{
    request_cancel, request_status, request_stop, request_sync, start_blocking, DaemonError,
};
use syllabus_sync::Trigger;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run daemon in foreground (interval + watcher + socket server).
    Start(StartArgs),
    /// Request graceful daemon shutdown over Unix socket.
    Stop,
    /// Query daemon runtime status over Unix socket.
    Status,
    /// Ask the daemon for a cycle and wait for its summary.
    Sync(DaemonSyncArgs),
    /// Cancel the daemon's in-flight cycle.
    Cancel,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Conflict policy for every cycle; overrides the configured one.
    #[arg(long, value_name = "POLICY")]
    pub policy: Option<ConflictPolicy>,
}

#[derive(Args, Debug)]
pub struct DaemonSyncArgs {
    /// Mark the request as relayed from a CMS webhook.
    #[arg(long)]
    pub webhook: bool,
}

pub fn run(root: &Path, command: DaemonCommand) -> Result<u8> {
    match command {
        DaemonCommand::Start(args) => {
            start_blocking(root, args.policy).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(root) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(root) {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let payload = serde_json::json!({
                    "running": false,
                    "socket": socket_path(root).display().to_string(),
                });
                print_json(&payload)?;
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Sync(args) => {
            let source = args.webhook.then_some(Trigger::Webhook);
            let summary = request_sync(root, source).context("daemon sync failed")?;
            print_json(&summary)?;
            return Ok(exit_code_of(&summary));
        }
        DaemonCommand::Cancel => {
            let payload = request_cancel(root).context("failed to cancel daemon cycle")?;
            print_json(&payload)?;
        }
    }

    Ok(0)
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render daemon JSON")?
    );
    Ok(())
}

fn exit_code_of(summary: &Value) -> u8 {
    match summary.get("status").and_then(Value::as_str) {
        Some("parked") => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parked_summary_maps_to_exit_one() {
        assert_eq!(exit_code_of(&serde_json::json!({"status": "parked"})), 1);
        assert_eq!(exit_code_of(&serde_json::json!({"status": "clean"})), 0);
    }
}
