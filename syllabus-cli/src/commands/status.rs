//! `syllabus status`: sync state and conflict visibility.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use syllabus_core::config;
use syllabus_core::types::ContentId;
use syllabus_sync::{conflict_queue, state_store, ConflictQueue, SyncState};

/// Arguments for `syllabus status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self, root: &Path) -> Result<()> {
        let sync_config = config::load_at(root)
            .context("failed to load sync configuration; run `syllabus init` first")?;
        let state = state_store::load_at(root).context("failed to load sync state")?;
        let queue = conflict_queue::load_at(root).context("failed to load conflict queue")?;

        let report = build_report(&state, &queue);
        if self.json {
            let payload = StatusJson {
                backend: backend_name(&sync_config.remote),
                policy: sync_config.policy.map(|p| p.to_string()),
                sequence: report.sequence,
                last_synced_at: report.last_synced_at,
                tracked: report.items.len(),
                parked: report.parked,
                items: report.items,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        print_table(&sync_config, report);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
struct ItemStatus {
    id: ContentId,
    path: String,
    external_id: String,
    remote_version: u64,
    sequence: u64,
    parked: bool,
}

#[derive(Debug, Clone)]
struct StatusReport {
    sequence: u64,
    last_synced_at: Option<DateTime<Utc>>,
    items: Vec<ItemStatus>,
    parked: Vec<ContentId>,
}

#[derive(Serialize)]
struct StatusJson {
    backend: &'static str,
    policy: Option<String>,
    sequence: u64,
    last_synced_at: Option<DateTime<Utc>>,
    tracked: usize,
    parked: Vec<ContentId>,
    items: Vec<ItemStatus>,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "path")]
    path: String,
    #[tabled(rename = "remote")]
    remote: String,
    #[tabled(rename = "synced at seq")]
    sequence: u64,
    #[tabled(rename = "state")]
    state: String,
}

fn build_report(state: &SyncState, queue: &ConflictQueue) -> StatusReport {
    let items = state
        .entries
        .values()
        .map(|entry| ItemStatus {
            id: entry.id.clone(),
            path: entry.path.clone(),
            external_id: entry.external_id.as_str().to_string(),
            remote_version: entry.remote_version.0,
            sequence: entry.sequence,
            parked: queue.conflicts.contains_key(&entry.id),
        })
        .collect();

    StatusReport {
        sequence: state.sequence,
        last_synced_at: state.synced_at,
        items,
        parked: queue.conflicts.keys().cloned().collect(),
    }
}

fn print_table(sync_config: &config::SyncConfig, report: StatusReport) {
    let last_sync = report
        .last_synced_at
        .map(|at| format!("{} ago", format_datetime_age(at)))
        .unwrap_or_else(|| "never".to_string());
    println!(
        "Syllabus v{} | {} backend | sequence {} | {} tracked | {} parked | last sync {}",
        env!("CARGO_PKG_VERSION"),
        backend_name(&sync_config.remote),
        report.sequence,
        report.items.len(),
        report.parked.len(),
        last_sync,
    );

    if report.items.is_empty() && report.parked.is_empty() {
        println!("Nothing synced yet. Run 'syllabus sync run' to start.");
        return;
    }

    let separator = "■".repeat(67).bright_black().to_string();
    println!("{separator}");
    println!(
        "Indicators: {} SYNCED  {} PARKED",
        "■".green().bold(),
        "■".yellow().bold()
    );
    println!("{separator}");

    let rows: Vec<StatusTableRow> = report
        .items
        .iter()
        .map(|item| StatusTableRow {
            id: item.id.to_string(),
            path: item.path.clone(),
            remote: format!("{} v{}", item.external_id, item.remote_version),
            sequence: item.sequence,
            state: if item.parked { "PARKED" } else { "SYNCED" }.to_string(),
        })
        .collect();
    if !rows.is_empty() {
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }

    // Parked items that were never synced have no state entry.
    let untracked: Vec<&ContentId> = report
        .parked
        .iter()
        .filter(|id| !report.items.iter().any(|item| &item.id == *id))
        .collect();
    for id in untracked {
        println!("  {} {id} (new on both sides)", "■".yellow().bold());
    }

    if !report.parked.is_empty() {
        println!("{separator}");
        println!("Run 'syllabus conflicts list' to review parked conflicts.");
    }
}

fn backend_name(remote: &config::RemoteConfig) -> &'static str {
    match remote {
        config::RemoteConfig::Strapi(_) => "strapi",
        config::RemoteConfig::File { .. } => "file",
        config::RemoteConfig::Memory => "memory",
    }
}

fn format_datetime_age(timestamp: DateTime<Utc>) -> String {
    let age = Utc::now()
        .signed_duration_since(timestamp)
        .num_seconds()
        .max(0) as u64;
    format_seconds(age)
}

fn format_seconds(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_are_bucketed_by_largest_unit() {
        assert_eq!(format_seconds(42), "42s");
        assert_eq!(format_seconds(125), "2m");
        assert_eq!(format_seconds(3 * 60 * 60 + 5), "3h");
        assert_eq!(format_seconds(2 * 24 * 60 * 60), "2d");
    }
}
