//! `syllabus sync run`: one lock-guarded sync cycle.

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use syllabus_core::config;
use syllabus_core::types::{ConflictPolicy, Origin};
use syllabus_sync::{run_cycle, CancelFlag, CycleOptions, CycleReport, CycleStatus, Quiet};

#[derive(Subcommand, Debug)]
pub enum SyncCommand {
    /// Reconcile local content with the remote store.
    Run(SyncRunArgs),
}

/// Arguments for `syllabus sync run`.
#[derive(Args, Debug)]
pub struct SyncRunArgs {
    /// Show what would change without touching the remote, the content tree
    /// or the sync state.
    #[arg(long)]
    pub dry_run: bool,

    /// Conflict policy for this run; overrides the configured one.
    #[arg(long, value_name = "POLICY")]
    pub policy: Option<ConflictPolicy>,

    /// Emit the cycle report as JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run(root: &Path, command: SyncCommand) -> Result<u8> {
    match command {
        SyncCommand::Run(args) => args.run(root),
    }
}

impl SyncRunArgs {
    pub fn run(self, root: &Path) -> Result<u8> {
        let sync_config = config::load_at(root)
            .context("failed to load sync configuration; run `syllabus init` first")?;
        let remote = syllabus_remote::connect(root, &sync_config.remote);
        tracing::debug!(
            root = %root.display(),
            dry_run = self.dry_run,
            policy = ?self.policy,
            "starting sync run"
        );

        let opts = CycleOptions {
            dry_run: self.dry_run,
            policy: self.policy,
            cancel: CancelFlag::new(),
        };
        let report = run_cycle(root, &sync_config, remote.as_ref(), &opts, &Quiet)
            .context("sync cycle failed")?;
        tracing::debug!(
            sequence = report.sequence,
            ops = report.ops.len(),
            parked = report.parked.len(),
            "sync run finished"
        );

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize report")?
            );
        } else {
            print_report(&report);
        }
        Ok(report.status().exit_code())
    }
}

fn print_report(report: &CycleReport) {
    let prefix = if report.dry_run { "[dry-run] " } else { "" };

    if report.is_noop() {
        println!("{prefix}✓ already in sync (sequence {})", report.sequence);
        return;
    }

    let verb = if report.dry_run { "would apply" } else { "applied" };
    println!(
        "{prefix}✓ {verb} {} op(s), {} converged, {} parked ({} policy)",
        report.ops.len(),
        report.converged.len(),
        report.parked.len(),
        report.policy,
    );

    for op in &report.ops {
        println!(
            "  {}  {:<7} {} ({})",
            direction(op.origin),
            op.op,
            op.path,
            op.id
        );
    }
    for converged in &report.converged {
        println!("  ·  converged {}", converged.id());
    }
    for resolved in &report.resolved {
        println!(
            "  ✓  {} kept {} ({})",
            resolved.id, resolved.winner, resolved.decided_by
        );
    }

    if report.status() == CycleStatus::Parked {
        for id in &report.parked {
            println!("  {}  {id}", "!".yellow().bold());
        }
        println!(
            "{} {} conflict(s) parked. Inspect with `syllabus conflicts list`.",
            "!".yellow().bold(),
            report.parked.len()
        );
    }
    if !report.dry_run && report.retries > 0 {
        println!("  ({} transient failure(s) retried)", report.retries);
    }
}

fn direction(origin: Origin) -> &'static str {
    match origin {
        Origin::Local => "local → remote",
        Origin::Remote => "remote → local",
    }
}
