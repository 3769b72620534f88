//! `syllabus conflicts`: parked conflicts awaiting an operator.

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use syllabus_core::types::{ChangeOp, ContentId, Origin};
use syllabus_sync::conflict_queue::{self, render_diff};

#[derive(Subcommand, Debug)]
pub enum ConflictsCommand {
    /// List parked conflicts.
    List(ListArgs),
    /// Show a unified diff from the local to the remote side.
    Show { id: String },
    /// Record which side the next cycle keeps.
    Resolve(ResolveArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    pub id: String,

    /// Side to keep: local | remote.
    #[arg(long, value_name = "SIDE")]
    pub keep: Origin,
}

#[derive(Tabled)]
struct ConflictRow {
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "local")]
    local: String,
    #[tabled(rename = "remote")]
    remote: String,
    #[tabled(rename = "parked at")]
    parked_at: String,
    #[tabled(rename = "decision")]
    decision: String,
}

pub fn run(root: &Path, command: ConflictsCommand) -> Result<u8> {
    match command {
        ConflictsCommand::List(args) => list(root, args.json),
        ConflictsCommand::Show { id } => show(root, &ContentId::from(id.as_str())),
        ConflictsCommand::Resolve(args) => resolve(root, &ContentId::from(args.id.as_str()), args.keep),
    }
}

fn list(root: &Path, json: bool) -> Result<u8> {
    let queue = conflict_queue::load_at(root).context("failed to load conflict queue")?;
    if json {
        let parked: Vec<_> = queue.conflicts.values().collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&parked).context("failed to serialize conflicts")?
        );
        return Ok(0);
    }

    if queue.is_empty() {
        println!("✓ no parked conflicts");
        return Ok(0);
    }

    let rows: Vec<ConflictRow> = queue
        .conflicts
        .values()
        .map(|parked| ConflictRow {
            id: parked.conflict.id.to_string(),
            local: describe(&parked.conflict.local),
            remote: describe(&parked.conflict.remote),
            parked_at: parked.parked_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            decision: parked
                .resolution
                .map(|side| format!("keep {side}"))
                .unwrap_or_else(|| "pending".to_string()),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    println!(
        "Resolve with 'syllabus conflicts resolve <id> --keep local|remote', then run 'syllabus sync run'."
    );
    Ok(0)
}

fn show(root: &Path, id: &ContentId) -> Result<u8> {
    let queue = conflict_queue::load_at(root).context("failed to load conflict queue")?;
    let parked = queue
        .conflicts
        .get(id)
        .with_context(|| format!("no parked conflict for '{id}'"))?;

    println!("{} {}", "conflict".yellow().bold(), parked.conflict.id);
    println!("  local:  {}", describe(&parked.conflict.local));
    println!("  remote: {}", describe(&parked.conflict.remote));
    if let Some(side) = parked.resolution {
        println!("  decision: keep {side}");
    }
    let diff = render_diff(&parked.conflict);
    if diff.is_empty() {
        println!("(bodies are identical)");
    } else {
        print!("{diff}");
    }
    Ok(0)
}

fn resolve(root: &Path, id: &ContentId, keep: Origin) -> Result<u8> {
    conflict_queue::resolve_at(root, id, keep)
        .with_context(|| format!("failed to resolve '{id}'"))?;
    tracing::info!(id = %id, keep = %keep, "operator decision recorded");
    println!("✓ '{id}' will keep the {keep} side on the next sync run");
    Ok(0)
}

fn describe(op: &ChangeOp) -> String {
    match op.hash() {
        Some(hash) => format!("{} {} ({})", op.verb(), op.path, hash.short()),
        None => format!("{} {}", op.verb(), op.path),
    }
}
