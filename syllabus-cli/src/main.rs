//! Syllabus: curriculum content sync between a local tree and a headless CMS.
//!
//! # Usage
//!
//! ```text
//! syllabus init --hierarchy path-depth|flat --backend file|strapi|memory [--policy ...]
//! syllabus sync run [--dry-run] [--policy last-writer-wins|prefer-local|prefer-remote|manual] [--json]
//! syllabus status [--json]
//! syllabus conflicts list [--json]
//! syllabus conflicts show <id>
//! syllabus conflicts resolve <id> --keep local|remote
//! syllabus daemon start|stop|status|sync|cancel
//! ```
//!
//! Exit codes: `0` clean, `1` conflicts parked, `2` fatal.

mod commands;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use commands::{
    conflicts::ConflictsCommand, daemon::DaemonCommand, init::InitArgs, status::StatusArgs,
    sync::SyncCommand,
};
use syllabus_core::config::HierarchyRule;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "syllabus",
    version,
    about = "Sync curriculum content between a local tree and a headless CMS",
    long_about = None,
)]
struct Cli {
    /// Repository root holding `.syllabus/` and the content tree.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scaffold `.syllabus/config.yaml` and the content root.
    Init(InitArgs),

    /// Run sync cycles.
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },

    /// Show sync state, tracked items and parked conflicts.
    Status(StatusArgs),

    /// Inspect and resolve parked conflicts.
    Conflicts {
        #[command(subcommand)]
        command: ConflictsCommand,
    },

    /// Run or talk to the background sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared HierarchyRule argument, parsed from CLI strings into the core type
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `HierarchyRule` from CLI args.
#[derive(Debug, Clone)]
pub struct HierarchyArg(pub HierarchyRule);

impl FromStr for HierarchyArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "path-depth" => Ok(Self(HierarchyRule::PathDepth)),
            "flat" => Ok(Self(HierarchyRule::Flat)),
            other => Err(format!(
                "unknown hierarchy rule '{other}'; expected: path-depth, flat"
            )),
        }
    }
}

impl fmt::Display for HierarchyArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            HierarchyRule::PathDepth => f.write_str("path-depth"),
            HierarchyRule::Flat => f.write_str("flat"),
        }
    }
}

impl From<HierarchyArg> for HierarchyRule {
    fn from(h: HierarchyArg) -> Self {
        h.0
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    // The daemon installs its own subscriber with an `info` default.
    if !matches!(
        cli.command,
        Commands::Daemon {
            command: DaemonCommand::Start(_)
        }
    ) {
        init_tracing();
    }

    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::from(2)
        }
    }
}

fn dispatch(cli: Cli) -> Result<u8> {
    let root = cli.root;
    match cli.command {
        Commands::Init(args) => args.run(&root).map(|()| 0),
        Commands::Sync { command } => commands::sync::run(&root, command),
        Commands::Status(args) => args.run(&root).map(|()| 0),
        Commands::Conflicts { command } => commands::conflicts::run(&root, command),
        Commands::Daemon { command } => commands::daemon::run(&root, command),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SYLLABUS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
