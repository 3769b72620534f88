//! `syllabus init --hierarchy <rule> --backend <name> [--policy ...]`

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};

use syllabus_core::config::{self, RemoteConfig, StrapiConfig, SyncConfig};
use syllabus_core::paths;
use syllabus_core::types::ConflictPolicy;

use super::super::HierarchyArg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    File,
    Strapi,
    Memory,
}

/// Scaffold a sync configuration for the repository.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Dependency-ordering rule: path-depth | flat.
    #[arg(long, value_name = "RULE")]
    pub hierarchy: HierarchyArg,

    /// Remote backend behind the sync engine.
    #[arg(long, value_enum, default_value_t = BackendArg::File)]
    pub backend: BackendArg,

    /// JSON file for the `file` backend, relative to the root.
    #[arg(long, default_value = "cms.json")]
    pub file_path: PathBuf,

    /// Base URL of the CMS API for the `strapi` backend.
    #[arg(long, required_if_eq("backend", "strapi"))]
    pub base_url: Option<String>,

    /// Collection name for the `strapi` backend.
    #[arg(long, required_if_eq("backend", "strapi"))]
    pub collection: Option<String>,

    /// Default conflict policy. Without one every run needs `--policy`.
    #[arg(long)]
    pub policy: Option<ConflictPolicy>,

    /// Content root, relative to the repository root.
    #[arg(long)]
    pub content_root: Option<PathBuf>,
}

impl InitArgs {
    pub fn run(self, root: &Path) -> Result<()> {
        if paths::config_path(root).exists() {
            bail!(
                "already initialized: {} exists",
                paths::config_path(root).display()
            );
        }

        let remote = match self.backend {
            BackendArg::File => RemoteConfig::File {
                path: self.file_path,
            },
            BackendArg::Strapi => {
                let base_url = self.base_url.context("--base-url is required for strapi")?;
                let collection = self
                    .collection
                    .context("--collection is required for strapi")?;
                RemoteConfig::Strapi(StrapiConfig::new(base_url, collection))
            }
            BackendArg::Memory => RemoteConfig::Memory,
        };

        let mut sync_config = SyncConfig::new(remote, self.hierarchy.into());
        sync_config.policy = self.policy;
        if let Some(content_root) = self.content_root {
            sync_config.content_root = content_root;
        }
        sync_config
            .validate()
            .context("refusing to write an invalid configuration")?;

        let saved = config::init_at(root, sync_config)
            .with_context(|| format!("failed to init '{}'", root.display()))?;

        println!("✓ Initialized sync configuration");
        println!("  Config:  {}", paths::config_path(root).display());
        println!("  Content: {}", saved.content_root_at(root).display());
        match saved.policy {
            Some(policy) => println!("  Policy:  {policy}"),
            None => println!("  Policy:  none (pass --policy to each run)"),
        }
        Ok(())
    }
}
