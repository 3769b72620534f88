//! Per-repository YAML configuration.
//!
//! # Storage layout
//!
//! ```text
//! <root>/.syllabus/config.yaml   (mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every function takes the repository root explicitly (`fn_at(root, …)`).
//! Tests point `root` at a `TempDir`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{config_io_err, ConfigError};
use crate::paths::{config_path, syllabus_dir};
use crate::types::ConflictPolicy;

pub const CONFIG_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// 1. Schema
// ---------------------------------------------------------------------------

/// Parent/child rule used for dependency ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HierarchyRule {
    /// A directory's `index.*` item is the parent of its siblings and of
    /// everything in its subdirectories.
    PathDepth,
    /// No hierarchy; items are ordered by id.
    Flat,
}

/// Which content-management backend sits behind the Remote Client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum RemoteConfig {
    /// Strapi-style REST collection.
    Strapi(StrapiConfig),
    /// JSON-file CMS emulator; `path` is relative to the repository root.
    File { path: PathBuf },
    /// Process-local store. Only useful for embedding and tests.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrapiConfig {
    pub base_url: String,
    pub collection: String,
    /// Environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl StrapiConfig {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            collection: collection.into(),
            token_env: default_token_env(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Bounded exponential backoff for transient remote failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Total retries allowed across one cycle.
    pub cycle_budget: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            cycle_budget: 20,
        }
    }
}

impl RetrySettings {
    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            cycle_budget: max_attempts.saturating_mul(10),
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(retry as i32 - 1);
        let capped = base.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScheduleConfig {
    /// Periodic trigger; `None` disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    /// Trigger a cycle when the content tree changes.
    #[serde(default)]
    pub watch: bool,
}

/// Root of `.syllabus/config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub version: u32,
    #[serde(default = "default_content_root")]
    pub content_root: PathBuf,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Required; there is no inferred default ordering rule.
    pub hierarchy: HierarchyRule,
    /// Optional; a run without a configured policy must be given one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ConflictPolicy>,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl SyncConfig {
    pub fn new(remote: RemoteConfig, hierarchy: HierarchyRule) -> Self {
        Self {
            version: CONFIG_VERSION,
            content_root: default_content_root(),
            extensions: default_extensions(),
            hierarchy,
            policy: None,
            remote,
            retry: RetrySettings::default(),
            workers: default_workers(),
            schedule: ScheduleConfig::default(),
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Pick the run's conflict policy: an explicit override beats the
    /// configured value; neither is an error.
    pub fn resolve_policy(
        &self,
        override_policy: Option<ConflictPolicy>,
    ) -> Result<ConflictPolicy, ConfigError> {
        override_policy
            .or(self.policy)
            .ok_or(ConfigError::MissingPolicy)
    }

    /// Absolute content root for a repository at `root`.
    pub fn content_root_at(&self, root: &Path) -> PathBuf {
        if self.content_root.is_absolute() {
            self.content_root.clone()
        } else {
            root.join(&self.content_root)
        }
    }

    /// Whether a file extension (without dot) is synced.
    pub fn accepts_extension(&self, ext: &str) -> bool {
        self.extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {} (expected {CONFIG_VERSION})",
                self.version
            )));
        }
        if self.extensions.is_empty() {
            return Err(ConfigError::Invalid("`extensions` must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("`workers` must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "`retry.max_attempts` must be at least 1".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "`retry.multiplier` must be >= 1.0".into(),
            ));
        }
        if let RemoteConfig::Strapi(strapi) = &self.remote {
            if strapi.base_url.trim().is_empty() || strapi.collection.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "strapi backend needs `base_url` and `collection`".into(),
                ));
            }
            if strapi.page_size == 0 {
                return Err(ConfigError::Invalid("`page_size` must be at least 1".into()));
            }
        }
        Ok(())
    }
}

fn default_content_root() -> PathBuf {
    PathBuf::from("content")
}

fn default_extensions() -> Vec<String> {
    ["md", "markdown", "json", "yaml", "yml"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_workers() -> usize {
    4
}

fn default_token_env() -> String {
    "SYLLABUS_CMS_TOKEN".to_string()
}

fn default_page_size() -> u32 {
    100
}

fn default_timeout_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load `<root>/.syllabus/config.yaml`.
///
/// Returns `ConfigError::NotFound` if absent, `ConfigError::Parse` (with path
/// and line context) if malformed, `ConfigError::Invalid` if it parses but
/// fails validation.
pub fn load_at(root: &Path) -> Result<SyncConfig, ConfigError> {
    let path = config_path(root);
    if !path.exists() {
        return Err(ConfigError::NotFound { path });
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| config_io_err(&path, e))?;
    let config: SyncConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the config.
///
/// Write flow: serialize → `config.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(root: &Path, config: &SyncConfig) -> Result<(), ConfigError> {
    config.validate()?;
    let dir = syllabus_dir(root);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| config_io_err(&dir, e))?;
        set_dir_permissions(&dir)?;
    }
    let path = config_path(root);
    let tmp_path = path.with_extension("yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| config_io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path).map_err(|e| config_io_err(&path, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// 4. Init
// ---------------------------------------------------------------------------

/// Write `config` for the repository at `root` and create its content root.
///
/// Idempotent: if a config already exists it is loaded and returned
/// unchanged.
pub fn init_at(root: &Path, config: SyncConfig) -> Result<SyncConfig, ConfigError> {
    if config_path(root).exists() {
        return load_at(root);
    }
    save_at(root, &config)?;
    let content = config.content_root_at(root);
    std::fs::create_dir_all(&content).map_err(|e| config_io_err(&content, e))?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| config_io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| config_io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
