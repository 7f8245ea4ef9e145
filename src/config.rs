//! Engine configuration, read from `.ratchet/ratchet.toml`.
//!
//! Values are layered: file, then environment, then whatever the embedding
//! code sets on the returned struct before handing it to the executor.
//!
//! ```toml
//! [store]
//! path = ".ratchet/phases.db"
//! busy_timeout_ms = 5000
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 100
//! max_delay_ms = 2000
//!
//! [savepoints]
//! keep_last = 3
//! max_age_days = 7
//!
//! [policy]
//! protected = [".github/", "Cargo.lock"]
//! allowed = [".github/workflows/ci.yml"]
//! scope = ["src/", "tests/"]
//! internal_mode = false
//!
//! [validation]
//! command = ["cargo", "test", "--quiet"]
//! report_file = "target/test-report.json"
//!
//! [features]
//! external_validation = true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::features::Feature;
use crate::state::RetryPolicy;

/// Engine-owned directory at the project root.
pub const RATCHET_DIR: &str = ".ratchet";
pub const CONFIG_FILE: &str = "ratchet.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database, relative to the project root.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(RATCHET_DIR).join("phases.db")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Backoff for transient store errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavepointConfig {
    /// Savepoints kept per run after a successful apply.
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
    /// Maintenance pruning threshold, across all runs.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    #[serde(default = "default_tag_timeout_secs")]
    pub tag_timeout_secs: u64,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
    #[serde(default = "default_clean_timeout_secs")]
    pub clean_timeout_secs: u64,
    /// Untracked files matching these globs are never removed by a clean.
    #[serde(default = "default_protected_untracked")]
    pub protected_untracked: Vec<String>,
}

fn default_keep_last() -> usize {
    3
}

fn default_max_age_days() -> u64 {
    7
}

fn default_tag_timeout_secs() -> u64 {
    10
}

fn default_reset_timeout_secs() -> u64 {
    30
}

fn default_clean_timeout_secs() -> u64 {
    10
}

fn default_protected_untracked() -> Vec<String> {
    [
        ".env",
        ".env.*",
        "*.db",
        "*.sqlite",
        "*.sqlite3",
        ".ratchet/",
        ".vscode/",
        ".idea/",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for SavepointConfig {
    fn default() -> Self {
        Self {
            keep_last: default_keep_last(),
            max_age_days: default_max_age_days(),
            tag_timeout_secs: default_tag_timeout_secs(),
            reset_timeout_secs: default_reset_timeout_secs(),
            clean_timeout_secs: default_clean_timeout_secs(),
            protected_untracked: default_protected_untracked(),
        }
    }
}

impl SavepointConfig {
    pub fn tag_timeout(&self) -> Duration {
        Duration::from_secs(self.tag_timeout_secs)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    pub fn clean_timeout(&self) -> Duration {
        Duration::from_secs(self.clean_timeout_secs)
    }
}

/// Path sets for the patch policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub protected: Vec<String>,
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub scope: Vec<String>,
    /// Self-maintenance runs drop non-critical protected entries.
    #[serde(default)]
    pub internal_mode: bool,
    /// Limit for a single `git apply` of a diff patch.
    #[serde(default = "default_apply_timeout_secs")]
    pub apply_timeout_secs: u64,
}

fn default_apply_timeout_secs() -> u64 {
    60
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            protected: Vec::new(),
            allowed: Vec::new(),
            scope: Vec::new(),
            internal_mode: false,
            apply_timeout_secs: default_apply_timeout_secs(),
        }
    }
}

impl PolicyConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

fn default_max_rounds() -> u32 {
    3
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
        }
    }
}

/// External test/validation runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Argument vector; never passed through a shell.
    #[serde(default)]
    pub command: Vec<String>,
    /// Machine-readable report the command writes, relative to the project root.
    #[serde(default)]
    pub report_file: Option<PathBuf>,
    #[serde(default = "default_validation_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_validation_timeout_secs() -> u64 {
    600
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            report_file: None,
            timeout_secs: default_validation_timeout_secs(),
        }
    }
}

impl ValidationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Used for phases that do not set their own `max_attempts`.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// An InProgress row untouched this long is considered stale.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_commit_on_success")]
    pub commit_on_success: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_stale_after_secs() -> u64 {
    3600
}

fn default_commit_on_success() -> bool {
    true
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            stale_after_secs: default_stale_after_secs(),
            commit_on_success: default_commit_on_success(),
        }
    }
}

/// Top-level `ratchet.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub savepoints: SavepointConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub continuation: ContinuationConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Feature name to enabled state.
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse ratchet.toml")
    }

    /// Load `<ratchet_dir>/ratchet.toml`, or defaults when it does not exist.
    pub fn load_or_default(ratchet_dir: &Path) -> Result<Self> {
        let config_path = ratchet_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize ratchet.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// File, then environment, then validation.
    pub fn resolve(project_dir: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(&project_dir.join(RATCHET_DIR))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RATCHET_INTERNAL_MODE") {
            self.policy.internal_mode = parse_bool(&v)
                .with_context(|| format!("RATCHET_INTERNAL_MODE: invalid value '{}'", v))?;
        }
        if let Some(v) = lookup("RATCHET_MAX_CONTINUATIONS") {
            self.continuation.max_rounds = v
                .trim()
                .parse()
                .with_context(|| format!("RATCHET_MAX_CONTINUATIONS: invalid value '{}'", v))?;
        }
        if let Some(v) = lookup("RATCHET_KEEP_SAVEPOINTS") {
            self.savepoints.keep_last = v
                .trim()
                .parse()
                .with_context(|| format!("RATCHET_KEEP_SAVEPOINTS: invalid value '{}'", v))?;
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.savepoints.keep_last == 0 {
            problems.push(
                "savepoints.keep_last must be at least 1 (a savepoint is needed to roll back a failed validation)"
                    .to_string(),
            );
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.executor.default_max_attempts == 0 {
            problems.push("executor.default_max_attempts must be at least 1".to_string());
        }
        for name in self.features.keys() {
            if name.parse::<Feature>().is_err() {
                problems.push(format!("unknown feature '{}'", name));
            }
        }
        let validation_enabled = self
            .features
            .get(Feature::ExternalValidation.as_str())
            .copied()
            .unwrap_or_else(|| Feature::ExternalValidation.default_enabled());
        if validation_enabled && self.validation.command.is_empty() {
            problems.push(
                "validation.command must not be empty when external_validation is enabled".to_string(),
            );
        }
        for pattern in &self.savepoints.protected_untracked {
            if let Err(e) = glob::Pattern::new(pattern.trim_end_matches('/')) {
                problems.push(format!("invalid protected_untracked pattern '{}': {}", pattern, e));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            bail!("Invalid configuration:\n  {}", problems.join("\n  "))
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.executor.stale_after_secs)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{}'", other),
    }
}

/// On-disk layout for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub project_dir: PathBuf,
    pub ratchet_dir: PathBuf,
    pub run_dir: PathBuf,
    pub state_file: PathBuf,
    pub rollback_log: PathBuf,
    pub log_dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl RunPaths {
    pub fn new(project_dir: &Path, run_id: &str) -> Self {
        let ratchet_dir = project_dir.join(RATCHET_DIR);
        let run_dir = ratchet_dir.join("runs").join(run_id);
        Self {
            project_dir: project_dir.to_path_buf(),
            state_file: run_dir.join("state.json"),
            rollback_log: run_dir.join("rollback.log"),
            log_dir: run_dir.join("logs"),
            artifacts_dir: run_dir.join("artifacts"),
            ratchet_dir,
            run_dir,
        }
    }

    /// Default phase definitions file.
    pub fn phases_file(&self) -> PathBuf {
        self.ratchet_dir.join("phases.json")
    }

    /// Store path from config, anchored at the project root when relative.
    pub fn store_path(&self, config: &EngineConfig) -> PathBuf {
        if config.store.path.is_absolute() {
            config.store.path.clone()
        } else {
            self.project_dir.join(&config.store.path)
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.artifacts_dir)
            .context("Failed to create artifacts directory")?;
        Ok(())
    }
}
