//! Configuration management for AGS
//!
//! Repository-level settings for the reliability subsystem: where the health
//! ledger lives, circuit breaker and backoff tuning, run supervision limits,
//! and the command-backed pipeline the CLI drives.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{AgsError, Result};

/// Repository-level AGS configuration
///
/// Loaded from `.ags/config.toml` in the repo root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgsConfig {
    /// Health ledger persistence
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Per-agent circuit breaker tuning
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry wait policy
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Whole-run supervision
    #[serde(default)]
    pub run: RunConfig,

    /// Agents the CLI runs
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Where the health ledger is stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Durable ledger file (backup and temp files live next to it)
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,

    /// Artifact file exchanged with CI between runs
    #[serde(default = "default_artifact_path")]
    pub artifact_path: PathBuf,
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures in the closed state before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before admitting a trial call
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,

    /// Seconds past the retry deadline after which the recovery sweep
    /// forces a trial call regardless of ledger health
    #[serde(default = "default_forced_trial_after_secs")]
    pub forced_trial_after_secs: u64,
}

/// Retry wait policy for failed agent calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Backoff base, doubled per consecutive failure
    #[serde(default = "default_base_wait_ms")]
    pub base_wait_ms: u64,

    /// Backoff cap (before jitter)
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Upper bound of the random jitter, as a fraction of the wait
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Fixed wait after a rate-limit error
    #[serde(default = "default_rate_limit_wait_ms")]
    pub rate_limit_wait_ms: u64,

    /// Fixed wait after a timeout
    #[serde(default = "default_timeout_wait_ms")]
    pub timeout_wait_ms: u64,

    /// Fixed wait after a network error
    #[serde(default = "default_network_wait_ms")]
    pub network_wait_ms: u64,
}

/// Whole-run supervision limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Seconds between successful runs
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Consecutive failed runs that force a restart
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,

    /// Wait before retrying after a failed run that does not need a restart
    #[serde(default = "default_failure_wait_ms")]
    pub failure_wait_ms: u64,

    /// Restart backoff base
    #[serde(default = "default_restart_base_wait_ms")]
    pub restart_base_wait_ms: u64,

    /// Restart backoff cap
    #[serde(default = "default_restart_max_wait_ms")]
    pub restart_max_wait_ms: u64,

    /// Agents whose skip status forces a restart
    #[serde(default = "default_critical_agents")]
    pub critical_agents: Vec<String>,

    /// Agents always listed in health checks, even before their first call
    #[serde(default = "default_tracked_agents")]
    pub tracked_agents: Vec<String>,

    /// Seconds an in-flight agent call may keep running after shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// How often cooperative waits re-check the shutdown flag
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Stop after this many runs (0 = run until shutdown)
    #[serde(default)]
    pub max_runs: usize,

    /// Give up once this many restarts happened without a healthy run
    /// in between
    #[serde(default)]
    pub max_restarts: Option<usize>,
}

/// Command-backed pipeline definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Agent that produces the batch of work items for a run
    #[serde(default)]
    pub source: Option<SourceSpec>,

    /// Agents every work item passes through, in order
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

/// The work source agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Agent name tracked in the ledger
    pub name: String,

    /// Shell command; each non-empty stdout line becomes a work item
    pub command: String,

    /// Hard limit for one invocation
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

/// One stage of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Agent name tracked in the ledger
    pub name: String,

    /// Shell command; receives the payload on stdin, returns it on stdout.
    /// Exit status 3 vetoes the payload with stderr as the reason.
    pub command: String,

    /// How a veto or failure of this stage affects the work item
    #[serde(default)]
    pub role: StageRole,

    /// Hard limit for one invocation
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

/// How the run controller treats a stage that is vetoed or fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    /// Failure fails the work item
    #[default]
    Required,
    /// Veto or failure discards the work item
    SafetyCritical,
    /// Veto or failure passes the input through unchanged
    Optional,
}

impl std::fmt::Display for StageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Required => write!(f, "required"),
            Self::SafetyCritical => write!(f, "safety_critical"),
            Self::Optional => write!(f, "optional"),
        }
    }
}

// Default value providers
fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/learning.json")
}

fn default_artifact_path() -> PathBuf {
    PathBuf::from("learning-data.json")
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout_secs() -> u64 {
    60
}

fn default_forced_trial_after_secs() -> u64 {
    300
}

fn default_base_wait_ms() -> u64 {
    5_000
}

fn default_max_wait_ms() -> u64 {
    300_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_rate_limit_wait_ms() -> u64 {
    60_000
}

fn default_timeout_wait_ms() -> u64 {
    5_000
}

fn default_network_wait_ms() -> u64 {
    10_000
}

fn default_interval_secs() -> u64 {
    3_600
}

fn default_max_consecutive_failures() -> usize {
    3
}

fn default_failure_wait_ms() -> u64 {
    60_000
}

fn default_restart_base_wait_ms() -> u64 {
    60_000
}

fn default_restart_max_wait_ms() -> u64 {
    600_000
}

fn default_critical_agents() -> Vec<String> {
    vec![
        "topic_researcher".to_string(),
        "content_composer".to_string(),
        "safety_officer".to_string(),
    ]
}

fn default_tracked_agents() -> Vec<String> {
    vec![
        "topic_researcher".to_string(),
        "scripture_mapper".to_string(),
        "content_composer".to_string(),
        "seo_metadata".to_string(),
        "formatter".to_string(),
        "interlinker".to_string(),
        "safety_officer".to_string(),
        "publisher".to_string(),
    ]
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_agent_timeout_secs() -> u64 {
    300
}

impl AgsConfig {
    /// Load configuration from `.ags/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".ags/config.toml");

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from an explicit file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| AgsError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.ags/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<PathBuf> {
        let config_dir = repo_root.join(".ags");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| AgsError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Reject settings the reliability layers cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(AgsError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.recovery.jitter_ratio) {
            return Err(AgsError::Config(format!(
                "recovery.jitter_ratio must be within [0, 1], got {}",
                self.recovery.jitter_ratio
            )));
        }
        if self.recovery.base_wait_ms > self.recovery.max_wait_ms {
            return Err(AgsError::Config(
                "recovery.base_wait_ms exceeds recovery.max_wait_ms".to_string(),
            ));
        }
        if self.run.poll_interval_ms == 0 {
            return Err(AgsError::Config(
                "run.poll_interval_ms must be positive".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        let source_name = self.pipeline.source.as_ref().map(|s| s.name.as_str());
        for name in source_name
            .into_iter()
            .chain(self.pipeline.stages.iter().map(|s| s.name.as_str()))
        {
            if !seen.insert(name) {
                return Err(AgsError::Config(format!(
                    "pipeline agent name used twice: {}",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            artifact_path: default_artifact_path(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_secs: default_open_timeout_secs(),
            forced_trial_after_secs: default_forced_trial_after_secs(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_wait_ms: default_base_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
            jitter_ratio: default_jitter_ratio(),
            rate_limit_wait_ms: default_rate_limit_wait_ms(),
            timeout_wait_ms: default_timeout_wait_ms(),
            network_wait_ms: default_network_wait_ms(),
        }
    }
}

impl RunConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            failure_wait_ms: default_failure_wait_ms(),
            restart_base_wait_ms: default_restart_base_wait_ms(),
            restart_max_wait_ms: default_restart_max_wait_ms(),
            critical_agents: default_critical_agents(),
            tracked_agents: default_tracked_agents(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_runs: 0,
            max_restarts: None,
        }
    }
}

impl StageSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SourceSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
