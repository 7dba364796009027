//! Pipeline configuration.
//!
//! Handles loading, validating, and merging `config.toml`. Stock defaults are
//! the base layer; a sparse `config.toml` in the runs directory overrides
//! them, and command-line flags override both.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [retry]
//! max_attempts = 3          # Invocations per chapter before it is Failed
//! base_delay_ms = 2000      # First backoff; doubles per failed attempt
//! max_delay_ms = 60000      # Cap for computed and provider-hinted waits
//! transient = ["rate_limited", "timeout", "network", "server", "unavailable"]
//!
//! [scheduler]
//! strategy = "sequential"   # or "concurrent"
//! concurrency = 2           # Worker count for the concurrent strategy
//! chapter_delay_ms = 0      # Pause between chapters (sequential only)
//!
//! [lock]
//! stale_after_secs = 3600   # Lock with no heartbeat for this long is reclaimed
//! acquire_timeout_secs = 0  # How long to wait for a live lock (0 = fail fast)
//! poll_interval_ms = 250
//!
//! [invoker]
//! analyze = ["extract-scenes", "--json"]
//! illustrate = ["render-scene"]
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::invoke::ErrorKind;
use crate::scheduler::Strategy;
use crate::state::Phase;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// File name looked up in the runs directory.
pub const CONFIG_FILENAME: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub lock: LockConfig,
    pub invoker: InvokerConfig,
}

impl PipelineConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Validation(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.scheduler.concurrency == 0 {
            return Err(ConfigError::Validation(
                "scheduler.concurrency must be at least 1".into(),
            ));
        }
        if self.lock.stale_after_secs == 0 {
            return Err(ConfigError::Validation(
                "lock.stale_after_secs must be non-zero".into(),
            ));
        }
        if self.lock.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "lock.poll_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Retry budget and backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Error kinds retried with backoff. Everything else fails immediately.
    pub transient: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            transient: vec![
                ErrorKind::RateLimited,
                ErrorKind::Timeout,
                ErrorKind::Network,
                ErrorKind::Server,
                ErrorKind::Unavailable,
            ],
        }
    }
}

/// Execution strategy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub strategy: Strategy,
    /// Worker count for the concurrent strategy. Clamped to the core count.
    pub concurrency: usize,
    /// Cooperative pause between chapters in sequential mode.
    pub chapter_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Sequential,
            concurrency: 2,
            chapter_delay_ms: 0,
        }
    }
}

/// Resolve the effective worker count.
///
/// User can constrain down, not up: the value is clamped to `1..=cores`.
pub fn effective_concurrency(config: &SchedulerConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.concurrency.clamp(1, cores.max(1))
}

/// Run lock settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub stale_after_secs: u64,
    pub acquire_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 3_600,
            acquire_timeout_secs: 0,
            poll_interval_ms: 250,
        }
    }
}

/// External command per phase, as an argv list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InvokerConfig {
    pub analyze: Vec<String>,
    pub illustrate: Vec<String>,
}

impl InvokerConfig {
    pub fn command_for(&self, phase: Phase) -> &[String] {
        match phase {
            Phase::Analyze => &self.analyze,
            Phase::Illustrate => &self.illustrate,
        }
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(PipelineConfig::default()).expect("default config must serialize")
}

/// Recursively merge `overlay` on top of `base`.
///
/// Tables merge key-by-key; any other overlay value replaces the base value.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load `config.toml` from a directory as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(dir: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let path = dir.join(CONFIG_FILENAME);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)?;
    Ok(Some(toml::from_str(&content)?))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<PipelineConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: PipelineConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `config.toml` in the given directory, on top of stock defaults.
pub fn load_config(dir: &Path) -> Result<PipelineConfig, ConfigError> {
    resolve_config(stock_defaults_value(), load_raw_config(dir)?)
}

/// Returns a fully-commented stock `config.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Chapter Pipeline Configuration
# ==============================
# Place this file as config.toml in the runs directory (--runs-dir).
# All settings are optional; values shown are the defaults.
# Unknown keys cause an error.

# ---------------------------------------------------------------------------
# Retry policy
# ---------------------------------------------------------------------------
[retry]
# Invocations per chapter before it is marked Failed.
max_attempts = 3

# Backoff after the first failed attempt; doubles after each further failure.
base_delay_ms = 2000

# Upper bound on any wait, including provider retry-after hints.
max_delay_ms = 60000

# Error kinds that are retried. Any other kind fails the chapter immediately.
# Known kinds: rate_limited, timeout, network, server, unavailable,
#              invalid_input, unauthorized, quota_exhausted, other
transient = ["rate_limited", "timeout", "network", "server", "unavailable"]

# ---------------------------------------------------------------------------
# Scheduling
# ---------------------------------------------------------------------------
[scheduler]
# "sequential" processes one chapter at a time; "concurrent" uses a worker pool.
strategy = "sequential"

# Worker count for the concurrent strategy (clamped to the number of cores).
concurrency = 2

# Pause between chapters in sequential mode, to stay under a rate budget.
chapter_delay_ms = 0

# ---------------------------------------------------------------------------
# Run lock
# ---------------------------------------------------------------------------
[lock]
# A lock whose owner has not refreshed it for this long is reclaimed.
stale_after_secs = 3600

# How long to wait for another live run to finish (0 = fail immediately).
acquire_timeout_secs = 0

# Poll interval while waiting for the lock.
poll_interval_ms = 250

# ---------------------------------------------------------------------------
# External commands, one argv per phase
# ---------------------------------------------------------------------------
[invoker]
analyze = []
illustrate = []
"##
}
