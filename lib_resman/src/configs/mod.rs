//! # Configuration
//!
//! Everything the resource manager can be tuned with, grouped per component.
//! Every field has a default, so an empty file (or no file at all) yields the
//! reference behaviour. Files are JSON5 with `camelCase` keys; durations are
//! written in milliseconds (`ttlMs`, `sweepIntervalMs`, ...).
//!
//! ```json5
//! {
//!   cache: { maxPending: 50 },
//!   multiplexer: { maxSubscriptions: 2, coalesceDelayMs: 100 },
//!   policies: [
//!     { prefixMatch: "user-profile", ttlMs: 30000, priority: "critical", maxEntries: 50 },
//!   ],
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::memory_guard::PressureThresholds;
use crate::core::policy::{builtin_policies, default_policy, PolicyConfig, PolicyTable};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON5 for this schema.
    #[error("failed to parse config {origin}: {message}")]
    Parse {
        /// File path, or `<inline>` for strings.
        origin: String,
        /// Parser message.
        message: String,
    },

    /// The values parsed but are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper storing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Settings for the query cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Maximum number of in-flight producer calls.
    pub max_pending: usize,
    /// Period of the expired-entry sweep.
    #[serde(rename = "sweepIntervalMs", with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Share of a prefix's entries dropped when it exceeds `max_entries`.
    pub eviction_fraction: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_pending: 50,
            sweep_interval: Duration::from_secs(60),
            eviction_fraction: 0.3,
        }
    }
}

/// Settings for the pressure monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PressureSettings {
    /// Sampling period.
    #[serde(rename = "sampleIntervalMs", with = "duration_ms")]
    pub sample_interval: Duration,
    /// Ratio thresholds for each degradation level.
    pub thresholds: PressureThresholds,
    /// Resident memory budget. When unset, pressure sampling is a no-op.
    pub memory_budget_mb: Option<u64>,
}

impl Default for PressureSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            thresholds: PressureThresholds::default(),
            memory_budget_mb: None,
        }
    }
}

/// Settings for the realtime subscription multiplexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MultiplexerSettings {
    /// Name of the consolidated physical channel.
    pub channel_name: String,
    /// Maximum number of concurrently registered subscriptions.
    pub max_subscriptions: usize,
    /// Delay before queued Normal/Low deliveries are flushed.
    #[serde(rename = "coalesceDelayMs", with = "duration_ms")]
    pub coalesce_delay: Duration,
    /// Inactivity window after which a visible client's channel is torn down.
    #[serde(rename = "idleTimeoutMs", with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Memory ratio at or above which non-critical subscriptions are shed.
    pub shed_threshold: f64,
}

impl Default for MultiplexerSettings {
    fn default() -> Self {
        Self {
            channel_name: "resman-consolidated".to_string(),
            max_subscriptions: 2,
            coalesce_delay: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(300),
            shed_threshold: 0.75,
        }
    }
}

/// Hard ceiling on background worker threads.
pub const MAX_WORKERS: usize = 4;

/// Settings for the worker task scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    /// Number of background workers. `None` picks the available parallelism;
    /// `0` disables the pool so every task runs on the fallback path.
    pub pool_size: Option<usize>,
    /// Deadline for a single task.
    #[serde(rename = "taskTimeoutMs", with = "duration_ms")]
    pub task_timeout: Duration,
    /// Queue length beyond which tasks run on the fallback path.
    pub max_queue: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pool_size: None,
            task_timeout: Duration::from_secs(10),
            max_queue: 256,
        }
    }
}

impl WorkerSettings {
    /// Resolved pool size, capped at [`MAX_WORKERS`].
    pub fn effective_pool_size(&self) -> usize {
        let requested = self.pool_size.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        requested.min(MAX_WORKERS)
    }
}

/// # Resource Manager Config
///
/// Root of the configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceManagerConfig {
    /// Query cache settings.
    pub cache: CacheSettings,
    /// Pressure monitor settings.
    pub pressure: PressureSettings,
    /// Multiplexer settings.
    pub multiplexer: MultiplexerSettings,
    /// Worker scheduler settings.
    pub workers: WorkerSettings,
    /// Freshness policies, matched by longest prefix.
    pub policies: Vec<PolicyConfig>,
    /// Policy for keys no prefix matches.
    pub default_policy: PolicyConfig,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            pressure: PressureSettings::default(),
            multiplexer: MultiplexerSettings::default(),
            workers: WorkerSettings::default(),
            policies: builtin_policies(),
            default_policy: default_policy(),
        }
    }
}

impl ResourceManagerConfig {
    /// Parses and validates a JSON5 document.
    pub fn from_json5_str(source: &str) -> Result<Self, ConfigError> {
        Self::parse(source, "<inline>")
    }

    /// Reads, parses and validates a JSON5 file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&source, &path.display().to_string())
    }

    fn parse(source: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json5::from_str(source).map_err(|err| ConfigError::Parse {
            origin: origin.to_string(),
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.pressure.thresholds;
        if !(0.0 < t.soft && t.soft <= t.hard && t.hard <= t.emergency && t.emergency <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "pressure thresholds must satisfy 0 < soft <= hard <= emergency <= 1 (got {}/{}/{})",
                t.soft, t.hard, t.emergency
            )));
        }
        if !(self.cache.eviction_fraction > 0.0 && self.cache.eviction_fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "cache.evictionFraction must be in (0, 1] (got {})",
                self.cache.eviction_fraction
            )));
        }
        if self.cache.max_pending == 0 {
            return Err(ConfigError::Invalid("cache.maxPending must be at least 1".into()));
        }
        let shed = self.multiplexer.shed_threshold;
        if !(shed > 0.0 && shed <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "multiplexer.shedThreshold must be in (0, 1] (got {shed})"
            )));
        }
        for (name, period) in [
            ("cache.sweepIntervalMs", self.cache.sweep_interval),
            ("pressure.sampleIntervalMs", self.pressure.sample_interval),
            ("workers.taskTimeoutMs", self.workers.task_timeout),
        ] {
            if period.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if let Some(policy) = self
            .policies
            .iter()
            .chain(std::iter::once(&self.default_policy))
            .find(|p| p.max_entries == 0)
        {
            return Err(ConfigError::Invalid(format!(
                "policy '{}' must allow at least one entry",
                policy.prefix_match
            )));
        }
        Ok(())
    }

    /// Builds the immutable policy table.
    pub fn policy_table(&self) -> PolicyTable {
        PolicyTable::new(self.policies.clone(), self.default_policy.clone())
    }
}
