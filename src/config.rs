//! Configuration management for the fusion engine
//!
//! TOML file support, environment variable overrides and defaults that
//! match the agent's production settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::{DispatchMode, EngineOptions};
use crate::canonical::fingerprint::{Fingerprinter, DEFAULT_SEPARATOR};
use crate::dialect::{Dialect, DialectKind, WarehouseUdf};
use crate::dispatch::{DispatchPolicy, RetryPolicy};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FusionConfig {
    /// Fingerprint and family settings
    #[serde(default)]
    pub fingerprint: FingerprintConfig,

    /// Target backend dialect
    #[serde(default)]
    pub dialect: DialectConfig,

    /// Dispatch limits and scheduling
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Fingerprint configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FingerprintConfig {
    /// Separator between fingerprint components
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Put sketch calculations in their own families
    #[serde(default)]
    pub sketch_isolation: bool,
}

/// Dialect configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DialectConfig {
    /// presto, warehouse or embedded
    #[serde(default = "default_dialect_kind")]
    pub kind: DialectKind,

    /// Emit serialised sketches instead of plain approximate values
    #[serde(default = "default_true")]
    pub sketch_mode: bool,

    /// Database holding the warehouse sketch UDFs
    #[serde(default = "default_udf_database")]
    pub udf_database: String,

    /// Schema holding the warehouse sketch UDFs
    #[serde(default = "default_udf_schema")]
    pub udf_schema: String,
}

/// Dispatch configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Wait for results (sync) or only submit (async)
    #[serde(default)]
    pub mode: DispatchMode,

    /// Status checks before a running execution is cancelled
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,

    /// FAILED/CANCELLED executions tolerated per family
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// First wait between status checks
    #[serde(default = "default_poll_initial_delay_ms")]
    pub poll_initial_delay_ms: u64,

    /// Longest wait between status checks
    #[serde(default = "default_poll_max_delay_ms")]
    pub poll_max_delay_ms: u64,

    /// Throttled requests retried before giving up
    #[serde(default = "default_throttle_max_retries")]
    pub throttle_max_retries: u32,

    /// First wait after a throttled request
    #[serde(default = "default_throttle_initial_delay_ms")]
    pub throttle_initial_delay_ms: u64,

    /// Longest wait after a throttled request
    #[serde(default = "default_throttle_max_delay_ms")]
    pub throttle_max_delay_ms: u64,

    /// Exponential backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to waits
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Pause between family submissions
    #[serde(default = "default_inter_family_delay_ms")]
    pub inter_family_delay_ms: u64,

    /// Families in flight at once
    #[serde(default = "default_max_concurrent_families")]
    pub max_concurrent_families: usize,

    /// Wall-clock limit per family (unset = no limit)
    #[serde(default)]
    pub family_timeout_ms: Option<u64>,

    /// Fetch and demultiplex result rows of succeeded families
    #[serde(default = "default_true")]
    pub fetch_results: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub structured: bool,
}

// Default value functions
fn default_separator() -> String { DEFAULT_SEPARATOR.to_string() }
fn default_dialect_kind() -> DialectKind { DialectKind::Presto }
fn default_udf_database() -> String { "UDF".to_string() }
fn default_udf_schema() -> String { "PUBLIC".to_string() }
fn default_max_polls() -> u32 { 10 }
fn default_failure_threshold() -> u32 { 1 }
fn default_poll_initial_delay_ms() -> u64 { 1_000 }
fn default_poll_max_delay_ms() -> u64 { 600_000 }
fn default_throttle_max_retries() -> u32 { 8 }
fn default_throttle_initial_delay_ms() -> u64 { 1_000 }
fn default_throttle_max_delay_ms() -> u64 { 60_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_inter_family_delay_ms() -> u64 { 1_000 }
fn default_max_concurrent_families() -> usize { 1 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            sketch_isolation: false,
        }
    }
}

impl Default for DialectConfig {
    fn default() -> Self {
        Self {
            kind: default_dialect_kind(),
            sketch_mode: true,
            udf_database: default_udf_database(),
            udf_schema: default_udf_schema(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            max_polls: default_max_polls(),
            failure_threshold: default_failure_threshold(),
            poll_initial_delay_ms: default_poll_initial_delay_ms(),
            poll_max_delay_ms: default_poll_max_delay_ms(),
            throttle_max_retries: default_throttle_max_retries(),
            throttle_initial_delay_ms: default_throttle_initial_delay_ms(),
            throttle_max_delay_ms: default_throttle_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
            inter_family_delay_ms: default_inter_family_delay_ms(),
            max_concurrent_families: default_max_concurrent_families(),
            family_timeout_ms: None,
            fetch_results: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            structured: false,
        }
    }
}

impl FusionConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Fingerprint
        if let Ok(separator) = std::env::var("FUSION_SEPARATOR") {
            self.fingerprint.separator = separator;
        }
        if let Some(isolation) = env_parse("FUSION_SKETCH_ISOLATION") {
            self.fingerprint.sketch_isolation = isolation;
        }

        // Dialect
        if let Ok(kind) = std::env::var("FUSION_DIALECT") {
            match kind.to_ascii_lowercase().as_str() {
                "presto" => self.dialect.kind = DialectKind::Presto,
                "warehouse" => self.dialect.kind = DialectKind::Warehouse,
                "embedded" => self.dialect.kind = DialectKind::Embedded,
                other => tracing::warn!(dialect = other, "Ignoring unknown FUSION_DIALECT"),
            }
        }
        if let Some(sketch_mode) = env_parse("FUSION_SKETCH_MODE") {
            self.dialect.sketch_mode = sketch_mode;
        }
        if let Ok(database) = std::env::var("FUSION_UDF_DATABASE") {
            self.dialect.udf_database = database;
        }
        if let Ok(schema) = std::env::var("FUSION_UDF_SCHEMA") {
            self.dialect.udf_schema = schema;
        }

        // Dispatch
        if let Ok(mode) = std::env::var("FUSION_DISPATCH_MODE") {
            match mode.to_ascii_lowercase().as_str() {
                "sync" => self.dispatch.mode = DispatchMode::Sync,
                "async" => self.dispatch.mode = DispatchMode::Async,
                other => tracing::warn!(mode = other, "Ignoring unknown FUSION_DISPATCH_MODE"),
            }
        }
        if let Some(polls) = env_parse("FUSION_MAX_POLLS") {
            self.dispatch.max_polls = polls;
        }
        if let Some(threshold) = env_parse("FUSION_FAILURE_THRESHOLD") {
            self.dispatch.failure_threshold = threshold;
        }
        if let Some(delay) = env_parse("FUSION_INTER_FAMILY_DELAY_MS") {
            self.dispatch.inter_family_delay_ms = delay;
        }
        if let Some(concurrency) = env_parse("FUSION_MAX_CONCURRENT_FAMILIES") {
            self.dispatch.max_concurrent_families = concurrency;
        }
        if let Some(timeout) = env_parse("FUSION_FAMILY_TIMEOUT_MS") {
            self.dispatch.family_timeout_ms = Some(timeout);
        }

        // Logging
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.fingerprint.separator.is_empty() {
            return Err("Fingerprint separator cannot be empty".to_string());
        }

        if self.dialect.kind == DialectKind::Warehouse
            && (self.dialect.udf_database.trim().is_empty()
                || self.dialect.udf_schema.trim().is_empty())
        {
            return Err("Warehouse dialect requires udf_database and udf_schema".to_string());
        }

        if self.dispatch.max_polls == 0 {
            return Err("Max polls must be > 0".to_string());
        }
        if self.dispatch.failure_threshold == 0 {
            return Err("Failure threshold must be > 0".to_string());
        }
        if self.dispatch.backoff_multiplier < 1.0 {
            return Err("Backoff multiplier must be >= 1.0".to_string());
        }
        if self.dispatch.poll_initial_delay_ms > self.dispatch.poll_max_delay_ms {
            return Err("Poll initial delay cannot exceed poll max delay".to_string());
        }
        if self.dispatch.throttle_initial_delay_ms > self.dispatch.throttle_max_delay_ms {
            return Err("Throttle initial delay cannot exceed throttle max delay".to_string());
        }
        if self.dispatch.max_concurrent_families == 0 {
            return Err("Max concurrent families must be > 0".to_string());
        }
        if self.dispatch.family_timeout_ms == Some(0) {
            return Err("Family timeout must be > 0 when set".to_string());
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), String> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file {}: {}", path, e))
    }

    /// Fingerprinter for the configured separator
    pub fn fingerprinter(&self) -> Fingerprinter {
        Fingerprinter::new(self.fingerprint.separator.clone())
    }

    /// The configured dialect
    pub fn dialect(&self) -> Dialect {
        match self.dialect.kind {
            DialectKind::Presto => Dialect::Presto,
            DialectKind::Embedded => Dialect::Embedded,
            DialectKind::Warehouse => Dialect::Warehouse(WarehouseUdf::new(
                &self.dialect.udf_database,
                &self.dialect.udf_schema,
            )),
        }
    }

    /// Dispatcher limits
    pub fn dispatch_policy(&self) -> DispatchPolicy {
        let d = &self.dispatch;
        DispatchPolicy {
            max_polls: d.max_polls,
            failure_threshold: d.failure_threshold,
            poll_backoff: RetryPolicy {
                max_retries: d.max_polls,
                initial_delay: Duration::from_millis(d.poll_initial_delay_ms),
                max_delay: Duration::from_millis(d.poll_max_delay_ms),
                multiplier: d.backoff_multiplier,
                jitter: d.jitter,
            },
            throttle_retry: RetryPolicy {
                max_retries: d.throttle_max_retries,
                initial_delay: Duration::from_millis(d.throttle_initial_delay_ms),
                max_delay: Duration::from_millis(d.throttle_max_delay_ms),
                multiplier: d.backoff_multiplier,
                jitter: d.jitter,
            },
        }
    }

    /// Batch scheduling options
    pub fn engine_options(&self) -> EngineOptions {
        let d = &self.dispatch;
        EngineOptions {
            mode: d.mode,
            inter_family_delay: Duration::from_millis(d.inter_family_delay_ms),
            max_concurrent_families: d.max_concurrent_families,
            family_timeout: d.family_timeout_ms.map(Duration::from_millis),
            fetch_results: d.fetch_results,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.trim().parse().ok())
}
