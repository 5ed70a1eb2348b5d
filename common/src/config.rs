//! Pipeline configuration
//!
//! A JSON file sets the baseline; a small set of environment switches
//! override it for deployment tweaks without a config rollout.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration failure; maps to CLI exit code 2
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("read {}: {source}", path.display())]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// File content is not valid config JSON
    #[error("parse {}: {source}", path.display())]
    Parse {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
    /// A field failed validation
    #[error("invalid config: {0}")]
    Invalid(String),
    /// An environment switch carries an unusable value
    #[error("env {name}={value}: {message}")]
    BadEnv {
        /// Variable name
        name: &'static str,
        /// Observed value
        value: String,
        /// What was expected
        message: &'static str,
    },
}

/// Recorder write mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderMode {
    /// Batch straight into the column store
    Direct,
    /// Batch to WAL segments, drained by the loader
    WalFirst,
}

/// Overflow policy applied when a recorder topic hits pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicPolicy {
    /// Keep writing
    Write,
    /// Drop rows, count the loss
    Drop,
    /// Stop the pipeline
    Halt,
}

/// Bounded-queue capacities for every stage hand-off
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Raw broker market-data payloads
    pub raw: usize,
    /// Raw broker execution payloads
    pub raw_exec: usize,
    /// Market-data bus ring (power of two)
    pub bus: usize,
    /// Strategy intents awaiting the gateway
    pub intent: usize,
    /// Approved commands awaiting the adapter
    pub order: usize,
    /// Rows awaiting the recorder
    pub recorder: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            raw: 4096,
            raw_exec: 1024,
            bus: 8192,
            intent: 1024,
            order: 512,
            recorder: 16_384,
        }
    }
}

/// Exposure caps, all scaled integers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureConfig {
    /// Leaf cardinality bound for the store
    pub max_symbols: usize,
    /// |net_qty| cap per (account, strategy, symbol)
    pub max_net_qty: i64,
    /// Notional cap per (account, strategy, symbol), scaled
    pub max_notional: i64,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            max_symbols: 10_000,
            max_net_qty: 500,
            max_notional: 50_000_000_000,
        }
    }
}

/// Pre-trade risk thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Price band width in ticks around reference
    pub band_ticks: i64,
    /// Per-order quantity cap
    pub max_qty: i64,
    /// Per-order notional cap, scaled
    pub max_notional: i64,
    /// Per-strategy position cap (|net + pending + signed|)
    pub max_position: i64,
    /// Order-rate window
    pub rate_window_ns: i64,
    /// Orders per window before DEGRADED
    pub rate_soft: usize,
    /// Orders per window before reject
    pub rate_hard: usize,
    /// Drawdown (scaled) entering DEGRADED
    pub storm_warm_drawdown: i64,
    /// Drawdown (scaled) entering HALT
    pub storm_halt_drawdown: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            band_ticks: 20,
            max_qty: 100,
            max_notional: 10_000_000_000,
            max_position: 1_000,
            rate_window_ns: 10_000_000_000,
            rate_soft: 120,
            rate_hard: 200,
            storm_warm_drawdown: 50_000_000,
            storm_halt_drawdown: 200_000_000,
        }
    }
}

/// Gateway/dedup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Dispatch plane enabled; off wires intents to an audit-only sink
    pub enabled: bool,
    /// Idempotency window capacity
    pub dedup_capacity: usize,
    /// Idempotency entry TTL
    pub dedup_ttl_ns: i64,
    /// Persisted window location
    pub dedup_path: PathBuf,
    /// DEGRADED-mode quantity throttle divisor
    pub degraded_qty_divisor: i64,
    /// Command deadline, relative
    pub command_deadline_ns: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dedup_capacity: 65_536,
            dedup_ttl_ns: 3_600_000_000_000,
            dedup_path: PathBuf::from("state/dedup.bin"),
            degraded_qty_divisor: 4,
            command_deadline_ns: 500_000_000,
        }
    }
}

/// Order adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Rate window
    pub rate_window_ns: i64,
    /// Broker actions per window before backpressure
    pub rate_soft: usize,
    /// Broker actions per window, never exceeded
    pub rate_hard: usize,
    /// Consecutive failures opening the breaker
    pub breaker_threshold: u64,
    /// Open-state dwell before a half-open probe
    pub breaker_timeout_ms: u64,
    /// Dead-letter queue bound
    pub dlq_capacity: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            rate_window_ns: 10_000_000_000,
            rate_soft: 180,
            rate_hard: 250,
            breaker_threshold: 5,
            breaker_timeout_ms: 5_000,
            dlq_capacity: 1_024,
        }
    }
}

/// Recorder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// direct or wal_first
    pub mode: RecorderMode,
    /// WAL segment directory
    pub wal_dir: PathBuf,
    /// Segment rotation size
    pub segment_max_bytes: u64,
    /// Segment rotation age
    pub segment_max_age_ms: u64,
    /// Batch flush row threshold
    pub batch_max_rows: usize,
    /// Batch flush age threshold
    pub batch_max_age_ms: u64,
    /// Cross-batcher row bound before forced flush
    pub memory_guard_rows: usize,
    /// Disk usage poll interval
    pub disk_poll_ms: u64,
    /// WAL directory bytes entering WARN
    pub disk_warn_bytes: u64,
    /// WAL directory bytes entering CRITICAL
    pub disk_critical_bytes: u64,
    /// WAL directory bytes entering HALT
    pub disk_halt_bytes: u64,
    /// Policy applied to market data on CRITICAL
    pub market_data_policy: TopicPolicy,
    /// Policy applied to orders/trades on CRITICAL
    pub orders_policy: TopicPolicy,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            mode: RecorderMode::WalFirst,
            wal_dir: PathBuf::from("wal"),
            segment_max_bytes: 128 * 1024 * 1024,
            segment_max_age_ms: 60_000,
            batch_max_rows: 2_000,
            batch_max_age_ms: 200,
            memory_guard_rows: 200_000,
            disk_poll_ms: 1_000,
            disk_warn_bytes: 4 * 1024 * 1024 * 1024,
            disk_critical_bytes: 8 * 1024 * 1024 * 1024,
            disk_halt_bytes: 16 * 1024 * 1024 * 1024,
            market_data_policy: TopicPolicy::Drop,
            orders_policy: TopicPolicy::Halt,
        }
    }
}

/// Strategy runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Per-strategy handler budget
    pub strategy_budget_ns: i64,
    /// Budget overruns before the per-strategy breaker degrades
    pub breaker_degrade_after: u32,
    /// Overruns/failures before the breaker halts the strategy
    pub breaker_halt_after: u32,
    /// Idempotency-key epoch bucket width
    pub epoch_bucket_ns: i64,
    /// Default intent validity window
    pub intent_ttl_ns: i64,
    /// Events consumed per batch off the bus
    pub consume_batch: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            strategy_budget_ns: 200_000,
            breaker_degrade_after: 3,
            breaker_halt_after: 10,
            epoch_bucket_ns: 1_000_000_000,
            intent_ttl_ns: 500_000_000,
            consume_batch: 64,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Queue capacities
    pub queues: QueueConfig,
    /// Exposure caps
    pub exposure: ExposureConfig,
    /// Risk thresholds
    pub risk: RiskConfig,
    /// Gateway settings
    pub gateway: GatewayConfig,
    /// Adapter settings
    pub adapter: AdapterConfig,
    /// Recorder settings
    pub recorder: RecorderConfig,
    /// Strategy runner settings
    pub runner: RunnerConfig,
    /// Prometheus listener port
    pub metrics_port: u16,
    /// Symbol metadata file
    pub symbols_path: Option<PathBuf>,
    /// Per-stage drain window on shutdown; stages past it are abandoned
    pub shutdown_drain_ms: u64,
}

impl CoreConfig {
    /// Load from a JSON file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides; used when no file is given
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the recognized environment switches
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("RECORDER_MODE") {
            self.recorder.mode = match v.as_str() {
                "direct" => RecorderMode::Direct,
                "wal_first" => RecorderMode::WalFirst,
                _ => {
                    return Err(ConfigError::BadEnv {
                        name: "RECORDER_MODE",
                        value: v,
                        message: "expected direct or wal_first",
                    });
                }
            };
        }
        if let Ok(v) = std::env::var("GATEWAY_ENABLED") {
            self.gateway.enabled = match v.as_str() {
                "1" => true,
                "0" => false,
                _ => {
                    return Err(ConfigError::BadEnv {
                        name: "GATEWAY_ENABLED",
                        value: v,
                        message: "expected 0 or 1",
                    });
                }
            };
        }
        if let Ok(v) = std::env::var("EXPOSURE_MAX_SYMBOLS") {
            self.exposure.max_symbols = v.parse().map_err(|_| ConfigError::BadEnv {
                name: "EXPOSURE_MAX_SYMBOLS",
                value: v,
                message: "expected an integer",
            })?;
        }
        if let Ok(v) = std::env::var("BUS_CAPACITY") {
            self.queues.bus = v.parse().map_err(|_| ConfigError::BadEnv {
                name: "BUS_CAPACITY",
                value: v,
                message: "expected an integer",
            })?;
        }
        if let Ok(v) = std::env::var("METRICS_PORT") {
            self.metrics_port = v.parse().map_err(|_| ConfigError::BadEnv {
                name: "METRICS_PORT",
                value: v,
                message: "expected a port number",
            })?;
        }
        Ok(())
    }

    /// Reject unusable configurations before any component starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.queues.bus.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "bus capacity {} is not a power of two",
                self.queues.bus
            )));
        }
        for (name, cap) in [
            ("raw", self.queues.raw),
            ("raw_exec", self.queues.raw_exec),
            ("intent", self.queues.intent),
            ("order", self.queues.order),
            ("recorder", self.queues.recorder),
        ] {
            if cap == 0 {
                return Err(ConfigError::Invalid(format!("queue {name} has capacity 0")));
            }
        }
        if self.risk.rate_soft > self.risk.rate_hard {
            return Err(ConfigError::Invalid(
                "risk rate_soft exceeds rate_hard".to_string(),
            ));
        }
        if self.adapter.rate_soft > self.adapter.rate_hard {
            return Err(ConfigError::Invalid(
                "adapter rate_soft exceeds rate_hard".to_string(),
            ));
        }
        if self.recorder.disk_warn_bytes > self.recorder.disk_critical_bytes
            || self.recorder.disk_critical_bytes > self.recorder.disk_halt_bytes
        {
            return Err(ConfigError::Invalid(
                "disk thresholds must be warn <= critical <= halt".to_string(),
            ));
        }
        if self.exposure.max_symbols == 0 {
            return Err(ConfigError::Invalid(
                "exposure max_symbols must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            queues: QueueConfig::default(),
            exposure: ExposureConfig::default(),
            risk: RiskConfig::default(),
            gateway: GatewayConfig::default(),
            adapter: AdapterConfig::default(),
            recorder: RecorderConfig::default(),
            runner: RunnerConfig::default(),
            metrics_port: 9100,
            symbols_path: None,
            shutdown_drain_ms: 2_000,
        }
    }
}
