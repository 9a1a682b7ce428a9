use crate::interval::MAX_INTERVAL_SECS;
use crate::slo::SlaThresholds;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTestConfig {
    pub run: RunConfig,
    #[serde(default)]
    pub interval: IntervalConfig,
    #[serde(default)]
    pub burst: BurstConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub sla: SlaThresholds,
    #[serde(default)]
    pub drain: DrainConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

impl LoadTestConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: LoadTestConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.protocols.is_empty() {
            return Err(ConfigError::NoProtocols);
        }
        check_interval_secs(self.run.base_interval_secs)?;
        self.interval.validate()?;
        self.burst.validate()?;
        self.sampler.validate()
    }
}

/// A gap in seconds must be positive and no longer than [`MAX_INTERVAL_SECS`].
pub fn check_interval_secs(secs: f64) -> Result<(), ConfigError> {
    if !(secs > 0.0) {
        return Err(ConfigError::NonPositiveInterval(secs));
    }
    if !(secs <= MAX_INTERVAL_SECS) {
        return Err(ConfigError::IntervalTooLong(secs));
    }
    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("run.protocols must name at least one protocol")]
    NoProtocols,
    #[error("intervals must be positive, got {0}")]
    NonPositiveInterval(f64),
    #[error("intervals must not exceed one day (86400s), got {0}")]
    IntervalTooLong(f64),
    #[error("interval.min_interval_secs ({min}) exceeds interval.max_interval_secs ({max})")]
    InvertedIntervalBounds { min: f64, max: f64 },
    #[error("burst.multiplier must be >= 1.0, got {0}")]
    BurstMultiplier(f64),
    #[error("sampler.cadence_ms must be positive")]
    ZeroCadence,
    #[error("{0} must be positive")]
    ZeroWindow(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Deterministic seed for per-worker RNGs (payloads and Poisson draws)
    pub seed: u64,
    /// Optional run duration cap in milliseconds; runs until interrupted otherwise
    pub duration_ms: Option<u64>,
    /// Protocol names, in the order devices are distributed to them
    pub protocols: Vec<String>,
    /// Base message interval per device in seconds
    pub base_interval_secs: f64,
    /// Opaque message kind, e.g. "telemetry" or "event"
    #[serde(default = "default_message_kind")]
    pub message_kind: String,
}

fn default_message_kind() -> String {
    "telemetry".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalMode {
    Fixed,
    Poisson,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub mode: IntervalMode,
    /// Lower clamp for Poisson draws in seconds
    pub min_interval_secs: f64,
    /// Upper clamp for Poisson draws in seconds
    pub max_interval_secs: f64,
    /// Rolling window of draws kept for distribution statistics
    pub distribution_window: usize,
}

impl IntervalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_interval_secs(self.min_interval_secs)?;
        check_interval_secs(self.max_interval_secs)?;
        if self.min_interval_secs > self.max_interval_secs {
            return Err(ConfigError::InvertedIntervalBounds {
                min: self.min_interval_secs,
                max: self.max_interval_secs,
            });
        }
        if self.distribution_window == 0 {
            return Err(ConfigError::ZeroWindow("interval.distribution_window"));
        }
        Ok(())
    }
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            mode: IntervalMode::Fixed,
            min_interval_secs: 0.1,
            max_interval_secs: 300.0,
            distribution_window: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstConfig {
    pub enabled: bool,
    /// Load multiplier while a burst is active (interval is divided by it)
    pub multiplier: f64,
    pub duration_secs: u64,
    /// Seconds of normal load between bursts
    pub frequency_secs: u64,
}

impl BurstConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(ConfigError::BurstMultiplier(self.multiplier));
        }
        Ok(())
    }
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            multiplier: 5.0,
            duration_secs: 60,
            frequency_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub cadence_ms: u64,
    /// Number of most recent latency samples used for live percentiles
    pub latency_window: usize,
}

impl SamplerConfig {
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cadence_ms == 0 {
            return Err(ConfigError::ZeroCadence);
        }
        if self.latency_window == 0 {
            return Err(ConfigError::ZeroWindow("sampler.latency_window"));
        }
        Ok(())
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            cadence_ms: 10_000,
            latency_window: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Per-worker wait before a straggler is abandoned
    pub timeout_ms: u64,
}

impl DrainConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Adapter base URL; the message kind is appended as the path
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub output_dir: PathBuf,
    /// Write an intermediate report every N seconds while running
    pub every_secs: Option<u64>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("reports"),
            every_secs: None,
        }
    }
}
