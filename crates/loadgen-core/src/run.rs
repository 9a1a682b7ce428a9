//! Entry points for driving one load-test run.

use crate::burst::BurstSchedule;
use crate::config::{
    check_interval_secs, BurstConfig, ConfigError, IntervalConfig, IntervalMode, LoadTestConfig,
    SamplerConfig,
};
use crate::device::{tenant_ids, Device};
use crate::dispatcher::{DispatchSettings, DrainReport, TransportRegistry, WorkerPool};
use crate::metrics::{MetricsOptions, MetricsSnapshot, MetricsStore};
use crate::payload::TelemetryGenerator;
use crate::percentile::LatencySummary;
use crate::report::{ChartRenderer, FinalReport, ReportPaths, RunInfo};
use crate::sampler::{time_series, Sampler, TimeSeries};
use crate::slo::{SlaThresholds, SloResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Knobs for [`start_run`] beyond the device list and base interval.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub seed: u64,
    pub interval: IntervalConfig,
    pub burst: BurstConfig,
    pub sampler: SamplerConfig,
    pub sla: SlaThresholds,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            seed: 42,
            interval: IntervalConfig::default(),
            burst: BurstConfig::default(),
            sampler: SamplerConfig::default(),
            sla: SlaThresholds::default(),
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.interval.validate()?;
        self.burst.validate()?;
        self.sampler.validate()
    }
}

impl From<&LoadTestConfig> for RunOptions {
    fn from(config: &LoadTestConfig) -> Self {
        Self {
            seed: config.run.seed,
            interval: config.interval.clone(),
            burst: config.burst.clone(),
            sampler: config.sampler.clone(),
            sla: config.sla.clone(),
        }
    }
}

/// What a stopped run leaves behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalStats {
    pub duration_secs: f64,
    pub snapshot: MetricsSnapshot,
    /// Over the full latency population
    pub latency: LatencySummary,
    pub slo: SloResult,
    pub drain: DrainReport,
}

/// A run in progress (or stopped but not yet discarded).
pub struct RunHandle {
    store: Arc<MetricsStore>,
    pool: Option<WorkerPool>,
    sampler: Option<JoinHandle<()>>,
    series: TimeSeries,
    cancel: CancellationToken,
    info: RunInfo,
    started: Instant,
    stopped_after: Option<Duration>,
    charts: Option<Box<dyn ChartRenderer>>,
}

/// Create the metrics store, dispatch one worker per device and start the
/// sampler. Must be called inside a tokio runtime.
///
/// Intervals and sampler settings are checked before anything is spawned.
pub fn start_run(
    devices: &[Device],
    protocols: &[String],
    base_interval_secs: f64,
    message_kind: &str,
    options: RunOptions,
    registry: &TransportRegistry,
) -> Result<RunHandle, ConfigError> {
    check_interval_secs(base_interval_secs)?;
    options.validate()?;

    let started = Instant::now();
    let store = Arc::new(MetricsStore::new(MetricsOptions {
        sla: options.sla.clone(),
        latency_window: options.sampler.latency_window,
        interval_window: options.interval.distribution_window,
    }));

    let tenants = tenant_ids(devices);
    store.record_infrastructure(tenants.len() as u64, devices.len() as u64);

    let burst = BurstSchedule::from_config(&options.burst);
    let cancel = CancellationToken::new();

    info!(
        devices = devices.len(),
        tenants = tenants.len(),
        protocols = ?protocols,
        base_interval_secs,
        message_kind,
        "Starting load test run"
    );

    let settings = DispatchSettings {
        seed: options.seed,
        base_interval_secs,
        message_kind: message_kind.to_string(),
        interval: options.interval.clone(),
        burst: burst.clone(),
        run_started: started,
    };
    let pool = WorkerPool::start(
        devices,
        protocols,
        &settings,
        &store,
        registry,
        Arc::new(TelemetryGenerator::new(message_kind)),
        cancel.child_token(),
    );

    let (writer, series) = time_series();
    let sampler = Sampler::new(
        Arc::clone(&store),
        writer,
        options.sampler.cadence(),
        burst,
        started,
    )
    .spawn(cancel.child_token());

    let info = RunInfo {
        started_at: Utc::now(),
        duration_secs: 0.0,
        protocols: pool.protocols().iter().map(|p| p.to_string()).collect(),
        message_kind: message_kind.to_string(),
        base_interval_secs,
        interval_mode: match options.interval.mode {
            IntervalMode::Fixed => "fixed".to_string(),
            IntervalMode::Poisson => "poisson".to_string(),
        },
        burst_enabled: options.burst.enabled,
        seed: options.seed,
        devices: devices.len(),
        tenants: tenants.len(),
    };

    Ok(RunHandle {
        store,
        pool: Some(pool),
        sampler: Some(sampler),
        series,
        cancel,
        info,
        started,
        stopped_after: None,
        charts: None,
    })
}

impl RunHandle {
    pub fn with_chart_renderer(mut self, charts: Box<dyn ChartRenderer>) -> Self {
        self.charts = Some(charts);
        self
    }

    pub fn store(&self) -> &Arc<MetricsStore> {
        &self.store
    }

    pub fn time_series(&self) -> &TimeSeries {
        &self.series
    }

    pub fn worker_count(&self) -> usize {
        self.pool.as_ref().map(WorkerPool::len).unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn elapsed(&self) -> Duration {
        self.stopped_after.unwrap_or_else(|| self.started.elapsed())
    }

    pub fn snapshot_stats(&self) -> MetricsSnapshot {
        self.store.snapshot()
    }

    /// Signal workers and sampler, then drain workers for up to
    /// `drain_timeout`. Calling it again returns fresh stats without
    /// waiting.
    pub async fn stop_run(&mut self, drain_timeout: Duration) -> FinalStats {
        self.cancel.cancel();
        let drain = match self.pool.take() {
            Some(pool) => pool.stop_and_join(drain_timeout).await,
            None => DrainReport::default(),
        };
        if let Some(sampler) = self.sampler.take() {
            match tokio::time::timeout(drain_timeout, sampler).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Sampler task failed"),
                Err(_) => warn!("Sampler did not stop in time"),
            }
        }
        if self.stopped_after.is_none() {
            self.stopped_after = Some(self.started.elapsed());
        }

        let latency = LatencySummary::from_samples(&self.store.latency_population());
        let snapshot = self.store.snapshot();
        let slo = SloResult::evaluate(
            self.store.sla(),
            latency.p95_ms,
            latency.p99_ms,
            snapshot.global.success_rate_percent,
        );
        let duration_secs = self.elapsed().as_secs_f64();
        info!(
            duration_secs,
            sent = snapshot.global.messages_sent,
            failed = snapshot.global.messages_failed,
            sla_passed = slo.passed,
            "Run stopped"
        );

        FinalStats {
            duration_secs,
            snapshot,
            latency,
            slo,
            drain,
        }
    }

    /// Report over everything recorded so far. Works on a live run too.
    pub fn report(&self) -> FinalReport {
        let mut info = self.info.clone();
        info.duration_secs = self.elapsed().as_secs_f64();
        FinalReport::build(info, &self.store, &self.series.points())
    }

    pub fn render_report(&self, output_dir: &Path) -> ReportPaths {
        self.report().write_all(output_dir, self.charts.as_deref())
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
