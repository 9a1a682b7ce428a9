//! Periodic sampling of the metrics store into a time series.

use crate::burst::BurstSchedule;
use crate::metrics::{success_rate, MetricsStore};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One row of the run's time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub elapsed_secs: f64,
    /// Cumulative totals at sample time
    pub messages_sent: u64,
    pub messages_failed: u64,
    /// Successful messages per second since the previous sample
    pub msg_rate: f64,
    pub failure_rate: f64,
    /// Success rate of this sampling interval only
    pub success_rate_percent: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub active_connections: u64,
    pub adapter_load: f64,
    pub burst_active: bool,
}

/// Read side of the time series. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct TimeSeries {
    points: Arc<RwLock<Vec<TimeSeriesPoint>>>,
}

impl TimeSeries {
    pub fn points(&self) -> Vec<TimeSeriesPoint> {
        self.points.read().clone()
    }

    pub fn last(&self) -> Option<TimeSeriesPoint> {
        self.points.read().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }
}

/// Append side of the time series. Not cloneable, so there is one writer.
#[derive(Debug)]
pub struct TimeSeriesWriter {
    points: Arc<RwLock<Vec<TimeSeriesPoint>>>,
}

impl TimeSeriesWriter {
    fn append(&self, point: TimeSeriesPoint) {
        self.points.write().push(point);
    }
}

pub fn time_series() -> (TimeSeriesWriter, TimeSeries) {
    let reader = TimeSeries::default();
    let writer = TimeSeriesWriter {
        points: Arc::clone(&reader.points),
    };
    (writer, reader)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalRates {
    pub sent: u64,
    pub failed: u64,
    pub msg_rate: f64,
    pub failure_rate: f64,
    pub success_rate_percent: f64,
}

/// Turns cumulative counters into per-interval rates.
#[derive(Debug, Clone)]
pub struct RateTracker {
    last_sent: u64,
    last_failed: u64,
    last_at: Instant,
}

impl RateTracker {
    pub fn new(at: Instant) -> Self {
        Self {
            last_sent: 0,
            last_failed: 0,
            last_at: at,
        }
    }

    pub fn advance(&mut self, sent: u64, failed: u64, now: Instant) -> IntervalRates {
        let mut elapsed = now.saturating_duration_since(self.last_at).as_secs_f64();
        if elapsed <= 0.0 {
            elapsed = 1.0;
        }
        let interval_sent = sent.saturating_sub(self.last_sent);
        let interval_failed = failed.saturating_sub(self.last_failed);

        self.last_sent = sent;
        self.last_failed = failed;
        self.last_at = now;

        IntervalRates {
            sent: interval_sent,
            failed: interval_failed,
            msg_rate: interval_sent as f64 / elapsed,
            failure_rate: interval_failed as f64 / elapsed,
            success_rate_percent: success_rate(interval_sent, interval_failed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

/// Memory and CPU of the current process.
pub struct ResourceProbe {
    system: System,
    pid: Pid,
}

impl ResourceProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    pub fn sample(&mut self) -> ResourceUsage {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        match self.system.process(self.pid) {
            Some(process) => ResourceUsage {
                memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
                cpu_percent: process.cpu_usage() as f64,
            },
            None => ResourceUsage::default(),
        }
    }
}

impl Default for ResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task that appends a [`TimeSeriesPoint`] every `cadence`.
pub struct Sampler {
    store: Arc<MetricsStore>,
    writer: TimeSeriesWriter,
    cadence: Duration,
    burst: Option<BurstSchedule>,
    run_started: std::time::Instant,
    probe: ResourceProbe,
    rates: RateTracker,
    burst_was_active: bool,
}

impl Sampler {
    pub fn new(
        store: Arc<MetricsStore>,
        writer: TimeSeriesWriter,
        cadence: Duration,
        burst: Option<BurstSchedule>,
        run_started: std::time::Instant,
    ) -> Self {
        Self {
            store,
            writer,
            cadence,
            burst,
            run_started,
            probe: ResourceProbe::new(),
            rates: RateTracker::new(Instant::now()),
            burst_was_active: false,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        debug!(cadence_ms = self.cadence.as_millis() as u64, "Sampler started");
        // Ticks stay on a fixed grid however long a sample takes
        let period = self.cadence.max(Duration::from_millis(1));
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.rates = RateTracker::new(Instant::now());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {}
            }
            // A stop that raced the wakeup must not produce a sample
            if cancel.is_cancelled() {
                break;
            }
            self.sample();
        }
        debug!("Sampler stopped");
    }

    /// Take one sample now and append it.
    pub fn sample(&mut self) -> TimeSeriesPoint {
        let snapshot = self.store.snapshot();
        let global = &snapshot.global;
        let rates = self.rates.advance(
            global.messages_sent,
            global.messages_failed,
            Instant::now(),
        );
        let resources = self.probe.sample();
        let adapter_load = self
            .store
            .record_adapter_load(snapshot.active_connections, rates.msg_rate);

        let burst_active = self
            .burst
            .as_ref()
            .map(|b| b.is_active(self.run_started.elapsed()))
            .unwrap_or(false);
        if burst_active != self.burst_was_active {
            if burst_active {
                let multiplier = self.burst.as_ref().map(|b| b.multiplier()).unwrap_or(1.0);
                info!(multiplier, "Burst started");
            } else {
                info!("Burst ended; back to base load");
            }
            self.burst_was_active = burst_active;
        }

        let latency = &snapshot.recent_latency;
        let point = TimeSeriesPoint {
            timestamp: snapshot.taken_at,
            elapsed_secs: snapshot.elapsed_secs,
            messages_sent: global.messages_sent,
            messages_failed: global.messages_failed,
            msg_rate: rates.msg_rate,
            failure_rate: rates.failure_rate,
            success_rate_percent: rates.success_rate_percent,
            avg_latency_ms: latency.avg_ms,
            p50_latency_ms: latency.p50_ms,
            p95_latency_ms: latency.p95_ms,
            p99_latency_ms: latency.p99_ms,
            memory_mb: resources.memory_mb,
            cpu_percent: resources.cpu_percent,
            active_connections: snapshot.active_connections,
            adapter_load,
            burst_active,
        };

        info!(
            "Stats - Sent: {} ({:.1} msg/s), Failed: {} ({:.1}/s), Success: {:.1}%, p95: {:.1}ms, Connections: {}",
            point.messages_sent,
            point.msg_rate,
            point.messages_failed,
            point.failure_rate,
            point.success_rate_percent,
            point.p95_latency_ms,
            point.active_connections
        );

        self.writer.append(point.clone());
        point
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsOptions;
    use crate::protocol::Protocol;
    use tokio::time::sleep;

    fn store() -> Arc<MetricsStore> {
        Arc::new(MetricsStore::new(MetricsOptions::default()))
    }

    #[test]
    fn test_rate_tracker_intervals() {
        let start = Instant::now();
        let mut tracker = RateTracker::new(start);

        let r = tracker.advance(100, 10, start + Duration::from_secs(10));
        assert_eq!(r.sent, 100);
        assert_eq!(r.msg_rate, 10.0);
        assert_eq!(r.failure_rate, 1.0);

        let r = tracker.advance(130, 10, start + Duration::from_secs(20));
        assert_eq!(r.sent, 30);
        assert_eq!(r.failed, 0);
        assert_eq!(r.msg_rate, 3.0);
        assert_eq!(r.success_rate_percent, 100.0);
    }

    #[test]
    fn test_rate_tracker_zero_elapsed_counts_as_one_second() {
        let start = Instant::now();
        let mut tracker = RateTracker::new(start);
        let r = tracker.advance(5, 5, start);
        assert_eq!(r.msg_rate, 5.0);
        assert_eq!(r.success_rate_percent, 50.0);
    }

    #[test]
    fn test_time_series_single_writer() {
        let (writer, reader) = time_series();
        let other_reader = reader.clone();
        assert!(reader.is_empty());

        let store = store();
        let mut sampler = Sampler::new(
            Arc::clone(&store),
            writer,
            Duration::from_secs(10),
            None,
            std::time::Instant::now(),
        );
        store.record_success(Protocol::Mqtt, 12.0, 64, 200);
        let point = sampler.sample();

        assert_eq!(point.messages_sent, 1);
        assert_eq!(point.p95_latency_ms, 12.0);
        assert!(!point.burst_active);
        assert_eq!(other_reader.len(), 1);
        assert_eq!(reader.last(), Some(point));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_ticks_on_cadence_and_stops_cleanly() {
        let store = store();
        for _ in 0..20 {
            store.record_success(Protocol::Http, 5.0, 32, 200);
        }
        let (writer, series) = time_series();
        let cancel = CancellationToken::new();
        let handle = Sampler::new(
            Arc::clone(&store),
            writer,
            Duration::from_secs(10),
            None,
            std::time::Instant::now(),
        )
        .spawn(cancel.clone());

        sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        handle.await.unwrap();

        let points = series.points();
        assert_eq!(points.len(), 3);
        assert!((points[0].msg_rate - 2.0).abs() < 1e-9);
        assert_eq!(points[1].msg_rate, 0.0);
        assert_eq!(points[2].messages_sent, 20);
        // Adapter load is fed from each sample
        assert!((store.snapshot().adapter_load.peak - 0.2).abs() < 1e-9);

        // Nothing is appended after stop
        sleep(Duration::from_secs(30)).await;
        assert_eq!(series.len(), 3);
    }

    #[tokio::test]
    async fn test_sampler_stop_before_first_tick() {
        let (writer, series) = time_series();
        let cancel = CancellationToken::new();
        let handle = Sampler::new(
            store(),
            writer,
            Duration::from_secs(60),
            None,
            std::time::Instant::now(),
        )
        .spawn(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(series.is_empty());
    }
}
