//! Shared, concurrently mutated run statistics.
//!
//! Every counter family has its own synchronization: plain counters are
//! atomics, keyed families live in [`DashMap`]s created through the entry API,
//! and sample buffers sit behind short-lived [`Mutex`] sections. Nothing here
//! takes a store-wide lock, so hundreds of workers can record concurrently.
//!
//! Reads through [`MetricsStore::snapshot`] are per-family consistent only:
//! the global `sent` counter and a protocol's `sent` counter may be observed
//! mid-update relative to each other.

use crate::errors::ErrorType;
use crate::percentile::LatencySummary;
use crate::protocol::Protocol;
use crate::slo::SlaThresholds;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// `sent / (sent + failed) * 100`, and 100% when nothing was attempted.
pub fn success_rate(sent: u64, failed: u64) -> f64 {
    let total = sent + failed;
    if total == 0 {
        100.0
    } else {
        sent as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Default)]
struct MessageCounters {
    sent: AtomicU64,
    failed: AtomicU64,
}

impl MessageCounters {
    fn record(&self, success: bool) {
        if success {
            self.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn load(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

/// Message-side statistics of one protocol.
///
/// Recording paths only ever see this struct; the device count assigned to
/// the protocol lives in a separate map that only
/// [`MetricsStore::set_protocol_device_count`] writes.
#[derive(Debug, Default)]
struct ProtocolTraffic {
    counters: MessageCounters,
    latencies: Mutex<Vec<f64>>,
    status_codes: DashMap<u16, u64>,
}

#[derive(Debug)]
struct LatencyBuffers {
    /// Full population, used for final percentiles
    all: Vec<f64>,
    /// Most recent samples, used for live percentiles
    recent: VecDeque<f64>,
    window: usize,
}

impl LatencyBuffers {
    fn new(window: usize) -> Self {
        Self {
            all: Vec::new(),
            recent: VecDeque::with_capacity(window),
            window,
        }
    }

    fn push(&mut self, latency_ms: f64) {
        self.all.push(latency_ms);
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(latency_ms);
    }
}

#[derive(Debug)]
struct DataCounters {
    total_bytes: AtomicU64,
    min_bytes: AtomicU64,
    max_bytes: AtomicU64,
}

impl Default for DataCounters {
    fn default() -> Self {
        Self {
            total_bytes: AtomicU64::new(0),
            min_bytes: AtomicU64::new(u64::MAX),
            max_bytes: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Default)]
struct InfrastructureCounters {
    tenants_registered: AtomicU64,
    devices_registered: AtomicU64,
    validation_success: AtomicU64,
    validation_failed: AtomicU64,
}

#[derive(Debug)]
struct AdapterLoad {
    current: f64,
    peak: f64,
    samples: VecDeque<f64>,
}

const ADAPTER_LOAD_WINDOW: usize = 100;

/// Construction parameters for a [`MetricsStore`].
#[derive(Debug, Clone)]
pub struct MetricsOptions {
    pub sla: SlaThresholds,
    pub latency_window: usize,
    pub interval_window: usize,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            sla: SlaThresholds::default(),
            latency_window: 1_000,
            interval_window: 100,
        }
    }
}

/// Thread-safe statistics for one run. Shared as `Arc<MetricsStore>`.
#[derive(Debug)]
pub struct MetricsStore {
    sla: SlaThresholds,
    started: Instant,
    messages: MessageCounters,
    infrastructure: InfrastructureCounters,
    traffic: DashMap<Protocol, Arc<ProtocolTraffic>>,
    assigned_devices: DashMap<Protocol, u64>,
    tenants: DashMap<String, MessageCounters>,
    errors: [AtomicU64; 6],
    status_codes: DashMap<u16, u64>,
    data: DataCounters,
    latency: Mutex<LatencyBuffers>,
    over_p95_target: AtomicU64,
    over_p99_target: AtomicU64,
    intervals: Mutex<VecDeque<f64>>,
    interval_window: usize,
    active_connections: AtomicU64,
    adapter_load: Mutex<AdapterLoad>,
}

impl MetricsStore {
    pub fn new(options: MetricsOptions) -> Self {
        Self {
            sla: options.sla,
            started: Instant::now(),
            messages: MessageCounters::default(),
            infrastructure: InfrastructureCounters::default(),
            traffic: DashMap::new(),
            assigned_devices: DashMap::new(),
            tenants: DashMap::new(),
            errors: Default::default(),
            status_codes: DashMap::new(),
            data: DataCounters::default(),
            latency: Mutex::new(LatencyBuffers::new(options.latency_window.max(1))),
            over_p95_target: AtomicU64::new(0),
            over_p99_target: AtomicU64::new(0),
            intervals: Mutex::new(VecDeque::with_capacity(options.interval_window)),
            interval_window: options.interval_window.max(1),
            active_connections: AtomicU64::new(0),
            adapter_load: Mutex::new(AdapterLoad {
                current: 0.0,
                peak: 0.0,
                samples: VecDeque::with_capacity(ADAPTER_LOAD_WINDOW),
            }),
        }
    }

    /// Create empty per-protocol entries so idle protocols still report.
    pub fn initialize_protocols(&self, protocols: &[Protocol]) {
        for protocol in protocols {
            self.protocol_traffic(*protocol);
        }
    }

    pub fn sla(&self) -> &SlaThresholds {
        &self.sla
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn protocol_traffic(&self, protocol: Protocol) -> Arc<ProtocolTraffic> {
        self.traffic.entry(protocol).or_default().value().clone()
    }

    /// Record one delivered message.
    pub fn record_success(
        &self,
        protocol: Protocol,
        latency_ms: f64,
        size_bytes: usize,
        status_code: u16,
    ) {
        self.messages.record(true);

        let traffic = self.protocol_traffic(protocol);
        traffic.counters.record(true);
        traffic.latencies.lock().push(latency_ms);
        *traffic.status_codes.entry(status_code).or_insert(0) += 1;

        *self.status_codes.entry(status_code).or_insert(0) += 1;
        self.latency.lock().push(latency_ms);

        if latency_ms > self.sla.p99_latency_ms {
            self.over_p99_target.fetch_add(1, Ordering::Relaxed);
        }
        if latency_ms > self.sla.p95_latency_ms {
            self.over_p95_target.fetch_add(1, Ordering::Relaxed);
        }

        if size_bytes > 0 {
            let size = size_bytes as u64;
            self.data.total_bytes.fetch_add(size, Ordering::Relaxed);
            self.data.min_bytes.fetch_min(size, Ordering::Relaxed);
            self.data.max_bytes.fetch_max(size, Ordering::Relaxed);
        }
    }

    /// Record one failed attempt, classifying the free-form `reason`, and
    /// return the category it was filed under.
    pub fn record_failure(&self, protocol: Protocol, reason: &str) -> ErrorType {
        self.record_failure_as(protocol, ErrorType::classify(reason), reason)
    }

    /// Record one failed attempt whose category is already known.
    pub fn record_failure_as(
        &self,
        protocol: Protocol,
        kind: ErrorType,
        reason: &str,
    ) -> ErrorType {
        self.messages.record(false);
        self.protocol_traffic(protocol).counters.record(false);

        self.errors[kind.index()].fetch_add(1, Ordering::Relaxed);
        debug!(%protocol, error_type = %kind, reason, "Recorded failed message");
        kind
    }

    pub fn record_tenant_message(&self, tenant_id: &str, success: bool) {
        if let Some(counters) = self.tenants.get(tenant_id) {
            counters.record(success);
            return;
        }
        // First message of a tenant; `entry` settles a racing insert
        self.tenants
            .entry(tenant_id.to_string())
            .or_default()
            .record(success);
    }

    /// Assign the authoritative device count of a protocol.
    ///
    /// Only the first assignment per protocol takes effect; later calls are
    /// ignored and return `false`.
    pub fn set_protocol_device_count(&self, protocol: Protocol, count: u64) -> bool {
        match self.assigned_devices.entry(protocol) {
            Entry::Vacant(slot) => {
                slot.insert(count);
                true
            }
            Entry::Occupied(existing) => {
                warn!(
                    %protocol,
                    existing = *existing.get(),
                    rejected = count,
                    "Device count already assigned; ignoring reassignment"
                );
                false
            }
        }
    }

    pub fn protocol_device_count(&self, protocol: Protocol) -> u64 {
        self.assigned_devices
            .get(&protocol)
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn record_infrastructure(&self, tenants: u64, devices: u64) {
        self.infrastructure
            .tenants_registered
            .store(tenants, Ordering::Relaxed);
        self.infrastructure
            .devices_registered
            .store(devices, Ordering::Relaxed);
    }

    pub fn record_validation(&self, success: u64, failed: u64) {
        self.infrastructure
            .validation_success
            .fetch_add(success, Ordering::Relaxed);
        self.infrastructure
            .validation_failed
            .fetch_add(failed, Ordering::Relaxed);
    }

    /// Record one interval drawn by a worker, in seconds.
    pub fn record_interval(&self, interval_secs: f64) {
        let mut draws = self.intervals.lock();
        if draws.len() == self.interval_window {
            draws.pop_front();
        }
        draws.push_back(interval_secs);
    }

    /// Mark a transport connection as open until the guard is dropped.
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            store: Arc::clone(self),
        }
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Weighted adapter load: connections plus a tenth of the message rate.
    pub fn record_adapter_load(&self, connections: u64, message_rate: f64) -> f64 {
        let load = connections as f64 + message_rate * 0.1;
        let mut adapter = self.adapter_load.lock();
        adapter.current = load;
        adapter.peak = adapter.peak.max(load);
        if adapter.samples.len() == ADAPTER_LOAD_WINDOW {
            adapter.samples.pop_front();
        }
        adapter.samples.push_back(load);
        load
    }

    /// Every latency sample recorded so far, in arrival order.
    pub fn latency_population(&self) -> Vec<f64> {
        self.latency.lock().all.clone()
    }

    pub fn protocol_latency(&self, protocol: Protocol) -> LatencySummary {
        match self.traffic.get(&protocol) {
            Some(traffic) => {
                let traffic = Arc::clone(traffic.value());
                let samples = traffic.latencies.lock().clone();
                LatencySummary::from_samples(&samples)
            }
            None => LatencySummary::default(),
        }
    }

    pub fn interval_distribution(&self) -> IntervalDistribution {
        let draws: Vec<f64> = self.intervals.lock().iter().copied().collect();
        IntervalDistribution::from_draws(&draws)
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (messages_sent, messages_failed) = self.messages.load();

        // Arc clones first so no shard lock is held while summarising
        let traffic: Vec<(Protocol, Arc<ProtocolTraffic>)> = self
            .traffic
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let protocols = traffic
            .into_iter()
            .map(|(protocol, traffic)| {
                let (sent, failed) = traffic.counters.load();
                let status_codes = traffic
                    .status_codes
                    .iter()
                    .map(|entry| (*entry.key(), *entry.value()))
                    .collect();
                (
                    protocol,
                    ProtocolSnapshot {
                        messages_sent: sent,
                        messages_failed: failed,
                        devices: self.protocol_device_count(protocol),
                        success_rate_percent: success_rate(sent, failed),
                        status_codes,
                    },
                )
            })
            .collect();

        let tenants = self
            .tenants
            .iter()
            .map(|entry| {
                let (sent, failed) = entry.value().load();
                (
                    entry.key().clone(),
                    TenantSnapshot {
                        messages_sent: sent,
                        messages_failed: failed,
                        success_rate_percent: success_rate(sent, failed),
                    },
                )
            })
            .collect();

        let error_types = ErrorType::ALL
            .iter()
            .map(|kind| (*kind, self.errors[kind.index()].load(Ordering::Relaxed)))
            .collect();

        let status_codes = self
            .status_codes
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        let min_bytes = self.data.min_bytes.load(Ordering::Relaxed);
        let data_transferred = DataTransferred {
            total_bytes: self.data.total_bytes.load(Ordering::Relaxed),
            min_message_bytes: if min_bytes == u64::MAX { 0 } else { min_bytes },
            max_message_bytes: self.data.max_bytes.load(Ordering::Relaxed),
        };

        let recent: Vec<f64> = self.latency.lock().recent.iter().copied().collect();

        let adapter_load = {
            let adapter = self.adapter_load.lock();
            let avg = if adapter.samples.is_empty() {
                0.0
            } else {
                adapter.samples.iter().sum::<f64>() / adapter.samples.len() as f64
            };
            AdapterLoadSnapshot {
                current: adapter.current,
                peak: adapter.peak,
                avg,
            }
        };

        MetricsSnapshot {
            taken_at: Utc::now(),
            elapsed_secs: self.elapsed_secs(),
            global: GlobalSnapshot {
                messages_sent,
                messages_failed,
                success_rate_percent: success_rate(messages_sent, messages_failed),
                tenants_registered: self
                    .infrastructure
                    .tenants_registered
                    .load(Ordering::Relaxed),
                devices_registered: self
                    .infrastructure
                    .devices_registered
                    .load(Ordering::Relaxed),
                validation_success: self
                    .infrastructure
                    .validation_success
                    .load(Ordering::Relaxed),
                validation_failed: self
                    .infrastructure
                    .validation_failed
                    .load(Ordering::Relaxed),
            },
            protocols,
            tenants,
            error_types,
            status_codes,
            data_transferred,
            recent_latency: LatencySummary::from_samples(&recent),
            sla_violations: SlaViolations {
                over_p95_target: self.over_p95_target.load(Ordering::Relaxed),
                over_p99_target: self.over_p99_target.load(Ordering::Relaxed),
            },
            active_connections: self.active_connections(),
            adapter_load,
            intervals: self.interval_distribution(),
        }
    }
}

/// Decrements the active connection count when dropped, including when the
/// owning worker task is aborted.
#[derive(Debug)]
pub struct ConnectionGuard {
    store: Arc<MetricsStore>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.store.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub global: GlobalSnapshot,
    pub protocols: BTreeMap<Protocol, ProtocolSnapshot>,
    pub tenants: BTreeMap<String, TenantSnapshot>,
    pub error_types: BTreeMap<ErrorType, u64>,
    pub status_codes: BTreeMap<u16, u64>,
    pub data_transferred: DataTransferred,
    /// Summary over the rolling latency window
    pub recent_latency: LatencySummary,
    pub sla_violations: SlaViolations,
    pub active_connections: u64,
    pub adapter_load: AdapterLoadSnapshot,
    pub intervals: IntervalDistribution,
}

impl MetricsSnapshot {
    pub fn total_errors(&self) -> u64 {
        self.error_types.values().sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSnapshot {
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub success_rate_percent: f64,
    pub tenants_registered: u64,
    pub devices_registered: u64,
    pub validation_success: u64,
    pub validation_failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSnapshot {
    pub messages_sent: u64,
    pub messages_failed: u64,
    /// Authoritative count assigned at dispatch
    pub devices: u64,
    pub success_rate_percent: f64,
    pub status_codes: BTreeMap<u16, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantSnapshot {
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub success_rate_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTransferred {
    pub total_bytes: u64,
    pub min_message_bytes: u64,
    pub max_message_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlaViolations {
    pub over_p95_target: u64,
    pub over_p99_target: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterLoadSnapshot {
    pub current: f64,
    pub peak: f64,
    pub avg: f64,
}

/// Quality statistics of the drawn message intervals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntervalDistribution {
    pub sample_size: usize,
    pub mean_interval_secs: f64,
    pub variance: f64,
    pub std_deviation: f64,
    pub coefficient_of_variation: f64,
    /// Observed events per minute
    pub actual_lambda: f64,
}

impl IntervalDistribution {
    pub fn from_draws(draws: &[f64]) -> Self {
        if draws.is_empty() {
            return Self::default();
        }
        let n = draws.len() as f64;
        let mean = draws.iter().sum::<f64>() / n;
        let variance = draws.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
        let std_deviation = variance.sqrt();
        let (cv, lambda) = if mean > 0.0 {
            (std_deviation / mean, 60.0 / mean)
        } else {
            (0.0, 0.0)
        };
        Self {
            sample_size: draws.len(),
            mean_interval_secs: mean,
            variance,
            std_deviation,
            coefficient_of_variation: cv,
            actual_lambda: lambda,
        }
    }
}
