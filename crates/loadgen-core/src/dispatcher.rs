//! Partitions devices across protocols and runs one worker task per device.

use crate::burst::BurstSchedule;
use crate::config::IntervalConfig;
use crate::device::Device;
use crate::interval::IntervalPolicy;
use crate::metrics::MetricsStore;
use crate::payload::PayloadGenerator;
use crate::protocol::Protocol;
use crate::transport::TransportFactory;
use crate::worker::{worker_rng, SendLogSampler, Worker, WorkerExit, WorkerReport};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Share of `total` devices for the protocol at `idx` out of `groups`.
/// The first `total % groups` protocols get one extra device.
pub fn split_devices(total: usize, groups: usize, idx: usize) -> usize {
    if groups == 0 {
        return 0;
    }
    let base = total / groups;
    let rem = total % groups;
    if idx < rem {
        base + 1
    } else {
        base
    }
}

/// Contiguous slices of `devices`, one per protocol, sized by [`split_devices`].
pub fn partition<'a>(
    devices: &'a [Device],
    protocols: &[Protocol],
) -> Vec<(Protocol, &'a [Device])> {
    let mut start = 0;
    protocols
        .iter()
        .enumerate()
        .map(|(idx, protocol)| {
            let count = split_devices(devices.len(), protocols.len(), idx);
            let slice = &devices[start..start + count];
            start += count;
            (*protocol, slice)
        })
        .collect()
}

/// Transport factories keyed by protocol.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: HashMap<Protocol, Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, protocol: Protocol, factory: Arc<dyn TransportFactory>) {
        self.factories.insert(protocol, factory);
    }

    /// Use one factory for every known protocol.
    pub fn with_all(factory: Arc<dyn TransportFactory>) -> Self {
        let mut registry = Self::new();
        for protocol in Protocol::ALL {
            registry.register(protocol, Arc::clone(&factory));
        }
        registry
    }

    pub fn get(&self, protocol: Protocol) -> Option<&Arc<dyn TransportFactory>> {
        self.factories.get(&protocol)
    }

    pub fn supports(&self, protocol: Protocol) -> bool {
        self.factories.contains_key(&protocol)
    }
}

/// Parse requested protocol names, skipping unknown, duplicate and
/// unsupported entries with a warning.
pub fn resolve_protocols(names: &[String], registry: &TransportRegistry) -> Vec<Protocol> {
    let mut resolved = Vec::with_capacity(names.len());
    for name in names {
        let protocol = match name.parse::<Protocol>() {
            Ok(protocol) => protocol,
            Err(e) => {
                warn!(protocol = %name, "{}; skipping", e);
                continue;
            }
        };
        if resolved.contains(&protocol) {
            warn!(protocol = %protocol, "Protocol listed twice; ignoring duplicate");
            continue;
        }
        if !registry.supports(protocol) {
            warn!(protocol = %protocol, "No transport registered; skipping");
            continue;
        }
        resolved.push(protocol);
    }
    resolved
}

/// Everything a worker needs besides its device and transport.
#[derive(Clone)]
pub struct DispatchSettings {
    pub seed: u64,
    pub base_interval_secs: f64,
    pub message_kind: String,
    pub interval: IntervalConfig,
    pub burst: Option<BurstSchedule>,
    pub run_started: Instant,
}

struct RunningWorker {
    device_id: String,
    protocol: Protocol,
    handle: JoinHandle<WorkerReport>,
}

/// Outcome of stopping the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub workers: usize,
    pub stopped: usize,
    pub connect_failures: usize,
    /// Workers that panicked
    pub crashed: usize,
    /// Workers still busy after the timeout; their tasks were aborted
    pub abandoned: Vec<String>,
}

enum JoinOutcome {
    Finished(WorkerReport),
    Crashed,
    Abandoned(String),
}

/// The set of running workers for one run.
pub struct WorkerPool {
    protocols: Vec<Protocol>,
    cancel: CancellationToken,
    workers: Vec<RunningWorker>,
}

impl WorkerPool {
    /// Spawn one task per device. Must be called inside a tokio runtime.
    ///
    /// Each protocol's device count is written to the store exactly once,
    /// before any of its workers starts.
    pub fn start(
        devices: &[Device],
        protocol_names: &[String],
        settings: &DispatchSettings,
        store: &Arc<MetricsStore>,
        registry: &TransportRegistry,
        payloads: Arc<dyn PayloadGenerator>,
        cancel: CancellationToken,
    ) -> Self {
        let protocols = resolve_protocols(protocol_names, registry);
        store.initialize_protocols(&protocols);

        if protocols.is_empty() {
            warn!("No usable protocols; no workers started");
        }

        let policy = IntervalPolicy::from_config(settings.base_interval_secs, &settings.interval);
        let mut workers = Vec::with_capacity(devices.len());
        let mut index = 0usize;

        for (protocol, assigned) in partition(devices, &protocols) {
            store.set_protocol_device_count(protocol, assigned.len() as u64);
            let Some(factory) = registry.get(protocol) else {
                continue;
            };
            info!(protocol = %protocol, devices = assigned.len(), "Starting protocol workers");

            for device in assigned {
                let transport = factory.create(device, protocol, &settings.message_kind);
                let worker = Worker {
                    device: device.clone(),
                    protocol,
                    policy: policy.clone(),
                    burst: settings.burst.clone(),
                    run_started: settings.run_started,
                    store: Arc::clone(store),
                    payloads: Arc::clone(&payloads),
                    transport,
                    rng: worker_rng(settings.seed, index),
                    send_log: SendLogSampler::default(),
                };
                workers.push(RunningWorker {
                    device_id: device.device_id.clone(),
                    protocol,
                    handle: tokio::spawn(worker.run(cancel.clone())),
                });
                index += 1;
            }
        }

        info!(workers = workers.len(), protocols = protocols.len(), "Dispatch complete");
        Self {
            protocols,
            cancel,
            workers,
        }
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Signal every worker to stop without waiting.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop all workers and wait up to `timeout` for them, concurrently.
    /// Workers still running afterwards are aborted and reported.
    pub async fn stop_and_join(self, timeout: Duration) -> DrainReport {
        self.cancel.cancel();
        let total = self.workers.len();

        let outcomes = join_all(self.workers.into_iter().map(|mut worker| async move {
            match tokio::time::timeout(timeout, &mut worker.handle).await {
                Ok(Ok(report)) => JoinOutcome::Finished(report),
                Ok(Err(e)) => {
                    warn!(
                        device = %worker.device_id,
                        protocol = %worker.protocol,
                        error = %e,
                        "Worker task failed"
                    );
                    JoinOutcome::Crashed
                }
                Err(_) => {
                    worker.handle.abort();
                    warn!(
                        device = %worker.device_id,
                        protocol = %worker.protocol,
                        timeout_ms = timeout.as_millis() as u64,
                        "Worker did not stop in time; abandoning"
                    );
                    JoinOutcome::Abandoned(worker.device_id)
                }
            }
        }))
        .await;

        let mut report = DrainReport {
            workers: total,
            ..DrainReport::default()
        };
        for outcome in outcomes {
            match outcome {
                JoinOutcome::Finished(r) => match r.exit {
                    WorkerExit::Stopped => report.stopped += 1,
                    WorkerExit::ConnectFailed => report.connect_failures += 1,
                },
                JoinOutcome::Crashed => report.crashed += 1,
                JoinOutcome::Abandoned(device_id) => report.abandoned.push(device_id),
            }
        }
        info!(
            workers = report.workers,
            stopped = report.stopped,
            connect_failures = report.connect_failures,
            abandoned = report.abandoned.len(),
            "Workers drained"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsOptions;
    use crate::payload::TelemetryGenerator;
    use crate::transport::{MockTransport, MockTransportFactory, TransportError};

    fn devices(n: usize) -> Vec<Device> {
        (0..n)
            .map(|i| Device::new(format!("dev-{i}"), format!("tenant-{}", i % 2), "pw"))
            .collect()
    }

    fn settings(base_interval_secs: f64) -> DispatchSettings {
        DispatchSettings {
            seed: 1,
            base_interval_secs,
            message_kind: "telemetry".into(),
            interval: IntervalConfig::default(),
            burst: None,
            run_started: Instant::now(),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_devices() {
        let counts: Vec<usize> = (0..3).map(|i| split_devices(10, 3, i)).collect();
        assert_eq!(counts, vec![4, 3, 3]);
        assert_eq!(split_devices(2, 5, 4), 0);
        assert_eq!(split_devices(7, 0, 0), 0);
    }

    #[test]
    fn test_partition_covers_every_device_once() {
        let devices = devices(10);
        let protocols = [Protocol::Mqtt, Protocol::Http, Protocol::Coap];
        let parts = partition(&devices, &protocols);

        let sizes: Vec<usize> = parts.iter().map(|(_, d)| d.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        let ids: Vec<&str> = parts
            .iter()
            .flat_map(|(_, d)| d.iter().map(|dev| dev.device_id.as_str()))
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("dev-{i}")).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_resolve_protocols_skips_bad_entries() {
        let mut registry = TransportRegistry::new();
        let factory: Arc<dyn TransportFactory> =
            Arc::new(MockTransportFactory::new(MockTransport::new(0)));
        registry.register(Protocol::Mqtt, Arc::clone(&factory));
        registry.register(Protocol::Http, factory);

        let resolved =
            resolve_protocols(&names(&["MQTT", "zigbee", "coap", "http", "mqtt"]), &registry);
        assert_eq!(resolved, vec![Protocol::Mqtt, Protocol::Http]);
    }

    #[tokio::test]
    async fn test_start_assigns_device_counts() {
        let store = Arc::new(MetricsStore::new(MetricsOptions::default()));
        let factory = MockTransportFactory::new(MockTransport::new(0));
        let counters = factory.counters();
        let registry = TransportRegistry::with_all(Arc::new(factory));

        let pool = WorkerPool::start(
            &devices(10),
            &names(&["mqtt", "bogus", "http", "coap"]),
            &settings(60.0),
            &store,
            &registry,
            Arc::new(TelemetryGenerator::new("telemetry")),
            CancellationToken::new(),
        );
        assert_eq!(pool.len(), 10);
        assert_eq!(pool.protocols(), &[Protocol::Mqtt, Protocol::Http, Protocol::Coap]);
        assert_eq!(store.protocol_device_count(Protocol::Mqtt), 4);
        assert_eq!(store.protocol_device_count(Protocol::Http), 3);
        assert_eq!(store.protocol_device_count(Protocol::Coap), 3);

        let report = pool.stop_and_join(Duration::from_secs(2)).await;
        assert_eq!(report.workers, 10);
        assert_eq!(report.stopped, 10);
        assert!(report.abandoned.is_empty());
        assert_eq!(counters.connects(), 10);
        assert_eq!(counters.closes(), 10);

        // Counts survive message recording
        let snapshot = store.snapshot();
        assert_eq!(snapshot.protocols[&Protocol::Mqtt].devices, 4);
        assert_eq!(snapshot.protocols[&Protocol::Coap].devices, 3);
    }

    #[tokio::test]
    async fn test_no_protocols_starts_nothing() {
        let store = Arc::new(MetricsStore::new(MetricsOptions::default()));
        let registry = TransportRegistry::new();
        let pool = WorkerPool::start(
            &devices(4),
            &names(&["mqtt"]),
            &settings(1.0),
            &store,
            &registry,
            Arc::new(TelemetryGenerator::new("telemetry")),
            CancellationToken::new(),
        );
        assert!(pool.is_empty());
        let report = pool.stop_and_join(Duration::from_millis(100)).await;
        assert_eq!(report, DrainReport::default());
    }

    #[tokio::test]
    async fn test_hanging_workers_are_abandoned_within_timeout() {
        let store = Arc::new(MetricsStore::new(MetricsOptions::default()));
        let registry = TransportRegistry::with_all(Arc::new(MockTransportFactory::new(
            MockTransport::new(0).hang_on_send(),
        )));
        let pool = WorkerPool::start(
            &devices(3),
            &names(&["mqtt"]),
            &settings(1.0),
            &store,
            &registry,
            Arc::new(TelemetryGenerator::new("telemetry")),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.active_connections(), 3);

        let started = Instant::now();
        let report = pool.stop_and_join(Duration::from_millis(300)).await;
        let waited = started.elapsed();

        assert!(waited < Duration::from_millis(1_000), "waited {:?}", waited);
        assert_eq!(report.abandoned.len(), 3);
        assert_eq!(report.stopped, 0);

        // Aborted tasks release their connection guards
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_connect_failures_are_counted() {
        let store = Arc::new(MetricsStore::new(MetricsOptions::default()));
        let registry = TransportRegistry::with_all(Arc::new(MockTransportFactory::new(
            MockTransport::new(0).refuse_connect(TransportError::Timeout(500)),
        )));
        let pool = WorkerPool::start(
            &devices(2),
            &names(&["amqp"]),
            &settings(1.0),
            &store,
            &registry,
            Arc::new(TelemetryGenerator::new("telemetry")),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = pool.stop_and_join(Duration::from_secs(1)).await;
        assert_eq!(report.connect_failures, 2);
        assert_eq!(store.snapshot().global.messages_failed, 2);
    }
}
