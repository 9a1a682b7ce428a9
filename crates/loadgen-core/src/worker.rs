//! Per-device send loop.

use crate::burst::BurstSchedule;
use crate::device::Device;
use crate::interval::{secs_to_duration, IntervalPolicy};
use crate::metrics::MetricsStore;
use crate::payload::PayloadGenerator;
use crate::protocol::Protocol;
use crate::transport::Transport;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerExit {
    /// Observed the stop signal
    Stopped,
    /// Could not establish a session; one failure was recorded
    ConnectFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub exit: WorkerExit,
}

/// Derive a worker's RNG from the run seed so runs are reproducible.
pub fn worker_rng(seed: u64, index: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed.wrapping_add((index as u64).wrapping_mul(1000)))
}

/// Decides which send outcomes are logged at `info`/`warn` rather than
/// `debug`. Logged: the first `initial` attempts, the first failure of each
/// failure streak, the `after_failure` successes that end a streak, and every
/// `periodic`th attempt.
#[derive(Debug, Clone)]
pub struct SendLogSampler {
    initial: u64,
    after_failure: u64,
    periodic: u64,
    attempts: u64,
    last_failure: Option<u64>,
}

impl SendLogSampler {
    pub fn new(initial: u64, after_failure: u64, periodic: u64) -> Self {
        Self {
            initial,
            after_failure,
            periodic,
            attempts: 0,
            last_failure: None,
        }
    }

    pub fn should_log(&mut self, success: bool) -> bool {
        self.attempts += 1;
        let attempt = self.attempts;
        let periodic = self.periodic > 0 && attempt % self.periodic == 0;
        if !success {
            let streak_start = self.last_failure != Some(attempt - 1);
            self.last_failure = Some(attempt);
            return streak_start || attempt <= self.initial || periodic;
        }
        if attempt <= self.initial || periodic {
            return true;
        }
        self.last_failure
            .map(|failed_at| attempt - failed_at <= self.after_failure)
            .unwrap_or(false)
    }
}

impl Default for SendLogSampler {
    fn default() -> Self {
        Self::new(10, 5, 100)
    }
}

/// One simulated device sending over one protocol.
pub struct Worker {
    pub device: Device,
    pub protocol: Protocol,
    pub policy: IntervalPolicy,
    pub burst: Option<BurstSchedule>,
    pub run_started: Instant,
    pub store: Arc<MetricsStore>,
    pub payloads: Arc<dyn PayloadGenerator>,
    pub transport: Box<dyn Transport>,
    pub rng: ChaCha8Rng,
    pub send_log: SendLogSampler,
}

impl Worker {
    /// Send until `cancel` fires.
    ///
    /// A failed send is recorded and the loop continues; only a failed
    /// connect ends the worker early. The transport is closed on both paths.
    pub async fn run(mut self, cancel: CancellationToken) -> WorkerReport {
        let mut report = WorkerReport {
            messages_sent: 0,
            messages_failed: 0,
            exit: WorkerExit::Stopped,
        };

        if let Err(e) = self.transport.connect().await {
            warn!(
                device = %self.device.device_id,
                protocol = %self.protocol,
                error = %e,
                "Connection failed; worker exiting"
            );
            self.store
                .record_failure_as(self.protocol, e.error_type(), &e.to_string());
            self.store
                .record_tenant_message(&self.device.tenant_id, false);
            self.transport.close().await;
            report.messages_failed = 1;
            report.exit = WorkerExit::ConnectFailed;
            return report;
        }

        let _connection = self.store.connection_opened();
        debug!(device = %self.device.device_id, protocol = %self.protocol, "Worker connected");

        let mut message_count = 0u64;
        loop {
            let payload =
                self.payloads
                    .generate(&self.device, self.protocol, message_count, &mut self.rng);

            match self.transport.send(&payload).await {
                Ok(delivery) => {
                    self.store.record_success(
                        self.protocol,
                        delivery.elapsed_ms,
                        payload.len(),
                        delivery.status_code,
                    );
                    self.store.record_tenant_message(&self.device.tenant_id, true);
                    report.messages_sent += 1;
                    message_count += 1;
                    if self.send_log.should_log(true) {
                        info!(
                            device = %self.device.device_id,
                            protocol = %self.protocol,
                            latency_ms = delivery.elapsed_ms,
                            sent = report.messages_sent,
                            "Message sent"
                        );
                    }
                }
                Err(e) => {
                    if self.send_log.should_log(false) {
                        warn!(
                            device = %self.device.device_id,
                            protocol = %self.protocol,
                            error = %e,
                            "Send failed"
                        );
                    } else {
                        debug!(
                            device = %self.device.device_id,
                            protocol = %self.protocol,
                            error = %e,
                            "Send failed"
                        );
                    }
                    self.store
                        .record_failure_as(self.protocol, e.error_type(), &e.to_string());
                    self.store
                        .record_tenant_message(&self.device.tenant_id, false);
                    report.messages_failed += 1;
                }
            }

            let interval = self.next_interval();
            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }
        }

        self.transport.close().await;
        debug!(
            device = %self.device.device_id,
            protocol = %self.protocol,
            sent = report.messages_sent,
            failed = report.messages_failed,
            "Worker stopped"
        );
        report
    }

    fn next_interval(&mut self) -> Duration {
        let secs = self.policy.next_secs(&mut self.rng);
        if self.policy.is_random() {
            self.store.record_interval(secs);
        }
        let interval = secs_to_duration(secs);
        match &self.burst {
            Some(burst) => burst.shape(interval, self.run_started.elapsed()),
            None => interval,
        }
    }
}
