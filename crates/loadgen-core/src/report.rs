//! Final and intermediate run reports.
//!
//! A [`FinalReport`] is assembled from the metrics store and the sampled
//! time series, then written as a text summary, a JSON document, a flat CSV
//! row and a time-series CSV. Each file is written on its own so one
//! failure does not cost the others.

use crate::errors::ErrorType;
use crate::metrics::{
    success_rate, AdapterLoadSnapshot, DataTransferred, GlobalSnapshot, IntervalDistribution,
    MetricsStore, SlaViolations, TenantSnapshot,
};
use crate::percentile::LatencySummary;
use crate::protocol::Protocol;
use crate::sampler::TimeSeriesPoint;
use crate::slo::{verdict, SloResult};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Run parameters echoed at the top of every report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub protocols: Vec<String>,
    pub message_kind: String,
    pub base_interval_secs: f64,
    pub interval_mode: String,
    pub burst_enabled: bool,
    pub seed: u64,
    pub devices: usize,
    pub tenants: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThroughputStats {
    pub avg_msg_rate: f64,
    pub peak_msg_rate: f64,
    pub min_msg_rate: f64,
}

impl ThroughputStats {
    /// From sampled interval rates, or the whole-run average when no sample
    /// was taken yet.
    pub fn from_series(series: &[TimeSeriesPoint], sent: u64, elapsed_secs: f64) -> Self {
        if series.is_empty() {
            let avg = if elapsed_secs > 0.0 {
                sent as f64 / elapsed_secs
            } else {
                0.0
            };
            return Self {
                avg_msg_rate: avg,
                peak_msg_rate: avg,
                min_msg_rate: avg,
            };
        }
        let rates = series.iter().map(|p| p.msg_rate);
        Self {
            avg_msg_rate: rates.clone().sum::<f64>() / series.len() as f64,
            peak_msg_rate: rates.clone().fold(f64::MIN, f64::max),
            min_msg_rate: rates.fold(f64::MAX, f64::min),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub peak_memory_mb: f64,
    pub avg_memory_mb: f64,
    pub peak_cpu_percent: f64,
    pub avg_cpu_percent: f64,
}

impl ResourceStats {
    pub fn from_series(series: &[TimeSeriesPoint]) -> Self {
        if series.is_empty() {
            return Self::default();
        }
        let n = series.len() as f64;
        Self {
            peak_memory_mb: series.iter().map(|p| p.memory_mb).fold(0.0, f64::max),
            avg_memory_mb: series.iter().map(|p| p.memory_mb).sum::<f64>() / n,
            peak_cpu_percent: series.iter().map(|p| p.cpu_percent).fold(0.0, f64::max),
            avg_cpu_percent: series.iter().map(|p| p.cpu_percent).sum::<f64>() / n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolReport {
    pub protocol: Protocol,
    /// Count assigned at dispatch
    pub devices: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub success_rate_percent: f64,
    pub latency: LatencySummary,
    pub status_codes: BTreeMap<u16, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub generated_at: DateTime<Utc>,
    pub run: RunInfo,
    pub global: GlobalSnapshot,
    pub throughput: ThroughputStats,
    /// Over every latency sample of the run
    pub latency: LatencySummary,
    pub slo: SloResult,
    pub sla_violations: SlaViolations,
    pub resources: ResourceStats,
    pub adapter_load: AdapterLoadSnapshot,
    pub data_transferred: DataTransferred,
    pub protocols: Vec<ProtocolReport>,
    pub tenants: BTreeMap<String, TenantSnapshot>,
    pub error_types: BTreeMap<ErrorType, u64>,
    pub total_errors: u64,
    pub status_codes: BTreeMap<u16, u64>,
    pub intervals: IntervalDistribution,
    pub time_series: Vec<TimeSeriesPoint>,
}

impl FinalReport {
    pub fn build(run: RunInfo, store: &MetricsStore, series: &[TimeSeriesPoint]) -> Self {
        let snapshot = store.snapshot();
        let latency = LatencySummary::from_samples(&store.latency_population());
        let global = snapshot.global.clone();
        let slo = SloResult::evaluate(
            store.sla(),
            latency.p95_ms,
            latency.p99_ms,
            success_rate(global.messages_sent, global.messages_failed),
        );

        let protocols = snapshot
            .protocols
            .iter()
            .map(|(protocol, stats)| ProtocolReport {
                protocol: *protocol,
                devices: stats.devices,
                messages_sent: stats.messages_sent,
                messages_failed: stats.messages_failed,
                success_rate_percent: stats.success_rate_percent,
                latency: store.protocol_latency(*protocol),
                status_codes: stats.status_codes.clone(),
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            throughput: ThroughputStats::from_series(
                series,
                global.messages_sent,
                snapshot.elapsed_secs,
            ),
            total_errors: snapshot.total_errors(),
            run,
            global,
            latency,
            slo,
            sla_violations: snapshot.sla_violations,
            resources: ResourceStats::from_series(series),
            adapter_load: snapshot.adapter_load,
            data_transferred: snapshot.data_transferred,
            protocols,
            tenants: snapshot.tenants,
            error_types: snapshot.error_types,
            status_codes: snapshot.status_codes,
            intervals: snapshot.intervals,
            time_series: series.to_vec(),
        }
    }

    pub fn error_rate_percent(&self) -> f64 {
        100.0 - self.global.success_rate_percent
    }

    pub fn render_text(&self) -> String {
        self.to_string()
    }

    /// Suffix shared by every file of this report, down to the millisecond
    /// so a periodic report and the final one never share names.
    pub fn file_stamp(&self) -> String {
        self.generated_at.format("%Y%m%d_%H%M%S_%3f").to_string()
    }

    /// Write every report file into `output_dir`, then run `charts` if given.
    pub fn write_all(
        &self,
        output_dir: &Path,
        charts: Option<&dyn ChartRenderer>,
    ) -> ReportPaths {
        let stamp = self.file_stamp();
        let mut paths = ReportPaths::default();

        if let Err(e) = std::fs::create_dir_all(output_dir) {
            warn!(dir = ?output_dir, error = %e, "Cannot create report directory");
        }

        paths.summary = keep(
            "summary",
            self.write_summary(&output_dir.join(format!("summary_{stamp}.txt"))),
        );
        paths.json = keep(
            "json",
            self.write_json(&output_dir.join(format!("metrics_{stamp}.json"))),
        );
        paths.csv = keep(
            "csv",
            self.write_csv(&output_dir.join(format!("metrics_{stamp}.csv"))),
        );
        if !self.time_series.is_empty() {
            let path = output_dir.join(format!("time_series_{stamp}.csv"));
            paths.time_series_csv = keep("time series", self.write_time_series_csv(&path));
        }

        if let Some(renderer) = charts {
            match renderer.render(self, output_dir, &stamp) {
                Ok(files) => paths.charts = files,
                Err(e) => warn!(
                    renderer = renderer.name(),
                    error = %e,
                    "Chart rendering failed; text report unaffected"
                ),
            }
        }

        info!(dir = ?output_dir, files = paths.count(), "Report written");
        paths
    }

    pub fn write_summary(&self, path: &Path) -> Result<PathBuf> {
        std::fs::write(path, self.render_text())
            .with_context(|| format!("Failed to write summary {:?}", path))?;
        Ok(path.to_path_buf())
    }

    pub fn write_json(&self, path: &Path) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(path.to_path_buf())
    }

    pub fn write_csv(&self, path: &Path) -> Result<PathBuf> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {:?}", path))?;
        writer.serialize(MetricsRow::from(self))?;
        writer.flush()?;
        Ok(path.to_path_buf())
    }

    pub fn write_time_series_csv(&self, path: &Path) -> Result<PathBuf> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {:?}", path))?;
        for point in &self.time_series {
            writer.serialize(point)?;
        }
        writer.flush()?;
        Ok(path.to_path_buf())
    }
}

fn keep(kind: &str, result: Result<PathBuf>) -> Option<PathBuf> {
    match result {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(kind, error = %format!("{e:#}"), "Report file skipped");
            None
        }
    }
}

/// One flat row of headline numbers.
#[derive(Debug, Serialize)]
struct MetricsRow {
    generated_at: String,
    duration_secs: f64,
    devices: usize,
    tenants: usize,
    messages_sent: u64,
    messages_failed: u64,
    success_rate_percent: f64,
    avg_msg_rate: f64,
    peak_msg_rate: f64,
    avg_latency_ms: f64,
    p50_latency_ms: f64,
    p95_latency_ms: f64,
    p99_latency_ms: f64,
    max_latency_ms: f64,
    total_bytes: u64,
    total_errors: u64,
    peak_memory_mb: f64,
    peak_cpu_percent: f64,
    sla_passed: bool,
}

impl From<&FinalReport> for MetricsRow {
    fn from(r: &FinalReport) -> Self {
        Self {
            generated_at: r.generated_at.to_rfc3339(),
            duration_secs: r.run.duration_secs,
            devices: r.run.devices,
            tenants: r.run.tenants,
            messages_sent: r.global.messages_sent,
            messages_failed: r.global.messages_failed,
            success_rate_percent: r.global.success_rate_percent,
            avg_msg_rate: r.throughput.avg_msg_rate,
            peak_msg_rate: r.throughput.peak_msg_rate,
            avg_latency_ms: r.latency.avg_ms,
            p50_latency_ms: r.latency.p50_ms,
            p95_latency_ms: r.latency.p95_ms,
            p99_latency_ms: r.latency.p99_ms,
            max_latency_ms: r.latency.max_ms,
            total_bytes: r.data_transferred.total_bytes,
            total_errors: r.total_errors,
            peak_memory_mb: r.resources.peak_memory_mb,
            peak_cpu_percent: r.resources.peak_cpu_percent,
            sla_passed: r.slo.passed,
        }
    }
}

impl fmt::Display for FinalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(72);
        writeln!(f, "{rule}")?;
        writeln!(f, "IoT LOAD TEST REPORT")?;
        writeln!(f, "Generated: {}", self.generated_at.to_rfc3339())?;
        writeln!(f, "{rule}")?;

        writeln!(f, "\n--- Test Information ---")?;
        writeln!(f, "Started:            {}", self.run.started_at.to_rfc3339())?;
        writeln!(f, "Duration:           {:.1}s", self.run.duration_secs)?;
        writeln!(f, "Protocols:          {}", self.run.protocols.join(", "))?;
        writeln!(f, "Message kind:       {}", self.run.message_kind)?;
        writeln!(
            f,
            "Base interval:      {:.2}s ({})",
            self.run.base_interval_secs, self.run.interval_mode
        )?;
        let burst = if self.run.burst_enabled {
            "enabled"
        } else {
            "disabled"
        };
        writeln!(f, "Burst mode:         {}", burst)?;
        writeln!(f, "Seed:               {}", self.run.seed)?;

        writeln!(f, "\n--- Infrastructure ---")?;
        writeln!(f, "Tenants:            {}", self.global.tenants_registered)?;
        writeln!(f, "Devices:            {}", self.global.devices_registered)?;
        writeln!(
            f,
            "Validation:         {} ok / {} failed",
            self.global.validation_success, self.global.validation_failed
        )?;

        writeln!(f, "\n--- Message Statistics ---")?;
        writeln!(f, "Sent:               {}", self.global.messages_sent)?;
        writeln!(f, "Failed:             {}", self.global.messages_failed)?;
        writeln!(f, "Success rate:       {:.2}%", self.global.success_rate_percent)?;
        writeln!(f, "Error rate:         {:.2}%", self.error_rate_percent())?;
        writeln!(
            f,
            "Data transferred:   {} bytes (min {} / max {} per message)",
            self.data_transferred.total_bytes,
            self.data_transferred.min_message_bytes,
            self.data_transferred.max_message_bytes
        )?;

        writeln!(f, "\n--- Throughput ---")?;
        writeln!(f, "Average:            {:.2} msg/s", self.throughput.avg_msg_rate)?;
        writeln!(f, "Peak:               {:.2} msg/s", self.throughput.peak_msg_rate)?;
        writeln!(f, "Minimum:            {:.2} msg/s", self.throughput.min_msg_rate)?;

        writeln!(f, "\n--- Latency ---")?;
        write_latency(f, &self.latency, "")?;

        writeln!(f, "\n--- SLA Compliance ---")?;
        let slo = &self.slo;
        writeln!(
            f,
            "P95 latency:        {:.2}ms (target <= {:.0}ms) {}",
            slo.p95_latency.measured,
            slo.p95_latency.target,
            verdict(slo.p95_latency.passed)
        )?;
        writeln!(
            f,
            "P99 latency:        {:.2}ms (target <= {:.0}ms) {}",
            slo.p99_latency.measured,
            slo.p99_latency.target,
            verdict(slo.p99_latency.passed)
        )?;
        writeln!(
            f,
            "Success rate:       {:.2}% (target >= {:.1}%) {}",
            slo.success_rate.measured,
            slo.success_rate.target,
            verdict(slo.success_rate.passed)
        )?;
        writeln!(f, "Overall:            {}", verdict(slo.passed))?;
        writeln!(
            f,
            "Samples over p95 target: {}, over p99 target: {}",
            self.sla_violations.over_p95_target, self.sla_violations.over_p99_target
        )?;

        writeln!(f, "\n--- Resource Usage ---")?;
        writeln!(
            f,
            "Memory:             peak {:.1} MB / avg {:.1} MB",
            self.resources.peak_memory_mb, self.resources.avg_memory_mb
        )?;
        writeln!(
            f,
            "CPU:                peak {:.1}% / avg {:.1}%",
            self.resources.peak_cpu_percent, self.resources.avg_cpu_percent
        )?;
        writeln!(
            f,
            "Adapter load:       current {:.2} / peak {:.2} / avg {:.2}",
            self.adapter_load.current, self.adapter_load.peak, self.adapter_load.avg
        )?;

        writeln!(f, "\n--- Protocol Breakdown ---")?;
        if self.protocols.is_empty() {
            writeln!(f, "(no protocols active)")?;
        }
        for p in &self.protocols {
            writeln!(
                f,
                "{}: devices={} sent={} failed={} success={:.2}%",
                p.protocol.as_str().to_uppercase(),
                p.devices,
                p.messages_sent,
                p.messages_failed,
                p.success_rate_percent
            )?;
            write_latency(f, &p.latency, "    ")?;
        }

        if !self.tenants.is_empty() {
            writeln!(f, "\n--- Tenant Breakdown ---")?;
            for (tenant, t) in &self.tenants {
                writeln!(
                    f,
                    "{}: sent={} failed={} success={:.2}%",
                    tenant, t.messages_sent, t.messages_failed, t.success_rate_percent
                )?;
            }
        }

        writeln!(f, "\n--- Error Type Breakdown ---")?;
        if self.total_errors == 0 {
            writeln!(f, "No errors recorded")?;
        } else {
            for (kind, count) in self.error_types.iter().filter(|(_, c)| **c > 0) {
                let share = *count as f64 / self.total_errors as f64 * 100.0;
                writeln!(f, "{:<24}{} ({:.1}%)", kind.title(), count, share)?;
            }
        }

        if self.intervals.sample_size > 0 {
            let d = &self.intervals;
            writeln!(f, "\n--- Interval Distribution ---")?;
            writeln!(f, "Samples:            {}", d.sample_size)?;
            writeln!(f, "Mean interval:      {:.3}s", d.mean_interval_secs)?;
            writeln!(f, "Std deviation:      {:.3}s", d.std_deviation)?;
            writeln!(f, "Variance:           {:.3}", d.variance)?;
            writeln!(f, "Coeff. of variation:{:.3}", d.coefficient_of_variation)?;
            writeln!(f, "Observed lambda:    {:.2} msg/min", d.actual_lambda)?;
        }

        writeln!(f, "\n{rule}")
    }
}

fn write_latency(f: &mut fmt::Formatter<'_>, l: &LatencySummary, indent: &str) -> fmt::Result {
    if l.samples == 0 {
        return writeln!(f, "{indent}No latency samples");
    }
    writeln!(
        f,
        "{indent}avg={:.2}ms min={:.2}ms max={:.2}ms std={:.2}ms (n={})",
        l.avg_ms, l.min_ms, l.max_ms, l.stddev_ms, l.samples
    )?;
    writeln!(
        f,
        "{indent}p50={:.2}ms p90={:.2}ms p95={:.2}ms p99={:.2}ms p99.9={:.2}ms",
        l.p50_ms, l.p90_ms, l.p95_ms, l.p99_ms, l.p999_ms
    )
}

/// Files produced by one report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportPaths {
    pub summary: Option<PathBuf>,
    pub json: Option<PathBuf>,
    pub csv: Option<PathBuf>,
    pub time_series_csv: Option<PathBuf>,
    pub charts: Vec<PathBuf>,
}

impl ReportPaths {
    pub fn count(&self) -> usize {
        [&self.summary, &self.json, &self.csv, &self.time_series_csv]
            .iter()
            .filter(|p| p.is_some())
            .count()
            + self.charts.len()
    }
}

/// Optional image output. Failures are logged and never affect text reports.
pub trait ChartRenderer: Send + Sync {
    fn name(&self) -> &str;

    fn render(&self, report: &FinalReport, output_dir: &Path, stamp: &str) -> Result<Vec<PathBuf>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsOptions;
    use chrono::TimeZone;
    use crate::slo::SlaThresholds;

    fn run_info() -> RunInfo {
        RunInfo {
            started_at: Utc::now(),
            duration_secs: 30.0,
            protocols: vec!["mqtt".into(), "http".into()],
            message_kind: "telemetry".into(),
            base_interval_secs: 1.0,
            interval_mode: "fixed".into(),
            burst_enabled: false,
            seed: 42,
            devices: 5,
            tenants: 2,
        }
    }

    fn point(sent: u64, rate: f64, memory_mb: f64) -> TimeSeriesPoint {
        TimeSeriesPoint {
            timestamp: Utc::now(),
            elapsed_secs: 10.0,
            messages_sent: sent,
            messages_failed: 0,
            msg_rate: rate,
            failure_rate: 0.0,
            success_rate_percent: 100.0,
            avg_latency_ms: 10.0,
            p50_latency_ms: 10.0,
            p95_latency_ms: 10.0,
            p99_latency_ms: 10.0,
            memory_mb,
            cpu_percent: 5.0,
            active_connections: 5,
            adapter_load: 5.0,
            burst_active: false,
        }
    }

    fn populated_store() -> MetricsStore {
        let store = MetricsStore::new(MetricsOptions {
            sla: SlaThresholds {
                p95_latency_ms: 50.0,
                p99_latency_ms: 100.0,
                success_rate_percent: 90.0,
            },
            ..MetricsOptions::default()
        });
        store.initialize_protocols(&[Protocol::Mqtt, Protocol::Http]);
        store.set_protocol_device_count(Protocol::Mqtt, 3);
        store.set_protocol_device_count(Protocol::Http, 2);
        store.record_infrastructure(2, 5);
        for i in 1..=10 {
            store.record_success(Protocol::Mqtt, i as f64, 100, 200);
            store.record_tenant_message("t1", true);
        }
        store.record_failure(Protocol::Mqtt, "authentication failed: bad password");
        store.record_tenant_message("t1", false);
        store
    }

    #[test]
    fn test_build_uses_full_population_and_assigned_devices() {
        let store = populated_store();
        let series = vec![point(5, 0.5, 40.0), point(10, 1.5, 60.0)];
        let report = FinalReport::build(run_info(), &store, &series);

        assert_eq!(report.latency.samples, 10);
        assert_eq!(report.latency.p95_ms, 9.0);
        assert_eq!(report.latency.max_ms, 10.0);
        assert_eq!(report.global.messages_sent, 10);
        assert_eq!(report.total_errors, 1);
        assert!(report.slo.p95_latency.passed);
        // 10 / 11 = 90.9% >= 90%
        assert!(report.slo.success_rate.passed);
        assert!(report.slo.passed);

        // HTTP never sent anything but still reports its assigned devices
        let http = report
            .protocols
            .iter()
            .find(|p| p.protocol == Protocol::Http)
            .unwrap();
        assert_eq!(http.devices, 2);
        assert_eq!(http.messages_sent, 0);
        assert_eq!(http.success_rate_percent, 100.0);
        assert_eq!(http.latency.samples, 0);

        assert_eq!(report.throughput.avg_msg_rate, 1.0);
        assert_eq!(report.throughput.peak_msg_rate, 1.5);
        assert_eq!(report.throughput.min_msg_rate, 0.5);
        assert_eq!(report.resources.peak_memory_mb, 60.0);
        assert_eq!(report.resources.avg_memory_mb, 50.0);
    }

    #[test]
    fn test_empty_run_renders() {
        let store = MetricsStore::new(MetricsOptions::default());
        let report = FinalReport::build(run_info(), &store, &[]);
        assert_eq!(report.global.success_rate_percent, 100.0);
        assert_eq!(report.throughput, ThroughputStats::default());

        let text = report.render_text();
        assert!(text.contains("No latency samples"));
        assert!(text.contains("No errors recorded"));
        assert!(text.contains("(no protocols active)"));
    }

    #[test]
    fn test_text_sections() {
        let store = populated_store();
        let text = FinalReport::build(run_info(), &store, &[]).render_text();

        for section in [
            "--- Test Information ---",
            "--- Message Statistics ---",
            "--- Throughput ---",
            "--- Latency ---",
            "--- SLA Compliance ---",
            "--- Resource Usage ---",
            "--- Protocol Breakdown ---",
            "--- Tenant Breakdown ---",
            "--- Error Type Breakdown ---",
        ] {
            assert!(text.contains(section), "missing {section}");
        }
        assert!(text.contains("Overall:            PASS"));
        assert!(text.contains("MQTT: devices=3 sent=10 failed=1"));
        assert!(text.contains("HTTP: devices=2 sent=0 failed=0"));
        assert!(text.contains("Authentication Failed"));
    }

    #[test]
    fn test_slo_failure_is_reported() {
        let store = MetricsStore::new(MetricsOptions::default());
        store.record_success(Protocol::Coap, 900.0, 10, 200);
        let report = FinalReport::build(run_info(), &store, &[]);
        assert!(!report.slo.p95_latency.passed);
        assert!(!report.slo.passed);
        assert!(report.render_text().contains("Overall:            FAIL"));
    }

    #[test]
    fn test_write_all_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let store = populated_store();
        let report = FinalReport::build(run_info(), &store, &[point(10, 1.0, 30.0)]);

        let paths = report.write_all(dir.path(), None);
        assert_eq!(paths.count(), 4);

        let json = std::fs::read_to_string(paths.json.as_ref().unwrap()).unwrap();
        let decoded: FinalReport = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.global.messages_sent, 10);
        assert_eq!(decoded.protocols.len(), 2);
        assert_eq!(decoded.error_types[&ErrorType::AuthenticationFailed], 1);

        let csv = std::fs::read_to_string(paths.csv.as_ref().unwrap()).unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("generated_at,duration_secs"));
        assert_eq!(lines.count(), 1);

        let series = std::fs::read_to_string(paths.time_series_csv.as_ref().unwrap()).unwrap();
        assert_eq!(series.lines().count(), 2);

        let summary = paths.summary.as_ref().unwrap();
        assert!(summary
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("summary_"));
    }

    #[test]
    fn test_reports_in_the_same_second_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = populated_store();
        let mut periodic = FinalReport::build(run_info(), &store, &[]);
        let mut last = periodic.clone();
        let second = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 30).unwrap();
        periodic.generated_at = second + chrono::Duration::milliseconds(120);
        last.generated_at = second + chrono::Duration::milliseconds(870);
        assert_eq!(periodic.file_stamp(), "20260301_120030_120");

        let periodic_paths = periodic.write_all(dir.path(), None);
        let last_paths = last.write_all(dir.path(), None);
        assert_ne!(periodic_paths.summary, last_paths.summary);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 6);
    }

    #[test]
    fn test_time_series_csv_omitted_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::new(MetricsOptions::default());
        let paths = FinalReport::build(run_info(), &store, &[]).write_all(dir.path(), None);
        assert!(paths.summary.is_some());
        assert!(paths.time_series_csv.is_none());
        assert_eq!(paths.count(), 3);
    }

    struct BrokenCharts;

    impl ChartRenderer for BrokenCharts {
        fn name(&self) -> &str {
            "broken"
        }

        fn render(&self, _: &FinalReport, _: &Path, _: &str) -> Result<Vec<PathBuf>> {
            anyhow::bail!("plotting backend unavailable")
        }
    }

    struct ListingCharts;

    impl ChartRenderer for ListingCharts {
        fn name(&self) -> &str {
            "listing"
        }

        fn render(&self, report: &FinalReport, dir: &Path, stamp: &str) -> Result<Vec<PathBuf>> {
            let path = dir.join(format!("chart_{stamp}.txt"));
            std::fs::write(&path, format!("{} points", report.time_series.len()))?;
            Ok(vec![path])
        }
    }

    #[test]
    fn test_chart_renderer_failure_keeps_text_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let store = populated_store();
        let report = FinalReport::build(run_info(), &store, &[]);

        let paths = report.write_all(dir.path(), Some(&BrokenCharts));
        assert!(paths.charts.is_empty());
        assert!(paths.summary.is_some());
        assert!(paths.json.is_some());

        let paths = report.write_all(dir.path(), Some(&ListingCharts));
        assert_eq!(paths.charts.len(), 1);
        assert!(paths.charts[0].exists());
    }

    #[test]
    fn test_unwritable_directory_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let store = MetricsStore::new(MetricsOptions::default());
        let paths = FinalReport::build(run_info(), &store, &[]).write_all(&blocker, None);
        assert_eq!(paths, ReportPaths::default());
    }
}
