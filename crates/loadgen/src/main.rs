use anyhow::{Context, Result};
use clap::Parser;
use loadgen_core::{
    load_devices, start_run, verdict, FinalStats, HttpTransportFactory, LoadTestConfig,
    MockTransport, MockTransportFactory, Protocol, ReportPaths, RunHandle, RunOptions,
    TransportRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, Interval};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "loadgen")]
#[command(about = "IoT adapter load generator - drives telemetry from provisioned devices")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.toml")]
    config: PathBuf,

    /// Device list (JSON) produced by provisioning
    #[arg(long, default_value = "config/devices.example.json")]
    devices: PathBuf,

    /// Transport mode: mock or http
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Report directory (overrides config)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Simulated send latency in mock mode
    #[arg(long, default_value = "10")]
    mock_latency_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = LoadTestConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(dir) = args.output_dir {
        config.report.output_dir = dir;
    }

    let devices = load_devices(&args.devices)?;
    if devices.is_empty() {
        anyhow::bail!("Device file {:?} lists no devices", args.devices);
    }

    let registry = build_registry(&args.mode, &config, args.mock_latency_ms)?;

    info!("Starting load test in {} mode", args.mode);
    info!("Seed: {}", config.run.seed);
    info!("Protocols: {}", config.run.protocols.join(", "));
    info!(
        "Base interval: {}s ({:?})",
        config.run.base_interval_secs, config.interval.mode
    );
    info!("Loaded {} devices", devices.len());

    let mut run = start_run(
        &devices,
        &config.run.protocols,
        config.run.base_interval_secs,
        &config.run.message_kind,
        RunOptions::from(&config),
        &registry,
    )
    .context("Invalid run settings")?;
    if run.worker_count() == 0 {
        warn!("No workers started; check run.protocols against --mode {}", args.mode);
    }

    wait_for_stop(&run, &config).await;

    info!("Stopping workers...");
    let stats = run.stop_run(config.drain.timeout()).await;
    let paths = run.render_report(&config.report.output_dir);

    print_summary(&stats, &paths);

    Ok(())
}

fn build_registry(
    mode: &str,
    config: &LoadTestConfig,
    mock_latency_ms: u64,
) -> Result<TransportRegistry> {
    match mode {
        "mock" => Ok(TransportRegistry::with_all(Arc::new(
            MockTransportFactory::new(MockTransport::new(mock_latency_ms)),
        ))),
        "http" => {
            let mut registry = TransportRegistry::new();
            registry.register(
                Protocol::Http,
                Arc::new(HttpTransportFactory::new(
                    config.http.base_url.clone(),
                    config.http.timeout_ms,
                )),
            );
            Ok(registry)
        }
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", mode),
    }
}

/// Block until the configured duration elapses or Ctrl-C arrives, writing
/// periodic reports in between when configured.
async fn wait_for_stop(run: &RunHandle, config: &LoadTestConfig) {
    let deadline = async {
        match config.run.duration_ms {
            Some(ms) => sleep(Duration::from_millis(ms)).await,
            None => std::future::pending().await,
        }
    };
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);
    tokio::pin!(interrupt);

    let mut periodic = config
        .report
        .every_secs
        .filter(|secs| *secs > 0)
        .map(|secs| {
            let every = Duration::from_secs(secs);
            interval_at(Instant::now() + every, every)
        });

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("Run duration reached");
                break;
            }
            _ = &mut interrupt => {
                info!("Interrupted; stopping run");
                break;
            }
            _ = next_tick(&mut periodic) => {
                let paths = run.render_report(&config.report.output_dir);
                info!("Periodic report written ({} files)", paths.count());
            }
        }
    }
}

async fn next_tick(periodic: &mut Option<Interval>) {
    match periodic {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn print_summary(stats: &FinalStats, paths: &ReportPaths) {
    let global = &stats.snapshot.global;
    println!("\n=== Load Test Summary ===");
    println!("Duration: {:.1}s", stats.duration_secs);
    println!("Sent: {}", global.messages_sent);
    println!("Failed: {}", global.messages_failed);
    println!("Success rate: {:.2}%", global.success_rate_percent);
    println!("Latency avg: {:.2}ms", stats.latency.avg_ms);
    println!("Latency p50: {:.2}ms", stats.latency.p50_ms);
    println!("Latency p95: {:.2}ms", stats.latency.p95_ms);
    println!("Latency p99: {:.2}ms", stats.latency.p99_ms);
    for (protocol, p) in &stats.snapshot.protocols {
        println!(
            "  {}: devices={} sent={} failed={}",
            protocol, p.devices, p.messages_sent, p.messages_failed
        );
    }
    println!("SLA: {}", verdict(stats.slo.passed));
    if !stats.drain.abandoned.is_empty() {
        println!("Workers abandoned at drain: {}", stats.drain.abandoned.len());
    }
    for path in [&paths.summary, &paths.json, &paths.csv, &paths.time_series_csv]
        .into_iter()
        .flatten()
    {
        println!("Report: {}", path.display());
    }
    println!();
}
