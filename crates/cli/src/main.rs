//! `skyrecon`: find uncatalogued sources in one astronomical image.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skyrecon_core::{
    build_backends, load_config, metrics, validate_config, AstrometryNetClient, BlobDetector,
    CatalogAggregator, ParallelOrchestrator, ReconciliationPipeline, RunOutcome, SanitizedConfig,
    SourceImage,
};

/// Reconcile plate-solved and locally detected sources against catalogs.
#[derive(Debug, Parser)]
#[command(name = "skyrecon", version, about)]
struct Args {
    /// Configuration file (TOML). `SKYRECON_*` variables override it.
    #[arg(short, long, env = "SKYRECON_CONFIG", default_value = "skyrecon.toml")]
    config: PathBuf,

    /// Observation time (RFC 3339). Defaults to the image's DATE-OBS.
    #[arg(long, value_parser = parse_observed_at)]
    observed_at: Option<DateTime<Utc>>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Print the effective configuration (API key redacted) and exit.
    #[arg(long)]
    print_config: bool,

    /// Dump Prometheus metrics to stderr after the run.
    #[arg(long)]
    metrics: bool,

    /// Image to process (FITS, PNG, JPEG, TIFF).
    #[arg(required_unless_present = "print_config")]
    image: Option<PathBuf>,
}

fn parse_observed_at(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp '{}': {}", value, e))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_json);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(json: bool) {
    // stdout carries the report, logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,skyrecon_core=info".into()),
        )
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

async fn run(args: Args) -> Result<ExitCode> {
    // Load configuration
    info!("Loading configuration from {:?}", args.config);
    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if args.print_config {
        let sanitized = SanitizedConfig::from(&config);
        println!("{}", serde_json::to_string_pretty(&sanitized)?);
        return Ok(ExitCode::SUCCESS);
    }

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;
    info!("Configuration loaded successfully");

    // Production adapters
    let calibration = AstrometryNetClient::new(config.calibration.clone())
        .context("Failed to create plate-solving client")?;
    info!("Plate solver at {}", config.calibration.api_url);

    let backends = build_backends(&config.catalog).context("Failed to create catalog backends")?;
    let aggregator = CatalogAggregator::from_config(backends, &config.catalog);
    info!("Catalog backends: {:?}", aggregator.backend_tags());

    let orchestrator = ParallelOrchestrator::new(
        Arc::new(calibration),
        Arc::new(BlobDetector::new(config.detection.clone())),
        Arc::new(aggregator),
        ReconciliationPipeline::new(config.quality.clone(), config.matching.clone()),
    );

    let image_path = args.image.context("No image given")?;
    let image = SourceImage::from_path(&image_path)
        .await
        .with_context(|| format!("Failed to read image {:?}", image_path))?;

    let report = orchestrator
        .run(image, args.observed_at)
        .await
        .context("Run aborted")?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if args.metrics {
        dump_metrics()?;
    }

    Ok(match report.outcome {
        RunOutcome::Complete(ref reconciled) => {
            info!(
                known = reconciled.outcome.known.len(),
                unknown = reconciled.outcome.unknown.len(),
                "Done"
            );
            ExitCode::SUCCESS
        }
        RunOutcome::Incomplete => {
            error!("Run incomplete, no reconciliation performed");
            ExitCode::from(2)
        }
    })
}

fn dump_metrics() -> Result<()> {
    let registry = Registry::new();
    for collector in metrics::all_metrics() {
        registry
            .register(collector)
            .context("Failed to register metric")?;
    }

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    eprintln!("{}", String::from_utf8_lossy(&buffer));
    Ok(())
}
