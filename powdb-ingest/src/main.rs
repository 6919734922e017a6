//! powdata - places-of-worship aggregation
//!
//! Runs the configured sources, merges the results and writes the JSON
//! output (merged entities, per-source manifest, summary, audits).

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use powdb_common::human_size::format_bytes;
use powdb_ingest::{Pipeline, PipelineConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for powdata
#[derive(Parser, Debug)]
#[command(name = "powdata")]
#[command(about = "Aggregate places of worship from public data sources")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "POWDB_CONFIG")]
    config: Option<PathBuf>,

    /// Resolve change history for flagged entities
    #[arg(long)]
    audit: bool,

    /// Write output to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, origin) =
        PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    match origin.path() {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: built-in defaults"),
    }

    if args.audit {
        config.audit.enabled = true;
    }

    let pipeline = Pipeline::from_config(&config).context("Failed to build pipeline")?;
    info!(
        "Starting powdata with {} source(s), audit {}",
        pipeline.source_count(),
        if config.audit.enabled { "on" } else { "off" }
    );

    let output = pipeline.run().await.context("Pipeline run failed")?;

    for report in output.manifest.iter().filter(|r| r.error.is_some() || !r.warnings.is_empty()) {
        warn!(
            source = %report.source,
            status = ?report.status,
            warnings = report.warnings.len(),
            "Source incomplete"
        );
    }

    let json = if args.pretty {
        serde_json::to_vec_pretty(&output)
    } else {
        serde_json::to_vec(&output)
    }
    .context("Failed to serialize output")?;

    match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&json)?;
            writer.flush()?;
            info!("Wrote {} to {}", format_bytes(json.len() as u64), path.display());
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(&json)?;
            stdout.write_all(b"\n")?;
        }
    }

    Ok(())
}
