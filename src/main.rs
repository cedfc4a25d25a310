//! feeder: drains a lock-coordinated CSV buffer file into a TimescaleDB
//! table over the PostgreSQL COPY protocol.
//!
//! The buffer file is expected on stdin (or behind `--buffer`); producers
//! append CSV rows to it under the same advisory lock the feeder takes for
//! each drain cycle. Stdout is never written to; all diagnostics go to
//! stderr so the channel stays free for redirections.

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use feeder::config::{Config, TruncateMode};
use feeder::error::{ConfigSnafu, FeederError};
use feeder::pipeline::run_feeder;

/// CSV buffer file to TimescaleDB feeder.
#[derive(Parser, Debug)]
#[command(name = "feeder")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target relation receiving the bulk-loaded rows.
    relation: Option<String>,

    /// libpq-style connection descriptor ("host=... user=... dbname=...");
    /// unset keys fall back to the PG* environment variables.
    conninfo: Option<String>,

    /// Path to an optional YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Buffer file path; when omitted the buffer file is expected on stdin.
    #[arg(long)]
    buffer: Option<PathBuf>,

    /// Seconds to sleep between drain cycles.
    #[arg(long)]
    poll_interval: Option<u64>,

    /// How much of the buffer file to remove after a committed load.
    #[arg(long, value_enum)]
    truncate_mode: Option<TruncateMode>,

    /// Log one status line for every completed statement and bulk load.
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration without connecting.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging on stderr; stdout stays untouched.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("feeder starting");

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => return report(e),
    };

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!("Relation: {}", config.relation);
        info!(
            "Buffer: {}",
            config
                .buffer
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<stdin>".to_string())
        );
        info!("Poll interval: {}s", config.poll_interval_secs);
        info!("Truncate mode: {:?}", config.truncate);
        info!("Configuration is valid");
        return ExitCode::SUCCESS;
    }

    match run_feeder(config).await {
        Ok(stats) => {
            info!("Feeder shut down cleanly");
            info!("  Cycles: {}", stats.cycles);
            info!("  Batches committed: {}", stats.batches_committed);
            info!("  Rows committed: {}", stats.rows_committed);
            info!("  Bytes committed: {}", stats.bytes_committed);
            ExitCode::SUCCESS
        }
        Err(e) => report(e),
    }
}

/// Build configuration from the optional file with CLI overrides on top.
fn build_config(args: &Args) -> Result<Config, FeederError> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).context(ConfigSnafu)?,
        None => Config::default(),
    };

    if let Some(relation) = &args.relation {
        config.relation = relation.clone();
    }
    if let Some(conninfo) = &args.conninfo {
        config.conninfo = Some(conninfo.clone());
    }
    if let Some(buffer) = &args.buffer {
        config.buffer = Some(buffer.clone());
    }
    if let Some(poll_interval) = args.poll_interval {
        config.poll_interval_secs = poll_interval;
    }
    if let Some(truncate) = args.truncate_mode {
        config.truncate = truncate;
    }
    if args.verbose {
        config.verbose = true;
    }

    config.validate().context(ConfigSnafu)?;
    Ok(config)
}

/// Log the error chain and translate the kind into the process exit code.
fn report(e: FeederError) -> ExitCode {
    let code = e.exit_code();
    error!("{}", snafu::Report::from_error(e));
    ExitCode::from(code)
}
