// engine/src/main.rs
use anyhow::{Context, Result};
use clap::Parser;
use horostracker::cancel::CancelToken;
use horostracker::collaborators::{InMemoryNodeStore, InMemoryUserStore};
use horostracker::config::Config;
use horostracker::platform::Platform;
use horostracker::store::migrations;
use horostracker::{ledger, telemetry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Orchestration engine daemon: opens the store and runs the periodic sweeps.
#[derive(Debug, Parser)]
#[command(name = "horostracker", version)]
struct Args {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single maintenance pass and exit.
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::default(),
    };
    telemetry::init(&config.log_filter);

    let platform = Platform::open(
        config,
        Arc::new(InMemoryNodeStore::default()),
        Arc::new(InMemoryUserStore::default()),
    )
    .context("failed to open platform")?;
    let (schema, db_version) = {
        let conn = platform.conn()?;
        (ledger::schema_version(&conn)?, migrations::applied_version(&conn)?)
    };
    info!(
        database = %platform.config.database_path.display(),
        providers = platform.client.configured_providers().len(),
        ledger_schema = %schema,
        db_version,
        "horostracker engine started"
    );

    if args.once {
        let report = platform.run_maintenance()?;
        info!(
            expired = report.expired_envelopes,
            purged = report.purged_buckets,
            dormant = report.dormant_providers,
            "maintenance pass finished"
        );
        return Ok(());
    }

    let stop = CancelToken::new();
    platform
        .spawn_maintenance(stop)
        .join()
        .map_err(|_| anyhow::anyhow!("maintenance thread panicked"))?;
    Ok(())
}
