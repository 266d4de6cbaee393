//! nsdb-check - PostgreSQL feature self-check (tsvector, pgvector, PostGIS)
//!
//! Prints a JSON report keyed by probe on stdout. Individual probe failures
//! are part of the report and do not change the exit status.

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use nsdb::config::Config;
use nsdb::{db, logging, probe};
use sqlx::postgres::PgConnection;
use sqlx::Connection;

#[derive(Parser)]
#[command(
    name = "nsdb-check",
    about = "PostgreSQL feature self-check (tsvector, pgvector, PostGIS)",
    version
)]
struct Cli {
    /// Config file (default: nsdb.{toml,yaml,json} in the working directory, if present).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Postgres connection URL.
    #[arg(long)]
    url: Option<String>,
    /// Run CREATE EXTENSION for vector and postgis before probing them.
    #[arg(long, action = ArgAction::SetTrue)]
    enable_extensions: bool,
    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = cli.url {
        config.database.url = url;
    }
    if cli.enable_extensions {
        config.check.enable_extensions = true;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let _logging_guard = logging::init_logging(&config.logging).context("Failed to initialize logging")?;

    let url = db::ensure_sslmode_required(&config.database.url).context("Invalid database URL")?;
    let mut conn = PgConnection::connect(&url)
        .await
        .context("Failed to connect to the database")?;

    let probes = probe::standard_probes(config.check.enable_extensions);
    tracing::info!(
        probes = probes.len(),
        enable_extensions = config.check.enable_extensions,
        "Running capability probes"
    );
    let report = probe::run_probes(&mut conn, &probes).await;

    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "Closing connection failed");
    }

    let json = serde_json::to_string_pretty(&report.to_json()).context("Failed to render report")?;
    println!("{json}");
    Ok(())
}
