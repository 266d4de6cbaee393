//! nsdb-load - bulk load entry point
//!
//! Reads coordinates.parquet, metadata.parquet and annotations.parquet from the
//! data directory and rebuilds the corresponding relations in the target schema.

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use nsdb::config::{Config, IfExists};
use nsdb::{db, logging, pipeline};

#[derive(Parser)]
#[command(
    name = "nsdb-load",
    about = "Load coordinates, metadata and annotations into PostgreSQL/PostGIS",
    version
)]
struct Cli {
    /// Config file (default: nsdb.{toml,yaml,json} in the working directory, if present).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Postgres connection URL. `sslmode=require` is added unless sslmode is set.
    #[arg(long)]
    url: Option<String>,
    /// Directory containing the three parquet files.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Target schema.
    #[arg(long)]
    schema: Option<String>,
    /// Replace or append coordinates and metadata.
    #[arg(long, value_enum)]
    if_exists: Option<IfExists>,
    /// terms_* columns to melt per batch (smaller uses less RAM).
    #[arg(long = "batch-cols")]
    batch_cols: Option<usize>,
    /// Rows per COPY when staging coordinates and metadata.
    #[arg(long = "stage-chunksize")]
    stage_chunksize: Option<usize>,
    /// Also build annotations_json (JSONB per study/contrast). Slow on wide matrices.
    #[arg(long, action = ArgAction::SetTrue)]
    enable_json: bool,
    /// SRID for the POINTZ geometries.
    #[arg(long)]
    srid: Option<i32>,
    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(url) = self.url {
            config.database.url = url;
        }
        if let Some(dir) = self.data_dir {
            config.loader.data_dir = dir;
        }
        if let Some(schema) = self.schema {
            config.loader.schema = schema;
        }
        if let Some(mode) = self.if_exists {
            config.loader.if_exists = mode;
        }
        if let Some(width) = self.batch_cols {
            config.loader.batch_columns = width;
        }
        if let Some(rows) = self.stage_chunksize {
            config.loader.stage_chunk_size = rows;
        }
        if self.enable_json {
            config.loader.enable_json = true;
        }
        if let Some(srid) = self.srid {
            config.loader.srid = srid;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let _logging_guard = logging::init_logging(&config.logging).context("Failed to initialize logging")?;

    let options = pipeline::LoadOptions::from_config(&config.loader).context("Invalid loader options")?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %options.data_dir.display(),
        schema = %options.schema,
        if_exists = options.if_exists.as_str(),
        batch_columns = options.batch_columns,
        stage_chunk_size = options.stage_chunk_size,
        enable_json = options.enable_json,
        srid = options.srid,
        "Starting nsdb-load"
    );

    let url = db::ensure_sslmode_required(&config.database.url).context("Invalid database URL")?;
    let pool = db::create_pool(&url, Some(&options.schema))
        .await
        .context("Failed to connect to the database")?;

    let summary = pipeline::run(&pool, &options).await.context("Load failed")?;

    pool.close().await;
    tracing::info!(
        coordinates = summary.coordinates,
        metadata = summary.metadata,
        annotation_terms = summary.annotation_terms,
        annotations_json = ?summary.annotations_json,
        "Done. Database is ready."
    );
    Ok(())
}
