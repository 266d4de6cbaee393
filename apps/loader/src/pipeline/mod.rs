//! The load pipeline: coordinates, then metadata, then annotations.
//!
//! All three datasets are read and validated before the first statement that
//! changes data is sent, so a missing file or column aborts without touching
//! the database. Each stage then takes the single pooled connection for its
//! whole unit of work.

pub mod annotations;
pub mod bulk;
pub mod coordinates;
pub mod metadata;
pub mod schema;

use serde::Serialize;
use sqlx::postgres::{PgConnection, PgPool};
use std::path::PathBuf;
use std::time::Instant;

use crate::config::{IfExists, LoaderConfig};
use crate::db;
use crate::ident::Ident;
use crate::source::SourceSet;
use crate::Result;

use annotations::{AnnotationMatrix, AnnotationOptions};
use coordinates::Coordinates;
use metadata::MetadataFrame;

/// Options shared by every stage.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub data_dir: PathBuf,
    pub schema: Ident,
    pub if_exists: IfExists,
    pub batch_columns: usize,
    pub stage_chunk_size: usize,
    pub enable_json: bool,
    pub srid: i32,
}

impl LoadOptions {
    pub fn from_config(config: &LoaderConfig) -> Result<Self> {
        Ok(Self {
            data_dir: config.data_dir.clone(),
            schema: Ident::new(&config.schema)?,
            if_exists: config.if_exists,
            batch_columns: config.batch_columns.max(1),
            stage_chunk_size: config.stage_chunk_size.max(1),
            enable_json: config.enable_json,
            srid: config.srid,
        })
    }

    fn annotations(&self) -> AnnotationOptions {
        AnnotationOptions {
            schema: self.schema.clone(),
            batch_columns: self.batch_columns,
            enable_json: self.enable_json,
        }
    }
}

/// Row and drop counts of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub coordinates: u64,
    pub coordinates_dropped: usize,
    pub metadata: u64,
    pub metadata_nulled: usize,
    pub annotation_terms: u64,
    pub annotation_rows_skipped: usize,
    pub annotation_batches: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations_json: Option<u64>,
}

/// Datasets after validation and coercion, before any backend work.
pub struct PreparedSources {
    pub coordinates: Coordinates,
    pub metadata: MetadataFrame,
    pub annotations: AnnotationMatrix,
}

impl PreparedSources {
    pub fn prepare(sources: &SourceSet) -> Result<Self> {
        Ok(Self {
            coordinates: Coordinates::extract(&sources.coordinates)?,
            metadata: MetadataFrame::prepare(&sources.metadata)?,
            annotations: AnnotationMatrix::from_table(&sources.annotations)?,
        })
    }
}

/// Schema, extensions and a log line describing the server.
pub async fn prepare_database(conn: &mut PgConnection, schema: &Ident) -> Result<()> {
    let info = db::server_info(conn).await?;
    tracing::info!(
        version = %info.version,
        database = %info.database,
        schema = info.schema.as_deref().unwrap_or("<none>"),
        "Connected"
    );

    db::ensure_schema(conn, schema).await?;
    db::ensure_extensions(conn).await?;
    tracing::info!(schema = %schema, extensions = ?db::REQUIRED_EXTENSIONS, "Schema and extensions ready");
    Ok(())
}

/// Load already prepared datasets, strictly in sequence.
pub async fn load_sources(pool: &PgPool, prepared: &PreparedSources, options: &LoadOptions) -> Result<LoadSummary> {
    let mut summary = LoadSummary {
        coordinates_dropped: prepared.coordinates.dropped,
        metadata_nulled: prepared.metadata.nulled(),
        annotation_rows_skipped: prepared.annotations.missing_study_rows(),
        ..LoadSummary::default()
    };

    {
        let mut conn = pool.acquire().await?;
        summary.coordinates = coordinates::load(&mut conn, &prepared.coordinates, options).await?;
    }
    {
        let mut conn = pool.acquire().await?;
        summary.metadata = metadata::load(&mut conn, &prepared.metadata, options).await?;
    }
    {
        let mut conn = pool.acquire().await?;
        let report = annotations::load(&mut conn, &prepared.annotations, &options.annotations()).await?;
        summary.annotation_terms = report.terms;
        summary.annotation_batches = report.batches_written;
        summary.annotations_json = report.json_documents;
    }

    Ok(summary)
}

/// Full run: read and validate sources, prepare the database, load every relation.
pub async fn run(pool: &PgPool, options: &LoadOptions) -> Result<LoadSummary> {
    let start = Instant::now();

    let sources = SourceSet::read_dir(&options.data_dir)?;
    let prepared = PreparedSources::prepare(&sources)?;
    drop(sources);

    {
        let mut conn = pool.acquire().await?;
        prepare_database(&mut conn, &options.schema).await?;
    }

    let summary = load_sources(pool, &prepared, options).await?;

    let mut relations = vec!["coordinates", "metadata", "annotations_terms"];
    if summary.annotations_json.is_some() {
        relations.push("annotations_json");
    }
    tracing::info!(
        schema = %options.schema,
        relations = ?relations,
        summary = ?summary,
        elapsed = ?start.elapsed(),
        "Database ready"
    );
    Ok(summary)
}
