//! Shared helpers for the database-backed tests.
//!
//! Tests need a PostgreSQL server with PostGIS available, named by
//! `NSDB_TEST_DATABASE_URL`. Without it they return early.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow::datatypes::{Field, Schema};
use nsdb::config::IfExists;
use nsdb::ident::Ident;
use nsdb::pipeline::LoadOptions;
use nsdb::source::{ANNOTATIONS_FILE, COORDINATES_FILE, METADATA_FILE};
use parquet::arrow::ArrowWriter;
use sqlx::postgres::PgPool;

pub const DATABASE_URL_ENV: &str = "NSDB_TEST_DATABASE_URL";

pub fn database_url() -> Option<String> {
    match std::env::var(DATABASE_URL_ENV) {
        Ok(url) if !url.trim().is_empty() => Some(url),
        _ => {
            eprintln!("{DATABASE_URL_ENV} not set; skipping database test");
            None
        }
    }
}

/// Pool scoped to `schema`, or `None` when no test database is configured.
pub async fn test_pool(schema: &str) -> anyhow::Result<Option<(PgPool, Ident)>> {
    let Some(url) = database_url() else {
        return Ok(None);
    };
    let schema = Ident::new(schema)?;
    let pool = nsdb::db::create_pool(&url, Some(&schema)).await?;
    sqlx::raw_sql(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&pool)
        .await?;
    Ok(Some((pool, schema)))
}

pub fn options(data_dir: &Path, schema: &Ident, batch_columns: usize) -> LoadOptions {
    LoadOptions {
        data_dir: data_dir.to_path_buf(),
        schema: schema.clone(),
        if_exists: IfExists::Replace,
        batch_columns,
        stage_chunk_size: 2,
        enable_json: true,
        srid: 4326,
    }
}

pub fn write_parquet(path: &Path, columns: Vec<(&str, ArrayRef)>) -> anyhow::Result<()> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, array)| Field::new(*name, array.data_type().clone(), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), columns.into_iter().map(|(_, a)| a).collect())?;

    let mut writer = ArrowWriter::try_new(File::create(path)?, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn text(values: &[Option<&str>]) -> ArrayRef {
    Arc::new(StringArray::from(values.to_vec()))
}

fn floats(values: &[Option<f64>]) -> ArrayRef {
    Arc::new(Float64Array::from(values.to_vec()))
}

pub fn write_coordinates(dir: &Path) -> anyhow::Result<()> {
    write_parquet(
        &dir.join(COORDINATES_FILE),
        vec![
            ("study_id", text(&[Some("s1"), Some("s1"), Some("s2"), Some("s3")])),
            ("x", floats(&[Some(-12.0), Some(1.5), Some(f64::NAN), Some(30.0)])),
            ("y", floats(&[Some(4.0), Some(2.0), Some(2.0), Some(-8.0)])),
            ("z", floats(&[Some(40.0), Some(0.0), Some(1.0), Some(12.5)])),
        ],
    )
}

pub fn write_metadata(dir: &Path) -> anyhow::Result<()> {
    write_parquet(
        &dir.join(METADATA_FILE),
        vec![
            ("Study ID", text(&[Some("s1"), Some("s2"), Some("s3")])),
            (
                "Title",
                text(&[Some("Working memory load"), Some("Pain and fear"), None]),
            ),
            ("Authors", text(&[Some("Doe J"), None, Some("Roe R")])),
            (
                "Sample Size",
                Arc::new(Int64Array::from(vec![Some(20), Some(31), None])) as ArrayRef,
            ),
            ("Mean Age", floats(&[Some(24.5), Some(f64::INFINITY), Some(30.1)])),
        ],
    )
}

/// Three term columns; the last two name the same term when `duplicate` is set.
pub fn write_annotations(dir: &Path, duplicate: bool) -> anyhow::Result<()> {
    let last = if duplicate { "terms_b__Pain" } else { "terms_b__Reward" };
    write_parquet(
        &dir.join(ANNOTATIONS_FILE),
        vec![
            ("id", floats(&[Some(1.0), Some(2.0), Some(3.0)])),
            ("study_id", text(&[Some("s1"), Some("s2"), Some("s3")])),
            ("contrast_id", text(&[Some("c1"), Some("c1"), Some("c2")])),
            ("terms_a__Working Memory", floats(&[Some(0.4), Some(0.0), None])),
            ("terms_a__Pain", floats(&[Some(0.1), Some(0.9), Some(f64::NAN)])),
            (last, floats(&[Some(0.2), Some(-1.0), Some(0.05)])),
        ],
    )
}

/// Metadata without any text column: no full-text search is set up for it.
pub fn write_numeric_metadata(dir: &Path) -> anyhow::Result<()> {
    write_parquet(
        &dir.join(METADATA_FILE),
        vec![
            (
                "Study ID",
                Arc::new(Int64Array::from(vec![Some(1), Some(2)])) as ArrayRef,
            ),
            ("Mean Age", floats(&[Some(24.5), Some(30.1)])),
        ],
    )
}

pub fn write_sources(dir: &Path, duplicate_terms: bool) -> anyhow::Result<()> {
    write_coordinates(dir)?;
    write_metadata(dir)?;
    write_annotations(dir, duplicate_terms)
}
