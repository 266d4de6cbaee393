//! Coordinates: stage raw x/y/z with COPY, then build POINTZ geometries server-side.

use arrow::array::{Array, StringArray};
use nsdb_copy::{CopyBuffer, CopyRecord, EncodeError};
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use std::time::Instant;

use super::bulk::BulkWriter;
use super::schema::{self, IndexMethod};
use super::LoadOptions;
use crate::config::IfExists;
use crate::db;
use crate::ident::QualifiedName;
use crate::sanitize;
use crate::source::Table;
use crate::Result;

pub const TABLE: &str = "coordinates";
pub const STAGE_TABLE: &str = "coordinates_stage";

const REQUIRED: [&str; 4] = ["study_id", "x", "y", "z"];

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateRow {
    pub study_id: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl CopyRecord for CoordinateRow {
    const ARITY: usize = 4;

    fn encode(&self, row: &mut CopyBuffer) -> std::result::Result<(), EncodeError> {
        row.text(&self.study_id)?
            .float(self.x)?
            .float(self.y)?
            .float(self.z)?;
        Ok(())
    }
}

/// Rows that survived filtering, plus how many were dropped.
#[derive(Debug, Clone, Default)]
pub struct Coordinates {
    pub rows: Vec<CoordinateRow>,
    pub dropped: usize,
}

impl Coordinates {
    /// Keep rows whose x, y and z are all finite and whose study_id is present.
    pub fn extract(table: &Table) -> Result<Self> {
        table.require_columns(&REQUIRED)?;
        let column = |name: &str| {
            table
                .column(name)
                .cloned()
                .ok_or_else(|| crate::Error::MissingColumns {
                    dataset: table.name().to_string(),
                    columns: vec![name.to_string()],
                })
        };

        let study_ids: StringArray = sanitize::to_text(&column("study_id")?)?;
        let x = sanitize::to_numeric(&column("x")?)?;
        let y = sanitize::to_numeric(&column("y")?)?;
        let z = sanitize::to_numeric(&column("z")?)?;

        let has_study: Vec<bool> = (0..study_ids.len()).map(|i| study_ids.is_valid(i)).collect();
        let keep = sanitize::and_masks(&[
            sanitize::finite_mask(&x),
            sanitize::finite_mask(&y),
            sanitize::finite_mask(&z),
            has_study,
        ]);

        let rows = sanitize::positions(&keep)
            .into_iter()
            .map(|i| CoordinateRow {
                study_id: study_ids.value(i).to_string(),
                x: x.value(i),
                y: y.value(i),
                z: z.value(i),
            })
            .collect();

        Ok(Self {
            rows,
            dropped: sanitize::dropped(&keep),
        })
    }
}

/// Stage, transform, index. Returns the number of geometries inserted.
pub async fn load(
    conn: &mut PgConnection,
    coordinates: &Coordinates,
    options: &LoadOptions,
) -> Result<u64> {
    let target = QualifiedName::new(&options.schema, TABLE)?;
    let stage = QualifiedName::new(&options.schema, STAGE_TABLE)?;

    if coordinates.dropped > 0 {
        tracing::warn!(
            dropped = coordinates.dropped,
            "coordinates: dropped rows with non-finite x/y/z or missing study_id"
        );
    }
    tracing::info!(rows = coordinates.rows.len(), "coordinates: staging");

    if options.if_exists == IfExists::Replace {
        schema::drop_table(conn, &target).await?;
        schema::drop_table(conn, &stage).await?;
    }

    db::exec(
        conn,
        &format!(
            "CREATE UNLOGGED TABLE IF NOT EXISTS {stage} (
                study_id TEXT,
                x DOUBLE PRECISION,
                y DOUBLE PRECISION,
                z DOUBLE PRECISION
            )"
        ),
    )
    .await?;
    db::exec(conn, &format!("TRUNCATE {stage}")).await?;

    let writer = BulkWriter::with_columns(stage.clone(), &REQUIRED)?;
    let mut staged = 0u64;
    for chunk in coordinates.rows.chunks(options.stage_chunk_size) {
        staged += writer.write_records(conn, chunk).await?;
        tracing::info!(copied = chunk.len(), cumulative = staged, "coordinates: staged chunk");
    }

    let start = Instant::now();
    let srid = options.srid;
    let mut tx = conn.begin().await?;

    db::exec(
        &mut *tx,
        &format!(
            "CREATE TABLE IF NOT EXISTS {target} (
                study_id TEXT NOT NULL,
                geom geometry(POINTZ, {srid}) NOT NULL
            )"
        ),
    )
    .await?;
    if options.if_exists == IfExists::Replace {
        db::exec(&mut *tx, &format!("TRUNCATE {target}")).await?;
    }

    let inserted = sqlx::raw_sql(&format!(
        "INSERT INTO {target} (study_id, geom)
         SELECT study_id, ST_SetSRID(ST_MakePoint(x, y, z), {srid})::geometry(POINTZ, {srid})
         FROM {stage}"
    ))
    .execute(&mut *tx)
    .await?
    .rows_affected();
    tracing::debug!(inserted, elapsed = ?start.elapsed(), "coordinates: geometries built");

    schema::create_index(&mut *tx, "idx_coordinates_study", &target, IndexMethod::BTree, &["study_id"]).await?;
    schema::create_index(&mut *tx, "idx_coordinates_geom_gist", &target, IndexMethod::Gist, &["geom"]).await?;
    schema::analyze(&mut *tx, &target).await?;
    schema::drop_table(&mut *tx, &stage).await?;

    tx.commit().await?;
    tracing::info!(inserted, elapsed = ?start.elapsed(), "coordinates: done");
    Ok(inserted)
}
