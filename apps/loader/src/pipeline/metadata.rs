//! Metadata: open-schema table with a maintained full-text search column.

use arrow::array::{Array, Float64Array, StringArray};
use nsdb_copy::CopyBuffer;
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use std::ops::Range;
use std::time::Instant;

use super::bulk::BulkWriter;
use super::schema::{self, ColumnKind, ColumnSpec, IndexMethod, FTS_COLUMN};
use super::LoadOptions;
use crate::config::IfExists;
use crate::db;
use crate::ident::{column_list, Ident, QualifiedName};
use crate::sanitize;
use crate::source::Table;
use crate::{Error, Result};

pub const TABLE: &str = "metadata";
const TEXT_SEARCH_CONFIG: &str = "pg_catalog.english";

#[derive(Debug, Clone)]
enum ColumnValues {
    Numeric(Float64Array),
    Text(StringArray),
}

/// Metadata columns coerced to their inferred kinds, ready to be streamed.
#[derive(Debug, Clone)]
pub struct MetadataFrame {
    columns: Vec<ColumnSpec>,
    values: Vec<ColumnValues>,
    rows: usize,
    nulled: usize,
}

impl MetadataFrame {
    pub fn prepare(table: &Table) -> Result<Self> {
        let columns = schema::infer_columns(table.name(), table.batch().schema_ref())?;
        let mut values = Vec::with_capacity(columns.len());
        let mut nulled = 0;

        for spec in &columns {
            let array = table.column(&spec.source).ok_or_else(|| Error::MissingColumns {
                dataset: table.name().to_string(),
                columns: vec![spec.source.clone()],
            })?;
            values.push(match spec.kind {
                ColumnKind::Numeric => {
                    let numeric = sanitize::to_numeric(array)?;
                    // Present but non-finite: written as NULL.
                    nulled += numeric
                        .iter()
                        .filter(|v| matches!(v, Some(x) if !x.is_finite()))
                        .count();
                    ColumnValues::Numeric(numeric)
                }
                ColumnKind::Text => ColumnValues::Text(sanitize::to_text(array)?),
            });
        }

        Ok(Self {
            columns,
            values,
            rows: table.num_rows(),
            nulled,
        })
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    /// Non-finite numeric cells that will be stored as NULL.
    pub fn nulled(&self) -> usize {
        self.nulled
    }

    pub fn column_names(&self) -> Vec<Ident> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Encode rows `range` in column order.
    pub fn encode(&self, range: Range<usize>, buffer: &mut CopyBuffer) -> Result<()> {
        for row in range {
            for values in &self.values {
                match values {
                    ColumnValues::Numeric(v) => buffer.opt_float(sanitize::finite_at(v, row))?,
                    ColumnValues::Text(v) => buffer.opt_text(v.is_valid(row).then(|| v.value(row)))?,
                };
            }
            buffer.end_row()?;
        }
        Ok(())
    }
}

pub async fn load(conn: &mut PgConnection, frame: &MetadataFrame, options: &LoadOptions) -> Result<u64> {
    let target = QualifiedName::new(&options.schema, TABLE)?;

    tracing::info!(
        rows = frame.num_rows(),
        columns = frame.columns().len(),
        "metadata: preparing & creating table"
    );
    if frame.nulled() > 0 {
        tracing::warn!(cells = frame.nulled(), "metadata: non-finite numeric cells stored as NULL");
    }

    if options.if_exists == IfExists::Replace {
        schema::drop_table(conn, &target).await?;
    }
    let fts = format!("{FTS_COLUMN} tsvector");
    db::exec(conn, &schema::create_table_sql(&target, frame.columns(), &[fts.as_str()])).await?;

    let writer = BulkWriter::new(target.clone(), frame.column_names());
    let mut copied = 0u64;
    let mut start_row = 0;
    while start_row < frame.num_rows() {
        let end_row = (start_row + options.stage_chunk_size).min(frame.num_rows());
        let mut buffer = writer.buffer();
        frame.encode(start_row..end_row, &mut buffer)?;
        copied += writer.write(conn, &buffer).await?;
        tracing::info!(copied = end_row - start_row, cumulative = copied, "metadata: copied chunk");
        start_row = end_row;
    }

    let text_columns = text_columns(conn, &target).await?;
    if text_columns.is_empty() {
        tracing::warn!("metadata: no text columns, skipping full-text search setup");
        return Ok(copied);
    }

    let start = Instant::now();
    let mut tx = conn.begin().await?;

    tracing::info!(columns = text_columns.len(), "metadata: computing tsvector over text columns");
    db::exec(&mut *tx, &fts_update_sql(&target, &text_columns)).await?;

    db::exec(&mut *tx, &format!("DROP TRIGGER IF EXISTS metadata_fts_update ON {target}")).await?;
    db::exec(&mut *tx, &fts_trigger_sql(&target, &text_columns)).await?;
    schema::create_index(&mut *tx, "idx_metadata_fts", &target, IndexMethod::Gin, &[FTS_COLUMN]).await?;
    schema::analyze(&mut *tx, &target).await?;

    tx.commit().await?;
    tracing::info!(rows = copied, elapsed = ?start.elapsed(), "metadata: full-text search ready");
    Ok(copied)
}

/// Text-typed columns of the live table, in ordinal order, excluding `fts`.
async fn text_columns(conn: &mut PgConnection, target: &QualifiedName) -> Result<Vec<Ident>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT column_name::text, data_type::text
         FROM information_schema.columns
         WHERE table_schema = $1 AND table_name = $2
         ORDER BY ordinal_position",
    )
    .bind(target.schema.as_str())
    .bind(target.table.as_str())
    .fetch_all(conn)
    .await?;

    rows.into_iter()
        .filter(|(name, data_type)| {
            name != FTS_COLUMN && matches!(data_type.as_str(), "text" | "character varying")
        })
        .map(|(name, _)| Ident::new(&name))
        .collect()
}

fn fts_update_sql(target: &QualifiedName, text_columns: &[Ident]) -> String {
    let document = text_columns
        .iter()
        .map(|c| format!("coalesce({c}, '')"))
        .collect::<Vec<_>>()
        .join(" || ' ' || ");
    format!("UPDATE {target} SET {FTS_COLUMN} = to_tsvector('{TEXT_SEARCH_CONFIG}', {document})")
}

fn fts_trigger_sql(target: &QualifiedName, text_columns: &[Ident]) -> String {
    format!(
        "CREATE TRIGGER metadata_fts_update
         BEFORE INSERT OR UPDATE ON {target}
         FOR EACH ROW EXECUTE FUNCTION tsvector_update_trigger({FTS_COLUMN}, '{TEXT_SEARCH_CONFIG}', {})",
        column_list(text_columns)
    )
}
