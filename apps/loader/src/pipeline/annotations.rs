//! Wide annotation matrix -> sparse `annotations_terms` rows.
//!
//! The source has one row per (study_id, contrast_id) and one `terms_*`
//! column per term. Only finite, strictly positive cells become rows; zero,
//! negative, missing and non-finite cells mean "not annotated".
//!
//! Term columns are processed `batch_columns` at a time and every batch is
//! streamed with COPY before the next one is built, so memory holds one
//! batch of records rather than the melted matrix. Secondary indexes and the
//! (study, contrast, term) uniqueness constraint are built once all batches
//! are in: duplicates across batches only surface at that point.

use arrow::array::{Array, ArrayRef, StringArray};
use nsdb_copy::{CopyBuffer, CopyRecord, EncodeError};
use regex::Regex;
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use std::sync::LazyLock;
use std::time::Instant;

use super::bulk::BulkWriter;
use super::schema::{self, IndexMethod};
use crate::db;
use crate::ident::{Ident, QualifiedName};
use crate::sanitize;
use crate::source::Table;
use crate::{Error, Result};

pub const TERMS_TABLE: &str = "annotations_terms";
pub const JSON_TABLE: &str = "annotations_json";

const TERM_PREFIX: &str = "terms_";
const ID_COLUMNS: [&str; 3] = ["id", "study_id", "contrast_id"];
const TERM_COLUMNS: [&str; 4] = ["study_id", "contrast_id", "term", "weight"];

/// `terms_<vocabulary>__` in front of the readable term.
static TERM_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^terms_[^_]*__").expect("valid term marker pattern"));

/// Readable term for a column: marker stripped, trimmed, lower case.
///
/// `terms_neurosynth__Working Memory` -> `working memory`
pub fn term_name(column: &str) -> String {
    TERM_MARKER.replace(column, "").trim().to_lowercase()
}

pub fn is_term_column(column: &str) -> bool {
    column.starts_with(TERM_PREFIX) && !ID_COLUMNS.contains(&column)
}

/// One row of `annotations_terms`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationTerm {
    pub study_id: String,
    pub contrast_id: Option<String>,
    pub term: String,
    pub weight: f64,
}

impl CopyRecord for AnnotationTerm {
    const ARITY: usize = 4;

    fn encode(&self, row: &mut CopyBuffer) -> std::result::Result<(), EncodeError> {
        row.text(&self.study_id)?
            .opt_text(self.contrast_id.as_deref())?
            .text(&self.term)?
            .float(self.weight)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct TermColumn {
    term: String,
    values: ArrayRef,
}

/// The annotation dataset with identifiers coerced to text and term columns located.
#[derive(Debug, Clone)]
pub struct AnnotationMatrix {
    study_ids: StringArray,
    contrast_ids: Option<StringArray>,
    columns: Vec<TermColumn>,
    missing_study_rows: usize,
}

impl AnnotationMatrix {
    /// `study_id` is required; `contrast_id` may be absent, in which case every contrast is NULL.
    pub fn from_table(table: &Table) -> Result<Self> {
        table.require_columns(&["study_id"])?;

        let columns: Vec<TermColumn> = table
            .column_names()
            .into_iter()
            .filter(|name| is_term_column(name))
            .filter_map(|name| {
                table.column(name).map(|values| TermColumn {
                    term: term_name(name),
                    values: values.clone(),
                })
            })
            .collect();
        if columns.is_empty() {
            return Err(Error::NoTermColumns {
                dataset: table.name().to_string(),
            });
        }

        let study_ids = table
            .column("study_id")
            .map(sanitize::to_text)
            .transpose()?
            .ok_or_else(|| Error::MissingColumns {
                dataset: table.name().to_string(),
                columns: vec!["study_id".to_string()],
            })?;
        let contrast_ids = table
            .column("contrast_id")
            .map(sanitize::to_text)
            .transpose()?;
        let missing_study_rows = study_ids.null_count();

        Ok(Self {
            study_ids,
            contrast_ids,
            columns,
            missing_study_rows,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.study_ids.len()
    }

    pub fn num_term_columns(&self) -> usize {
        self.columns.len()
    }

    /// Rows without a study identifier. They never produce records.
    pub fn missing_study_rows(&self) -> usize {
        self.missing_study_rows
    }

    /// Iterate the term columns in groups of `width`, in column order.
    pub fn batches(&self, width: usize) -> TermBatches<'_> {
        TermBatches {
            matrix: self,
            width: width.max(1),
            next_column: 0,
            index: 0,
        }
    }

    fn records_for(&self, column: &TermColumn, out: &mut Vec<AnnotationTerm>) -> Result<bool> {
        let values = sanitize::to_numeric(&column.values)?;
        if !sanitize::any_positive_finite(&values) {
            return Ok(false);
        }

        let mask = sanitize::positive_finite_mask(&values);
        for row in sanitize::positions(&mask) {
            if self.study_ids.is_null(row) {
                continue;
            }
            let contrast_id = self
                .contrast_ids
                .as_ref()
                .filter(|ids| ids.is_valid(row))
                .map(|ids| ids.value(row).to_string());
            out.push(AnnotationTerm {
                study_id: self.study_ids.value(row).to_string(),
                contrast_id,
                term: column.term.clone(),
                weight: values.value(row),
            });
        }
        Ok(true)
    }
}

/// Records of one group of term columns.
#[derive(Debug, Clone)]
pub struct TermBatch {
    /// Zero-based group number.
    pub index: usize,
    /// Term columns in the group.
    pub columns: usize,
    /// Columns without any positive finite value, skipped before per-row work.
    pub skipped: usize,
    pub records: Vec<AnnotationTerm>,
}

/// Lazily builds one [`TermBatch`] per group so only one group is materialized at a time.
pub struct TermBatches<'a> {
    matrix: &'a AnnotationMatrix,
    width: usize,
    next_column: usize,
    index: usize,
}

impl Iterator for TermBatches<'_> {
    type Item = Result<TermBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.matrix.columns.len();
        if self.next_column >= total {
            return None;
        }
        let end = (self.next_column + self.width).min(total);
        let group = &self.matrix.columns[self.next_column..end];

        let mut batch = TermBatch {
            index: self.index,
            columns: group.len(),
            skipped: 0,
            records: Vec::new(),
        };
        for column in group {
            match self.matrix.records_for(column, &mut batch.records) {
                Ok(true) => {}
                Ok(false) => batch.skipped += 1,
                Err(e) => return Some(Err(e)),
            }
        }

        self.next_column = end;
        self.index += 1;
        Some(Ok(batch))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.matrix.columns.len().saturating_sub(self.next_column);
        let groups = remaining.div_ceil(self.width);
        (groups, Some(groups))
    }
}

#[derive(Debug, Clone)]
pub struct AnnotationOptions {
    pub schema: Ident,
    pub batch_columns: usize,
    pub enable_json: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationReport {
    pub terms: u64,
    pub batches_written: usize,
    pub json_documents: Option<u64>,
}

/// Rebuild `annotations_terms` (and optionally `annotations_json`) from the matrix.
pub async fn load(
    conn: &mut PgConnection,
    matrix: &AnnotationMatrix,
    options: &AnnotationOptions,
) -> Result<AnnotationReport> {
    let terms_table = QualifiedName::new(&options.schema, TERMS_TABLE)?;
    let json_table = QualifiedName::new(&options.schema, JSON_TABLE)?;

    tracing::info!(
        rows = matrix.num_rows(),
        term_columns = matrix.num_term_columns(),
        batch_columns = options.batch_columns,
        "annotations: preparing"
    );
    if matrix.missing_study_rows() > 0 {
        tracing::warn!(
            rows = matrix.missing_study_rows(),
            "annotations: skipping rows without study_id"
        );
    }

    schema::drop_table(conn, &terms_table).await?;
    db::exec(
        conn,
        &format!(
            "CREATE UNLOGGED TABLE {terms_table} (
                study_id    TEXT NOT NULL,
                contrast_id TEXT,
                term        TEXT NOT NULL,
                weight      DOUBLE PRECISION NOT NULL
            )"
        ),
    )
    .await?;
    if options.enable_json {
        schema::drop_table(conn, &json_table).await?;
        db::exec(
            conn,
            &format!(
                "CREATE TABLE {json_table} (
                    study_id    TEXT NOT NULL,
                    contrast_id TEXT,
                    terms       JSONB NOT NULL
                )"
            ),
        )
        .await?;
    }

    let writer = BulkWriter::with_columns(terms_table.clone(), &TERM_COLUMNS)?;
    let mut report = AnnotationReport::default();
    let load_start = Instant::now();

    for batch in matrix.batches(options.batch_columns) {
        let batch = batch?;
        if batch.records.is_empty() {
            tracing::debug!(
                batch = batch.index,
                columns = batch.columns,
                "annotations: batch has no positive cells, nothing to copy"
            );
            continue;
        }

        let copied = writer.write_records(conn, &batch.records).await?;
        report.terms += copied;
        report.batches_written += 1;
        tracing::info!(
            batch = batch.index,
            columns = batch.columns,
            skipped_columns = batch.skipped,
            copied,
            cumulative = report.terms,
            "annotations: copied batch"
        );
    }
    tracing::info!(
        total = report.terms,
        elapsed = ?load_start.elapsed(),
        "annotations: bulk load finished"
    );

    build_term_indexes(conn, &terms_table).await?;

    if options.enable_json {
        report.json_documents = Some(build_json_documents(conn, &terms_table, &json_table).await?);
    }

    tracing::info!(
        terms = report.terms,
        json_documents = ?report.json_documents,
        "annotations: done"
    );
    Ok(report)
}

/// Secondary indexes, then the uniqueness constraint, all after the data is in.
///
/// Without NULL contrasts the unique index becomes the primary key. With them
/// it stays a unique index that treats NULL contrasts as equal, so a
/// duplicated term for a study without contrast is still rejected.
async fn build_term_indexes(conn: &mut PgConnection, table: &QualifiedName) -> Result<()> {
    let start = Instant::now();
    let mut tx = conn.begin().await?;

    schema::create_index(&mut *tx, "idx_annotations_terms_term", table, IndexMethod::BTree, &["term"]).await?;
    schema::create_index(&mut *tx, "idx_annotations_terms_study", table, IndexMethod::BTree, &["study_id"]).await?;
    schema::create_index(
        &mut *tx,
        "idx_annotations_terms_term_study",
        table,
        IndexMethod::BTree,
        &["term", "study_id"],
    )
    .await?;
    schema::analyze(&mut *tx, table).await?;

    let has_null_contrast: bool = sqlx::query_scalar(&format!(
        "SELECT EXISTS (SELECT 1 FROM {table} WHERE contrast_id IS NULL)"
    ))
    .fetch_one(&mut *tx)
    .await?;

    let nulls = if has_null_contrast { " NULLS NOT DISTINCT" } else { "" };
    let unique = format!(
        "CREATE UNIQUE INDEX ux_annotations_terms ON {table} (study_id, contrast_id, term){nulls}"
    );
    if let Err(e) = db::exec(&mut *tx, &unique).await {
        return Err(match e {
            Error::Database(source) if is_unique_violation(&source) => {
                Error::DuplicateAnnotations {
                    relation: table.to_string(),
                    source,
                }
            }
            other => other,
        });
    }

    if has_null_contrast {
        tracing::warn!(
            table = %table,
            "annotations: NULL contrast_id present; keeping ux_annotations_terms as unique index instead of primary key"
        );
    } else {
        db::exec(
            &mut *tx,
            &format!(
                "ALTER TABLE {table} ADD CONSTRAINT pk_annotations_terms PRIMARY KEY USING INDEX ux_annotations_terms"
            ),
        )
        .await?;
    }

    tx.commit().await?;
    tracing::info!(elapsed = ?start.elapsed(), "annotations: indexes and constraint built");
    Ok(())
}

/// Full recompute of one JSONB document per (study, contrast).
async fn build_json_documents(
    conn: &mut PgConnection,
    terms: &QualifiedName,
    json: &QualifiedName,
) -> Result<u64> {
    tracing::info!("annotations_json: aggregating (this may take a while)");
    let start = Instant::now();
    let mut tx = conn.begin().await?;

    db::exec(&mut *tx, "SET LOCAL work_mem = '512MB'").await?;
    db::exec(&mut *tx, "SET LOCAL maintenance_work_mem = '1GB'").await?;
    let documents = sqlx::raw_sql(&format!(
        "INSERT INTO {json} (study_id, contrast_id, terms)
         SELECT study_id, contrast_id, jsonb_object_agg(term, weight)
         FROM {terms}
         GROUP BY study_id, contrast_id"
    ))
    .execute(&mut *tx)
    .await?
    .rows_affected();

    db::exec(
        &mut *tx,
        &format!("CREATE UNIQUE INDEX ux_annotations_json ON {json} (study_id, contrast_id) NULLS NOT DISTINCT"),
    )
    .await?;
    schema::create_index(&mut *tx, "idx_annotations_json_terms_gin", json, IndexMethod::Gin, &["terms"]).await?;
    schema::analyze(&mut *tx, json).await?;

    tx.commit().await?;
    tracing::info!(documents, elapsed = ?start.elapsed(), "annotations_json: populated and indexed");
    Ok(documents)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
