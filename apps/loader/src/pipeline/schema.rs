//! Column-kind inference and the DDL helpers shared by the loaders.
//!
//! Inference is pure: it looks only at the Arrow schema, so the generated
//! table layout can be tested without a database.

use arrow::datatypes::{DataType, Schema};
use sqlx::postgres::PgConnection;
use std::collections::HashSet;

use crate::db;
use crate::ident::{column_list, Ident, QualifiedName};
use crate::{Error, Result};

/// Derived full-text column on `metadata`; a source column may not claim it.
pub const FTS_COLUMN: &str = "fts";

/// Prefix of the row-index columns pandas writes into Parquet files.
const PANDAS_INDEX_PREFIX: &str = "__index_level_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Numeric,
    Text,
}

impl ColumnKind {
    pub fn from_data_type(data_type: &DataType) -> Self {
        match data_type {
            DataType::Boolean
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float16
            | DataType::Float32
            | DataType::Float64
            | DataType::Decimal128(_, _)
            | DataType::Decimal256(_, _) => Self::Numeric,
            DataType::Dictionary(_, value) => Self::from_data_type(value),
            _ => Self::Text,
        }
    }

    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Numeric => "DOUBLE PRECISION",
            Self::Text => "TEXT",
        }
    }
}

/// A source column mapped to a validated target column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Header as it appears in the source file.
    pub source: String,
    pub name: Ident,
    pub kind: ColumnKind,
}

/// Normalize and type every column of a dataset. Pandas index columns are not data and are skipped.
pub fn infer_columns(dataset: &str, schema: &Schema) -> Result<Vec<ColumnSpec>> {
    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(schema.fields().len());

    for field in schema.fields() {
        if field.name().starts_with(PANDAS_INDEX_PREFIX) {
            tracing::debug!(dataset, column = %field.name(), "Skipping pandas index column");
            continue;
        }
        let name = Ident::normalized(field.name())?;
        if name.as_str() == FTS_COLUMN || !seen.insert(name.clone()) {
            return Err(Error::DuplicateColumn {
                dataset: dataset.to_string(),
                column: name.as_str().to_string(),
            });
        }
        specs.push(ColumnSpec {
            source: field.name().clone(),
            name,
            kind: ColumnKind::from_data_type(field.data_type()),
        });
    }

    Ok(specs)
}

/// `CREATE TABLE IF NOT EXISTS` for the inferred columns plus any extra column definitions.
pub fn create_table_sql(target: &QualifiedName, columns: &[ColumnSpec], extra: &[&str]) -> String {
    let mut defs: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", c.name, c.kind.sql_type()))
        .collect();
    defs.extend(extra.iter().map(|e| e.to_string()));
    format!("CREATE TABLE IF NOT EXISTS {target} ({})", defs.join(", "))
}

pub async fn drop_table(conn: &mut PgConnection, target: &QualifiedName) -> Result<()> {
    db::exec(conn, &format!("DROP TABLE IF EXISTS {target} CASCADE")).await
}

/// Index access method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMethod {
    BTree,
    Gist,
    Gin,
}

impl IndexMethod {
    fn using(&self) -> &'static str {
        match self {
            Self::BTree => "",
            Self::Gist => " USING GIST",
            Self::Gin => " USING GIN",
        }
    }
}

pub fn create_index_sql(
    index: &str,
    target: &QualifiedName,
    method: IndexMethod,
    columns: &[&str],
) -> Result<String> {
    let index = Ident::new(index)?;
    let columns = columns
        .iter()
        .map(|c| Ident::new(c))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!(
        "CREATE INDEX IF NOT EXISTS {index} ON {target}{} ({})",
        method.using(),
        column_list(&columns)
    ))
}

pub async fn create_index(
    conn: &mut PgConnection,
    index: &str,
    target: &QualifiedName,
    method: IndexMethod,
    columns: &[&str],
) -> Result<()> {
    let sql = create_index_sql(index, target, method, columns)?;
    let start = std::time::Instant::now();
    db::exec(conn, &sql).await?;
    tracing::debug!(index, table = %target, elapsed = ?start.elapsed(), "Index built");
    Ok(())
}

pub async fn analyze(conn: &mut PgConnection, target: &QualifiedName) -> Result<()> {
    db::exec(conn, &format!("ANALYZE {target}")).await
}
