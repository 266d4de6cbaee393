//! Error type shared by the loader and the checker.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("source file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("{dataset} missing columns: {}", .columns.join(", "))]
    MissingColumns {
        dataset: String,
        columns: Vec<String>,
    },

    #[error("no term columns found in {dataset}")]
    NoTermColumns { dataset: String },

    #[error("invalid identifier {0:?}: expected lower-case letters, digits or '_' (max 63 bytes)")]
    InvalidIdentifier(String),

    #[error("{dataset}: more than one column normalizes to {column:?}")]
    DuplicateColumn { dataset: String, column: String },

    #[error("duplicate (study_id, contrast_id, term) rows in {relation}; unique index build failed: {source}")]
    DuplicateAnnotations {
        relation: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("value cannot be written to the COPY stream: {0}")]
    Encode(#[from] nsdb_copy::EncodeError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// SQLSTATE of a backend error, if any.
    pub fn sqlstate(&self) -> Option<String> {
        match self {
            Error::Database(sqlx::Error::Database(db))
            | Error::DuplicateAnnotations {
                source: sqlx::Error::Database(db),
                ..
            } => db.code().map(|c| c.into_owned()),
            _ => None,
        }
    }
}
