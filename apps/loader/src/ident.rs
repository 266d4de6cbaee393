//! SQL identifiers that are safe to splice into statements.
//!
//! Schema, table and column names end up inside DDL and COPY statements that
//! cannot take bind parameters, so every name goes through [`Ident::new`]
//! before any SQL is built from it.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::{Error, Result};

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("valid identifier pattern"));

/// PostgreSQL truncates identifiers beyond this length (NAMEDATALEN - 1).
const MAX_IDENT_LEN: usize = 63;

/// A validated, lower-case identifier. Displays double-quoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    pub fn new(name: &str) -> Result<Self> {
        if name.len() > MAX_IDENT_LEN || !IDENT_RE.is_match(name) {
            return Err(Error::InvalidIdentifier(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    /// Normalize a free-form column header (trim, lower case, spaces to `_`) and validate it.
    pub fn normalized(raw: &str) -> Result<Self> {
        Self::new(&normalize_column_name(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The pattern excludes '"', so no inner quoting is needed.
        write!(f, "\"{}\"", self.0)
    }
}

pub fn normalize_column_name(raw: &str) -> String {
    raw.trim().to_lowercase().replace(' ', "_")
}

/// `schema.table`, both parts validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub schema: Ident,
    pub table: Ident,
}

impl QualifiedName {
    pub fn new(schema: &Ident, table: &str) -> Result<Self> {
        Ok(Self {
            schema: schema.clone(),
            table: Ident::new(table)?,
        })
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Comma-separated list of quoted identifiers.
pub fn column_list(columns: &[Ident]) -> String {
    columns
        .iter()
        .map(Ident::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
