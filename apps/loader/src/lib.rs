//! nsdb - bulk loader for the coordinate, metadata and annotation datasets.
//!
//! The library holds everything the two binaries share: configuration, logging,
//! the Parquet source reader, value sanitizing, the COPY-based bulk writer, the
//! three load pipelines and the capability probes.

pub mod config;
pub mod db;
pub mod error;
pub mod ident;
pub mod logging;
pub mod pipeline;
pub mod probe;
pub mod sanitize;
pub mod source;

pub use error::{Error, Result};
