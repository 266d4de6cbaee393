//! Configuration management for the loader and the checker

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::ident::Ident;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub loader: LoaderConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub check: CheckConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

/// What to do with `coordinates` and `metadata` when they already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IfExists {
    /// Drop and rebuild.
    Replace,
    /// Keep existing rows and add the new ones.
    Append,
}

impl IfExists {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Append => "append",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    /// Directory holding coordinates.parquet, metadata.parquet and annotations.parquet
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Target schema for every relation
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_if_exists")]
    pub if_exists: IfExists,
    /// Term columns turned into rows per COPY batch. Smaller uses less memory.
    #[serde(default = "default_batch_columns")]
    pub batch_columns: usize,
    /// Rows per COPY when staging coordinates and metadata
    #[serde(default = "default_stage_chunk_size")]
    pub stage_chunk_size: usize,
    /// Also build annotations_json (one JSONB document per study/contrast)
    #[serde(default)]
    pub enable_json: bool,
    /// Spatial reference of the POINTZ geometries
    #[serde(default = "default_srid")]
    pub srid: i32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CheckConfig {
    /// Run CREATE EXTENSION for the probed extensions before verifying them.
    #[serde(default)]
    pub enable_extensions: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON formatting for logs
    #[serde(default)]
    pub json: bool,

    /// Enable file logging in addition to console
    #[serde(default)]
    pub file_enabled: bool,

    /// Directory for log files (default: ./logs)
    #[serde(default = "default_log_directory")]
    pub file_directory: String,

    /// Log file prefix (default: nsdb)
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,

    /// Log rotation: daily, hourly, minutely, never (default: daily)
    #[serde(default = "default_log_rotation")]
    pub file_rotation: String,
}

fn default_database_url() -> String {
    "postgres://localhost/nsdb".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./")
}

fn default_schema() -> String {
    "ns".to_string()
}

fn default_if_exists() -> IfExists {
    IfExists::Replace
}

fn default_batch_columns() -> usize {
    150
}

fn default_stage_chunk_size() -> usize {
    50_000
}

fn default_srid() -> i32 {
    4326
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_directory() -> String {
    "./logs".to_string()
}

fn default_log_file_prefix() -> String {
    "nsdb".to_string()
}

fn default_log_rotation() -> String {
    "daily".to_string()
}

impl Config {
    /// Load configuration from defaults, an optional config file and `NSDB__*` environment variables.
    ///
    /// Without an explicit path, `nsdb.{toml,yaml,json}` in the working directory is used if present.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let file_source = match file {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("nsdb").required(false),
        };

        let config = config::Config::builder()
            .set_default("database.url", default_database_url())?
            .set_default("loader.data_dir", "./")?
            .set_default("loader.schema", default_schema())?
            .set_default("loader.if_exists", default_if_exists().as_str())?
            .set_default("loader.batch_columns", default_batch_columns() as i64)?
            .set_default("loader.stage_chunk_size", default_stage_chunk_size() as i64)?
            .set_default("loader.enable_json", false)?
            .set_default("loader.srid", default_srid() as i64)?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)?
            .set_default("logging.file_enabled", false)?
            .set_default("logging.file_directory", default_log_directory())?
            .set_default("logging.file_prefix", default_log_file_prefix())?
            .set_default("logging.file_rotation", default_log_rotation())?
            .set_default("check.enable_extensions", false)?
            .add_source(file_source)
            // Example: NSDB__LOADER__BATCH_COLUMNS=200 -> loader.batch_columns
            .add_source(
                config::Environment::with_prefix("NSDB")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Self = config.try_deserialize()?;

        // Allow DATABASE_URL to set `database.url` when no explicit
        // NSDB__DATABASE__URL override is present.
        if std::env::var("NSDB__DATABASE__URL").is_err() {
            if let Ok(url) = std::env::var("DATABASE_URL") {
                config.database.url = url;
            }
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        Ident::new(&self.loader.schema).map_err(|e| format!("loader.schema: {e}"))?;

        if self.loader.batch_columns == 0 {
            return Err("loader.batch_columns must be > 0".to_string());
        }
        if self.loader.stage_chunk_size == 0 {
            return Err("loader.stage_chunk_size must be > 0".to_string());
        }
        if self.loader.srid <= 0 {
            return Err("loader.srid must be > 0".to_string());
        }
        if self.database.url.trim().is_empty() {
            return Err("database.url must be set".to_string());
        }
        if !matches!(
            self.logging.file_rotation.as_str(),
            "daily" | "hourly" | "minutely" | "never"
        ) {
            return Err(format!(
                "logging.file_rotation must be one of daily, hourly, minutely, never (got {:?})",
                self.logging.file_rotation
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: default_database_url(),
            },
            loader: LoaderConfig {
                data_dir: default_data_dir(),
                schema: default_schema(),
                if_exists: default_if_exists(),
                batch_columns: default_batch_columns(),
                stage_chunk_size: default_stage_chunk_size(),
                enable_json: false,
                srid: default_srid(),
            },
            logging: LoggingConfig {
                level: default_log_level(),
                json: false,
                file_enabled: false,
                file_directory: default_log_directory(),
                file_prefix: default_log_file_prefix(),
                file_rotation: default_log_rotation(),
            },
            check: CheckConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.loader.schema, "ns");
        assert_eq!(config.loader.if_exists, IfExists::Replace);
        assert_eq!(config.loader.batch_columns, 150);
        assert_eq!(config.loader.stage_chunk_size, 50_000);
        assert_eq!(config.loader.srid, 4326);
        assert!(!config.loader.enable_json);
    }

    #[test]
    fn rejects_zero_batch_width() {
        let mut config = Config::default();
        config.loader.batch_columns = 0;
        assert!(config.validate().unwrap_err().contains("batch_columns"));
    }

    #[test]
    fn rejects_zero_chunk_and_bad_srid() {
        let mut config = Config::default();
        config.loader.stage_chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.loader.srid = 0;
        assert!(config.validate().unwrap_err().contains("srid"));
    }

    #[test]
    fn rejects_unsafe_schema_name() {
        let mut config = Config::default();
        config.loader.schema = "ns; DROP SCHEMA public".to_string();
        assert!(config.validate().unwrap_err().contains("loader.schema"));
    }

    #[test]
    fn rejects_unknown_rotation() {
        let mut config = Config::default();
        config.logging.file_rotation = "weekly".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn if_exists_parses_lowercase() {
        let mode: IfExists = serde_json::from_str("\"append\"").unwrap();
        assert_eq!(mode, IfExists::Append);
        assert_eq!(IfExists::Replace.as_str(), "replace");
    }
}
