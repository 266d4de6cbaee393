//! Parquet source datasets, read whole into a single Arrow batch each.

use arrow::array::ArrayRef;
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::fs::File;
use std::path::Path;

use crate::{Error, Result};

pub const COORDINATES_FILE: &str = "coordinates.parquet";
pub const METADATA_FILE: &str = "metadata.parquet";
pub const ANNOTATIONS_FILE: &str = "annotations.parquet";

/// One named in-memory dataset.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    batch: RecordBatch,
}

impl Table {
    pub fn new(name: impl Into<String>, batch: RecordBatch) -> Self {
        Self {
            name: name.into(),
            batch,
        }
    }

    /// Read a Parquet file. A missing file is a configuration error.
    pub fn read_parquet(name: &str, path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }

        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let schema = builder.schema().clone();
        let reader = builder.build()?;

        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        let batch = concat_batches(&schema, &batches)?;

        Ok(Self::new(name, batch))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.batch
            .schema_ref()
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&ArrayRef> {
        self.batch.column_by_name(name)
    }

    /// Fail with every missing column listed, not just the first.
    pub fn require_columns(&self, required: &[&str]) -> Result<()> {
        let missing: Vec<String> = required
            .iter()
            .filter(|c| self.column(c).is_none())
            .map(|c| c.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingColumns {
                dataset: self.name.clone(),
                columns: missing,
            })
        }
    }
}

/// The three datasets of one load.
#[derive(Debug, Clone)]
pub struct SourceSet {
    pub coordinates: Table,
    pub metadata: Table,
    pub annotations: Table,
}

impl SourceSet {
    /// Read all three files from `dir`, checking that each exists before reading any.
    pub fn read_dir(dir: &Path) -> Result<Self> {
        let paths = [COORDINATES_FILE, METADATA_FILE, ANNOTATIONS_FILE].map(|f| dir.join(f));
        if let Some(missing) = paths.iter().find(|p| !p.exists()) {
            return Err(Error::MissingFile(missing.clone()));
        }

        let [coordinates, metadata, annotations] = paths;
        let set = Self {
            coordinates: Table::read_parquet("coordinates", &coordinates)?,
            metadata: Table::read_parquet("metadata", &metadata)?,
            annotations: Table::read_parquet("annotations", &annotations)?,
        };

        for table in [&set.coordinates, &set.metadata, &set.annotations] {
            tracing::info!(
                dataset = table.name(),
                rows = table.num_rows(),
                columns = table.num_columns(),
                "Dataset loaded"
            );
        }

        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn coordinates() -> Table {
        let schema = Arc::new(Schema::new(vec![
            Field::new("study_id", DataType::Utf8, false),
            Field::new("x", DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["s1"])),
                Arc::new(Float64Array::from(vec![1.0])),
            ],
        )
        .unwrap();
        Table::new("coordinates", batch)
    }

    #[test]
    fn require_columns_lists_every_missing_name() {
        let table = coordinates();
        assert!(table.require_columns(&["study_id", "x"]).is_ok());

        match table.require_columns(&["study_id", "x", "y", "z"]) {
            Err(Error::MissingColumns { dataset, columns }) => {
                assert_eq!(dataset, "coordinates");
                assert_eq!(columns, vec!["y", "z"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_reported_by_path() {
        let dir = tempfile::tempdir().unwrap();
        match SourceSet::read_dir(dir.path()) {
            Err(Error::MissingFile(path)) => assert!(path.ends_with(COORDINATES_FILE)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn reads_back_a_parquet_file() {
        use parquet::arrow::ArrowWriter;

        let table = coordinates();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(COORDINATES_FILE);
        let file = File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, table.batch().schema(), None).unwrap();
        writer.write(table.batch()).unwrap();
        writer.close().unwrap();

        let read = Table::read_parquet("coordinates", &path).unwrap();
        assert_eq!(read.num_rows(), 1);
        assert_eq!(read.column_names(), vec!["study_id", "x"]);
    }
}
