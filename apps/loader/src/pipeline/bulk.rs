//! COPY-based bulk writes.
//!
//! Rows are encoded with `nsdb-copy` before the backend is touched, then
//! streamed through `COPY ... FROM STDIN` inside their own transaction. A
//! rejected stream rolls the whole batch back; nothing of it stays committed.
//!
//! The target tables are unindexed while loading, so the server does no
//! per-row index maintenance. `synchronous_commit` is switched off for the
//! batch transaction only.

use nsdb_copy::{CopyBuffer, CopyRecord};
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use std::time::Instant;

use crate::ident::{column_list, Ident, QualifiedName};
use crate::Result;

/// Bytes per CopyData message.
const COPY_SEND_CHUNK: usize = 1 << 20;

/// Writes rows of a fixed column list into one relation.
#[derive(Debug, Clone)]
pub struct BulkWriter {
    target: QualifiedName,
    columns: Vec<Ident>,
}

impl BulkWriter {
    pub fn new(target: QualifiedName, columns: Vec<Ident>) -> Self {
        Self { target, columns }
    }

    pub fn with_columns(target: QualifiedName, columns: &[&str]) -> Result<Self> {
        let columns = columns
            .iter()
            .map(|c| Ident::new(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(target, columns))
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    /// Empty buffer with this writer's arity.
    pub fn buffer(&self) -> CopyBuffer {
        CopyBuffer::new(self.arity())
    }

    pub fn statement(&self) -> String {
        format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
            self.target,
            column_list(&self.columns)
        )
    }

    /// Encode and write a slice of records as one committed batch.
    pub async fn write_records<R: CopyRecord>(
        &self,
        conn: &mut PgConnection,
        records: &[R],
    ) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let build_start = Instant::now();
        let buffer = nsdb_copy::encode_records(records)?;
        tracing::debug!(
            table = %self.target,
            rows = buffer.rows(),
            mb = buffer.as_bytes().len() as f64 / 1_048_576.0,
            elapsed = ?build_start.elapsed(),
            "COPY payload encoded"
        );
        self.write(conn, &buffer).await
    }

    /// Stream an encoded buffer and commit it. Returns the row count reported by the server.
    pub async fn write(&self, conn: &mut PgConnection, buffer: &CopyBuffer) -> Result<u64> {
        if buffer.is_empty() {
            return Ok(0);
        }
        debug_assert_eq!(buffer.arity(), self.arity(), "buffer arity mismatch");

        let start = Instant::now();
        let statement = self.statement();

        let mut tx = conn.begin().await?;
        sqlx::raw_sql("SET LOCAL synchronous_commit = off")
            .execute(&mut *tx)
            .await?;

        let mut copy = tx.copy_in_raw(&statement).await?;
        for chunk in buffer.as_bytes().chunks(COPY_SEND_CHUNK) {
            let sent = copy.send(chunk).await.map(|_| ());
            if let Err(e) = sent {
                if let Err(abort_err) = copy.abort("client failed while sending rows").await {
                    tracing::debug!(error = %abort_err, "COPY abort reported an error");
                }
                return Err(e.into());
            }
        }
        let copied = copy.finish().await?;
        let copy_time = start.elapsed();

        tx.commit().await?;

        tracing::debug!(
            table = %self.target,
            rows = copied,
            copy = ?copy_time,
            total = ?start.elapsed(),
            rows_per_sec = copied as f64 / copy_time.as_secs_f64().max(f64::EPSILON),
            "COPY committed"
        );

        Ok(copied)
    }
}
