//! Console buffer queries.

use marteau_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::ConsoleChunkRow;

impl Database {
    /// Append a chunk to a job's console buffer.
    pub async fn append_console_chunk(
        &self,
        job_id: &str,
        source: &str,
        stream: &str,
        data: &[u8],
    ) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO console_chunks (job_id, source, stream, data, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(source)
        .bind(stream)
        .bind(data)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Get a job's console chunks in append order.
    ///
    /// A console retained past its expiry reads as empty even before the
    /// sweep removes it.
    pub async fn get_console_chunks(
        &self,
        job_id: &str,
    ) -> Result<Vec<ConsoleChunkRow>, DatabaseError> {
        let chunks = sqlx::query_as::<_, ConsoleChunkRow>(
            r"
            SELECT * FROM console_chunks
            WHERE job_id = ?
              AND NOT EXISTS (SELECT 1 FROM consoles c WHERE c.job_id = ? AND c.expires_at <= ?)
            ORDER BY id ASC
            ",
        )
        .bind(job_id)
        .bind(job_id)
        .bind(unix_timestamp())
        .fetch_all(self.pool())
        .await?;

        Ok(chunks)
    }

    /// Delete a job's console, returning the chunks it held.
    pub async fn purge_console(&self, job_id: &str) -> Result<Vec<ConsoleChunkRow>, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let chunks = sqlx::query_as::<_, ConsoleChunkRow>(
            "SELECT * FROM console_chunks WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM console_chunks WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM consoles WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(chunks)
    }
}
