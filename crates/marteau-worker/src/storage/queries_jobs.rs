//! Job lifecycle queries: started set, pid correlation, results, history.

use marteau_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{HistoryEntry, JobResultRow, JobStart, Outcome, RunningJob};

/// Parameters for a terminal job transition.
pub struct FinishJobParams<'a> {
    pub job_id: &'a str,
    pub outcome: Outcome,
    pub descriptor: &'a str,
    pub payload: &'a str,
    pub ttl_secs: i64,
}

impl Database {
    // =========================================================================
    // Running jobs
    // =========================================================================

    /// Record a job as running in the worker process `pid`.
    ///
    /// Writes nothing when the job is already running or when `pid` still
    /// maps to another running job.
    pub async fn insert_running_job(
        &self,
        job_id: &str,
        descriptor: &str,
        pid: i64,
    ) -> Result<JobStart, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let holder: Option<String> = sqlx::query_scalar(
            "SELECT p.job_id FROM job_pids p JOIN running_jobs r ON r.job_id = p.job_id WHERE p.pid = ?",
        )
        .bind(pid)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(holder) = holder.filter(|holder| holder != job_id) {
            tx.rollback().await?;
            return Ok(JobStart::PidBusy { job_id: holder });
        }

        let inserted = sqlx::query(
            "INSERT INTO running_jobs (job_id, descriptor, pid, started_at) VALUES (?, ?, ?, ?) ON CONFLICT(job_id) DO NOTHING",
        )
        .bind(job_id)
        .bind(descriptor)
        .bind(pid)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(JobStart::AlreadyRunning);
        }

        // Only a mapping whose job is no longer running can be left here.
        sqlx::query("INSERT OR REPLACE INTO job_pids (pid, job_id) VALUES (?, ?)")
            .bind(pid)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(JobStart::Started)
    }

    /// Apply a terminal transition as one batch: drop the running marker and
    /// pid mapping, append to the history, store the result and retain the
    /// console until the same expiry.
    ///
    /// Returns `false` (and writes nothing) when the job was not running.
    pub async fn finish_job(&self, params: &FinishJobParams<'_>) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let expires_at = now.saturating_add(params.ttl_secs);
        let mut tx = self.pool().begin().await?;

        let removed = sqlx::query("DELETE FROM running_jobs WHERE job_id = ?")
            .bind(params.job_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if removed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM job_pids WHERE job_id = ?")
            .bind(params.job_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO job_history (job_id, outcome, descriptor, finished_at) VALUES (?, ?, ?, ?)",
        )
        .bind(params.job_id)
        .bind(params.outcome.as_str())
        .bind(params.descriptor)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT OR REPLACE INTO job_results (job_id, outcome, payload, created_at, expires_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(params.job_id)
        .bind(params.outcome.as_str())
        .bind(params.payload)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT OR REPLACE INTO consoles (job_id, expires_at) VALUES (?, ?)")
            .bind(params.job_id)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Get a running job by ID.
    pub async fn get_running_job(&self, job_id: &str) -> Result<RunningJob, DatabaseError> {
        sqlx::query_as::<_, RunningJob>("SELECT * FROM running_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Running job {job_id}")))
    }

    /// List running jobs, oldest first.
    pub async fn list_running_jobs(&self) -> Result<Vec<RunningJob>, DatabaseError> {
        let jobs = sqlx::query_as::<_, RunningJob>(
            "SELECT * FROM running_jobs ORDER BY started_at ASC, job_id ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(jobs)
    }

    /// Resolve the job running in worker process `pid`.
    pub async fn pid_to_job(&self, pid: i64) -> Result<Option<String>, DatabaseError> {
        let job_id: Option<String> =
            sqlx::query_scalar("SELECT job_id FROM job_pids WHERE pid = ?")
                .bind(pid)
                .fetch_optional(self.pool())
                .await?;

        Ok(job_id)
    }

    // =========================================================================
    // Results and history
    // =========================================================================

    /// Get a job's result unless it has expired.
    pub async fn get_job_result(&self, job_id: &str) -> Result<Option<JobResultRow>, DatabaseError> {
        let row = sqlx::query_as::<_, JobResultRow>(
            "SELECT * FROM job_results WHERE job_id = ? AND expires_at > ?",
        )
        .bind(job_id)
        .bind(unix_timestamp())
        .fetch_optional(self.pool())
        .await?;

        Ok(row)
    }

    /// List finished jobs with the given outcome, newest first.
    pub async fn list_history(&self, outcome: Outcome) -> Result<Vec<HistoryEntry>, DatabaseError> {
        let entries = sqlx::query_as::<_, HistoryEntry>(
            "SELECT * FROM job_history WHERE outcome = ? ORDER BY id DESC",
        )
        .bind(outcome.as_str())
        .fetch_all(self.pool())
        .await?;

        Ok(entries)
    }

    /// Clear the histories and every retained console.
    ///
    /// Running jobs and unexpired results are left alone so in-flight
    /// transitions still complete.
    pub async fn purge_jobs(&self) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM job_history")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM console_chunks WHERE job_id IN (SELECT job_id FROM consoles)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM consoles").execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Remove expired results together with their consoles.
    ///
    /// Returns the number of results and console chunks removed.
    pub async fn sweep_expired(&self) -> Result<(u64, u64), DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let results = sqlx::query("DELETE FROM job_results WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let chunks = sqlx::query(
            "DELETE FROM console_chunks WHERE job_id IN (SELECT job_id FROM consoles WHERE expires_at <= ?)",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM consoles WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((results, chunks))
    }
}
