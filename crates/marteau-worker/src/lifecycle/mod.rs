//! Job lifecycle: transitions, results and retention.
//!
//! [`JobLifecycleStore`] records the start of a job in the worker process
//! and its single terminal transition. The terminal transition is one store
//! transaction, so a reader never sees the pid mapping gone while the result
//! is still missing.

mod events;
mod worker;

pub use events::{EventBus, JobEvent, LifecycleHooks};
pub use worker::JobWorker;

use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::job::{Job, JobResult};
use crate::storage::{Database, DatabaseError, FinishJobParams, JobStart, Outcome};

/// Default retention of results and consoles.
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(3600);

/// Lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Job already running: {job_id}")]
    AlreadyRunning { job_id: String },

    #[error("Worker {pid} is still running job {job_id}")]
    WorkerBusy { pid: u32, job_id: String },

    #[error("Job not running: {job_id}")]
    NotRunning { job_id: String },

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Invalid job descriptor: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stored result of {job_id} is malformed")]
    CorruptResult { job_id: String },
}

/// Records job transitions in the shared store.
#[derive(Clone)]
pub struct JobLifecycleStore {
    db: Database,
    pid: u32,
    ttl: Duration,
}

impl JobLifecycleStore {
    /// Store for jobs executed by the current process.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            pid: std::process::id(),
            ttl: DEFAULT_RESULT_TTL,
        }
    }

    /// Record jobs under another worker pid.
    #[must_use]
    pub const fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Mark `job` as running in this worker process.
    pub async fn starting(&self, job: &Job) -> Result<(), LifecycleError> {
        let descriptor = job.to_json()?;
        match self
            .db
            .insert_running_job(&job.job_id, &descriptor, i64::from(self.pid))
            .await?
        {
            JobStart::Started => {}
            JobStart::AlreadyRunning => {
                return Err(LifecycleError::AlreadyRunning {
                    job_id: job.job_id.clone(),
                });
            }
            JobStart::PidBusy { job_id } => {
                warn!(pid = self.pid, running = %job_id, job_id = %job.job_id, "Worker pid still mapped to a running job");
                return Err(LifecycleError::WorkerBusy {
                    pid: self.pid,
                    job_id,
                });
            }
        }

        info!(job_id = %job.job_id, pid = self.pid, function = job.function(), "Job started");
        Ok(())
    }

    /// Record a successful run and its result.
    pub async fn success(&self, job: &Job, result: &serde_json::Value) -> Result<(), LifecycleError> {
        self.finish(job, Outcome::Success, result.clone()).await
    }

    /// Record a failed run and its error message.
    pub async fn failure(&self, job: &Job, error: &str) -> Result<(), LifecycleError> {
        self.finish(job, Outcome::Failure, json!(error)).await
    }

    async fn finish(
        &self,
        job: &Job,
        outcome: Outcome,
        data: serde_json::Value,
    ) -> Result<(), LifecycleError> {
        let descriptor = job.to_json()?;
        let payload = json!({ "data": data }).to_string();
        let ttl_secs = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);

        let finished = self
            .db
            .finish_job(&FinishJobParams {
                job_id: &job.job_id,
                outcome,
                descriptor: &descriptor,
                payload: &payload,
                ttl_secs,
            })
            .await?;

        if !finished {
            warn!(job_id = %job.job_id, %outcome, "Terminal transition for a job that is not running");
            return Err(LifecycleError::NotRunning {
                job_id: job.job_id.clone(),
            });
        }

        info!(job_id = %job.job_id, %outcome, "Job finished");
        Ok(())
    }

    /// Result and console of a job. The result is `None` while the job is
    /// running or once it expired.
    pub async fn get_result(
        &self,
        job_id: &str,
    ) -> Result<(Option<JobResult>, Option<Vec<u8>>), LifecycleError> {
        let result = match self.db.get_job_result(job_id).await? {
            Some(row) => {
                let mut payload: serde_json::Value = serde_json::from_str(&row.payload)?;
                let data = payload
                    .get_mut("data")
                    .map(serde_json::Value::take)
                    .ok_or_else(|| LifecycleError::CorruptResult {
                        job_id: job_id.to_string(),
                    })?;
                let outcome = if row.outcome == Outcome::Failure.as_str() {
                    Outcome::Failure
                } else {
                    Outcome::Success
                };
                Some(JobResult {
                    outcome,
                    data,
                    finished_at: row.created_at,
                })
            }
            None => None,
        };

        let chunks = self.db.get_console_chunks(job_id).await?;
        let console =
            (!chunks.is_empty()).then(|| chunks.into_iter().flat_map(|c| c.data).collect());

        Ok((result, console))
    }

    /// Descriptor of a running job.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, LifecycleError> {
        match self.db.get_running_job(job_id).await {
            Ok(row) => Ok(Some(Job::from_json(&row.descriptor)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Jobs currently running in any worker process.
    pub async fn get_running_jobs(&self) -> Result<Vec<Job>, LifecycleError> {
        self.db
            .list_running_jobs()
            .await?
            .iter()
            .map(|row| Job::from_json(&row.descriptor).map_err(LifecycleError::from))
            .collect()
    }

    /// Jobs that succeeded, newest first.
    pub async fn get_successes(&self) -> Result<Vec<Job>, LifecycleError> {
        self.history(Outcome::Success).await
    }

    /// Jobs that failed, newest first.
    pub async fn get_failures(&self) -> Result<Vec<Job>, LifecycleError> {
        self.history(Outcome::Failure).await
    }

    async fn history(&self, outcome: Outcome) -> Result<Vec<Job>, LifecycleError> {
        self.db
            .list_history(outcome)
            .await?
            .iter()
            .map(|entry| Job::from_json(&entry.descriptor).map_err(LifecycleError::from))
            .collect()
    }

    /// Resolve the job running in worker process `pid`.
    pub async fn pid_to_job(&self, pid: u32) -> Result<Option<String>, LifecycleError> {
        Ok(self.db.pid_to_job(i64::from(pid)).await?)
    }

    /// Clear the histories and retained consoles.
    pub async fn purge(&self) -> Result<(), LifecycleError> {
        self.db.purge_jobs().await?;
        info!("Job histories and consoles purged");
        Ok(())
    }

    /// Drop expired results together with their consoles.
    pub async fn sweep_expired(&self) -> Result<(u64, u64), LifecycleError> {
        let (results, chunks) = self.db.sweep_expired().await?;
        if results > 0 || chunks > 0 {
            info!(results, chunks, "Expired results swept");
        }
        Ok((results, chunks))
    }
}

impl LifecycleHooks for JobLifecycleStore {
    async fn on_start(&self, job: &Job) -> Result<(), LifecycleError> {
        self.starting(job).await
    }

    async fn on_success(&self, job: &Job, result: &serde_json::Value) -> Result<(), LifecycleError> {
        self.success(job, result).await
    }

    async fn on_failure(&self, job: &Job, error: &str) -> Result<(), LifecycleError> {
        self.failure(job, error).await
    }
}
