//! Runs a job between its lifecycle hooks.

use std::fmt::Display;
use std::future::Future;

use tracing::{error, info_span, Instrument};

use super::{EventBus, JobEvent, LifecycleError, LifecycleHooks};
use crate::job::Job;
use crate::storage::Outcome;

/// Executes jobs, firing exactly one start and one terminal transition per
/// job.
pub struct JobWorker<H> {
    hooks: H,
    events: EventBus,
}

impl<H: LifecycleHooks> JobWorker<H> {
    pub fn new(hooks: H) -> Self {
        Self {
            hooks,
            events: EventBus::new(),
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub const fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Run `job` through `run`.
    ///
    /// The start hook runs before `run`; if it fails, `run` is never called.
    /// A failing `run` is not an error of this call: it is recorded through
    /// the failure hook and reported as [`Outcome::Failure`].
    pub async fn execute<F, Fut, E>(&self, job: Job, run: F) -> Result<Outcome, LifecycleError>
    where
        F: FnOnce(Job) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
        E: Display,
    {
        let span = info_span!("job", job_id = %job.job_id, function = job.function());
        async move {
            self.hooks.on_start(&job).await?;
            self.events.publish(JobEvent::Prerun { job: job.clone() });

            match run(job.clone()).await {
                Ok(result) => {
                    self.hooks.on_success(&job, &result).await?;
                    self.events.publish(JobEvent::Postrun { job, result });
                    Ok(Outcome::Success)
                }
                Err(e) => {
                    let message = e.to_string();
                    error!(error = %message, "Job failed");
                    self.hooks.on_failure(&job, &message).await?;
                    self.events.publish(JobEvent::Failure {
                        job,
                        error: message,
                    });
                    Ok(Outcome::Failure)
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::json;

    use super::*;
    use crate::job::{JobTask, LoadTestArgs};
    use crate::lifecycle::JobLifecycleStore;
    use crate::storage::Database;

    fn job(id: &str) -> Job {
        Job::new(
            id,
            JobTask::RunLoadtest(LoadTestArgs {
                repo: "/srv/tests".to_string(),
                ..Default::default()
            }),
        )
    }

    async fn worker() -> JobWorker<JobLifecycleStore> {
        let db = Database::open_in_memory().await.unwrap();
        JobWorker::new(JobLifecycleStore::new(db).with_pid(7))
    }

    #[tokio::test]
    async fn success_hook_store_error_is_returned() {
        let db = Database::open_in_memory().await.unwrap();
        let worker = JobWorker::new(JobLifecycleStore::new(db.clone()).with_pid(7));
        let mut rx = worker.events().subscribe();
        let db = &db;

        let err = worker
            .execute(job("j1"), move |_| async move {
                db.pool().close().await;
                Ok::<_, String>(json!("/tmp/report"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Store(_)));
        assert_eq!(rx.recv().await.unwrap().name(), "job_prerun");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn success_publishes_prerun_then_postrun() {
        let worker = worker().await;
        let mut rx = worker.events().subscribe();

        let outcome = worker
            .execute(job("j1"), |_| async { Ok::<_, String>(json!("/tmp/report")) })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(rx.recv().await.unwrap().name(), "job_prerun");
        let post = rx.recv().await.unwrap();
        assert_eq!(post.name(), "job_postrun");
        assert_eq!(post.job().job_id, "j1");

        let (result, _) = worker.hooks().get_result("j1").await.unwrap();
        assert_eq!(result.unwrap().data, json!("/tmp/report"));
    }

    #[tokio::test]
    async fn failing_run_is_recorded_as_failure() {
        let worker = worker().await;
        let mut rx = worker.events().subscribe();

        let outcome = worker
            .execute(job("j1"), |_| async { Err::<serde_json::Value, _>("\"exit 1\" failed") })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Failure);
        rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            JobEvent::Failure { error, .. } => assert_eq!(error, "\"exit 1\" failed"),
            other => panic!("unexpected event {}", other.name()),
        }
        assert_eq!(worker.hooks().get_failures().await.unwrap().len(), 1);
        assert!(worker.hooks().get_running_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_hook_error_skips_run() {
        let worker = worker().await;
        worker.hooks().starting(&job("j1")).await.unwrap();
        let ran = AtomicBool::new(false);
        let flag = &ran;

        let err = worker
            .execute(job("j1"), move |_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, String>(json!(null))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::AlreadyRunning { .. }));
        assert!(!ran.load(Ordering::SeqCst));
    }
}
