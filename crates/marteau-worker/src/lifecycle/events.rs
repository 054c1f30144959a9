//! Lifecycle events published around each job, and the hook interface the
//! store implements.

use std::future::Future;

use tokio::sync::broadcast;
use tracing::debug;

use super::LifecycleError;
use crate::job::Job;

const EVENT_CAPACITY: usize = 64;

/// Typed handlers run for every job transition.
///
/// Errors abort the transition and are returned to the worker; they are
/// never swallowed.
pub trait LifecycleHooks: Send + Sync {
    fn on_start(&self, job: &Job) -> impl Future<Output = Result<(), LifecycleError>> + Send;

    fn on_success(
        &self,
        job: &Job,
        result: &serde_json::Value,
    ) -> impl Future<Output = Result<(), LifecycleError>> + Send;

    fn on_failure(
        &self,
        job: &Job,
        error: &str,
    ) -> impl Future<Output = Result<(), LifecycleError>> + Send;
}

/// A job transition.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Prerun { job: Job },
    Postrun { job: Job, result: serde_json::Value },
    Failure { job: Job, error: String },
}

impl JobEvent {
    /// Wire name of the event.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Prerun { .. } => "job_prerun",
            Self::Postrun { .. } => "job_postrun",
            Self::Failure { .. } => "job_failure",
        }
    }

    pub const fn job(&self) -> &Job {
        match self {
            Self::Prerun { job } | Self::Postrun { job, .. } | Self::Failure { job, .. } => job,
        }
    }
}

/// In-process pub/sub for job events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event, returning how many subscribers received it.
    pub fn publish(&self, event: JobEvent) -> usize {
        let name = event.name();
        let job_id = event.job().job_id.clone();
        match self.tx.send(event) {
            Ok(count) => {
                debug!(event = name, job_id = %job_id, receivers = count, "Event published");
                count
            }
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
