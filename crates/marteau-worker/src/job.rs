//! Job descriptors exchanged with the dispatcher.

use serde::{Deserialize, Serialize};

use marteau_core::db::unix_timestamp;

use crate::storage::Outcome;

/// One load-test execution request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque identifier assigned by the dispatcher.
    pub job_id: String,
    pub task: JobTask,
    pub enqueued_at: i64,
}

impl Job {
    pub fn new(job_id: impl Into<String>, task: JobTask) -> Self {
        Self {
            job_id: job_id.into(),
            task,
            enqueued_at: unix_timestamp(),
        }
    }

    /// Serialized descriptor, as stored in the running set and histories.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(descriptor: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(descriptor)
    }

    pub const fn function(&self) -> &'static str {
        self.task.function()
    }
}

/// The function a job runs, with its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "function", content = "args", rename_all = "snake_case")]
pub enum JobTask {
    RunLoadtest(LoadTestArgs),
}

impl JobTask {
    pub const fn function(&self) -> &'static str {
        match self {
            Self::RunLoadtest(_) => "run_loadtest",
        }
    }
}

/// Arguments of a load-test run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadTestArgs {
    /// Git repository URL or local directory holding the test.
    pub repo: String,
    /// Bench cycles, passed through as `--cycles=`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycles: Option<String>,
    /// Bench duration in seconds, passed through as `--duration=`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Overrides the node count of the test configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u32>,
}

/// Final result of a job as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub outcome: Outcome,
    /// Result payload on success, error message on failure.
    pub data: serde_json::Value,
    pub finished_at: i64,
}
