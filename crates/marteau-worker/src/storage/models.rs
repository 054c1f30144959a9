//! Database models for the Marteau store.

use serde::{Deserialize, Serialize};

/// Job currently executing in some worker process.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunningJob {
    pub job_id: String,
    pub descriptor: String,
    pub pid: i64,
    pub started_at: i64,
}

/// Entry of the successes/failures history.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HistoryEntry {
    pub id: i64,
    pub job_id: String,
    pub outcome: String,
    pub descriptor: String,
    pub finished_at: i64,
}

/// Stored result of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobResultRow {
    pub job_id: String,
    pub outcome: String,
    pub payload: String,
    pub created_at: i64,
    pub expires_at: i64,
}

/// One chunk of a job's console buffer.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConsoleChunkRow {
    pub id: i64,
    pub job_id: String,
    pub source: String,
    pub stream: String,
    pub data: Vec<u8>,
    pub created_at: i64,
}

/// Worker node record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeRow {
    pub name: String,
    pub status: String,
    pub reserved_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl NodeRow {
    pub fn is_idle(&self) -> bool {
        self.status == NodeStatus::Idle.as_str()
    }
}

/// Terminal job outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of recording a job as running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStart {
    Started,
    /// The job id is already running.
    AlreadyRunning,
    /// The worker pid is mapped to another job that is still running.
    PidBusy { job_id: String },
}

/// Node status enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Idle,
    Working,
}

impl NodeStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
