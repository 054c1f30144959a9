//! Per-job console buffers.
//!
//! The [`ConsoleBus`] appends redirected chunks to the shared store, keyed by
//! job id, and pushes every appended chunk to in-process subscribers.

mod sink;

pub use sink::{ConsoleSink, StoreFault};

use tokio::sync::broadcast;
use tracing::debug;

use crate::redirector::{Chunk, StreamKind};
use crate::storage::{ConsoleChunkRow, Database, DatabaseError};

const LIVE_CAPACITY: usize = 256;

/// A chunk recorded in a job's console buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleChunk {
    pub job_id: String,
    pub source: String,
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

impl From<ConsoleChunkRow> for ConsoleChunk {
    fn from(row: ConsoleChunkRow) -> Self {
        Self {
            job_id: row.job_id,
            source: row.source,
            stream: StreamKind::parse(&row.stream).unwrap_or(StreamKind::Stdout),
            data: row.data,
        }
    }
}

/// Append-only console store plus live feed.
#[derive(Clone)]
pub struct ConsoleBus {
    db: Database,
    live_tx: broadcast::Sender<ConsoleChunk>,
}

impl ConsoleBus {
    pub fn new(db: Database) -> Self {
        let (live_tx, _) = broadcast::channel(LIVE_CAPACITY);
        Self { db, live_tx }
    }

    /// Append a redirected chunk to `job_id`'s console.
    pub async fn append(&self, job_id: &str, chunk: &Chunk) -> Result<(), DatabaseError> {
        self.db
            .append_console_chunk(job_id, &chunk.source, chunk.stream.as_str(), &chunk.data)
            .await?;

        let entry = ConsoleChunk {
            job_id: job_id.to_string(),
            source: chunk.source.clone(),
            stream: chunk.stream,
            data: chunk.data.clone(),
        };
        if let Ok(receivers) = self.live_tx.send(entry) {
            debug!(job_id, receivers, bytes = chunk.data.len(), "Console chunk pushed");
        }
        Ok(())
    }

    /// Follow every chunk appended through this bus from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleChunk> {
        self.live_tx.subscribe()
    }

    /// The whole console of a job, or `None` if nothing was recorded.
    pub async fn get_console(&self, job_id: &str) -> Result<Option<Vec<u8>>, DatabaseError> {
        let chunks = self.db.get_console_chunks(job_id).await?;
        Ok(concat(chunks))
    }

    /// The console of a job as tagged chunks, in append order.
    pub async fn get_chunks(&self, job_id: &str) -> Result<Vec<ConsoleChunk>, DatabaseError> {
        let chunks = self.db.get_console_chunks(job_id).await?;
        Ok(chunks.into_iter().map(ConsoleChunk::from).collect())
    }

    /// Delete a job's console and return what it held.
    pub async fn purge_console(&self, job_id: &str) -> Result<Option<Vec<u8>>, DatabaseError> {
        let chunks = self.db.purge_console(job_id).await?;
        Ok(concat(chunks))
    }

    /// Resolve the job executing in worker process `pid`.
    pub async fn pid_to_job(&self, pid: u32) -> Result<Option<String>, DatabaseError> {
        self.db.pid_to_job(i64::from(pid)).await
    }
}

fn concat(chunks: Vec<ConsoleChunkRow>) -> Option<Vec<u8>> {
    if chunks.is_empty() {
        return None;
    }
    Some(chunks.into_iter().flat_map(|c| c.data).collect())
}
