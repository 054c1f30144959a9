//! Redirector sink writing into the console of the job running in this
//! worker process.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::ConsoleBus;
use crate::redirector::{Chunk, ChunkSink};
use crate::storage::DatabaseError;

/// First store error a [`ConsoleSink`] hit, shared with whoever runs the
/// job so the job fails instead of losing its console.
#[derive(Clone, Default)]
pub struct StoreFault(Arc<Mutex<Option<DatabaseError>>>);

impl StoreFault {
    pub fn new() -> Self {
        Self::default()
    }

    async fn record(&self, error: DatabaseError) {
        let mut slot = self.0.lock().await;
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Take the recorded error, if any.
    pub async fn take(&self) -> Option<DatabaseError> {
        self.0.lock().await.take()
    }
}

/// Delivers redirected chunks to the console of the job mapped to
/// `worker_pid`, optionally echoing them to stdout.
pub struct ConsoleSink {
    bus: ConsoleBus,
    worker_pid: u32,
    echo: bool,
    fault: StoreFault,
}

impl ConsoleSink {
    /// Sink for the job running in the current process.
    pub fn new(bus: ConsoleBus) -> Self {
        Self::for_pid(bus, std::process::id())
    }

    /// Sink for the job mapped to `worker_pid`.
    pub fn for_pid(bus: ConsoleBus, worker_pid: u32) -> Self {
        Self {
            bus,
            worker_pid,
            echo: false,
            fault: StoreFault::new(),
        }
    }

    #[must_use]
    pub const fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Handle on the first store error this sink runs into.
    pub fn fault(&self) -> StoreFault {
        self.fault.clone()
    }
}

impl ChunkSink for ConsoleSink {
    async fn deliver(&self, chunk: Chunk) {
        if self.echo {
            let mut stdout = tokio::io::stdout();
            if stdout.write_all(&chunk.data).await.is_ok() {
                let _ = stdout.flush().await;
            }
        }

        match self.bus.pid_to_job(self.worker_pid).await {
            Ok(Some(job_id)) => {
                if let Err(e) = self.bus.append(&job_id, &chunk).await {
                    error!(job_id = %job_id, error = %e, "Failed to append console chunk");
                    self.fault.record(e).await;
                }
            }
            Ok(None) => {
                debug!(
                    pid = self.worker_pid,
                    bytes = chunk.data.len(),
                    "No running job for worker, chunk not recorded"
                );
            }
            Err(e) => {
                error!(pid = self.worker_pid, error = %e, "Failed to resolve job for worker");
                self.fault.record(e).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::redirector::StreamKind;
    use crate::storage::Database;

    fn chunk(data: &[u8]) -> Chunk {
        Chunk {
            source: "marteau".to_string(),
            stream: StreamKind::Stdout,
            pid: Some(1),
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn records_under_mapped_job() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_running_job("j1", "{}", 99).await.unwrap();
        let bus = ConsoleBus::new(db);
        let sink = ConsoleSink::for_pid(bus.clone(), 99);

        sink.deliver(chunk(b"tracked")).await;

        assert_eq!(
            bus.get_console("j1").await.unwrap().as_deref(),
            Some(&b"tracked"[..])
        );
    }

    #[tokio::test]
    async fn drops_chunks_without_running_job() {
        let db = Database::open_in_memory().await.unwrap();
        let bus = ConsoleBus::new(db);
        let mut rx = bus.subscribe();
        let sink = ConsoleSink::for_pid(bus.clone(), 12345);

        sink.deliver(chunk(b"orphan")).await;

        assert!(rx.try_recv().is_err());
        assert!(sink.fault().take().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_store_is_recorded_once() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_running_job("j1", "{}", 99).await.unwrap();
        let sink = ConsoleSink::for_pid(ConsoleBus::new(db.clone()), 99);
        let fault = sink.fault();
        db.pool().close().await;

        sink.deliver(chunk(b"lost")).await;
        sink.deliver(chunk(b"lost again")).await;

        assert!(fault.take().await.is_some());
        assert!(fault.take().await.is_none());
    }
}
