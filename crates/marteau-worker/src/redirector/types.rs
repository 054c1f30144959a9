//! Stream redirector types.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Which pipe of a child process a chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One read from a watched stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Label the stream was registered under.
    pub source: String,
    pub stream: StreamKind,
    /// Pid of the process that produced the bytes, if known.
    pub pid: Option<u32>,
    pub data: Vec<u8>,
}

/// Receiver of redirected chunks.
///
/// The dispatch loop awaits `deliver` before reading the next chunk, so a
/// slow sink slows the redirector down instead of buffering.
pub trait ChunkSink: Send + Sync + 'static {
    fn deliver(&self, chunk: Chunk) -> impl Future<Output = ()> + Send;
}

impl ChunkSink for mpsc::Sender<Chunk> {
    async fn deliver(&self, chunk: Chunk) {
        let _ = self.send(chunk).await;
    }
}

/// Configuration for a stream redirector.
#[derive(Debug, Clone)]
pub struct RedirectorConfig {
    /// Size of a single read from a watched stream.
    pub read_buffer_size: usize,
    /// How long `kill` waits for the dispatch loop before aborting it.
    pub kill_grace: Duration,
}

impl Default for RedirectorConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8192,
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Resolves once a registered stream reached EOF, failed, or was released
/// by `kill`.
#[derive(Debug)]
pub struct Drained {
    pub(crate) rx: oneshot::Receiver<()>,
}

impl Drained {
    /// Wait until every chunk of the stream has been delivered or the stream
    /// was dropped.
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

/// Redirector errors.
#[derive(Debug, thiserror::Error)]
pub enum RedirectorError {
    #[error("Redirector already started")]
    AlreadyStarted,

    #[error("Redirector stopped")]
    Stopped,
}
