//! Live multiplexer for child process output.
//!
//! A [`StreamRedirector`] watches any number of readable streams (usually the
//! stdout and stderr pipes of the steps of one job) and hands every chunk it
//! reads to a single [`ChunkSink`], one chunk at a time. Chunks of one stream
//! keep their order; chunks of different streams interleave in arrival order.
//! Streams may be registered before or after [`StreamRedirector::start`].

mod types;

pub use types::{Chunk, ChunkSink, Drained, RedirectorConfig, RedirectorError, StreamKind};

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tracing::{debug, warn};

type ChunkStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

struct Registration {
    key: u64,
    label: String,
    stream: ChunkStream,
}

/// Merges watched streams into one ordered callback sequence.
pub struct StreamRedirector<S: ChunkSink> {
    sink: Option<Arc<S>>,
    config: RedirectorConfig,
    register_tx: mpsc::UnboundedSender<Registration>,
    register_rx: Option<mpsc::UnboundedReceiver<Registration>>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    next_key: AtomicU64,
    stopped: AtomicBool,
}

impl<S: ChunkSink> StreamRedirector<S> {
    /// Create a redirector delivering to `sink`. Nothing is read before
    /// [`start`](Self::start).
    pub fn new(sink: S, config: RedirectorConfig) -> Self {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        Self {
            sink: Some(Arc::new(sink)),
            config,
            register_tx,
            register_rx: Some(register_rx),
            stop_tx,
            task: None,
            next_key: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults(sink: S) -> Self {
        Self::new(sink, RedirectorConfig::default())
    }

    /// Spawn the dispatch loop on the current tokio runtime.
    pub fn start(&mut self) -> Result<(), RedirectorError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RedirectorError::Stopped);
        }
        let (Some(sink), Some(register_rx)) = (self.sink.take(), self.register_rx.take()) else {
            return Err(RedirectorError::AlreadyStarted);
        };

        let stop_rx = self.stop_tx.subscribe();
        self.task = Some(tokio::spawn(dispatch(sink, register_rx, stop_rx)));
        debug!("Redirector started");
        Ok(())
    }

    /// Whether the dispatch loop has been started and not killed.
    pub fn is_running(&self) -> bool {
        self.task.is_some() && !self.stopped.load(Ordering::SeqCst)
    }

    /// Watch `reader` and deliver what it produces under `label`.
    ///
    /// The returned [`Drained`] resolves after the last chunk of the stream
    /// has been delivered.
    pub fn add_redirection<R>(
        &self,
        label: &str,
        pid: Option<u32>,
        kind: StreamKind,
        reader: R,
    ) -> Result<Drained, RedirectorError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RedirectorError::Stopped);
        }

        let (drained_tx, drained_rx) = oneshot::channel();
        let registration = Registration {
            key: self.next_key.fetch_add(1, Ordering::SeqCst),
            label: label.to_string(),
            stream: chunk_stream(
                reader,
                label.to_string(),
                kind,
                pid,
                self.config.read_buffer_size,
                drained_tx,
            ),
        };

        self.register_tx
            .send(registration)
            .map_err(|_| RedirectorError::Stopped)?;

        debug!(label, ?pid, stream = %kind, "Redirection added");
        Ok(Drained { rx: drained_rx })
    }

    /// Stop the dispatch loop and release every watched stream, read or not.
    ///
    /// Safe to call any number of times, before or after `start`. Returns
    /// within the configured kill grace even if the sink is stuck.
    pub async fn kill(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) && self.task.is_none() {
            return;
        }
        let _ = self.stop_tx.send(true);

        if let Some(mut task) = self.task.take()
            && tokio::time::timeout(self.config.kill_grace, &mut task)
                .await
                .is_err()
        {
            warn!(
                grace_ms = self.config.kill_grace.as_millis(),
                "Redirector did not stop in time, aborting dispatch loop"
            );
            task.abort();
            let _ = task.await;
        }

        // Registrations never picked up by a running loop.
        self.register_rx.take();
        debug!("Redirector killed");
    }
}

impl<S: ChunkSink> Drop for StreamRedirector<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn dispatch<S: ChunkSink>(
    sink: Arc<S>,
    mut register_rx: mpsc::UnboundedReceiver<Registration>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut streams: StreamMap<u64, ChunkStream> = StreamMap::new();
    let mut accepting = true;

    loop {
        tokio::select! {
            biased;

            _ = stop_rx.changed() => break,

            registration = register_rx.recv(), if accepting => {
                if let Some(registration) = registration {
                    debug!(key = registration.key, label = %registration.label, "Watching stream");
                    streams.insert(registration.key, registration.stream);
                } else {
                    accepting = false;
                }
            }

            Some((_, chunk)) = streams.next(), if !streams.is_empty() => {
                sink.deliver(chunk).await;
            }
        }
    }

    debug!(watched = streams.len(), "Dispatch loop stopped");
}

fn chunk_stream<R>(
    mut reader: R,
    label: String,
    kind: StreamKind,
    pid: Option<u32>,
    buffer_size: usize,
    drained: oneshot::Sender<()>,
) -> ChunkStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    Box::pin(async_stream::stream! {
        let mut buf = vec![0u8; buffer_size.max(1)];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    yield Chunk {
                        source: label.clone(),
                        stream: kind,
                        pid,
                        data: buf[..n].to_vec(),
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(label = %label, ?pid, stream = %kind, error = %e, "Stream read failed, no longer watched");
                    break;
                }
            }
        }
        debug!(label = %label, ?pid, stream = %kind, "Stream drained");
        let _ = drained.send(());
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::process::Stdio;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, ReadBuf};
    use tokio::process::Command;

    fn collector() -> (mpsc::Sender<Chunk>, mpsc::Receiver<Chunk>) {
        mpsc::channel(4096)
    }

    fn drain(rx: &mut mpsc::Receiver<Chunk>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    fn bytes_for(chunks: &[Chunk], label: &str) -> Vec<u8> {
        chunks
            .iter()
            .filter(|c| c.source == label)
            .flat_map(|c| c.data.clone())
            .collect()
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }
    }

    #[tokio::test]
    async fn delivers_child_output() {
        let (tx, mut rx) = collector();
        let mut redirector = StreamRedirector::with_defaults(tx);
        redirector.start().unwrap();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg("echo out; echo err 1>&2")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let pid = child.id();
        let out = redirector
            .add_redirection("marteau", pid, StreamKind::Stdout, child.stdout.take().unwrap())
            .unwrap();
        let err = redirector
            .add_redirection("marteau", pid, StreamKind::Stderr, child.stderr.take().unwrap())
            .unwrap();
        child.wait().await.unwrap();
        out.wait().await;
        err.wait().await;
        redirector.kill().await;

        let chunks = drain(&mut rx);
        let stdout: Vec<u8> = chunks
            .iter()
            .filter(|c| c.stream == StreamKind::Stdout)
            .flat_map(|c| c.data.clone())
            .collect();
        let stderr: Vec<u8> = chunks
            .iter()
            .filter(|c| c.stream == StreamKind::Stderr)
            .flat_map(|c| c.data.clone())
            .collect();
        assert_eq!(stdout, b"out\n");
        assert_eq!(stderr, b"err\n");
        assert!(chunks.iter().all(|c| c.pid == pid));
    }

    #[tokio::test]
    async fn preserves_order_within_each_stream() {
        let (tx, mut rx) = collector();
        let mut redirector = StreamRedirector::new(
            tx,
            RedirectorConfig {
                read_buffer_size: 7,
                ..Default::default()
            },
        );
        redirector.start().unwrap();

        let (mut a_writer, a_reader) = tokio::io::duplex(16);
        let (mut b_writer, b_reader) = tokio::io::duplex(16);
        let a = redirector
            .add_redirection("a", None, StreamKind::Stdout, a_reader)
            .unwrap();
        let b = redirector
            .add_redirection("b", None, StreamKind::Stderr, b_reader)
            .unwrap();

        let writer_a = tokio::spawn(async move {
            for i in 0..200 {
                a_writer.write_all(format!("a{i};").as_bytes()).await.unwrap();
            }
        });
        let writer_b = tokio::spawn(async move {
            for i in 0..200 {
                b_writer.write_all(format!("b{i};").as_bytes()).await.unwrap();
                tokio::task::yield_now().await;
            }
        });
        writer_a.await.unwrap();
        writer_b.await.unwrap();
        a.wait().await;
        b.wait().await;
        redirector.kill().await;

        let chunks = drain(&mut rx);
        let expected_a: String = (0..200).map(|i| format!("a{i};")).collect();
        let expected_b: String = (0..200).map(|i| format!("b{i};")).collect();
        assert_eq!(bytes_for(&chunks, "a"), expected_a.into_bytes());
        assert_eq!(bytes_for(&chunks, "b"), expected_b.into_bytes());
    }

    #[tokio::test]
    async fn registration_before_start_is_kept() {
        let (tx, mut rx) = collector();
        let mut redirector = StreamRedirector::with_defaults(tx);
        let drained = redirector
            .add_redirection("early", None, StreamKind::Stdout, &b"ready"[..])
            .unwrap();
        redirector.start().unwrap();
        drained.wait().await;
        redirector.kill().await;

        assert_eq!(bytes_for(&drain(&mut rx), "early"), b"ready");
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let (tx, _rx) = collector();
        let mut redirector = StreamRedirector::with_defaults(tx);
        redirector.start().unwrap();
        assert!(matches!(
            redirector.start(),
            Err(RedirectorError::AlreadyStarted)
        ));
        redirector.kill().await;
    }

    #[tokio::test]
    async fn failing_stream_does_not_stop_others() {
        let (tx, mut rx) = collector();
        let mut redirector = StreamRedirector::with_defaults(tx);
        redirector.start().unwrap();

        let broken = redirector
            .add_redirection("broken", None, StreamKind::Stderr, FailingReader)
            .unwrap();
        let healthy = redirector
            .add_redirection("healthy", None, StreamKind::Stdout, &b"still here"[..])
            .unwrap();
        broken.wait().await;
        healthy.wait().await;
        redirector.kill().await;

        let chunks = drain(&mut rx);
        assert!(bytes_for(&chunks, "broken").is_empty());
        assert_eq!(bytes_for(&chunks, "healthy"), b"still here");
    }

    #[tokio::test]
    async fn kill_is_idempotent_and_bounded_with_live_streams() {
        let (tx, _rx) = mpsc::channel(8);
        let mut redirector = StreamRedirector::new(
            tx,
            RedirectorConfig {
                kill_grace: Duration::from_millis(200),
                ..Default::default()
            },
        );
        redirector.start().unwrap();

        // Producer never stops; the small sink channel fills and blocks delivery.
        let (mut writer, reader) = tokio::io::duplex(64);
        let producer = tokio::spawn(async move {
            while writer.write_all(b"spam").await.is_ok() {}
        });
        let drained = redirector
            .add_redirection("spam", None, StreamKind::Stdout, reader)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(2), redirector.kill())
            .await
            .expect("kill must finish within bound");
        tokio::time::timeout(Duration::from_secs(2), redirector.kill())
            .await
            .expect("second kill must return");

        // The watched stream was released, so the producer sees a closed pipe.
        tokio::time::timeout(Duration::from_secs(2), drained.wait())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), producer)
            .await
            .unwrap()
            .unwrap();
        assert!(!redirector.is_running());
    }

    #[tokio::test]
    async fn kill_before_start_then_add_fails() {
        let (tx, _rx) = collector();
        let mut redirector = StreamRedirector::with_defaults(tx);
        redirector.kill().await;

        assert!(matches!(
            redirector.add_redirection("late", None, StreamKind::Stdout, &b""[..]),
            Err(RedirectorError::Stopped)
        ));
        assert!(matches!(redirector.start(), Err(RedirectorError::Stopped)));
    }

    #[tokio::test]
    async fn kill_after_child_exit_does_not_fail() {
        let (tx, _rx) = collector();
        let mut redirector = StreamRedirector::with_defaults(tx);
        redirector.start().unwrap();

        let mut child = Command::new("true")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let drained = redirector
            .add_redirection("done", child.id(), StreamKind::Stdout, child.stdout.take().unwrap())
            .unwrap();
        child.wait().await.unwrap();
        drained.wait().await;

        redirector.kill().await;
        redirector.kill().await;
    }
}
