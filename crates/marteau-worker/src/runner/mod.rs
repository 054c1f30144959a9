//! Ordered shell steps of one job.
//!
//! A [`JobRunner`] executes command strings through `sh -c`, one after the
//! other, and attaches the stdout and stderr of every step to the job's
//! [`StreamRedirector`] under one label. A required step exiting non-zero
//! fails the runner; nothing runs after that.

mod pipeline;
mod test_config;

pub use pipeline::{
    Distribution, LoadTestPipeline, NODES_ENV, bench_command, checkout_name, report_command,
};
pub use test_config::{JsonTestConfigLoader, TEST_CONFIG_FILE, TestConfig, TestConfigLoader};

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::console::StoreFault;
use crate::nodes::AllocationError;
use crate::redirector::{ChunkSink, Drained, RedirectorError, StreamKind, StreamRedirector};
use crate::storage::DatabaseError;

/// Label the output of every step is recorded under.
pub const DEFAULT_LABEL: &str = "marteau";

/// Job execution errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("\"{command}\" failed with exit code {code}")]
    StepFailed { command: String, code: i32 },

    #[error("Failed to spawn \"{command}\": {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("\"{command}\" cancelled")]
    Cancelled { command: String },

    #[error("Invalid test configuration: {0}")]
    Config(String),

    #[error("Node allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Redirector error: {0}")]
    Redirector(#[from] RedirectorError),

    #[error("Runner already failed, no further steps")]
    Aborted,
}

/// Whether a non-zero exit fails the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPolicy {
    Required,
    Optional,
}

/// Runner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    NotStarted,
    Running,
    Completed,
    Failed,
}

/// Runs the steps of one job.
pub struct JobRunner<'r, S: ChunkSink> {
    redirector: &'r StreamRedirector<S>,
    label: String,
    cwd: PathBuf,
    drain_timeout: Duration,
    terminate_timeout: Duration,
    shutdown: Option<watch::Receiver<bool>>,
    store_fault: Option<StoreFault>,
    state: RunnerState,
}

impl<'r, S: ChunkSink> JobRunner<'r, S> {
    pub fn new(redirector: &'r StreamRedirector<S>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            redirector,
            label: DEFAULT_LABEL.to_string(),
            cwd: cwd.into(),
            drain_timeout: Duration::from_secs(5),
            terminate_timeout: Duration::from_secs(5),
            shutdown: None,
            store_fault: None,
            state: RunnerState::NotStarted,
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Bound on waiting for a step's pipes to drain after it exited.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Grace between SIGTERM and SIGKILL when a step is cancelled.
    #[must_use]
    pub const fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Cancel the running step once `shutdown` turns `true`.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Fail the step whose output could not be recorded.
    #[must_use]
    pub fn with_store_fault(mut self, fault: StoreFault) -> Self {
        self.store_fault = Some(fault);
        self
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Directory the following steps run in.
    pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) {
        self.cwd = cwd.into();
    }

    pub const fn state(&self) -> RunnerState {
        self.state
    }

    /// Run `command` and return its exit code.
    pub async fn run_step(&mut self, command: &str, policy: StepPolicy) -> Result<i32, JobError> {
        self.run_step_with_env(command, policy, &[]).await
    }

    /// Run `command` with extra environment variables.
    ///
    /// A child killed by a signal reports exit code `-1`.
    pub async fn run_step_with_env(
        &mut self,
        command: &str,
        policy: StepPolicy,
        env: &[(&str, &str)],
    ) -> Result<i32, JobError> {
        match self.state {
            RunnerState::Failed | RunnerState::Completed => return Err(JobError::Aborted),
            RunnerState::NotStarted => self.state = RunnerState::Running,
            RunnerState::Running => {}
        }

        match self.execute(command, env).await {
            Ok(code) if code != 0 && policy == StepPolicy::Required => {
                warn!(command, code, "Step failed");
                self.state = RunnerState::Failed;
                Err(JobError::StepFailed {
                    command: command.to_string(),
                    code,
                })
            }
            Ok(code) => {
                if code != 0 {
                    debug!(command, code, "Optional step exited non-zero");
                }
                Ok(code)
            }
            Err(e) => {
                self.state = RunnerState::Failed;
                Err(e)
            }
        }
    }

    /// Close the runner, returning its final state.
    pub fn finish(&mut self) -> RunnerState {
        if self.state != RunnerState::Failed {
            self.state = RunnerState::Completed;
        }
        self.state
    }

    async fn execute(&self, command: &str, env: &[(&str, &str)]) -> Result<i32, JobError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for (key, value) in env {
            cmd.env(key, value);
        }

        info!(command, cwd = %self.cwd.display(), label = %self.label, "Running step");
        let mut child = cmd.spawn().map_err(|source| JobError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child stderr not captured"))?;
        let drained = [
            self.redirector
                .add_redirection(&self.label, pid, StreamKind::Stdout, stdout)?,
            self.redirector
                .add_redirection(&self.label, pid, StreamKind::Stderr, stderr)?,
        ];

        let status = self.wait(&mut child, command).await?;
        self.drain(drained, command).await;
        if let Some(fault) = &self.store_fault
            && let Some(e) = fault.take().await
        {
            warn!(command, error = %e, "Step output could not be recorded");
            return Err(JobError::Store(e));
        }

        let code = status.code().unwrap_or(-1);
        debug!(command, ?pid, code, "Step exited");
        Ok(code)
    }

    async fn wait(&self, child: &mut Child, command: &str) -> Result<ExitStatus, JobError> {
        let Some(mut shutdown) = self.shutdown.clone() else {
            return Ok(child.wait().await?);
        };

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            () = shutdown_requested(&mut shutdown) => None,
        };

        match status {
            Some(status) => Ok(status),
            None => {
                self.terminate(child, command).await;
                Err(JobError::Cancelled {
                    command: command.to_string(),
                })
            }
        }
    }

    async fn terminate(&self, child: &mut Child, command: &str) {
        let pid = child.id();
        if let Some(pid) = pid {
            signal_group(pid, libc::SIGTERM);
        }

        match tokio::time::timeout(self.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => info!(command, ?status, "Step terminated"),
            Ok(Err(e)) => {
                warn!(command, error = %e, "Error waiting for step");
                child.kill().await.ok();
            }
            Err(_) => {
                warn!(command, "Timeout waiting for step to terminate, killing");
                if let Some(pid) = pid {
                    signal_group(pid, libc::SIGKILL);
                }
                child.kill().await.ok();
            }
        }
    }

    async fn drain(&self, drained: [Drained; 2], command: &str) {
        let all = async {
            for stream in drained {
                stream.wait().await;
            }
        };
        if tokio::time::timeout(self.drain_timeout, all).await.is_err() {
            warn!(
                command,
                timeout_ms = self.drain_timeout.as_millis(),
                "Step output still open after exit, moving on"
            );
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Sender gone: no shutdown can come anymore.
        std::future::pending::<()>().await;
    }
}

/// Send `signal` to the process group led by `pid`.
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) only sends a signal; the group was created by our own
    // spawn through `process_group(0)`.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        debug!(pid, signal, error = %err, "Failed to signal step process group");
    }
}
