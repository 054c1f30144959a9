//! The `run_loadtest` job.
//!
//! Fetches the test repository, provisions its environment, runs the bench
//! (on reserved nodes when the run is distributed) and builds the HTML
//! report. The report directory is the job result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use marteau_core::config::{Config, ToolConfig};
use tokio::sync::watch;
use tracing::{error, info};

use super::test_config::{JsonTestConfigLoader, TestConfig, TestConfigLoader};
use super::{JobError, JobRunner, StepPolicy};
use crate::console::{ConsoleBus, ConsoleSink, StoreFault};
use crate::job::{Job, JobTask, LoadTestArgs};
use crate::nodes::{NodeAllocator, RandomSelection, Reservation, SelectionStrategy};
use crate::redirector::{ChunkSink, RedirectorConfig, StreamRedirector};
use crate::storage::Database;

/// Environment variable holding the reserved nodes during a distributed run.
pub const NODES_ENV: &str = "MARTEAU_NODES";

/// Distributed bench parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    /// Comma-joined node names.
    pub workers: String,
    /// Directory the nodes write their bench output to.
    pub log_path: PathBuf,
}

/// Executes load-test jobs.
pub struct LoadTestPipeline<L = JsonTestConfigLoader, St = RandomSelection> {
    db: Database,
    config: Config,
    loader: L,
    allocator: NodeAllocator<St>,
    worker_pid: u32,
    echo: bool,
    shutdown: Option<watch::Receiver<bool>>,
}

impl LoadTestPipeline {
    pub fn new(db: Database, config: Config) -> Self {
        Self {
            allocator: NodeAllocator::new(db.clone()),
            db,
            config,
            loader: JsonTestConfigLoader,
            worker_pid: std::process::id(),
            echo: false,
            shutdown: None,
        }
    }
}

impl<L: TestConfigLoader, St: SelectionStrategy> LoadTestPipeline<L, St> {
    #[must_use]
    pub fn with_loader<L2: TestConfigLoader>(self, loader: L2) -> LoadTestPipeline<L2, St> {
        LoadTestPipeline {
            db: self.db,
            config: self.config,
            loader,
            allocator: self.allocator,
            worker_pid: self.worker_pid,
            echo: self.echo,
            shutdown: self.shutdown,
        }
    }

    #[must_use]
    pub fn with_strategy<St2: SelectionStrategy>(self, strategy: St2) -> LoadTestPipeline<L, St2> {
        LoadTestPipeline {
            allocator: NodeAllocator::with_strategy(self.db.clone(), strategy),
            db: self.db,
            config: self.config,
            loader: self.loader,
            worker_pid: self.worker_pid,
            echo: self.echo,
            shutdown: self.shutdown,
        }
    }

    /// Record output under the job mapped to `pid` instead of this process.
    #[must_use]
    pub const fn with_worker_pid(mut self, pid: u32) -> Self {
        self.worker_pid = pid;
        self
    }

    /// Also copy step output to stdout.
    #[must_use]
    pub const fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Run `job`, returning its result payload.
    pub async fn run_job(&self, job: &Job) -> Result<serde_json::Value, JobError> {
        match &job.task {
            JobTask::RunLoadtest(args) => {
                let report_dir = self.run(&job.job_id, args).await?;
                Ok(serde_json::Value::String(report_dir.display().to_string()))
            }
        }
    }

    /// Run a load test and return its report directory.
    ///
    /// The redirector is killed and reserved nodes are released on every
    /// exit path. Output that could not be recorded fails the run.
    pub async fn run(&self, job_id: &str, args: &LoadTestArgs) -> Result<PathBuf, JobError> {
        let worker = &self.config.worker;
        let sink = ConsoleSink::for_pid(ConsoleBus::new(self.db.clone()), self.worker_pid)
            .with_echo(self.echo);
        let fault = sink.fault();
        let mut redirector = StreamRedirector::new(
            sink,
            RedirectorConfig {
                kill_grace: Duration::from_millis(worker.kill_grace_ms),
                ..RedirectorConfig::default()
            },
        );
        redirector.start()?;

        let mut reservation = None;
        let result = self
            .steps(&redirector, &fault, job_id, args, &mut reservation)
            .await;

        redirector.kill().await;
        let result = match fault.take().await {
            Some(e) if result.is_ok() => {
                error!(job_id, error = %e, "Console output lost while finishing");
                Err(JobError::Store(e))
            }
            _ => result,
        };

        let Some(reservation) = reservation else {
            return result;
        };
        match self.allocator.release(&reservation).await {
            Ok(_) => result,
            Err(e) => {
                error!(job_id, nodes = %reservation.workers(), error = %e, "Failed to release nodes");
                result.and(Err(e.into()))
            }
        }
    }

    async fn steps<S: ChunkSink>(
        &self,
        redirector: &StreamRedirector<S>,
        fault: &StoreFault,
        job_id: &str,
        args: &LoadTestArgs,
        reservation: &mut Option<Reservation>,
    ) -> Result<PathBuf, JobError> {
        let worker = &self.config.worker;
        let tools = &self.config.tools;

        let mut runner = JobRunner::new(redirector, &worker.workdir)
            .with_drain_timeout(Duration::from_millis(worker.drain_timeout_ms))
            .with_terminate_timeout(Duration::from_secs(worker.terminate_timeout_secs))
            .with_store_fault(fault.clone());
        if let Some(shutdown) = &self.shutdown {
            runner = runner.with_shutdown(shutdown.clone());
        }

        let checkout = self.checkout(&mut runner, &args.repo).await?;
        let test_config = self.loader.load(&checkout)?;
        let test_dir = match &test_config.wdir {
            Some(wdir) => checkout.join(wdir),
            None => checkout,
        };
        runner.set_cwd(&test_dir);

        runner.run_step(&tools.venv, StepPolicy::Required).await?;
        runner
            .run_step(
                &format!("{} {}", tools.installer, tools.loadtest_package),
                StepPolicy::Required,
            )
            .await?;
        for dep in &test_config.deps {
            runner
                .run_step(&format!("{} {dep}", tools.installer), StepPolicy::Required)
                .await?;
        }

        let nodes = args.nodes.or(test_config.nodes).unwrap_or(1);
        let mut log_dir = None;
        let mut env = Vec::new();
        let distribution = if nodes > 1 {
            let reserved = self
                .allocator
                .reserve(job_id, usize::try_from(nodes).unwrap_or(usize::MAX))
                .await?;
            let workers = reserved.workers();
            *reservation = Some(reserved);

            let dir = tempfile::Builder::new().prefix("marteau-").tempdir()?;
            let log_path = dir.path().to_path_buf();
            log_dir = Some(dir);
            env.push((NODES_ENV, workers.clone()));
            Some(Distribution { workers, log_path })
        } else {
            None
        };
        let env: Vec<(&str, &str)> = env.iter().map(|(k, v)| (*k, v.as_str())).collect();

        let report_dir = worker.reports_dir.join(job_id);
        let bench = bench_command(tools, &test_config, args, distribution.as_ref());
        let report = report_command(tools, &test_config, &report_dir, distribution.as_ref());

        runner
            .run_step_with_env(&bench, StepPolicy::Required, &env)
            .await?;
        runner
            .run_step_with_env(&report, StepPolicy::Required, &env)
            .await?;
        runner.finish();
        drop(log_dir);

        info!(job_id, report_dir = %report_dir.display(), "Load test finished");
        Ok(report_dir)
    }

    async fn checkout<S: ChunkSink>(
        &self,
        runner: &mut JobRunner<'_, S>,
        repo: &str,
    ) -> Result<PathBuf, JobError> {
        let local = Path::new(repo);
        if local.is_dir() {
            return Ok(local.to_path_buf());
        }

        let git = &self.config.tools.git;
        let workdir = &self.config.worker.workdir;
        let name = checkout_name(repo)
            .ok_or_else(|| JobError::Config(format!("Cannot derive a checkout name from {repo}")))?;
        let target = workdir.join(name);

        if target.is_dir() {
            runner.set_cwd(&target);
            runner
                .run_step(&format!("{git} pull"), StepPolicy::Required)
                .await?;
        } else {
            runner.set_cwd(workdir);
            runner
                .run_step(&format!("{git} clone {repo}"), StepPolicy::Optional)
                .await?;
        }
        Ok(target)
    }
}

/// Directory name of a repository checkout: the last path segment, up to
/// its first dot.
pub fn checkout_name(repo: &str) -> Option<&str> {
    let segment = repo.trim_end_matches('/').rsplit('/').next()?;
    let name = segment.split('.').next()?;
    (!name.is_empty()).then_some(name)
}

/// Bench invocation: `<bench> [options] <script> <test>`.
pub fn bench_command(
    tools: &ToolConfig,
    test_config: &TestConfig,
    args: &LoadTestArgs,
    distribution: Option<&Distribution>,
) -> String {
    let mut cmd = tools.bench.clone();

    if let Some(dist) = distribution {
        cmd.push_str(&format!(" --distribute --distribute-workers={}", dist.workers));
        if !test_config.deps.is_empty() {
            cmd.push_str(&format!(
                " --distributed-packages=\"{}\"",
                test_config.deps.join(" ")
            ));
        }
        cmd.push_str(&format!(
            " --distributed-log-path={}",
            dist.log_path.display()
        ));
    }
    if let Some(cycles) = &args.cycles {
        cmd.push_str(&format!(" --cycles={cycles}"));
    }
    if let Some(duration) = args.duration {
        cmd.push_str(&format!(" --duration={duration}"));
    }

    format!("{cmd} {} {}", test_config.script, test_config.test)
}

/// Report invocation over the bench output.
///
/// Distributed runs read every XML file the nodes wrote to the log path.
pub fn report_command(
    tools: &ToolConfig,
    test_config: &TestConfig,
    report_dir: &Path,
    distribution: Option<&Distribution>,
) -> String {
    let target = distribution.map_or_else(
        || test_config.xml.clone(),
        |dist| dist.log_path.join("*.xml").display().to_string(),
    );
    format!(
        "{} --html -r {} {target}",
        tools.report,
        report_dir.display()
    )
}
