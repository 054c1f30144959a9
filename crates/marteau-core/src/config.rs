//! Configuration resolution for Marteau.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/marteau/settings.json)
//! 3. Project config (.marteau/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Marteau configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub tools: ToolConfig,
}

/// Job worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Directory where remote repositories are checked out.
    pub workdir: PathBuf,
    /// Directory where HTML reports are generated, one sub-directory per job.
    pub reports_dir: PathBuf,
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    /// Retention of job results and consoles after a terminal transition.
    pub result_ttl_secs: u64,
    /// Upper bound for stopping the output redirector.
    pub kill_grace_ms: u64,
    /// How long a step waits for its output streams to reach EOF after exit.
    pub drain_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL for a cancelled step.
    pub terminate_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("/tmp"),
            reports_dir: PathBuf::from("/tmp"),
            database_path: None,
            log_level: "info".to_string(),
            result_ttl_secs: 3600,
            kill_grace_ms: 2000,
            drain_timeout_ms: 5000,
            terminate_timeout_secs: 5,
        }
    }
}

/// External commands used by the load-test pipeline.
///
/// Each entry is a shell fragment; arguments are appended by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub git: String,
    pub venv: String,
    pub installer: String,
    pub bench: String,
    pub report: String,
    /// Package providing the bench and report tools.
    pub loadtest_package: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
            venv: "virtualenv --no-site-packages .".to_string(),
            installer: "bin/pip install".to_string(),
            bench: "bin/fl-run-bench".to_string(),
            report: "bin/fl-build-report".to_string(),
            loadtest_package: "funkload".to_string(),
        }
    }
}

/// One settings file. Only the keys it sets override lower layers.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    worker: WorkerFile,
    tools: ToolFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WorkerFile {
    workdir: Option<PathBuf>,
    reports_dir: Option<PathBuf>,
    database_path: Option<PathBuf>,
    log_level: Option<String>,
    result_ttl_secs: Option<u64>,
    kill_grace_ms: Option<u64>,
    drain_timeout_ms: Option<u64>,
    terminate_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ToolFile {
    git: Option<String>,
    venv: Option<String>,
    installer: Option<String>,
    bench: Option<String>,
    report: Option<String>,
    loadtest_package: Option<String>,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = resolve_files(global_config_path().as_deref(), project_dir)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Defaults, then the global file, then the project file.
fn resolve_files(global_path: Option<&Path>, project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_path.filter(|p| p.exists()) {
        merge_config(&mut config, load_config_file(global_path)?);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".marteau").join("settings.json");
        if project_path.exists() {
            merge_config(&mut config, load_config_file(&project_path)?);
        }
    }

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/marteau/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("marteau").join("settings.json"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Get the default path of the shared job/node database.
pub fn database_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/marteau/marteau.db"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_DATA_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".local").join("share"))
            })
            .map(|p| p.join("marteau").join("marteau.db"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: ConfigFile) {
    fn set<T>(slot: &mut T, value: Option<T>) {
        if let Some(value) = value {
            *slot = value;
        }
    }

    let (worker, file) = (&mut base.worker, overlay.worker);
    set(&mut worker.workdir, file.workdir);
    set(&mut worker.reports_dir, file.reports_dir);
    if file.database_path.is_some() {
        worker.database_path = file.database_path;
    }
    set(&mut worker.log_level, file.log_level);
    set(&mut worker.result_ttl_secs, file.result_ttl_secs);
    set(&mut worker.kill_grace_ms, file.kill_grace_ms);
    set(&mut worker.drain_timeout_ms, file.drain_timeout_ms);
    set(&mut worker.terminate_timeout_secs, file.terminate_timeout_secs);

    let (tools, file) = (&mut base.tools, overlay.tools);
    set(&mut tools.git, file.git);
    set(&mut tools.venv, file.venv);
    set(&mut tools.installer, file.installer);
    set(&mut tools.bench, file.bench);
    set(&mut tools.report, file.report);
    set(&mut tools.loadtest_package, file.loadtest_package);
}

fn apply_env_overrides(config: &mut Config) -> Result<()> {
    let worker = &mut config.worker;
    if let Some(val) = env_var("MARTEAU_WORKDIR") {
        worker.workdir = PathBuf::from(val);
    }
    if let Some(val) = env_var("MARTEAU_REPORTS_DIR") {
        worker.reports_dir = PathBuf::from(val);
    }
    if let Some(val) = env_var("MARTEAU_DB_PATH") {
        worker.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = env_var("MARTEAU_LOG_LEVEL") {
        worker.log_level = val;
    }
    if let Some(n) = env_number("MARTEAU_RESULT_TTL")? {
        worker.result_ttl_secs = n;
    }
    if let Some(n) = env_number("MARTEAU_TERMINATE_TIMEOUT")? {
        worker.terminate_timeout_secs = n;
    }
    Ok(())
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_number(key: &'static str) -> Result<Option<u64>> {
    env_var(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| Error::InvalidSetting { key, value })
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_result_ttl_is_one_hour() {
        let config = Config::default();
        assert_eq!(config.worker.result_ttl_secs, 3600);
    }

    #[test]
    fn default_tools_drive_funkload() {
        let config = Config::default();
        assert_eq!(config.tools.loadtest_package, "funkload");
        assert_eq!(config.tools.git, "git");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"worker": {"workdir": "/srv/marteau"}}"#).unwrap();

        let config = resolve_files(Some(&path), None).unwrap();
        assert_eq!(config.worker.workdir, PathBuf::from("/srv/marteau"));
        assert_eq!(config.worker.result_ttl_secs, 3600);
        assert_eq!(config.tools.bench, "bin/fl-run-bench");
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_number_rejects_garbage() {
        let key = "MARTEAU_TEST_ENV_NUMBER";
        assert!(env_number(key).unwrap().is_none());
        // SAFETY: the key is private to this test.
        #[allow(unsafe_code)]
        unsafe {
            std::env::set_var(key, "soon");
        }
        assert!(matches!(
            env_number(key),
            Err(Error::InvalidSetting { key: "MARTEAU_TEST_ENV_NUMBER", .. })
        ));
        #[allow(unsafe_code)]
        unsafe {
            std::env::set_var(key, " 90 ");
        }
        assert_eq!(env_number(key).unwrap(), Some(90));
    }

    #[test]
    fn project_config_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".marteau")).unwrap();
        std::fs::write(
            dir.path().join(".marteau").join("settings.json"),
            r#"{"worker": {"reports_dir": "/var/reports"}, "tools": {"git": "/usr/bin/git"}}"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert_eq!(config.tools.git, "/usr/bin/git");
    }

    #[test]
    fn project_layer_keeps_unset_global_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let global = dir.path().join("global.json");
        std::fs::write(
            &global,
            r#"{"worker": {"workdir": "/srv/marteau", "result_ttl_secs": 60},
                "tools": {"bench": "/opt/bench"}}"#,
        )
        .unwrap();
        let project = dir.path().join("project");
        std::fs::create_dir_all(project.join(".marteau")).unwrap();
        std::fs::write(
            project.join(".marteau").join("settings.json"),
            r#"{"worker": {"reports_dir": "/var/reports"}, "tools": {"git": "/usr/bin/git"}}"#,
        )
        .unwrap();

        let config = resolve_files(Some(&global), Some(&project)).unwrap();
        assert_eq!(config.worker.workdir, PathBuf::from("/srv/marteau"));
        assert_eq!(config.worker.result_ttl_secs, 60);
        assert_eq!(config.worker.reports_dir, PathBuf::from("/var/reports"));
        assert_eq!(config.tools.bench, "/opt/bench");
        assert_eq!(config.tools.git, "/usr/bin/git");
        assert_eq!(config.tools.report, "bin/fl-build-report");
    }
}
