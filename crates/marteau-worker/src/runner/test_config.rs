//! Load-test configuration shipped with a test repository.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::JobError;

/// File read from the checkout root by [`JsonTestConfigLoader`].
pub const TEST_CONFIG_FILE: &str = ".marteau.json";

/// How to run the load test of one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Sub-directory of the checkout holding the test.
    pub wdir: Option<String>,
    /// Extra packages installed into the environment.
    pub deps: Vec<String>,
    /// Node count when the job does not override it.
    pub nodes: Option<u32>,
    /// Bench script path.
    pub script: String,
    /// Test name passed to the bench.
    pub test: String,
    /// Bench output read by the report step in single-node runs.
    pub xml: String,
}

/// Loads the [`TestConfig`] of a checkout.
pub trait TestConfigLoader: Send + Sync {
    fn load(&self, checkout: &Path) -> Result<TestConfig, JobError>;
}

/// Reads `.marteau.json` from the checkout root.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTestConfigLoader;

impl TestConfigLoader for JsonTestConfigLoader {
    fn load(&self, checkout: &Path) -> Result<TestConfig, JobError> {
        let path = checkout.join(TEST_CONFIG_FILE);
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            JobError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| JobError::Config(format!("Failed to parse {}: {e}", path.display())))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn loads_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(TEST_CONFIG_FILE),
            r#"{"script": "test_simple.py", "test": "Simple.test_simple", "deps": ["requests"]}"#,
        )
        .unwrap();

        let config = JsonTestConfigLoader.load(dir.path()).unwrap();

        assert_eq!(config.script, "test_simple.py");
        assert_eq!(config.deps, vec!["requests"]);
        assert!(config.wdir.is_none());
        assert!(config.nodes.is_none());
    }

    #[test]
    fn missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            JsonTestConfigLoader.load(dir.path()),
            Err(JobError::Config(_))
        ));
    }
}
