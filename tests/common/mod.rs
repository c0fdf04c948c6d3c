//! Common test utilities for integration tests.

pub mod assertions;
pub mod cluster_sim;
pub mod fixtures;

use std::path::PathBuf;
use strata_mds::config::MdsConfig;
use tempfile::TempDir;

// Re-export common types
pub use assertions::*;
pub use cluster_sim::*;
pub use fixtures::*;

/// Test error type
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

/// Test environment that manages temporary directories and cleanup.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub config_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config_dir = temp_dir.path().join("config");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");
        Self {
            temp_dir,
            config_dir,
        }
    }

    /// Write `config` as JSON and return its path.
    pub fn write_config(&self, name: &str, config: &MdsConfig) -> PathBuf {
        let path = self.config_dir.join(name);
        let json = serde_json::to_string_pretty(config).expect("Failed to encode config");
        std::fs::write(&path, json).expect("Failed to write config");
        path
    }

    /// Write raw text to a file in the config directory.
    pub fn write_raw(&self, name: &str, content: &str) -> PathBuf {
        let path = self.config_dir.join(name);
        std::fs::write(&path, content).expect("Failed to write file");
        path
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// A three-node simulation with the root on node 0.
pub fn three_nodes() -> SimCluster {
    SimCluster::new(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_creation() {
        let env = TestEnv::new();
        assert!(env.config_dir.exists());
    }

    #[test]
    fn test_sim_starts_quiet() {
        let sim = three_nodes();
        assert_eq!(sim.nodes.len(), 3);
        assert_quiescent(&sim);
    }
}
