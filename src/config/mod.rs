//! Configuration module for the Strata metadata server.

use crate::error::{MdsError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a metadata server node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MdsConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Cluster membership.
    pub cluster: ClusterConfig,
    /// Cache sizing.
    pub cache: CacheConfig,
    /// Protocol deadlines and limits.
    pub protocol: ProtocolConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl MdsConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MdsError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| MdsError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.nodes.is_empty() {
            return Err(MdsError::InvalidConfig {
                field: "cluster.nodes".to_string(),
                reason: "Cluster must contain at least one node".to_string(),
            });
        }

        if !self.cluster.nodes.contains(&self.node.id) {
            return Err(MdsError::InvalidConfig {
                field: "node.id".to_string(),
                reason: format!("Node {} is not a cluster member", self.node.id),
            });
        }

        if !self.cluster.nodes.contains(&self.cluster.root_node) {
            return Err(MdsError::InvalidConfig {
                field: "cluster.root_node".to_string(),
                reason: "Root node must be a cluster member".to_string(),
            });
        }

        if self.protocol.ack_timeout_ticks == 0 || self.protocol.freeze_timeout_ticks == 0 {
            return Err(MdsError::InvalidConfig {
                field: "protocol".to_string(),
                reason: "Timeouts must be non-zero".to_string(),
            });
        }

        if self.cache.max_inodes == 0 {
            return Err(MdsError::InvalidConfig {
                field: "cache.max_inodes".to_string(),
                reason: "Cache size must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal three-node development configuration for node `id`.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: 0,
                name: "dev-mds".to_string(),
            },
            cluster: ClusterConfig {
                nodes: vec![0, 1, 2],
                root_node: 0,
            },
            cache: CacheConfig {
                max_inodes: 10_000,
                completed_request_memory: 1024,
            },
            protocol: ProtocolConfig {
                tick_interval: Duration::from_millis(10),
                ..ProtocolConfig::default()
            },
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                json_logs: false,
            },
        }
    }

    /// Same configuration, viewed from another cluster member.
    pub fn for_node(&self, id: NodeId) -> Self {
        let mut config = self.clone();
        config.node.id = id;
        config.node.name = format!("{}-{}", self.node.name, id);
        config
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier.
    pub id: NodeId,
    /// Human-readable node name.
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            name: "strata-mds".to_string(),
        }
    }
}

/// Cluster membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// All metadata server ids.
    pub nodes: Vec<NodeId>,
    /// Node that is authoritative for the root inode.
    pub root_node: NodeId,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: vec![0],
            root_node: 0,
        }
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Target number of cached inodes.
    pub max_inodes: usize,
    /// Completed request ids remembered for duplicate suppression.
    pub completed_request_memory: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_inodes: 100_000,
            completed_request_memory: 4096,
        }
    }
}

/// Protocol deadlines and limits, in logical ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Wall-clock length of one tick for the runtime driver.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Ticks to wait for a peer acknowledgement.
    pub ack_timeout_ticks: u64,
    /// Ticks a freeze may wait for in-flight requests to drain.
    pub freeze_timeout_ticks: u64,
    /// Forwards allowed before a request fails with a timeout.
    pub max_forwards: u32,
    /// Symlinks followed during one path resolution.
    pub max_symlink_depth: u32,
    /// Ticks before a conflicted request is retried.
    pub retry_delay_ticks: u64,
    /// Re-sends of a committed message before giving up on a peer.
    pub max_resends: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            ack_timeout_ticks: 50,
            freeze_timeout_ticks: 100,
            max_forwards: 8,
            max_symlink_depth: 16,
            retry_delay_ticks: 2,
            max_resends: 3,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
