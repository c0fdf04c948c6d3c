//! Dentry placement for hashed directories.
//!
//! A hashed fragment is split across every cluster member; each entry lives
//! on the node its `(dir, name)` hashes to. The function only has to be
//! deterministic and identical on every node.

use crate::error::{MdsError, Result};
use crate::types::{InodeId, NodeId};

/// Maps a directory entry to the node that owns it while the directory is
/// hashed.
pub trait Placement: Send + Sync {
    fn authority_for(&self, dir: InodeId, name: &str) -> NodeId;

    /// Every node that can own a shard.
    fn members(&self) -> &[NodeId];
}

/// CRC32 of the directory id and entry name, modulo the member count.
#[derive(Debug, Clone)]
pub struct HashPlacement {
    nodes: Vec<NodeId>,
}

impl HashPlacement {
    pub fn new(mut nodes: Vec<NodeId>) -> Result<Self> {
        nodes.sort_unstable();
        nodes.dedup();
        if nodes.is_empty() {
            return Err(MdsError::InvalidConfig {
                field: "cluster.nodes".to_string(),
                reason: "Placement needs at least one node".to_string(),
            });
        }
        Ok(Self { nodes })
    }

    fn bucket(dir: InodeId, name: &str) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&dir.to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.finalize()
    }
}

impl Placement for HashPlacement {
    fn authority_for(&self, dir: InodeId, name: &str) -> NodeId {
        let idx = Self::bucket(dir, name) as usize % self.nodes.len();
        self.nodes[idx]
    }

    fn members(&self) -> &[NodeId] {
        &self.nodes
    }
}
