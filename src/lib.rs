//! Strata MDS - the metadata-server cache of the Strata filesystem.
//!
//! Every metadata server keeps a partially replicated, in-memory view of the
//! namespace (inodes, directory fragments, directory entries). Each fragment
//! is authoritative on exactly one node at a time; ownership moves between
//! nodes by export, is spread over all nodes by hashing and merged back by
//! unhashing, while replicas stay coherent through per-object locks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        MdsNode                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Protocols: Migrator | Hasher | Renamer                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Coordination: Locker | Request Tracker | Topology          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Cache: CInode | CDir | CDentry | two-segment LRU           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Collaborators: Transport | AttributeStore | Placement      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use strata_mds::config::MdsConfig;
//!
//! #[tokio::main]
//! async fn main() -> strata_mds::Result<()> {
//!     // Three nodes in one process
//!     let config = MdsConfig::development();
//!
//!     strata_mds::run(config).await
//! }
//! ```

pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod mds;
pub mod observability;
pub mod shutdown;
pub mod types;

// Re-exports
pub use error::{MdsError, Result};
pub use types::*;

use cluster::LocalCluster;
use config::MdsConfig;
use shutdown::{ShutdownCoordinator, SignalHandler};
use tracing::{info, warn};

/// Run every configured node as an in-process cluster until a stop signal.
pub async fn run(config: MdsConfig) -> Result<()> {
    observability::init(&config.observability)?;
    info!(
        "Starting Strata MDS cluster: {} node(s), root on mds{}",
        config.cluster.nodes.len(),
        config.cluster.root_node
    );

    let coordinator = ShutdownCoordinator::new();
    let cluster = LocalCluster::start_with(&config, coordinator.clone())?;

    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        SignalHandler::new(signal_coordinator).run().await;
    });

    coordinator.wait_for_shutdown().await;
    info!("Shutting down Strata MDS gracefully...");

    if !cluster.shutdown().await {
        warn!("Cluster did not drain before the timeout");
    }

    info!("Strata MDS shutdown complete");
    Ok(())
}
