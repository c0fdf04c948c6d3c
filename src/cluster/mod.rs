//! Cluster collaborators of the metadata cache.
//!
//! This module provides:
//! - Dentry placement for hashed directories
//! - The transport and attribute store seams the cache core is written against
//! - An in-process tokio cluster for development and tests

mod local;
mod placement;
mod transport;

pub use local::{ClusterHandle, LocalCluster};
pub use placement::{HashPlacement, Placement};
pub use transport::{
    AdminOp, AttributeStore, ChannelTransport, Envelope, MemoryStore, ReplyRouter, Transport,
};
