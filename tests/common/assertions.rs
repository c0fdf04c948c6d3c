// Cluster-wide invariant checks

use crate::common::cluster_sim::SimCluster;
use strata_mds::types::{DirAuthority, InodeId, NodeId};

/// Nothing is pending, waiting, frozen or in flight anywhere.
pub fn assert_quiescent(sim: &SimCluster) {
    for (id, node) in &sim.nodes {
        assert!(node.is_quiescent(), "mds{} is not quiescent", id);
        assert_eq!(node.requests().active_count(), 0, "mds{} has active requests", id);
        assert!(node.topology().is_consistent(), "mds{} topology inconsistent", id);
    }
}

/// No cached object on any node is still pinned by a request.
pub fn assert_no_request_pins(sim: &SimCluster) {
    for (id, node) in &sim.nodes {
        for dir in node.cache().dirs() {
            for (name, dn) in &dir.entries {
                assert_eq!(dn.pins(), 0, "mds{} dentry {}/{} still pinned", id, dir.ino, name);
                assert!(
                    dn.lock.xlock_by.is_none(),
                    "mds{} dentry {}/{} still xlocked",
                    id,
                    dir.ino,
                    name
                );
            }
        }
    }
}

/// Every node that caches `dir`'s fragment agrees it lives on `owner`.
pub fn assert_dir_owner(sim: &SimCluster, dir: InodeId, owner: NodeId) {
    let expected = DirAuthority::Node(owner);
    for (id, node) in &sim.nodes {
        if let Some(authority) = node.dir_authority(dir) {
            assert_eq!(authority, expected, "mds{} disagrees on owner of {}", id, dir);
        }
    }
}

/// Every node caching `dir`'s fragment sees it hashed.
pub fn assert_hashed_everywhere(sim: &SimCluster, dir: InodeId) {
    for (id, node) in &sim.nodes {
        assert_eq!(
            node.dir_authority(dir),
            Some(DirAuthority::Hashed),
            "mds{} does not see {} hashed",
            id,
            dir
        );
        assert!(node.topology().is_hashed(dir), "mds{} topology misses hashed {}", id, dir);
    }
}

/// Index of the first delivered message matching `pred`.
pub fn position<F>(sim: &SimCluster, pred: F) -> Option<usize>
where
    F: Fn(&crate::common::cluster_sim::SimMessage) -> bool,
{
    sim.delivered().iter().position(pred)
}
