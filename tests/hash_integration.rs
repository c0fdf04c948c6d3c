//! Integration tests for hashing a directory over every node and back.

#[allow(dead_code)]
mod common;

use common::*;
use strata_mds::cluster::{AttributeStore, HashPlacement, Placement};
use strata_mds::error::ErrorKind;
use strata_mds::mds::messages::HashMessage;
use strata_mds::mds::{MdsMessage, ReplyBody};
use strata_mds::types::{DirAuthority, InodeId, NodeId};

const FILES: usize = 12;

fn owner(dir: InodeId, name: &str) -> NodeId {
    HashPlacement::new(vec![0, 1, 2]).unwrap().authority_for(dir, name)
}

fn sorted_names(count: usize) -> Vec<String> {
    let mut names: Vec<String> = (0..count).map(|i| format!("f{}", i)).collect();
    names.sort();
    names
}

fn hashed_dir(sim: &mut SimCluster) -> InodeId {
    let h = populate(sim, 0, "/h", FILES);
    sim.hash(0, h);
    h
}

// =============================================================================
// Hash
// =============================================================================

#[test]
fn test_hash_spreads_entries() {
    let mut sim = three_nodes();
    let h = hashed_dir(&mut sim);

    assert_hashed_everywhere(&sim, h);
    assert_quiescent(&sim);

    // Each entry lives on its placement owner
    let mut owners = std::collections::BTreeSet::new();
    for i in 0..FILES {
        let name = format!("f{}", i);
        let node = owner(h, &name);
        owners.insert(node);
        let ino = sim.node(node).lookup_cached(&format!("/h/{}", name));
        assert!(ino.is_some(), "mds{} is missing its shard entry {}", node, name);
        assert_eq!(sim.node(node).cache().get_or_null(ino.unwrap()).unwrap().authority, node);
    }
    assert!(owners.len() > 1, "placement put every entry on one node");
}

#[test]
fn test_hashed_readdir_gathers_every_shard() {
    let mut sim = three_nodes();
    let h = hashed_dir(&mut sim);

    for node in 0..3 {
        let listed = names(&sim.ok(node, readdir("/h")));
        assert_eq!(listed, sorted_names(FILES), "readdir on mds{}", node);
    }
    assert!(sim.node(1).topology().is_hashed(h));

    sim.settle();
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}

#[test]
fn test_hashed_entries_resolve_everywhere() {
    let mut sim = three_nodes();
    hashed_dir(&mut sim);

    for i in 0..FILES {
        let path = format!("/h/f{}", i);
        let expected = sim.ino(0, &path);
        for node in 1..3 {
            match sim.ok(node, stat(&path)) {
                ReplyBody::Inode { ino, attrs } => {
                    assert_eq!(ino, expected);
                    assert_eq!(attrs.mode, 0o644);
                }
                other => panic!("unexpected reply {:?}", other),
            }
        }
    }
}

#[test]
fn test_create_and_unlink_in_hashed_dir() {
    let mut sim = three_nodes();
    let h = hashed_dir(&mut sim);

    for name in ["new", "other", "third"] {
        let reply = sim.call(2, create(&format!("/h/{}", name)));
        assert_eq!(reply.served_by, owner(h, name), "create of {}", name);
        assert!(reply.result.is_ok());
    }
    assert_eq!(sim.err(1, create("/h/new")), ErrorKind::AlreadyExists);

    let reply = sim.call(0, unlink("/h/f3"));
    assert_eq!(reply.served_by, owner(h, "f3"));
    assert_eq!(sim.err(1, stat("/h/f3")), ErrorKind::NotFound);

    let listed = names(&sim.ok(1, readdir("/h")));
    assert_eq!(listed.len(), FILES + 2);
    assert!(listed.contains(&"third".to_string()));
    assert!(!listed.contains(&"f3".to_string()));
}

#[test]
fn test_request_during_hash_waits_for_unfreeze() {
    let mut sim = three_nodes();
    let h = populate(&mut sim, 0, "/h", FILES);

    sim.hold_when(|m| matches!(&m.msg, MdsMessage::Hash(HashMessage::HashDir { .. })));
    sim.node_mut(0).hash_dir(h).unwrap();
    sim.run();
    assert!(!sim.held().is_empty());

    let id = sim.submit(0, create("/h/late"));
    sim.run();
    assert!(sim.reply(id).is_none());

    sim.release_held();
    let reply = sim.wait_reply(id);
    assert!(reply.result.is_ok());
    assert_eq!(reply.served_by, owner(h, "late"));

    sim.settle();
    assert_hashed_everywhere(&sim, h);
    assert_quiescent(&sim);
}

// =============================================================================
// Unhash
// =============================================================================

#[test]
fn test_unhash_restores_single_owner() {
    let mut sim = three_nodes();
    let h = hashed_dir(&mut sim);
    sim.ok(1, create("/h/extra"));

    sim.unhash(0, h);

    assert_dir_owner(&sim, h, 0);
    for (id, node) in &sim.nodes {
        assert!(!node.topology().is_hashed(h), "mds{} still sees {} hashed", id, h);
    }
    assert_quiescent(&sim);

    let reply = sim.call(2, readdir("/h"));
    assert_eq!(reply.served_by, 0);
    let mut expected = sorted_names(FILES);
    expected.push("extra".to_string());
    expected.sort();
    assert_eq!(names(&reply.result.unwrap()), expected);

    assert_eq!(mode_of(&sim.ok(2, stat("/h/extra"))), 0o644);
    assert_eq!(sim.call(1, create("/h/post")).served_by, 0);

    sim.settle();
    assert_no_request_pins(&sim);
}

#[test]
fn test_hash_unhash_cycle() {
    let mut sim = three_nodes();
    let h = hashed_dir(&mut sim);
    sim.unhash(0, h);
    sim.hash(0, h);
    assert_hashed_everywhere(&sim, h);
    assert_eq!(names(&sim.ok(2, readdir("/h"))), sorted_names(FILES));
    sim.unhash(0, h);
    assert_dir_owner(&sim, h, 0);
    assert_quiescent(&sim);
}

// =============================================================================
// Refusals
// =============================================================================

#[test]
fn test_hash_refusals() {
    let mut sim = three_nodes();
    let h = hashed_dir(&mut sim);
    let e = populate(&mut sim, 0, "/e", 1);
    sim.export(0, e, 1);

    let kind = |r: strata_mds::Result<()>| r.unwrap_err().kind();
    assert_eq!(kind(sim.node_mut(0).hash_dir(h)), ErrorKind::InvalidOperation);
    assert_eq!(kind(sim.node_mut(0).export_dir(h, 1)), ErrorKind::Conflict);
    assert_eq!(kind(sim.node_mut(0).unhash_dir(e)), ErrorKind::InvalidOperation);
    assert_eq!(
        kind(sim.node_mut(1).unhash_dir(h)),
        ErrorKind::NotAuthoritative(Some(0))
    );
    assert_eq!(
        kind(sim.node_mut(0).hash_dir(e)),
        ErrorKind::NotAuthoritative(Some(1))
    );
    // An import root stays whole
    assert_eq!(kind(sim.node_mut(1).hash_dir(e)), ErrorKind::Conflict);

    sim.settle();
    assert_quiescent(&sim);
}

// =============================================================================
// Replays
// =============================================================================

/// Per node: authority, hashed flag, freeze flag and linked entries of `dir`.
type Shape = Vec<(NodeId, Option<DirAuthority>, bool, bool, Vec<(String, InodeId)>)>;

fn shape(sim: &SimCluster, dir: InodeId) -> Shape {
    sim.nodes
        .iter()
        .map(|(id, node)| {
            let frag = node.cache().dir(dir);
            let mut linked: Vec<(String, InodeId)> = frag
                .map(|d| d.linked().map(|(name, ino)| (name.clone(), ino)).collect())
                .unwrap_or_default();
            linked.sort();
            (
                *id,
                node.dir_authority(dir),
                node.topology().is_hashed(dir),
                frag.map(|d| d.is_frozen() || d.is_freezing()).unwrap_or(false),
                linked,
            )
        })
        .collect()
}

/// Deliver every logged hash message a second time.
fn replay_hash_traffic(sim: &mut SimCluster) -> usize {
    let logged: Vec<SimMessage> = sim
        .delivered()
        .into_iter()
        .filter(|m| matches!(m.msg, MdsMessage::Hash(_)))
        .collect();
    sim.clear_log();
    for m in &logged {
        sim.node_mut(m.to).proc_message(m.from, m.msg.clone());
    }
    sim.run();
    logged.len()
}

#[test]
fn test_replayed_hash_and_unhash_traffic_changes_nothing() {
    let mut sim = three_nodes();
    let h = populate(&mut sim, 0, "/h", FILES);

    sim.clear_log();
    sim.hash(0, h);
    let hashed = shape(&sim, h);
    let stored = sim.store.load_dir(h).unwrap();
    assert!(replay_hash_traffic(&mut sim) > 0);
    sim.settle();
    assert_eq!(shape(&sim, h), hashed);
    assert_eq!(sim.store.load_dir(h).unwrap(), stored);
    assert_hashed_everywhere(&sim, h);
    assert_eq!(names(&sim.ok(1, readdir("/h"))), sorted_names(FILES));

    sim.clear_log();
    sim.unhash(0, h);
    let unhashed = shape(&sim, h);
    assert!(replay_hash_traffic(&mut sim) > 0);
    sim.settle();
    assert_eq!(shape(&sim, h), unhashed);
    assert_eq!(sim.store.load_dir(h).unwrap(), stored);
    assert_dir_owner(&sim, h, 0);
    assert_quiescent(&sim);

    let reply = sim.call(2, readdir("/h"));
    assert_eq!(reply.served_by, 0);
    assert_eq!(names(&reply.result.unwrap()), sorted_names(FILES));
}
