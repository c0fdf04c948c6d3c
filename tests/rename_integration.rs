//! Integration tests for rename, within one node and across nodes.

#[allow(dead_code)]
mod common;

use common::*;
use strata_mds::cluster::AttributeStore;
use strata_mds::error::ErrorKind;
use strata_mds::mds::messages::RenameMessage;
use strata_mds::mds::{MdsMessage, ReplyBody};
use strata_mds::types::InodeId;

fn is_rename(m: &SimMessage, f: impl Fn(&RenameMessage) -> bool) -> bool {
    matches!(&m.msg, MdsMessage::Rename(r) if f(r))
}

fn created(body: ReplyBody) -> InodeId {
    match body {
        ReplyBody::Inode { ino, .. } => ino,
        other => panic!("unexpected reply {:?}", other),
    }
}

/// `/a` owned by mds1 and `/b` by mds2; `/a/f` was created on mds0, which
/// keeps replicas of both.
fn split_namespace(sim: &mut SimCluster) -> (InodeId, InodeId, InodeId) {
    let a = created(sim.ok(0, mkdir("/a")));
    let b = created(sim.ok(0, mkdir("/b")));
    let f = created(sim.ok(0, create("/a/f")));
    sim.export(0, a, 1);
    sim.export(0, b, 2);
    (a, b, f)
}

// =============================================================================
// Local rename
// =============================================================================

#[test]
fn test_local_rename() {
    let mut sim = three_nodes();
    let a = created(sim.ok(0, mkdir("/a")));
    let f = created(sim.ok(0, create("/a/f")));
    sim.ok(1, stat("/a/f"));

    assert_eq!(sim.ok(1, rename("/a/f", "/a/g")), ReplyBody::Done);

    assert_eq!(sim.err(2, stat("/a/f")), ErrorKind::NotFound);
    assert_eq!(sim.ino(2, "/a/g"), f);
    assert_eq!(sim.node(1).lookup_cached("/a/f"), None);
    assert_eq!(sim.node(1).lookup_cached("/a/g"), Some(f));
    let listing = sim.store.load_dir(a).unwrap();
    assert_eq!(listing, vec![("g".to_string(), f)]);

    sim.settle();
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}

#[test]
fn test_rename_moves_directory_with_contents() {
    let mut sim = three_nodes();
    populate(&mut sim, 0, "/src", 3);
    sim.ok(0, mkdir("/dst"));

    assert_eq!(sim.ok(2, rename("/src", "/dst/moved")), ReplyBody::Done);
    assert_eq!(names(&sim.ok(1, readdir("/dst/moved"))), vec!["f0", "f1", "f2"]);
    assert_eq!(sim.err(1, readdir("/src")), ErrorKind::NotFound);
}

#[test]
fn test_rename_errors() {
    let mut sim = three_nodes();
    sim.ok(0, mkdir("/a"));
    sim.ok(0, mkdir("/a/sub"));
    sim.ok(0, create("/a/f"));
    sim.ok(0, create("/a/g"));

    assert_eq!(sim.err(1, rename("/a", "/a/sub/x")), ErrorKind::InvalidOperation);
    assert_eq!(sim.err(0, rename("/a", "/a/x")), ErrorKind::InvalidOperation);
    assert_eq!(sim.err(0, rename("/a/f", "/a/g")), ErrorKind::AlreadyExists);
    assert_eq!(sim.err(2, rename("/a/missing", "/a/x")), ErrorKind::NotFound);
    assert_eq!(sim.err(0, rename("/a/f", "/nope/x")), ErrorKind::NotFound);
    assert_eq!(sim.err(0, rename("/a/f", "/a/g/x")), ErrorKind::NotADirectory);
    // Renaming onto itself is a no-op
    assert_eq!(sim.ok(0, rename("/a/f", "/a/f")), ReplyBody::Done);

    sim.settle();
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}

// =============================================================================
// Rename across nodes
// =============================================================================

#[test]
fn test_cross_node_rename() {
    let mut sim = three_nodes();
    let (a, b, f) = split_namespace(&mut sim);
    sim.clear_log();

    let reply = sim.call(1, rename("/a/f", "/b/g"));
    assert_eq!(reply.served_by, 1);
    assert_eq!(reply.result, Ok(ReplyBody::Done));

    // The bystander hears about the link before the unlink
    let warned = position(&sim, |m| {
        m.to == 0 && is_rename(m, |r| matches!(r, RenameMessage::Warning { .. }))
    })
    .unwrap();
    let notified = position(&sim, |m| {
        m.to == 0 && is_rename(m, |r| matches!(r, RenameMessage::Notify { .. }))
    })
    .unwrap();
    assert!(warned < notified);

    assert_eq!(sim.node(2).lookup_cached("/b/g"), Some(f));
    assert_eq!(sim.node(2).cache().get_or_null(f).unwrap().authority, 2);
    assert_eq!(sim.node(1).lookup_cached("/a/f"), None);
    assert_eq!(sim.node(0).lookup_cached("/a/f"), None);
    assert_eq!(sim.node(0).lookup_cached("/b/g"), Some(f));

    assert!(sim.store.load_dir(a).unwrap().is_empty());
    assert_eq!(sim.store.load_dir(b).unwrap(), vec![("g".to_string(), f)]);

    for node in 0..3 {
        assert_eq!(sim.ino(node, "/b/g"), f);
        assert_eq!(sim.err(node, stat("/a/f")), ErrorKind::NotFound);
    }

    sim.settle();
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}

#[test]
fn test_cross_node_rename_onto_existing_entry() {
    let mut sim = three_nodes();
    let (_, _, f) = split_namespace(&mut sim);
    sim.ok(2, create("/b/taken"));

    assert_eq!(sim.err(1, rename("/a/f", "/b/taken")), ErrorKind::AlreadyExists);
    assert_eq!(sim.ino(1, "/a/f"), f);
    assert_eq!(sim.ino(0, "/a/f"), f);

    sim.settle();
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}

#[test]
fn test_bystander_lookup_waits_for_rename() {
    let mut sim = three_nodes();
    split_namespace(&mut sim);

    sim.hold_when(|m| m.to == 0 && is_rename(m, |r| matches!(r, RenameMessage::Notify { .. })));
    let rename_id = sim.submit(1, rename("/a/f", "/b/g"));
    sim.run();
    assert!(sim.reply(rename_id).is_none());
    assert_eq!(sim.held().len(), 1);

    let lookup_id = sim.submit(0, lookup("/a/f"));
    sim.run();
    assert!(sim.reply(lookup_id).is_none());

    sim.release_held();
    assert_eq!(sim.wait_reply(rename_id).result, Ok(ReplyBody::Done));
    assert_eq!(sim.wait_reply(lookup_id).result, Err(ErrorKind::NotFound));

    sim.settle();
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}

// =============================================================================
// Overlapping renames
// =============================================================================

#[test]
fn test_competing_renames_of_one_entry() {
    let mut sim = three_nodes();
    let (_, b, f) = split_namespace(&mut sim);

    let first = sim.submit(1, rename("/a/f", "/b/g"));
    let second = sim.submit(0, rename("/a/f", "/b/k"));
    sim.settle();

    let results = [sim.wait_reply(first).result, sim.wait_reply(second).result];
    let done = results.iter().filter(|r| **r == Ok(ReplyBody::Done)).count();
    let missing = results.iter().filter(|r| **r == Err(ErrorKind::NotFound)).count();
    assert_eq!((done, missing), (1, 1), "results {:?}", results);

    let winner = if results[0].is_ok() { "g" } else { "k" };
    let loser = if winner == "g" { "k" } else { "g" };
    assert_eq!(sim.store.load_dir(b).unwrap(), vec![(winner.to_string(), f)]);
    for node in 0..3 {
        assert_eq!(sim.ino(node, &format!("/b/{}", winner)), f);
        assert_eq!(sim.err(node, stat(&format!("/b/{}", loser))), ErrorKind::NotFound);
        assert_eq!(sim.err(node, stat("/a/f")), ErrorKind::NotFound);
    }

    sim.settle();
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}

#[test]
fn test_renames_sharing_a_bystander() {
    let mut sim = three_nodes();
    let (a, b, f) = split_namespace(&mut sim);
    let h = created(sim.ok(0, create("/a/h")));

    let first = sim.submit(1, rename("/a/f", "/b/g"));
    let second = sim.submit(1, rename("/a/h", "/b/i"));
    sim.settle();
    assert_eq!(sim.wait_reply(first).result, Ok(ReplyBody::Done));
    assert_eq!(sim.wait_reply(second).result, Ok(ReplyBody::Done));

    assert!(sim.store.load_dir(a).unwrap().is_empty());
    let mut moved = sim.store.load_dir(b).unwrap();
    moved.sort();
    assert_eq!(moved, vec![("g".to_string(), f), ("i".to_string(), h)]);
    for node in 0..3 {
        assert_eq!(names(&sim.ok(node, readdir("/b"))), vec!["g", "i"]);
        assert!(names(&sim.ok(node, readdir("/a"))).is_empty());
    }

    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}

#[test]
fn test_cross_node_directory_rename_keeps_its_fragment() {
    let mut sim = three_nodes();
    split_namespace(&mut sim);
    let d = created(sim.ok(1, mkdir("/a/d")));
    sim.ok(1, create("/a/d/x"));

    assert_eq!(sim.ok(1, rename("/a/d", "/b/d")), ReplyBody::Done);

    // The fragment stays on mds1 and becomes one of its subtree roots
    assert!(sim.node(1).topology().is_import(d));
    for node in 0..3 {
        assert_eq!(names(&sim.ok(node, readdir("/b/d"))), vec!["x"]);
        assert_eq!(sim.err(node, stat("/a/d")), ErrorKind::NotFound);
    }

    sim.settle();
    assert_no_request_pins(&sim);
}

// =============================================================================
// Lost messages
// =============================================================================

#[test]
fn test_lost_acks_never_undo_a_committed_rename() {
    let mut sim = three_nodes();
    let (a, b, f) = split_namespace(&mut sim);
    sim.drop_when(|m| is_rename(m, |r| matches!(r, RenameMessage::Ack { .. })));

    let id = sim.submit(1, rename("/a/f", "/b/g"));
    // Outlast every request resend and several cancels
    let protocol = sim.config.protocol.clone();
    sim.ticks((u64::from(protocol.max_resends) + 4) * protocol.ack_timeout_ticks);

    assert!(sim.reply(id).is_none());
    assert!(sim.dropped().len() > protocol.max_resends as usize + 1);
    assert_eq!(sim.store.load_dir(b).unwrap(), vec![("g".to_string(), f)]);
    assert_eq!(sim.node(2).lookup_cached("/b/g"), Some(f));

    sim.release_held();
    assert_eq!(sim.wait_reply(id).result, Ok(ReplyBody::Done));

    assert!(sim.store.load_dir(a).unwrap().is_empty());
    assert_eq!(sim.store.load_dir(b).unwrap(), vec![("g".to_string(), f)]);
    for node in 0..3 {
        assert_eq!(sim.ino(node, "/b/g"), f);
        assert_eq!(sim.err(node, stat("/a/f")), ErrorKind::NotFound);
    }

    sim.settle();
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}

#[test]
fn test_unheard_rename_is_cancelled() {
    let mut sim = three_nodes();
    let (a, b, f) = split_namespace(&mut sim);
    sim.drop_when(|m| is_rename(m, |r| matches!(r, RenameMessage::Request { .. })));

    let reply = sim.call(1, rename("/a/f", "/b/g"));
    assert_eq!(reply.result, Err(ErrorKind::Timeout));
    sim.release_held();

    assert_eq!(sim.store.load_dir(a).unwrap(), vec![("f".to_string(), f)]);
    assert!(sim.store.load_dir(b).unwrap().is_empty());
    for node in 0..3 {
        assert_eq!(sim.ino(node, "/a/f"), f);
        assert_eq!(sim.err(node, stat("/b/g")), ErrorKind::NotFound);
    }

    sim.settle();
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
}
