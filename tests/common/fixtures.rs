// Namespace fixtures shared by the integration tests

use crate::common::cluster_sim::SimCluster;
use strata_mds::mds::{ClientOp, ReplyBody};
use strata_mds::types::{InodeId, NodeId};

pub fn mkdir(path: &str) -> ClientOp {
    ClientOp::Mkdir {
        path: path.to_string(),
        mode: 0o755,
    }
}

pub fn create(path: &str) -> ClientOp {
    ClientOp::Create {
        path: path.to_string(),
        mode: 0o644,
    }
}

pub fn stat(path: &str) -> ClientOp {
    ClientOp::Stat {
        path: path.to_string(),
    }
}

pub fn lookup(path: &str) -> ClientOp {
    ClientOp::Lookup {
        path: path.to_string(),
    }
}

pub fn readdir(path: &str) -> ClientOp {
    ClientOp::Readdir {
        path: path.to_string(),
    }
}

pub fn unlink(path: &str) -> ClientOp {
    ClientOp::Unlink {
        path: path.to_string(),
    }
}

pub fn rename(src: &str, dst: &str) -> ClientOp {
    ClientOp::Rename {
        src: src.to_string(),
        dst: dst.to_string(),
    }
}

pub fn chmod(path: &str, mode: u32) -> ClientOp {
    ClientOp::SetAttr {
        path: path.to_string(),
        mode: Some(mode),
        uid: None,
        gid: None,
    }
}

/// Make directory `dir` on `node` holding files `f0..f{count}`.
/// Returns the directory's inode.
pub fn populate(sim: &mut SimCluster, node: NodeId, dir: &str, count: usize) -> InodeId {
    let ino = match sim.ok(node, mkdir(dir)) {
        ReplyBody::Inode { ino, .. } => ino,
        other => panic!("mkdir {} returned {:?}", dir, other),
    };
    for i in 0..count {
        sim.ok(node, create(&format!("{}/f{}", dir, i)));
    }
    ino
}

/// Names returned by a readdir reply.
pub fn names(body: &ReplyBody) -> Vec<String> {
    match body {
        ReplyBody::Entries(entries) => entries.iter().map(|e| e.name.clone()).collect(),
        other => panic!("expected entries, got {:?}", other),
    }
}

/// Mode bits of a stat or lookup reply.
pub fn mode_of(body: &ReplyBody) -> u32 {
    match body {
        ReplyBody::Inode { attrs, .. } => attrs.mode,
        other => panic!("expected an inode, got {:?}", other),
    }
}
