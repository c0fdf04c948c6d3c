//! Randomised request sequences against a simulated cluster.
//!
//! Every run is seeded, so a failure reproduces by re-running the seed.

#[allow(dead_code)]
mod common;

use common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata_mds::error::ErrorKind;
use strata_mds::mds::{ClientOp, ReplyBody};

const PATHS: &[&str] = &[
    "/a", "/b", "/x", "/a/x", "/a/y", "/a/c", "/a/c/x", "/b/x", "/b/y", "/b/c",
];

fn pick<'a>(rng: &mut StdRng, pool: &[&'a str]) -> &'a str {
    pool[rng.gen_range(0..pool.len())]
}

fn random_op(rng: &mut StdRng) -> ClientOp {
    let path = pick(rng, PATHS);
    match rng.gen_range(0..9) {
        0 => mkdir(path),
        1 => create(path),
        2 => stat(path),
        3 => lookup(path),
        4 => readdir(path),
        5 => unlink(path),
        6 => rename(path, pick(rng, PATHS)),
        7 => chmod(path, 0o700 | rng.gen_range(0..0o100)),
        _ => ClientOp::Write {
            path: path.to_string(),
            size: rng.gen_range(0..1 << 20),
            mtime: rng.gen_range(1..1000),
        },
    }
}

/// Failures a single client may legitimately see on this namespace.
fn expected_error(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::NotFound
            | ErrorKind::NotADirectory
            | ErrorKind::DirectoryNotEmpty
            | ErrorKind::AlreadyExists
            | ErrorKind::InvalidOperation
    )
}

/// A replica never resolves a path to something its authority does not.
fn assert_replicas_coherent(sim: &mut SimCluster) {
    for path in PATHS {
        let authoritative = match sim.call(0, lookup(path)).result {
            Ok(ReplyBody::Inode { ino, .. }) => Some(ino),
            Ok(other) => panic!("lookup of {} returned {:?}", path, other),
            Err(_) => None,
        };
        for node in [1, 2] {
            if let Some(cached) = sim.node(node).lookup_cached(path) {
                assert_eq!(
                    Some(cached),
                    authoritative,
                    "mds{} caches a stale binding for {}",
                    node,
                    path
                );
            }
        }
    }
}

fn run_seed(seed: u64, ops: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sim = three_nodes();
    let mut succeeded = 0;

    for step in 0..ops {
        let node = rng.gen_range(0..3);
        let op = random_op(&mut rng);
        let desc = format!("seed {} step {}: {:?} on mds{}", seed, step, op, node);
        match sim.call(node, op).result {
            Ok(_) => succeeded += 1,
            Err(kind) => assert!(expected_error(kind), "{} failed with {:?}", desc, kind),
        }
    }
    assert!(succeeded > 0, "seed {} never succeeded", seed);

    sim.settle();
    assert_quiescent(&sim);
    assert_no_request_pins(&sim);
    assert_replicas_coherent(&mut sim);
}

// =============================================================================
// Seeds
// =============================================================================

#[test]
fn test_fuzz_seed_1() {
    run_seed(1, 150);
}

#[test]
fn test_fuzz_seed_42() {
    run_seed(42, 150);
}

#[test]
fn test_fuzz_seed_1234() {
    run_seed(1234, 150);
}

#[test]
fn test_fuzz_long_run() {
    run_seed(0xfeed, 400);
}
