//! Ownership topology of one node.
//!
//! `imports` are subtree roots this node is authoritative for although the
//! containing fragment belongs elsewhere; `exports` are fragments with an
//! export in flight; `hashdirs` are fragments currently sharded; `hashing`
//! are fragments with a hash or unhash in flight. `nested` maps each
//! subtree root to the exported or hashed fragments beneath it.
//!
//! The sets are disjoint by construction: every `begin_*` refuses a
//! fragment already present in a conflicting set with `Conflict`.

use crate::error::{MdsError, Result};
use crate::types::InodeId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

#[derive(Debug, Default, Clone)]
pub struct Topology {
    imports: BTreeSet<InodeId>,
    exports: BTreeSet<InodeId>,
    hashdirs: BTreeSet<InodeId>,
    hashing: BTreeSet<InodeId>,
    nested: BTreeMap<InodeId, BTreeSet<InodeId>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn imports(&self) -> &BTreeSet<InodeId> {
        &self.imports
    }

    pub fn exports(&self) -> &BTreeSet<InodeId> {
        &self.exports
    }

    pub fn hashdirs(&self) -> &BTreeSet<InodeId> {
        &self.hashdirs
    }

    pub fn hashing(&self) -> &BTreeSet<InodeId> {
        &self.hashing
    }

    pub fn nested_under(&self, root: InodeId) -> Option<&BTreeSet<InodeId>> {
        self.nested.get(&root)
    }

    pub fn is_import(&self, dir: InodeId) -> bool {
        self.imports.contains(&dir)
    }

    pub fn is_hashed(&self, dir: InodeId) -> bool {
        self.hashdirs.contains(&dir)
    }

    /// Whether an export, hash or unhash of `dir` is in flight.
    pub fn is_busy(&self, dir: InodeId) -> bool {
        self.exports.contains(&dir) || self.hashing.contains(&dir)
    }

    /// Every fragment with a structural operation in flight.
    pub fn in_flight(&self) -> impl Iterator<Item = InodeId> + '_ {
        self.exports.iter().chain(self.hashing.iter()).copied()
    }

    /// Returns `true` if the fragment was not already an import.
    pub fn add_import(&mut self, dir: InodeId) -> bool {
        let added = self.imports.insert(dir);
        if added {
            info!(dir, "subtree imported");
        }
        added
    }

    pub fn remove_import(&mut self, dir: InodeId) -> bool {
        let removed = self.imports.remove(&dir);
        if removed {
            self.nested.remove(&dir);
        }
        removed
    }

    pub fn begin_export(&mut self, dir: InodeId, root: InodeId) -> Result<()> {
        if self.exports.contains(&dir) {
            return Err(MdsError::Conflict(format!("export of {} already in flight", dir)));
        }
        if self.hashdirs.contains(&dir) || self.hashing.contains(&dir) {
            return Err(MdsError::Conflict(format!("{} is hashed or being hashed", dir)));
        }
        self.exports.insert(dir);
        self.nested.entry(root).or_default().insert(dir);
        Ok(())
    }

    /// Drop an export from the topology. A finished export also stops
    /// the fragment from being one of our imports.
    pub fn end_export(&mut self, dir: InodeId, exported: bool) {
        self.exports.remove(&dir);
        self.unnest(dir);
        if exported && self.imports.remove(&dir) {
            self.nested.remove(&dir);
        }
    }

    /// Start a hash (`to_hashed`) or unhash of `dir`.
    pub fn begin_hash(&mut self, dir: InodeId, root: InodeId, to_hashed: bool) -> Result<()> {
        if self.exports.contains(&dir) || self.hashing.contains(&dir) {
            return Err(MdsError::Conflict(format!("{} has an operation in flight", dir)));
        }
        if to_hashed && self.imports.contains(&dir) {
            return Err(MdsError::Conflict(format!("{} is an import root", dir)));
        }
        if to_hashed == self.hashdirs.contains(&dir) {
            return Err(MdsError::InvalidOperation(format!(
                "{} is {}hashed",
                dir,
                if to_hashed { "already " } else { "not " }
            )));
        }
        self.hashing.insert(dir);
        self.nested.entry(root).or_default().insert(dir);
        Ok(())
    }

    /// Finish or abort a hash/unhash; `hashed` is the resulting state.
    pub fn end_hash(&mut self, dir: InodeId, hashed: bool) {
        self.hashing.remove(&dir);
        if hashed {
            self.hashdirs.insert(dir);
        } else {
            self.hashdirs.remove(&dir);
            self.unnest(dir);
        }
    }

    /// Record a fragment hashed by another node.
    pub fn note_hashed(&mut self, dir: InodeId, root: InodeId, hashed: bool) {
        if hashed {
            self.hashdirs.insert(dir);
            self.nested.entry(root).or_default().insert(dir);
        } else {
            self.hashdirs.remove(&dir);
            self.unnest(dir);
        }
    }

    fn unnest(&mut self, dir: InodeId) {
        self.nested.retain(|_, set| {
            set.remove(&dir);
            !set.is_empty()
        });
    }

    /// Every nested entry refers to a live export or hashed fragment.
    pub fn is_consistent(&self) -> bool {
        let disjoint = self.exports.is_disjoint(&self.hashdirs)
            && self.exports.is_disjoint(&self.hashing)
            && self.imports.is_disjoint(&self.hashdirs);
        let nested_live = self.nested.values().flatten().all(|d| {
            self.exports.contains(d) || self.hashdirs.contains(d) || self.hashing.contains(d)
        });
        disjoint && nested_live
    }

    pub fn is_quiet(&self) -> bool {
        self.exports.is_empty() && self.hashing.is_empty()
    }
}
