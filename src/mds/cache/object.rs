//! Namespace objects held by the cache: inodes, directory fragments and
//! directory entries.
//!
//! Objects reference each other by identifier only. The arena in
//! [`super::MdCache`] owns them; parent/child links are `DentryKey`s and
//! `InodeId`s resolved through it.

use crate::mds::locker::{DentryLock, LockFacet, SimpleLock};
use crate::types::{DentryKey, DirAuthority, InodeAttrs, InodeId, NodeId};
use std::collections::{BTreeMap, BTreeSet};

/// A cached inode, either authoritative or a replica.
#[derive(Debug, Clone)]
pub struct CInode {
    pub ino: InodeId,
    pub attrs: InodeAttrs,
    /// Dentry that links this inode, if it is known here.
    pub parent: Option<DentryKey>,
    /// Node believed authoritative for this inode.
    pub authority: NodeId,
    /// Nodes holding replicas (meaningful on the authority only).
    pub replicas: BTreeSet<NodeId>,
    pub(crate) ref_count: u32,
    pub dirty: bool,
    pub hard: SimpleLock,
    pub file: SimpleLock,
}

impl CInode {
    pub fn new(ino: InodeId, attrs: InodeAttrs, authority: NodeId) -> Self {
        Self {
            ino,
            attrs,
            parent: None,
            authority,
            replicas: BTreeSet::new(),
            ref_count: 0,
            dirty: false,
            hard: SimpleLock::new(),
            file: SimpleLock::new(),
        }
    }

    pub fn with_parent(mut self, parent: DentryKey) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn lock(&self, facet: LockFacet) -> &SimpleLock {
        match facet {
            LockFacet::Hard => &self.hard,
            LockFacet::File => &self.file,
        }
    }

    pub fn lock_mut(&mut self, facet: LockFacet) -> &mut SimpleLock {
        match facet {
            LockFacet::Hard => &mut self.hard,
            LockFacet::File => &mut self.file,
        }
    }

    /// Copy the facet-owned fields of `attrs` into this inode.
    pub fn apply_facet(&mut self, facet: LockFacet, attrs: &InodeAttrs) {
        match facet {
            LockFacet::Hard => {
                self.attrs.mode = attrs.mode;
                self.attrs.uid = attrs.uid;
                self.attrs.gid = attrs.gid;
                self.attrs.nlink = attrs.nlink;
                self.attrs.ctime = attrs.ctime;
            }
            LockFacet::File => {
                self.attrs.size = attrs.size;
                self.attrs.mtime = attrs.mtime;
            }
        }
        self.attrs.version = self.attrs.version.max(attrs.version);
    }
}

/// Admission state of a directory fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FreezeState {
    #[default]
    Thawed,
    /// New requests wait; admitted requests drain.
    Freezing,
    /// Every request waits.
    Frozen,
}

/// One directory fragment. Fragments are keyed by their directory's inode.
#[derive(Debug, Clone)]
pub struct CDir {
    pub ino: InodeId,
    pub authority: DirAuthority,
    pub entries: BTreeMap<String, CDentry>,
    /// All entries this node is responsible for are cached.
    pub complete: bool,
    /// Nodes holding replicas of this fragment (meaningful on the authority).
    pub replicas: BTreeSet<NodeId>,
    pub(crate) ref_count: u32,
    pub freeze: FreezeState,
    /// The freeze covers the whole subtree below this fragment.
    pub freeze_tree: bool,
}

impl CDir {
    pub fn new(ino: InodeId, authority: DirAuthority) -> Self {
        Self {
            ino,
            authority,
            entries: BTreeMap::new(),
            complete: false,
            replicas: BTreeSet::new(),
            ref_count: 0,
            freeze: FreezeState::Thawed,
            freeze_tree: false,
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze == FreezeState::Frozen
    }

    pub fn is_freezing(&self) -> bool {
        self.freeze == FreezeState::Freezing
    }

    /// Linked entries (null dentries held only for an xlock are skipped).
    pub fn linked(&self) -> impl Iterator<Item = (&String, InodeId)> {
        self.entries
            .iter()
            .filter_map(|(name, dn)| dn.ino.map(|ino| (name, ino)))
    }

    pub fn lookup(&self, name: &str) -> Option<InodeId> {
        self.entries.get(name).and_then(|dn| dn.ino)
    }
}

/// A name binding inside a fragment. `ino == None` is a null dentry that
/// exists only while a create or rename holds its xlock.
#[derive(Debug, Clone, Default)]
pub struct CDentry {
    pub ino: Option<InodeId>,
    pub(crate) pins: u32,
    pub lock: DentryLock,
}

impl CDentry {
    pub fn linked(ino: InodeId) -> Self {
        Self {
            ino: Some(ino),
            ..Self::default()
        }
    }

    pub fn null() -> Self {
        Self::default()
    }

    pub fn pins(&self) -> u32 {
        self.pins
    }
}
