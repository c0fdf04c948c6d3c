//! Core type definitions for the Strata metadata server cache.
//!
//! This module contains the identifiers and attribute records shared by the
//! cache, the lock state machines and the ownership-transfer protocols.
//!
//! # Type Aliases
//!
//! - [`InodeId`] = `u64`: stable inode number, the cache's primary key
//! - [`NodeId`] = `u64`: metadata server identifier
//! - [`ReqId`] = `u64`: client request identifier (stable across forwards)
//! - [`Tid`] = `u64`: correlation id for a peer request/reply pair
//! - [`Epoch`] = `u64`: phase tag used to discard stale acknowledgements
//! - [`Tick`] = `u64`: logical time, advanced by [`crate::mds::MdsNode::tick`]
//!
//! # Examples
//!
//! ```rust
//! use strata_mds::types::{DirAuthority, InodeAttrs, ROOT_INO};
//!
//! let root = InodeAttrs::new_directory(0o755, 0, 0);
//! assert!(root.is_dir());
//!
//! let auth = DirAuthority::Node(0);
//! assert_eq!(auth.node(), Some(0));
//! assert!(DirAuthority::Hashed.is_hashed());
//! assert_eq!(ROOT_INO, 1);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an inode.
pub type InodeId = u64;

/// Unique identifier for a metadata server node.
pub type NodeId = u64;

/// Client request identifier.
pub type ReqId = u64;

/// Client identifier (where replies are delivered).
pub type ClientId = u64;

/// Correlation id for peer request/reply pairs.
pub type Tid = u64;

/// Phase/epoch tag for multi-message protocols.
pub type Epoch = u64;

/// Logical clock tick.
pub type Tick = u64;

/// Inode number of the namespace root.
pub const ROOT_INO: InodeId = 1;

/// Number of low bits reserved for the per-node inode sequence.
pub const INO_NODE_SHIFT: u32 = 40;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
}

/// Inode attributes.
///
/// The hard facet covers ownership, mode and link count; the file facet
/// covers size and modification time. Lock messages carry the whole record
/// and replicas apply only the facet being synchronised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttrs {
    pub file_type: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub symlink_target: Option<String>,
    pub version: u64,
}

impl InodeAttrs {
    pub fn new_file(mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            file_type: FileType::RegularFile,
            mode,
            uid,
            gid,
            nlink: 1,
            size: 0,
            mtime: 0,
            ctime: 0,
            symlink_target: None,
            version: 1,
        }
    }

    pub fn new_directory(mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            file_type: FileType::Directory,
            mode,
            uid,
            gid,
            nlink: 2, // . and parent link
            size: 0,
            mtime: 0,
            ctime: 0,
            symlink_target: None,
            version: 1,
        }
    }

    pub fn new_symlink(uid: u32, gid: u32, target: String) -> Self {
        Self {
            file_type: FileType::Symlink,
            mode: 0o777,
            uid,
            gid,
            nlink: 1,
            size: target.len() as u64,
            mtime: 0,
            ctime: 0,
            symlink_target: Some(target),
            version: 1,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    /// Whether the directory grants search permission to anybody.
    pub fn is_searchable(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

/// Authority designation of a directory fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirAuthority {
    /// A single node is authoritative for every entry.
    Node(NodeId),
    /// Entries are sharded across all nodes by name hash.
    Hashed,
}

impl DirAuthority {
    pub fn node(&self) -> Option<NodeId> {
        match self {
            DirAuthority::Node(n) => Some(*n),
            DirAuthority::Hashed => None,
        }
    }

    pub fn is_hashed(&self) -> bool {
        matches!(self, DirAuthority::Hashed)
    }
}

impl fmt::Display for DirAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirAuthority::Node(n) => write!(f, "mds{}", n),
            DirAuthority::Hashed => write!(f, "hashed"),
        }
    }
}

/// Names one directory entry: the fragment's inode and the entry name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DentryKey {
    pub dir: InodeId,
    pub name: String,
}

impl DentryKey {
    pub fn new(dir: InodeId, name: impl Into<String>) -> Self {
        Self {
            dir,
            name: name.into(),
        }
    }
}

impl fmt::Display for DentryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dir, self.name)
    }
}

/// Caller identity used for traversal permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }

    pub fn user(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Split a slash-separated path into its components.
///
/// Empty components and `.` are dropped; `..` is rejected since traversal
/// never walks upward.
pub fn split_path(path: &str) -> crate::Result<Vec<String>> {
    let mut out = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(crate::MdsError::InvalidPath(format!(
                    "parent references are not supported: {}",
                    path
                )))
            }
            p => out.push(p.to_string()),
        }
    }
    Ok(out)
}
