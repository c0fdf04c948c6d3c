//! Client and peer message types.
//!
//! Peer traffic is one tagged union, [`MdsMessage`], with a nested enum per
//! protocol. Everything derives serde so a transport can put it on a wire;
//! the cache core itself never encodes messages except for the export
//! payload, which is shipped as an opaque bincode blob.

use crate::error::ErrorKind;
use crate::mds::locker::LockFacet;
use crate::mds::request::RequestId;
use crate::types::{
    ClientId, Credentials, DentryKey, DirAuthority, Epoch, InodeAttrs, InodeId, NodeId, ReqId, Tid,
};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------
// Client surface
// ----------------------------------------------------------------------

/// Namespace operation requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientOp {
    /// Resolve without following a trailing symlink.
    Lookup { path: String },
    /// Resolve and read hard attributes.
    Stat { path: String },
    Readdir { path: String },
    Create { path: String, mode: u32 },
    Mkdir { path: String, mode: u32 },
    Symlink { path: String, target: String },
    Unlink { path: String },
    Rename { src: String, dst: String },
    SetAttr {
        path: String,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
    },
    Write { path: String, size: u64, mtime: u64 },
    ReadSize { path: String },
}

impl ClientOp {
    pub fn name(&self) -> &'static str {
        match self {
            ClientOp::Lookup { .. } => "lookup",
            ClientOp::Stat { .. } => "stat",
            ClientOp::Readdir { .. } => "readdir",
            ClientOp::Create { .. } => "create",
            ClientOp::Mkdir { .. } => "mkdir",
            ClientOp::Symlink { .. } => "symlink",
            ClientOp::Unlink { .. } => "unlink",
            ClientOp::Rename { .. } => "rename",
            ClientOp::SetAttr { .. } => "setattr",
            ClientOp::Write { .. } => "write",
            ClientOp::ReadSize { .. } => "read_size",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client: ClientId,
    pub req: ReqId,
    pub op: ClientOp,
    pub creds: Credentials,
    /// Times this request has been forwarded between nodes.
    pub num_fwd: u32,
}

impl ClientRequest {
    pub fn new(client: ClientId, req: ReqId, op: ClientOp) -> Self {
        Self {
            client,
            req,
            op,
            creds: Credentials::root(),
            num_fwd: 0,
        }
    }

    pub fn with_creds(mut self, creds: Credentials) -> Self {
        self.creds = creds;
        self
    }

    pub fn id(&self) -> RequestId {
        RequestId::new(self.client, self.req)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub ino: InodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyBody {
    Inode { ino: InodeId, attrs: InodeAttrs },
    Entries(Vec<DirEntry>),
    Size(u64),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReply {
    pub client: ClientId,
    pub req: ReqId,
    /// Node that executed the request.
    pub served_by: NodeId,
    pub result: std::result::Result<ReplyBody, ErrorKind>,
}

impl ClientReply {
    pub fn id(&self) -> RequestId {
        RequestId::new(self.client, self.req)
    }
}

// ----------------------------------------------------------------------
// Shared payloads
// ----------------------------------------------------------------------

/// Replica state of one inode as handed out by its authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub parent: Option<DentryKey>,
    pub ino: InodeId,
    pub attrs: InodeAttrs,
    pub authority: NodeId,
    /// Authority of the inode's fragment, for directories.
    pub dir_auth: Option<DirAuthority>,
    pub hard_sync: bool,
    pub file_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoverTarget {
    Root,
    Dentry(DentryKey),
}

/// One dentry and its inode inside an export, hash or unhash transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedDentry {
    pub name: String,
    pub ino: InodeId,
    pub attrs: InodeAttrs,
    pub replicas: Vec<NodeId>,
    /// Set when the child fragment is a boundary owned elsewhere.
    pub dir_auth: Option<DirAuthority>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedDir {
    pub ino: InodeId,
    pub complete: bool,
    pub replicas: Vec<NodeId>,
    pub entries: Vec<ExportedDentry>,
}

/// Serialized subtree shipped at export "go".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportPayload {
    pub root: InodeId,
    /// Parents always precede their children.
    pub dirs: Vec<ExportedDir>,
}

// ----------------------------------------------------------------------
// Peer messages
// ----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MdsMessage {
    Discover {
        tid: Tid,
        target: DiscoverTarget,
    },
    DiscoverReply {
        tid: Tid,
        target: DiscoverTarget,
        result: std::result::Result<Replica, ErrorKind>,
    },
    /// Replicas the sender dropped from its cache.
    CacheExpire {
        inodes: Vec<InodeId>,
        dirs: Vec<InodeId>,
    },
    /// Authority change of a fragment made outside a migration.
    DirUpdate {
        dir: InodeId,
        authority: DirAuthority,
    },
    ClientForward(ClientRequest),
    Lock(LockMessage),
    Export(ExportMessage),
    Hash(HashMessage),
    Rename(RenameMessage),
}

impl MdsMessage {
    /// Short label used for logging and the message counter.
    pub fn kind(&self) -> &'static str {
        match self {
            MdsMessage::Discover { .. } => "discover",
            MdsMessage::DiscoverReply { .. } => "discover_reply",
            MdsMessage::CacheExpire { .. } => "cache_expire",
            MdsMessage::DirUpdate { .. } => "dir_update",
            MdsMessage::ClientForward(_) => "client_forward",
            MdsMessage::Lock(_) => "lock",
            MdsMessage::Export(_) => "export",
            MdsMessage::Hash(_) => "hash",
            MdsMessage::Rename(_) => "rename",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMessage {
    /// Authority asks a replica to stop trusting the facet.
    Lock {
        ino: InodeId,
        facet: LockFacet,
        epoch: Epoch,
    },
    LockAck {
        ino: InodeId,
        facet: LockFacet,
        epoch: Epoch,
    },
    /// Authority pushes the current value and returns the facet to SYNC.
    Sync {
        ino: InodeId,
        facet: LockFacet,
        attrs: InodeAttrs,
    },
    /// Replica wants to read a facet that is not in SYNC.
    ReqRead { ino: InodeId, facet: LockFacet },
    DentryLock { key: DentryKey, epoch: Epoch },
    DentryLockAck { key: DentryKey, epoch: Epoch },
    /// Dentry xlock released; `binding` is the entry's new content.
    DentryUnlock {
        key: DentryKey,
        binding: Option<Replica>,
    },
    ReqXlock {
        tid: Tid,
        key: DentryKey,
        req: RequestId,
    },
    XlockAck {
        tid: Tid,
        key: DentryKey,
        req: RequestId,
    },
    XlockNak {
        tid: Tid,
        key: DentryKey,
        error: ErrorKind,
    },
    Unxlock { key: DentryKey, req: RequestId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportMessage {
    Discover {
        tid: Tid,
        dir: InodeId,
        path: Vec<String>,
    },
    DiscoverAck {
        tid: Tid,
        dir: InodeId,
        error: Option<ErrorKind>,
    },
    Prep {
        tid: Tid,
        dir: InodeId,
        nested: Vec<(InodeId, DirAuthority)>,
        bystanders: Vec<NodeId>,
    },
    PrepAck { tid: Tid, dir: InodeId },
    Dir {
        tid: Tid,
        dir: InodeId,
        payload: Vec<u8>,
        bystanders: Vec<NodeId>,
    },
    DirAck { tid: Tid, dir: InodeId },
    /// Exporter to bystanders: authority of `dirs` is moving to `importer`.
    Warning {
        tid: Tid,
        dir: InodeId,
        dirs: Vec<InodeId>,
        importer: NodeId,
    },
    /// Importer to bystanders: the subtree is now installed here.
    Notify {
        tid: Tid,
        dir: InodeId,
        dirs: Vec<InodeId>,
        exporter: NodeId,
    },
    NotifyAck { tid: Tid, dir: InodeId },
    Finish { tid: Tid, dir: InodeId },
    Cancel { tid: Tid, dir: InodeId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashMessage {
    Discover {
        tid: Tid,
        dir: InodeId,
        path: Vec<String>,
    },
    DiscoverAck {
        tid: Tid,
        dir: InodeId,
        error: Option<ErrorKind>,
    },
    Prep { tid: Tid, dir: InodeId },
    PrepAck { tid: Tid, dir: InodeId },
    /// The receiver's shard of the fragment.
    HashDir {
        tid: Tid,
        dir: InodeId,
        shard: Vec<ExportedDentry>,
    },
    HashDirAck { tid: Tid, dir: InodeId },
    /// Peer to peer: the sender installed its shard.
    Notify {
        tid: Tid,
        dir: InodeId,
        driver: NodeId,
    },
    /// To the driver: `from` saw the notify about `about`.
    NotifyAck {
        tid: Tid,
        dir: InodeId,
        about: NodeId,
    },
    Finish { tid: Tid, dir: InodeId },
    Cancel { tid: Tid, dir: InodeId },
    UnhashPrep { tid: Tid, dir: InodeId },
    UnhashPrepAck {
        tid: Tid,
        dir: InodeId,
        inodes: Vec<DirEntry>,
    },
    Unhash { tid: Tid, dir: InodeId },
    UnhashAck {
        tid: Tid,
        dir: InodeId,
        entries: Vec<ExportedDentry>,
    },
    UnhashNotify { tid: Tid, dir: InodeId },
    UnhashNotifyAck { tid: Tid, dir: InodeId },
    Readdir { tid: Tid, dir: InodeId },
    ReaddirReply {
        tid: Tid,
        dir: InodeId,
        result: std::result::Result<Vec<DirEntry>, ErrorKind>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenameMessage {
    /// Source to destination: link `ino` at `dst`.
    Request {
        tid: Tid,
        src: DentryKey,
        dst: DentryKey,
        ino: InodeId,
        attrs: InodeAttrs,
        dir_auth: Option<DirAuthority>,
        bystanders: Vec<NodeId>,
        req: RequestId,
    },
    /// Destination to bystanders, before the link.
    Warning {
        initiator: NodeId,
        tid: Tid,
        ino: InodeId,
        src: DentryKey,
        dst: DentryKey,
    },
    WarningAck { initiator: NodeId, tid: Tid },
    /// Destination committed the link.
    Ack { tid: Tid, bystanders: Vec<NodeId> },
    Nak { tid: Tid, error: ErrorKind },
    /// Source to bystanders, after the unlink.
    Notify {
        initiator: NodeId,
        tid: Tid,
        ino: InodeId,
        src: DentryKey,
        dst: DentryKey,
        dir_auth: Option<DirAuthority>,
    },
    NotifyAck { tid: Tid },
    /// Source gave up waiting for the destination's ack.
    Cancel { tid: Tid },
    /// Destination to warned bystanders when it aborts before commit.
    Abort {
        initiator: NodeId,
        tid: Tid,
        ino: InodeId,
    },
}
