//! Collaborators the cache core talks to: message delivery and the
//! attribute store.
//!
//! The core only needs reliable, per-pair ordered delivery. The in-process
//! implementation here uses one unbounded tokio channel per node, which
//! gives exactly that.

use crate::error::Result;
use crate::mds::messages::{ClientReply, ClientRequest, MdsMessage};
use crate::mds::request::RequestId;
use crate::types::{InodeAttrs, InodeId, NodeId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Outbound side of peer messaging and client replies.
pub trait Transport: Send + Sync {
    /// Queue `msg` for node `to`. Never blocks.
    fn send(&self, to: NodeId, msg: MdsMessage);

    /// Deliver a reply to the client that issued the request.
    fn reply(&self, reply: ClientReply);
}

/// Persistent inode attributes and directory listings.
pub trait AttributeStore: Send + Sync {
    fn load(&self, ino: InodeId) -> Result<Option<InodeAttrs>>;
    fn store(&self, ino: InodeId, attrs: &InodeAttrs) -> Result<()>;
    fn remove(&self, ino: InodeId) -> Result<()>;
    /// Entries of `dir` in name order; empty if the directory was never
    /// written.
    fn load_dir(&self, dir: InodeId) -> Result<Vec<(String, InodeId)>>;
    fn link(&self, dir: InodeId, name: &str, ino: InodeId) -> Result<()>;
    /// Removing a missing entry is not an error.
    fn unlink(&self, dir: InodeId, name: &str) -> Result<()>;
}

/// Attribute store kept in memory and shared by every node of a cluster.
#[derive(Debug, Default)]
pub struct MemoryStore {
    attrs: RwLock<HashMap<InodeId, InodeAttrs>>,
    dirs: RwLock<HashMap<InodeId, BTreeMap<String, InodeId>>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.attrs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.read().is_empty()
    }

    pub fn lookup(&self, dir: InodeId, name: &str) -> Option<InodeId> {
        self.dirs.read().get(&dir).and_then(|d| d.get(name).copied())
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

impl AttributeStore for MemoryStore {
    fn load(&self, ino: InodeId) -> Result<Option<InodeAttrs>> {
        Ok(self.attrs.read().get(&ino).cloned())
    }

    fn store(&self, ino: InodeId, attrs: &InodeAttrs) -> Result<()> {
        self.attrs.write().insert(ino, attrs.clone());
        self.wrote();
        Ok(())
    }

    fn remove(&self, ino: InodeId) -> Result<()> {
        self.attrs.write().remove(&ino);
        self.dirs.write().remove(&ino);
        self.wrote();
        Ok(())
    }

    fn load_dir(&self, dir: InodeId) -> Result<Vec<(String, InodeId)>> {
        Ok(self
            .dirs
            .read()
            .get(&dir)
            .map(|d| d.iter().map(|(n, i)| (n.clone(), *i)).collect())
            .unwrap_or_default())
    }

    fn link(&self, dir: InodeId, name: &str, ino: InodeId) -> Result<()> {
        self.dirs
            .write()
            .entry(dir)
            .or_default()
            .insert(name.to_string(), ino);
        self.wrote();
        Ok(())
    }

    fn unlink(&self, dir: InodeId, name: &str) -> Result<()> {
        let removed = self
            .dirs
            .write()
            .get_mut(&dir)
            .and_then(|d| d.remove(name));
        if removed.is_some() {
            self.wrote();
        }
        Ok(())
    }
}

/// Administrative entry points of a node (load balancer, operator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOp {
    Export { dir: InodeId, dest: NodeId },
    Hash { dir: InodeId },
    Unhash { dir: InodeId },
}

/// What a node task receives.
#[derive(Debug)]
pub enum Envelope {
    Peer { from: NodeId, msg: MdsMessage },
    Client(ClientRequest),
    Admin {
        op: AdminOp,
        done: oneshot::Sender<Result<()>>,
    },
}

/// Routes client replies to whoever is waiting for them.
#[derive(Debug, Default)]
pub struct ReplyRouter {
    waiting: Mutex<HashMap<RequestId, oneshot::Sender<ClientReply>>>,
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the reply to `id`. A later registration for the
    /// same id replaces the earlier one.
    pub fn register(&self, id: RequestId) -> oneshot::Receiver<ClientReply> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(id, tx);
        rx
    }

    pub fn forget(&self, id: &RequestId) {
        self.waiting.lock().remove(id);
    }

    fn deliver(&self, reply: ClientReply) {
        let id = reply.id();
        match self.waiting.lock().remove(&id) {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    debug!(%id, "client gave up before the reply");
                }
            }
            None => debug!(%id, "reply without a waiting client"),
        }
    }
}

/// Channel transport for one node of an in-process cluster.
#[derive(Clone)]
pub struct ChannelTransport {
    from: NodeId,
    peers: Arc<HashMap<NodeId, mpsc::UnboundedSender<Envelope>>>,
    replies: Arc<ReplyRouter>,
}

impl ChannelTransport {
    pub fn new(
        from: NodeId,
        peers: Arc<HashMap<NodeId, mpsc::UnboundedSender<Envelope>>>,
        replies: Arc<ReplyRouter>,
    ) -> Self {
        Self {
            from,
            peers,
            replies,
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, to: NodeId, msg: MdsMessage) {
        let Some(tx) = self.peers.get(&to) else {
            warn!(from = self.from, to, kind = msg.kind(), "message to unknown node dropped");
            return;
        };
        if tx.send(Envelope::Peer { from: self.from, msg }).is_err() {
            debug!(from = self.from, to, "peer task gone, message dropped");
        }
    }

    fn reply(&self, reply: ClientReply) {
        self.replies.deliver(reply);
    }
}
