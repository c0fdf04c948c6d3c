//! Hash and unhash of a directory fragment.
//!
//! Hashing spreads one fragment over every node: each entry is owned by
//! `placement.authority_for(dir, name)`. The driver (the fragment's
//! authority) runs discover, prep, freeze and go against all peers at once.
//! After go each peer installs its shard, tells every other peer, and the
//! driver collects both the shard acks (`hash_gather`) and the peer to peer
//! notify acks (`notify_gather`) before finishing.
//!
//! Unhash is driven by the authority of the directory inode. Peers freeze
//! their shard, hand it over on `Unhash`, and the driver accumulates the
//! replies in `unhash_content` until every peer has answered.
//!
//! A hashed fragment stays pinned on every node until it is unhashed.

use crate::error::{ErrorKind, MdsError, Result};
use crate::mds::cache::CInode;
use crate::mds::messages::{ClientRequest, DirEntry, ExportedDentry, HashMessage, MdsMessage, ReplyBody};
use crate::mds::node::{Ctx, Flow, FreezeOwner, MdsNode, Pending, Waiter};
use crate::observability;
use crate::types::{DentryKey, DirAuthority, InodeId, NodeId, Tick, Tid};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashPhase {
    Discovering,
    Prepping,
    Freezing,
    Hashing,
}

/// Driver side of a hash.
#[derive(Debug, Clone)]
pub(crate) struct HashState {
    pub tid: Tid,
    pub phase: HashPhase,
    pub deadline: Tick,
    pub waiting: BTreeSet<NodeId>,
    pub hash_gather: BTreeSet<NodeId>,
    /// Peer whose shard is announced -> peers yet to confirm they saw it.
    pub notify_gather: BTreeMap<NodeId, BTreeSet<NodeId>>,
    pub shards: BTreeMap<NodeId, Vec<ExportedDentry>>,
    pub resends: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhashPhase {
    Prepping,
    Collecting,
    Notifying,
}

/// Driver side of an unhash.
#[derive(Debug, Clone)]
pub(crate) struct UnhashState {
    pub tid: Tid,
    pub phase: UnhashPhase,
    pub deadline: Tick,
    pub waiting: BTreeSet<NodeId>,
    pub frozen: bool,
    pub unhash_content: BTreeMap<NodeId, Vec<ExportedDentry>>,
    pub resends: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Discovered,
    Prepped,
    Hashed,
    UnhashFreezing,
    UnhashFrozen,
    Unhashed,
}

/// Participant side of a hash or unhash driven elsewhere.
#[derive(Debug, Clone)]
pub(crate) struct PeerState {
    pub driver: NodeId,
    pub tid: Tid,
    pub phase: PeerPhase,
    pub since: Tick,
    /// Shard handed to the unhash driver, kept for a repeated `Unhash`.
    pub handed: Vec<ExportedDentry>,
}

#[derive(Debug, Default)]
pub(crate) struct Hasher {
    pub hashing: BTreeMap<InodeId, HashState>,
    pub unhashing: BTreeMap<InodeId, UnhashState>,
    pub peers: BTreeMap<InodeId, PeerState>,
}

impl Hasher {
    pub fn is_idle(&self) -> bool {
        self.hashing.is_empty() && self.unhashing.is_empty() && self.peers.is_empty()
    }
}

impl MdsNode {
    /// Start hashing fragment `dir` across the cluster.
    pub fn hash_dir(&mut self, dir: InodeId) -> Result<()> {
        let frag = self
            .cache
            .dir(dir)
            .ok_or_else(|| MdsError::NotFound(format!("dir {}", dir)))?;
        match frag.authority {
            DirAuthority::Node(n) if n == self.id => {}
            DirAuthority::Node(n) => return Err(MdsError::NotAuthoritative { redirect: Some(n) }),
            DirAuthority::Hashed => {
                return Err(MdsError::InvalidOperation(format!("{} is already hashed", dir)))
            }
        }
        if self.blocking_freeze(dir, false).is_some() {
            return Err(MdsError::Conflict(format!("{} is inside a freeze", dir)));
        }
        let path = self
            .cache
            .path_of(dir)
            .ok_or_else(|| MdsError::NotFound(format!("path of {}", dir)))?;
        let root = self.containing_root(dir);
        self.topology.begin_hash(dir, root, true)?;
        self.cache.pin_inode(dir)?;
        self.cache.pin_dir(dir)?;

        let tid = self.next_tid();
        let peers: BTreeSet<NodeId> = self.peers().into_iter().collect();
        info!(node = self.id, dir, tid, peers = peers.len(), "hash started");
        self.hasher.hashing.insert(
            dir,
            HashState {
                tid,
                phase: HashPhase::Discovering,
                deadline: self.now + self.config.protocol.ack_timeout_ticks,
                waiting: peers.clone(),
                hash_gather: BTreeSet::new(),
                notify_gather: BTreeMap::new(),
                shards: BTreeMap::new(),
                resends: 0,
            },
        );
        for peer in peers {
            self.send(
                peer,
                MdsMessage::Hash(HashMessage::Discover {
                    tid,
                    dir,
                    path: path.clone(),
                }),
            );
        }
        self.advance_hash(dir)
    }

    /// Start returning hashed fragment `dir` to a single authority (us).
    pub fn unhash_dir(&mut self, dir: InodeId) -> Result<()> {
        let inode = self
            .cache
            .get_or_null(dir)
            .ok_or_else(|| MdsError::NotFound(format!("inode {}", dir)))?;
        if inode.authority != self.id {
            return Err(MdsError::NotAuthoritative {
                redirect: Some(inode.authority),
            });
        }
        if !self.topology.is_hashed(dir) || self.dir_authority(dir) != Some(DirAuthority::Hashed) {
            return Err(MdsError::InvalidOperation(format!("{} is not hashed", dir)));
        }
        let root = self.containing_root(dir);
        self.topology.begin_hash(dir, root, false)?;

        let tid = self.next_tid();
        let peers: BTreeSet<NodeId> = self.peers().into_iter().collect();
        info!(node = self.id, dir, tid, "unhash started");
        self.hasher.unhashing.insert(
            dir,
            UnhashState {
                tid,
                phase: UnhashPhase::Prepping,
                deadline: self.now + self.config.protocol.freeze_timeout_ticks,
                waiting: peers.clone(),
                frozen: false,
                unhash_content: BTreeMap::new(),
                resends: 0,
            },
        );
        for peer in peers {
            self.send(peer, MdsMessage::Hash(HashMessage::UnhashPrep { tid, dir }));
        }
        self.start_freeze(dir, false, FreezeOwner::UnhashDriver)
    }

    pub(crate) fn handle_hash_message(&mut self, from: NodeId, msg: HashMessage) -> Result<()> {
        match msg {
            HashMessage::Discover { tid, dir, path } => {
                self.hash_peer_discover(from, tid, dir, path);
                Ok(())
            }
            HashMessage::DiscoverAck { tid, dir, error } => {
                if let Some(kind) = error {
                    self.check_hash_msg(from, tid, dir, HashPhase::Discovering)?;
                    warn!(node = self.id, dir, from, ?kind, "peer could not open hash target");
                    self.abort_hash(dir, "discover failed");
                    return Ok(());
                }
                self.hash_gathered(from, tid, dir, HashPhase::Discovering)
            }
            HashMessage::Prep { tid, dir } => {
                let now = self.now;
                let peer = self.peer_state(from, tid, dir, PeerPhase::Discovered)?;
                peer.phase = PeerPhase::Prepped;
                peer.since = now;
                self.freeze_now(dir, false);
                self.send(from, MdsMessage::Hash(HashMessage::PrepAck { tid, dir }));
                Ok(())
            }
            HashMessage::PrepAck { tid, dir } => self.hash_gathered(from, tid, dir, HashPhase::Prepping),
            HashMessage::HashDir { tid, dir, shard } => self.install_shard(from, tid, dir, shard),
            HashMessage::HashDirAck { tid, dir } => {
                let state = self.check_hash_msg(from, tid, dir, HashPhase::Hashing)?;
                if !state.hash_gather.remove(&from) {
                    return Err(MdsError::ProtocolViolation(format!(
                        "duplicate shard ack for {} from mds{}",
                        dir, from
                    )));
                }
                self.advance_hash(dir)
            }
            HashMessage::Notify { tid, dir, driver } => {
                self.send(
                    driver,
                    MdsMessage::Hash(HashMessage::NotifyAck {
                        tid,
                        dir,
                        about: from,
                    }),
                );
                Ok(())
            }
            HashMessage::NotifyAck { tid, dir, about } => {
                let state = self.check_hash_msg(from, tid, dir, HashPhase::Hashing)?;
                let acked = state
                    .notify_gather
                    .get_mut(&about)
                    .map(|waiting| waiting.remove(&from))
                    .unwrap_or(false);
                if !acked {
                    return Err(MdsError::ProtocolViolation(format!(
                        "unexpected notify ack for {} about mds{} from mds{}",
                        dir, about, from
                    )));
                }
                self.advance_hash(dir)
            }
            HashMessage::Finish { tid, dir } => {
                self.peer_state(from, tid, dir, PeerPhase::Hashed)?;
                self.hasher.peers.remove(&dir);
                let root = self.containing_root(dir);
                self.topology.note_hashed(dir, root, true);
                self.unfreeze(dir);
                debug!(node = self.id, dir, driver = from, "hash finished");
                Ok(())
            }
            HashMessage::Cancel { tid, dir } => self.peer_cancel(from, tid, dir),
            HashMessage::UnhashPrep { tid, dir } => self.unhash_peer_prep(from, tid, dir),
            HashMessage::UnhashPrepAck { tid, dir, inodes } => {
                let state = self.check_unhash_msg(from, tid, dir, UnhashPhase::Prepping)?;
                if !state.waiting.remove(&from) {
                    return Err(MdsError::ProtocolViolation(format!(
                        "duplicate unhash prep ack for {} from mds{}",
                        dir, from
                    )));
                }
                debug!(node = self.id, dir, from, entries = inodes.len(), "peer shard frozen");
                self.advance_unhash(dir)
            }
            HashMessage::Unhash { tid, dir } => self.unhash_peer_go(from, tid, dir),
            HashMessage::UnhashAck { tid, dir, entries } => {
                let state = self.check_unhash_msg(from, tid, dir, UnhashPhase::Collecting)?;
                if !state.waiting.remove(&from) {
                    return Err(MdsError::ProtocolViolation(format!(
                        "duplicate unhash ack for {} from mds{}",
                        dir, from
                    )));
                }
                state.unhash_content.insert(from, entries);
                self.advance_unhash(dir)
            }
            HashMessage::UnhashNotify { tid, dir } => {
                let handed_back = match self.hasher.peers.get(&dir) {
                    Some(p) if p.driver == from && p.tid == tid => match p.phase {
                        PeerPhase::Unhashed => true,
                        PeerPhase::UnhashFreezing | PeerPhase::UnhashFrozen => false,
                        _ => {
                            return Err(MdsError::ProtocolViolation(format!(
                                "unhash notify for {} out of phase",
                                dir
                            )))
                        }
                    },
                    _ => {
                        return Err(MdsError::ProtocolViolation(format!(
                            "unhash notify for {} tid {} without state",
                            dir, tid
                        )))
                    }
                };
                if !handed_back {
                    // The driver gave up on our shard and reads it from the store.
                    self.set_dir_authority(dir, DirAuthority::Node(from));
                }
                self.hasher.peers.remove(&dir);
                let root = self.containing_root(dir);
                self.topology.note_hashed(dir, root, false);
                self.cache.unpin_dir(dir);
                self.cache.unpin_inode(dir);
                self.unfreeze(dir);
                self.send(from, MdsMessage::Hash(HashMessage::UnhashNotifyAck { tid, dir }));
                debug!(node = self.id, dir, driver = from, "unhash finished");
                Ok(())
            }
            HashMessage::UnhashNotifyAck { tid, dir } => {
                let state = self.check_unhash_msg(from, tid, dir, UnhashPhase::Notifying)?;
                if !state.waiting.remove(&from) {
                    return Err(MdsError::ProtocolViolation(format!(
                        "duplicate unhash notify ack for {} from mds{}",
                        dir, from
                    )));
                }
                self.advance_unhash(dir)
            }
            HashMessage::Readdir { tid, dir } => {
                let result = self.list_own_shard(dir).map_err(|e| e.kind());
                self.send(from, MdsMessage::Hash(HashMessage::ReaddirReply { tid, dir, result }));
                Ok(())
            }
            HashMessage::ReaddirReply { tid, dir, result } => self.readdir_reply(from, tid, dir, result),
        }
    }

    fn check_hash_msg(
        &mut self,
        from: NodeId,
        tid: Tid,
        dir: InodeId,
        phase: HashPhase,
    ) -> Result<&mut HashState> {
        match self.hasher.hashing.get_mut(&dir) {
            Some(state) if state.tid == tid && state.phase == phase => Ok(state),
            _ => Err(MdsError::ProtocolViolation(format!(
                "hash message for {} tid {} from mds{} out of phase",
                dir, tid, from
            ))),
        }
    }

    fn check_unhash_msg(
        &mut self,
        from: NodeId,
        tid: Tid,
        dir: InodeId,
        phase: UnhashPhase,
    ) -> Result<&mut UnhashState> {
        match self.hasher.unhashing.get_mut(&dir) {
            Some(state) if state.tid == tid && state.phase == phase => Ok(state),
            _ => Err(MdsError::ProtocolViolation(format!(
                "unhash message for {} tid {} from mds{} out of phase",
                dir, tid, from
            ))),
        }
    }

    fn peer_state(
        &mut self,
        from: NodeId,
        tid: Tid,
        dir: InodeId,
        phase: PeerPhase,
    ) -> Result<&mut PeerState> {
        match self.hasher.peers.get_mut(&dir) {
            Some(peer) if peer.driver == from && peer.tid == tid && peer.phase == phase => Ok(peer),
            _ => Err(MdsError::ProtocolViolation(format!(
                "peer message for {} tid {} from mds{} out of phase",
                dir, tid, from
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Hash driver
    // ------------------------------------------------------------------

    fn hash_gathered(&mut self, from: NodeId, tid: Tid, dir: InodeId, phase: HashPhase) -> Result<()> {
        let state = self.check_hash_msg(from, tid, dir, phase)?;
        if !state.waiting.remove(&from) {
            return Err(MdsError::ProtocolViolation(format!(
                "duplicate {:?} ack for {} from mds{}",
                phase, dir, from
            )));
        }
        self.advance_hash(dir)
    }

    /// Move the driver to the next phase once the current gather is empty.
    fn advance_hash(&mut self, dir: InodeId) -> Result<()> {
        let Some(state) = self.hasher.hashing.get(&dir) else {
            return Ok(());
        };
        let tid = state.tid;
        match state.phase {
            HashPhase::Discovering if state.waiting.is_empty() => {
                let peers: BTreeSet<NodeId> = self.peers().into_iter().collect();
                let deadline = self.now + self.config.protocol.ack_timeout_ticks;
                if let Some(state) = self.hasher.hashing.get_mut(&dir) {
                    state.phase = HashPhase::Prepping;
                    state.waiting = peers.clone();
                    state.deadline = deadline;
                }
                for peer in peers {
                    self.send(peer, MdsMessage::Hash(HashMessage::Prep { tid, dir }));
                }
                self.advance_hash(dir)
            }
            HashPhase::Prepping if state.waiting.is_empty() => {
                let deadline = self.now + self.config.protocol.freeze_timeout_ticks;
                if let Some(state) = self.hasher.hashing.get_mut(&dir) {
                    state.phase = HashPhase::Freezing;
                    state.deadline = deadline;
                }
                self.start_freeze(dir, false, FreezeOwner::Hash)
            }
            HashPhase::Hashing
                if state.hash_gather.is_empty()
                    && state.notify_gather.values().all(|w| w.is_empty()) =>
            {
                self.finish_hash(dir);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// The fragment is frozen: split it into shards and ship them.
    pub(crate) fn hash_frozen(&mut self, dir: InodeId) -> Result<()> {
        let tid = match self.hasher.hashing.get(&dir) {
            Some(state) if state.phase == HashPhase::Freezing => state.tid,
            _ => return Ok(()),
        };
        if !self.cache.dir(dir).map(|d| d.complete).unwrap_or(false) {
            self.load_dir(dir)?;
        }
        let peers = self.peers();
        let listing: Vec<(String, InodeId)> = self
            .cache
            .dir(dir)
            .map(|d| d.linked().map(|(name, ino)| (name.clone(), ino)).collect())
            .unwrap_or_default();
        let mut shards: BTreeMap<NodeId, Vec<ExportedDentry>> =
            peers.iter().map(|p| (*p, Vec::new())).collect();
        for (name, ino) in &listing {
            if self.cache.get_or_null(*ino).map(|i| i.dirty).unwrap_or(false) {
                self.persist(*ino)?;
            }
            let owner = self.placement.authority_for(dir, name);
            if owner == self.id {
                continue;
            }
            if let Some(dentry) = self.shard_dentry(name, *ino, owner) {
                shards.entry(owner).or_default().push(dentry);
            }
        }

        let old_replicas = self.cache.dir(dir).map(|d| d.replicas.clone()).unwrap_or_default();
        self.set_dir_authority(dir, DirAuthority::Hashed);
        if let Some(frag) = self.cache.dir_mut(dir) {
            frag.replicas = old_replicas;
            frag.complete = true;
        }
        for (_, ino) in &listing {
            self.keep_child_import(*ino);
        }

        let deadline = self.now + self.config.protocol.ack_timeout_ticks;
        let notify_gather = peers
            .iter()
            .map(|p| (*p, peers.iter().copied().filter(|q| q != p).collect()))
            .collect();
        if let Some(state) = self.hasher.hashing.get_mut(&dir) {
            state.phase = HashPhase::Hashing;
            state.deadline = deadline;
            state.hash_gather = peers.iter().copied().collect();
            state.notify_gather = notify_gather;
            state.shards = shards.clone();
        }
        info!(node = self.id, dir, entries = listing.len(), "hash go");
        for (peer, shard) in shards {
            self.send(peer, MdsMessage::Hash(HashMessage::HashDir { tid, dir, shard }));
        }
        self.advance_hash(dir)
    }

    /// Transfer record for one entry handed to `to`; we keep a replica.
    fn shard_dentry(&self, name: &str, ino: InodeId, to: NodeId) -> Option<ExportedDentry> {
        let inode = self.cache.get_or_null(ino)?;
        let mut replicas = inode.replicas.clone();
        replicas.insert(self.id);
        replicas.remove(&to);
        Some(ExportedDentry {
            name: name.to_string(),
            ino,
            attrs: inode.attrs.clone(),
            replicas: replicas.into_iter().collect(),
            dir_auth: self.cache.dir(ino).map(|child| child.authority),
        })
    }

    /// A child fragment we still own whose inode moved away is an import.
    fn keep_child_import(&mut self, ino: InodeId) {
        let me = DirAuthority::Node(self.id);
        let owned = self.cache.dir(ino).map(|d| d.authority == me).unwrap_or(false);
        if owned && !self.cache.is_auth(ino) {
            self.topology.add_import(ino);
        }
    }

    /// Install a received entry as authoritative here.
    fn adopt_dentry(&mut self, dir: InodeId, entry: &ExportedDentry) -> Result<()> {
        let key = DentryKey::new(dir, entry.name.clone());
        if self.cache.contains(entry.ino) {
            self.cache.set_authority(entry.ino, self.id);
        } else {
            self.cache
                .add(CInode::new(entry.ino, entry.attrs.clone(), self.id).with_parent(key.clone()))?;
        }
        if let Some(inode) = self.cache.get_mut(entry.ino) {
            inode.attrs = entry.attrs.clone();
            inode.replicas = entry.replicas.iter().copied().collect();
            inode.hard = Default::default();
            inode.file = Default::default();
        }
        self.cache.link(&key, entry.ino)?;

        let me = DirAuthority::Node(self.id);
        match (entry.dir_auth, self.cache.dir(entry.ino).is_some()) {
            (Some(authority), true) => self.set_dir_authority(entry.ino, authority),
            (Some(authority), false) => {
                self.cache.open_dir(entry.ino, authority)?;
            }
            (None, true) => self.set_dir_authority(entry.ino, me),
            (None, false) => {}
        }
        if self.dir_authority(entry.ino) == Some(me) {
            self.topology.remove_import(entry.ino);
        }
        self.cache.touch(entry.ino);
        Ok(())
    }

    fn finish_hash(&mut self, dir: InodeId) {
        let Some(state) = self.hasher.hashing.remove(&dir) else {
            return;
        };
        for peer in self.peers() {
            self.send(peer, MdsMessage::Hash(HashMessage::Finish { tid: state.tid, dir }));
        }
        self.topology.end_hash(dir, true);
        self.unfreeze(dir);
        observability::record_hash("hashed");
        info!(node = self.id, dir, "hash finished");
    }

    /// Undo a hash that has not shipped its shards.
    fn abort_hash(&mut self, dir: InodeId, reason: &str) {
        let Some(state) = self.hasher.hashing.remove(&dir) else {
            return;
        };
        warn!(node = self.id, dir, phase = ?state.phase, reason, "hash aborted");
        for peer in self.peers() {
            self.send(peer, MdsMessage::Hash(HashMessage::Cancel { tid: state.tid, dir }));
        }
        self.topology.end_hash(dir, false);
        self.cache.unpin_dir(dir);
        self.cache.unpin_inode(dir);
        if state.phase == HashPhase::Freezing {
            self.unfreeze(dir);
        }
        observability::record_hash("aborted");
    }

    // ------------------------------------------------------------------
    // Hash peer
    // ------------------------------------------------------------------

    fn hash_peer_discover(&mut self, from: NodeId, tid: Tid, dir: InodeId, path: Vec<String>) {
        let path_str = format!("/{}", path.join("/"));
        let error = match self.resolve(&path_str, false, Ctx::peer()) {
            Ok(Flow::Ready(trace)) if trace.target == dir => self.pin_hash_target(from, tid, dir).err(),
            Ok(Flow::Ready(_)) => Some(ErrorKind::NotFound),
            Ok(Flow::Blocked(key)) => {
                let msg = MdsMessage::Hash(HashMessage::Discover { tid, dir, path });
                self.wait(key, Waiter::Message { from, msg });
                return;
            }
            Ok(Flow::Forward(_)) | Ok(Flow::Pending) => Some(ErrorKind::Internal),
            Err(e) => Some(e.kind()),
        };
        debug!(node = self.id, dir, from, ?error, "hash discover");
        self.send(from, MdsMessage::Hash(HashMessage::DiscoverAck { tid, dir, error }));
    }

    fn pin_hash_target(&mut self, driver: NodeId, tid: Tid, dir: InodeId) -> std::result::Result<(), ErrorKind> {
        if self.hasher.peers.contains_key(&dir) || self.topology.is_hashed(dir) {
            return Err(ErrorKind::Conflict);
        }
        self.cache
            .open_dir(dir, DirAuthority::Node(driver))
            .map_err(|e| e.kind())?;
        self.cache.pin_inode(dir).map_err(|e| e.kind())?;
        if let Err(e) = self.cache.pin_dir(dir) {
            self.cache.unpin_inode(dir);
            return Err(e.kind());
        }
        self.hasher.peers.insert(
            dir,
            PeerState {
                driver,
                tid,
                phase: PeerPhase::Discovered,
                since: self.now,
                handed: Vec::new(),
            },
        );
        Ok(())
    }

    fn install_shard(&mut self, from: NodeId, tid: Tid, dir: InodeId, shard: Vec<ExportedDentry>) -> Result<()> {
        let repeated = self
            .hasher
            .peers
            .get(&dir)
            .map(|p| p.driver == from && p.tid == tid && p.phase == PeerPhase::Hashed)
            .unwrap_or(false);
        if repeated {
            debug!(node = self.id, dir, "repeated shard, re-acking");
            self.send(from, MdsMessage::Hash(HashMessage::HashDirAck { tid, dir }));
            return Ok(());
        }
        let now = self.now;
        let peer = self.peer_state(from, tid, dir, PeerPhase::Prepped)?;
        peer.phase = PeerPhase::Hashed;
        peer.since = now;

        self.set_dir_authority(dir, DirAuthority::Hashed);
        let mut replicas = BTreeSet::new();
        for entry in &shard {
            self.adopt_dentry(dir, entry)?;
            replicas.extend(entry.replicas.iter().copied());
        }
        replicas.remove(&self.id);
        if let Some(frag) = self.cache.dir_mut(dir) {
            frag.replicas = replicas;
            frag.complete = true;
        }
        debug!(node = self.id, dir, entries = shard.len(), "shard installed");

        for peer in self.peers() {
            if peer != from {
                self.send(peer, MdsMessage::Hash(HashMessage::Notify { tid, dir, driver: from }));
            }
        }
        self.send(from, MdsMessage::Hash(HashMessage::HashDirAck { tid, dir }));
        Ok(())
    }

    fn peer_cancel(&mut self, from: NodeId, tid: Tid, dir: InodeId) -> Result<()> {
        let phase = match self.hasher.peers.get(&dir) {
            Some(peer) if peer.driver == from && peer.tid == tid => peer.phase,
            _ => {
                return Err(MdsError::ProtocolViolation(format!(
                    "cancel for {} tid {} from mds{} without state",
                    dir, tid, from
                )))
            }
        };
        match phase {
            PeerPhase::Discovered | PeerPhase::Prepped => {
                self.hasher.peers.remove(&dir);
                self.cache.unpin_dir(dir);
                self.cache.unpin_inode(dir);
                if phase == PeerPhase::Prepped {
                    self.unfreeze(dir);
                }
            }
            PeerPhase::UnhashFreezing | PeerPhase::UnhashFrozen => {
                // Still hashed; only the freeze goes.
                self.hasher.peers.remove(&dir);
                self.unfreeze(dir);
            }
            PeerPhase::Hashed | PeerPhase::Unhashed => {
                return Err(MdsError::ProtocolViolation(format!(
                    "cancel for {} after go",
                    dir
                )))
            }
        }
        debug!(node = self.id, dir, driver = from, ?phase, "hash cancelled");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unhash driver
    // ------------------------------------------------------------------

    pub(crate) fn unhash_driver_frozen(&mut self, dir: InodeId) -> Result<()> {
        match self.hasher.unhashing.get_mut(&dir) {
            Some(state) if state.phase == UnhashPhase::Prepping => state.frozen = true,
            _ => return Ok(()),
        }
        if !self.cache.dir(dir).map(|d| d.complete).unwrap_or(false) {
            self.load_dir(dir)?;
        }
        self.advance_unhash(dir)
    }

    fn advance_unhash(&mut self, dir: InodeId) -> Result<()> {
        let Some(state) = self.hasher.unhashing.get(&dir) else {
            return Ok(());
        };
        let tid = state.tid;
        match state.phase {
            UnhashPhase::Prepping if state.frozen && state.waiting.is_empty() => {
                let peers: BTreeSet<NodeId> = self.peers().into_iter().collect();
                let deadline = self.now + self.config.protocol.ack_timeout_ticks;
                if let Some(state) = self.hasher.unhashing.get_mut(&dir) {
                    state.phase = UnhashPhase::Collecting;
                    state.waiting = peers.clone();
                    state.deadline = deadline;
                }
                info!(node = self.id, dir, "unhash go");
                for peer in peers {
                    self.send(peer, MdsMessage::Hash(HashMessage::Unhash { tid, dir }));
                }
                self.advance_unhash(dir)
            }
            UnhashPhase::Collecting if state.waiting.is_empty() => self.finish_unhash(dir, true),
            UnhashPhase::Notifying if state.waiting.is_empty() => {
                self.hasher.unhashing.remove(&dir);
                observability::record_hash("unhashed");
                info!(node = self.id, dir, "unhash finished");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Reassemble the fragment from every shard we received. Without
    /// `complete` some shards are missing and are read back from the store.
    fn finish_unhash(&mut self, dir: InodeId, complete: bool) -> Result<()> {
        let (tid, content) = match self.hasher.unhashing.get_mut(&dir) {
            Some(state) => (state.tid, std::mem::take(&mut state.unhash_content)),
            None => return Ok(()),
        };
        let received: BTreeSet<&str> = content
            .values()
            .flatten()
            .map(|e| e.name.as_str())
            .collect();
        let answered: BTreeSet<NodeId> = content.keys().copied().collect();
        let stale: Vec<DentryKey> = self
            .cache
            .dir(dir)
            .map(|d| {
                d.linked()
                    .filter(|(name, _)| {
                        let owner = self.placement.authority_for(dir, name);
                        owner != self.id && answered.contains(&owner) && !received.contains(name.as_str())
                    })
                    .map(|(name, _)| DentryKey::new(dir, name.clone()))
                    .collect()
            })
            .unwrap_or_default();
        for key in stale {
            debug!(node = self.id, %key, "dropping entry missing from its shard");
            self.cache.unlink(&key);
        }
        for entries in content.values() {
            for entry in entries {
                self.adopt_dentry(dir, entry)?;
            }
        }

        self.set_dir_authority(dir, DirAuthority::Node(self.id));
        let children: Vec<InodeId> = self
            .cache
            .dir(dir)
            .map(|d| d.linked().map(|(_, ino)| ino).collect())
            .unwrap_or_default();
        for child in children {
            if self.dir_authority(child) == Some(DirAuthority::Node(self.id)) {
                self.topology.remove_import(child);
            }
        }
        if let Some(frag) = self.cache.dir_mut(dir) {
            frag.complete = complete;
        }
        self.topology.end_hash(dir, false);
        self.cache.unpin_dir(dir);
        self.cache.unpin_inode(dir);
        self.unfreeze(dir);

        let deadline = self.now + self.config.protocol.ack_timeout_ticks;
        if let Some(state) = self.hasher.unhashing.get_mut(&dir) {
            state.phase = UnhashPhase::Notifying;
            state.waiting = answered;
            state.deadline = deadline;
            state.resends = 0;
        }
        for peer in self.peers() {
            self.send(peer, MdsMessage::Hash(HashMessage::UnhashNotify { tid, dir }));
        }
        self.advance_unhash(dir)
    }

    fn abort_unhash(&mut self, dir: InodeId, reason: &str) {
        let Some(state) = self.hasher.unhashing.remove(&dir) else {
            return;
        };
        warn!(node = self.id, dir, reason, "unhash aborted");
        for peer in self.peers() {
            self.send(peer, MdsMessage::Hash(HashMessage::Cancel { tid: state.tid, dir }));
        }
        self.topology.end_hash(dir, true);
        self.unfreeze(dir);
        observability::record_hash("aborted");
    }

    // ------------------------------------------------------------------
    // Unhash peer
    // ------------------------------------------------------------------

    fn unhash_peer_prep(&mut self, from: NodeId, tid: Tid, dir: InodeId) -> Result<()> {
        if !self.topology.is_hashed(dir) || self.cache.dir(dir).is_none() {
            return Err(MdsError::ProtocolViolation(format!(
                "unhash prep for {} which is not hashed here",
                dir
            )));
        }
        if self.hasher.peers.contains_key(&dir) {
            return Err(MdsError::ProtocolViolation(format!(
                "unhash prep for {} while busy",
                dir
            )));
        }
        self.hasher.peers.insert(
            dir,
            PeerState {
                driver: from,
                tid,
                phase: PeerPhase::UnhashFreezing,
                since: self.now,
                handed: Vec::new(),
            },
        );
        self.start_freeze(dir, false, FreezeOwner::UnhashPeer { driver: from, tid })
    }

    pub(crate) fn unhash_peer_frozen(&mut self, dir: InodeId, driver: NodeId, tid: Tid) {
        match self.peer_state(driver, tid, dir, PeerPhase::UnhashFreezing) {
            Ok(peer) => peer.phase = PeerPhase::UnhashFrozen,
            Err(_) => {
                debug!(node = self.id, dir, "unhash freeze completed after cancel");
                self.unfreeze(dir);
                return;
            }
        }
        match self.list_own_shard(dir) {
            Ok(inodes) => {
                self.send(driver, MdsMessage::Hash(HashMessage::UnhashPrepAck { tid, dir, inodes }))
            }
            Err(e) => warn!(node = self.id, dir, error = %e, "could not list shard for unhash"),
        }
    }

    fn unhash_peer_go(&mut self, from: NodeId, tid: Tid, dir: InodeId) -> Result<()> {
        let repeated = self
            .hasher
            .peers
            .get(&dir)
            .filter(|p| p.driver == from && p.tid == tid && p.phase == PeerPhase::Unhashed)
            .map(|p| p.handed.clone());
        if let Some(entries) = repeated {
            self.send(from, MdsMessage::Hash(HashMessage::UnhashAck { tid, dir, entries }));
            return Ok(());
        }
        self.peer_state(from, tid, dir, PeerPhase::UnhashFrozen)?;

        let own: Vec<DirEntry> = self.list_own_shard(dir)?;
        let mut entries = Vec::with_capacity(own.len());
        for entry in &own {
            if self.cache.get_or_null(entry.ino).map(|i| i.dirty).unwrap_or(false) {
                self.persist(entry.ino)?;
            }
            if let Some(dentry) = self.shard_dentry(&entry.name, entry.ino, from) {
                entries.push(dentry);
            }
        }
        self.set_dir_authority(dir, DirAuthority::Node(from));
        for entry in &own {
            self.keep_child_import(entry.ino);
        }
        let now = self.now;
        if let Some(peer) = self.hasher.peers.get_mut(&dir) {
            peer.phase = PeerPhase::Unhashed;
            peer.since = now;
            peer.handed = entries.clone();
        }
        debug!(node = self.id, dir, entries = entries.len(), "shard handed back");
        self.send(from, MdsMessage::Hash(HashMessage::UnhashAck { tid, dir, entries }));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Hashed readdir
    // ------------------------------------------------------------------

    /// Entries of `dir` that this node owns as a shard.
    fn list_own_shard(&mut self, dir: InodeId) -> Result<Vec<DirEntry>> {
        let hashed = match self.cache.dir(dir) {
            Some(frag) => frag.authority.is_hashed(),
            None => {
                let listing = self.store.load_dir(dir)?;
                return Ok(listing
                    .into_iter()
                    .filter(|(name, _)| self.placement.authority_for(dir, name) == self.id)
                    .map(|(name, ino)| DirEntry { name, ino })
                    .collect());
            }
        };
        if !hashed {
            return Err(MdsError::Conflict(format!("{} is not hashed here", dir)));
        }
        if !self.cache.dir(dir).map(|d| d.complete).unwrap_or(false) {
            self.load_dir(dir)?;
        }
        Ok(self
            .cache
            .dir(dir)
            .map(|d| {
                d.linked()
                    .filter(|(name, _)| self.placement.authority_for(dir, name) == self.id)
                    .map(|(name, ino)| DirEntry {
                        name: name.clone(),
                        ino,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// List a hashed directory by gathering every node's shard.
    pub(crate) fn start_hashed_readdir(&mut self, req: ClientRequest, dir: InodeId) -> Result<Flow<ReplyBody>> {
        let mut entries = self.list_own_shard(dir)?;
        let peers: BTreeSet<NodeId> = self.peers().into_iter().collect();
        if peers.is_empty() {
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            return Ok(Flow::Ready(ReplyBody::Entries(entries)));
        }
        let tid = self.next_tid();
        let deadline = self.now + self.config.protocol.ack_timeout_ticks;
        for peer in &peers {
            self.send(*peer, MdsMessage::Hash(HashMessage::Readdir { tid, dir }));
        }
        self.pending.insert(
            tid,
            Pending::Readdir {
                request: req,
                dir,
                waiting: peers,
                entries,
                deadline,
            },
        );
        Ok(Flow::Pending)
    }

    fn readdir_reply(
        &mut self,
        from: NodeId,
        tid: Tid,
        dir: InodeId,
        result: std::result::Result<Vec<DirEntry>, ErrorKind>,
    ) -> Result<()> {
        let done = match self.pending.get_mut(&tid) {
            Some(Pending::Readdir {
                dir: d,
                waiting,
                entries,
                ..
            }) if *d == dir && waiting.contains(&from) => match result {
                Ok(shard) => {
                    waiting.remove(&from);
                    entries.extend(shard);
                    waiting.is_empty().then_some(Ok(()))
                }
                Err(kind) => Some(Err(kind)),
            },
            _ => {
                return Err(MdsError::ProtocolViolation(format!(
                    "unexpected readdir reply {} from mds{}",
                    tid, from
                )))
            }
        };
        let Some(outcome) = done else {
            return Ok(());
        };
        let Some(Pending::Readdir {
            request, mut entries, ..
        }) = self.pending.remove(&tid)
        else {
            return Ok(());
        };
        match outcome {
            Ok(()) => {
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                self.complete(&request, Ok(ReplyBody::Entries(entries)));
            }
            Err(kind) => {
                let err = kind.into_error(format!("shard of {} on mds{}", dir, from));
                self.complete(&request, Err(err));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    pub(crate) fn hasher_tick(&mut self) {
        let now = self.now;
        let max = self.config.protocol.max_resends;
        let due: Vec<(InodeId, HashPhase)> = self
            .hasher
            .hashing
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(d, s)| (*d, s.phase))
            .collect();
        for (dir, phase) in due {
            if phase != HashPhase::Hashing {
                self.abort_hash(dir, "peers timed out");
                continue;
            }
            let deadline = now + self.config.protocol.ack_timeout_ticks;
            let Some(state) = self.hasher.hashing.get_mut(&dir) else {
                continue;
            };
            if state.resends >= max {
                warn!(node = self.id, dir, silent = ?state.hash_gather, "dropping silent hash peers");
                state.hash_gather.clear();
                state.notify_gather.clear();
                self.finish_hash(dir);
                continue;
            }
            state.resends += 1;
            state.deadline = deadline;
            let tid = state.tid;
            let resend: Vec<(NodeId, Vec<ExportedDentry>)> = state
                .hash_gather
                .iter()
                .map(|p| (*p, state.shards.get(p).cloned().unwrap_or_default()))
                .collect();
            for (peer, shard) in resend {
                self.send(peer, MdsMessage::Hash(HashMessage::HashDir { tid, dir, shard }));
            }
        }

        let due: Vec<(InodeId, UnhashPhase)> = self
            .hasher
            .unhashing
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(d, s)| (*d, s.phase))
            .collect();
        for (dir, phase) in due {
            match phase {
                UnhashPhase::Prepping => self.abort_unhash(dir, "peers did not freeze"),
                UnhashPhase::Collecting => {
                    let deadline = now + self.config.protocol.ack_timeout_ticks;
                    let Some(state) = self.hasher.unhashing.get_mut(&dir) else {
                        continue;
                    };
                    if state.resends >= max {
                        warn!(node = self.id, dir, silent = ?state.waiting, "unhash without silent shards");
                        state.waiting.clear();
                        if let Err(e) = self.finish_unhash(dir, false) {
                            warn!(node = self.id, dir, error = %e, "unhash finish failed");
                        }
                        continue;
                    }
                    state.resends += 1;
                    state.deadline = deadline;
                    let tid = state.tid;
                    let waiting: Vec<NodeId> = state.waiting.iter().copied().collect();
                    for peer in waiting {
                        self.send(peer, MdsMessage::Hash(HashMessage::Unhash { tid, dir }));
                    }
                }
                UnhashPhase::Notifying => {
                    if let Some(state) = self.hasher.unhashing.remove(&dir) {
                        warn!(node = self.id, dir, silent = ?state.waiting, "dropping silent unhash peers");
                    }
                    observability::record_hash("unhashed");
                }
            }
        }

        let patience =
            self.config.protocol.freeze_timeout_ticks + 2 * self.config.protocol.ack_timeout_ticks;
        let stale: Vec<(InodeId, PeerPhase)> = self
            .hasher
            .peers
            .iter()
            .filter(|(_, p)| p.since + patience < now)
            .map(|(d, p)| (*d, p.phase))
            .collect();
        for (dir, phase) in stale {
            match phase {
                PeerPhase::Discovered | PeerPhase::Prepped => {
                    warn!(node = self.id, dir, "abandoned hash dropped");
                    self.hasher.peers.remove(&dir);
                    self.cache.unpin_dir(dir);
                    self.cache.unpin_inode(dir);
                    if phase == PeerPhase::Prepped {
                        self.unfreeze(dir);
                    }
                }
                PeerPhase::UnhashFreezing | PeerPhase::UnhashFrozen => {
                    warn!(node = self.id, dir, "abandoned unhash dropped");
                    self.hasher.peers.remove(&dir);
                    self.unfreeze(dir);
                }
                // Past go the driver always finishes; keep waiting for it.
                PeerPhase::Hashed | PeerPhase::Unhashed => {}
            }
        }
    }
}
