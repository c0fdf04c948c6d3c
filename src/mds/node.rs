//! The per-node control thread: client requests, path resolution,
//! discovery, waiters and the logical clock.
//!
//! Nothing in here blocks. A step that needs another node records a
//! [`Waiter`] under a [`WaitKey`] and returns; the matching reply (or the
//! release of a local resource) wakes every waiter on the key into the
//! retry queue, which is drained before each entry point returns.

use crate::cluster::{AttributeStore, Placement, Transport};
use crate::config::MdsConfig;
use crate::error::{ErrorKind, MdsError, Result};
use crate::mds::cache::{CInode, FreezeState, MdCache};
use crate::mds::hasher::Hasher;
use crate::mds::locker::{DentryLockState, ForeignGrant, LockFacet, LockMode, LockState};
use crate::mds::messages::{
    ClientOp, ClientReply, ClientRequest, DirEntry, DiscoverTarget, ExportMessage, HashMessage,
    LockMessage, MdsMessage, Replica, ReplyBody,
};
use crate::mds::migrator::Migrator;
use crate::mds::renamer::Renamer;
use crate::mds::request::{ActiveRequest, RequestId, RequestTracker};
use crate::mds::topology::Topology;
use crate::observability;
use crate::types::{
    split_path, Credentials, DentryKey, DirAuthority, InodeAttrs, InodeId, NodeId, Tick, Tid,
    INO_NODE_SHIFT, ROOT_INO,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Upper bound on retry-queue entries processed per entry point.
const SETTLE_LIMIT: usize = 100_000;

/// Result of one non-blocking step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow<T> {
    Ready(T),
    /// Suspended until `WaitKey` is woken.
    Blocked(WaitKey),
    /// Another node is authoritative; send the request there.
    Forward(NodeId),
    /// A protocol took ownership of the request and will reply itself.
    Pending,
}

/// Dentries traversed by a path resolution, and where it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub dentries: Vec<DentryKey>,
    pub target: InodeId,
}

/// What a suspended step waits for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaitKey {
    Discover(DiscoverTarget),
    /// Freeze root whose thaw we wait for.
    Unfreeze(InodeId),
    Lock(InodeId, LockFacet),
    /// Another holder's xlock, or a stale replica entry.
    Dentry(DentryKey),
    /// Our own xlock gathering replica acks.
    XlockGather(DentryKey),
    ForeignXlock(DentryKey),
}

impl WaitKey {
    /// Whether a request waiting on this key keeps its handle.
    ///
    /// Lock and xlock waits hold what was already granted; every other
    /// wait drops the handle and resolves again from scratch when woken.
    pub fn retains_handle(&self) -> bool {
        matches!(
            self,
            WaitKey::Lock(..) | WaitKey::XlockGather(_) | WaitKey::ForeignXlock(_)
        )
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Waiter {
    Request(ClientRequest),
    Message { from: NodeId, msg: MdsMessage },
}

/// Outstanding peer exchange keyed by tid.
#[derive(Debug, Clone)]
pub(crate) enum Pending {
    Discover {
        target: DiscoverTarget,
        deadline: Tick,
    },
    Readdir {
        request: ClientRequest,
        dir: InodeId,
        waiting: BTreeSet<NodeId>,
        entries: Vec<DirEntry>,
        deadline: Tick,
    },
    ForeignXlock {
        key: DentryKey,
        req: RequestId,
        to: NodeId,
        deadline: Tick,
    },
}

impl Pending {
    fn deadline(&self) -> Tick {
        match self {
            Pending::Discover { deadline, .. }
            | Pending::Readdir { deadline, .. }
            | Pending::ForeignXlock { deadline, .. } => *deadline,
        }
    }
}

/// Protocol that started a freeze and is told when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FreezeOwner {
    Export,
    Hash,
    UnhashDriver,
    UnhashPeer { driver: NodeId, tid: Tid },
}

/// Caller context of a path resolution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ctx {
    pub creds: Credentials,
    pub req: Option<RequestId>,
    /// Holds a handle, so freezing (not frozen) fragments admit it.
    pub admitted: bool,
}

impl Ctx {
    pub(crate) fn peer() -> Self {
        Self {
            creds: Credentials::root(),
            req: None,
            admitted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Client,
    Peer,
    Resume,
}

/// Kind of inode a create-like request makes.
enum NewInode {
    File(u32),
    Dir(u32),
    Symlink(String),
}

impl NewInode {
    fn attrs(self, creds: Credentials, now: Tick) -> InodeAttrs {
        let mut attrs = match self {
            NewInode::File(mode) => InodeAttrs::new_file(mode, creds.uid, creds.gid),
            NewInode::Dir(mode) => InodeAttrs::new_directory(mode, creds.uid, creds.gid),
            NewInode::Symlink(target) => InodeAttrs::new_symlink(creds.uid, creds.gid, target),
        };
        attrs.ctime = now;
        attrs.mtime = now;
        attrs
    }
}

/// One metadata server.
pub struct MdsNode {
    pub(crate) id: NodeId,
    pub(crate) config: MdsConfig,
    pub(crate) cache: MdCache,
    pub(crate) topology: Topology,
    pub(crate) requests: RequestTracker,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) store: Arc<dyn AttributeStore>,
    pub(crate) placement: Arc<dyn Placement>,
    pub(crate) now: Tick,
    next_tid: Tid,
    next_ino: u64,
    waiters: HashMap<WaitKey, Vec<Waiter>>,
    retry: VecDeque<Waiter>,
    delayed: Vec<(Tick, Waiter)>,
    /// Requests sitting in `waiters` or `delayed`.
    parked: HashSet<RequestId>,
    pub(crate) pending: HashMap<Tid, Pending>,
    discovering: HashMap<DiscoverTarget, Tid>,
    freezing: BTreeMap<InodeId, FreezeOwner>,
    pub(crate) gathering_locks: BTreeSet<(InodeId, LockFacet)>,
    pub(crate) gathering_dentries: BTreeSet<DentryKey>,
    pub(crate) foreign_grants: HashMap<DentryKey, ForeignGrant>,
    pub(crate) migrator: Migrator,
    pub(crate) hasher: Hasher,
    pub(crate) renamer: Renamer,
    shutting_down: bool,
}

impl MdsNode {
    pub fn new(
        config: MdsConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn AttributeStore>,
        placement: Arc<dyn Placement>,
    ) -> Result<Self> {
        config.validate()?;
        let id = config.node.id;
        let mut node = Self {
            id,
            cache: MdCache::new(id),
            topology: Topology::new(),
            requests: RequestTracker::new(config.cache.completed_request_memory),
            config,
            transport,
            store,
            placement,
            now: 0,
            next_tid: 1,
            next_ino: 2,
            waiters: HashMap::new(),
            retry: VecDeque::new(),
            delayed: Vec::new(),
            parked: HashSet::new(),
            pending: HashMap::new(),
            discovering: HashMap::new(),
            freezing: BTreeMap::new(),
            gathering_locks: BTreeSet::new(),
            gathering_dentries: BTreeSet::new(),
            foreign_grants: HashMap::new(),
            migrator: Migrator::default(),
            hasher: Hasher::default(),
            renamer: Renamer::default(),
            shutting_down: false,
        };
        node.bootstrap_root()?;
        info!(node = id, root_node = node.root_node(), "metadata server started");
        Ok(node)
    }

    fn bootstrap_root(&mut self) -> Result<()> {
        if self.id != self.root_node() {
            return Ok(());
        }
        let attrs = match self.store.load(ROOT_INO)? {
            Some(attrs) => attrs,
            None => {
                let attrs = InodeAttrs::new_directory(0o755, 0, 0);
                self.store.store(ROOT_INO, &attrs)?;
                attrs
            }
        };
        self.cache.add(CInode::new(ROOT_INO, attrs, self.id))?;
        self.cache.open_dir(ROOT_INO, DirAuthority::Node(self.id))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn now(&self) -> Tick {
        self.now
    }

    pub fn config(&self) -> &MdsConfig {
        &self.config
    }

    pub fn cache(&self) -> &MdCache {
        &self.cache
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn requests(&self) -> &RequestTracker {
        &self.requests
    }

    pub fn root_node(&self) -> NodeId {
        self.config.cluster.root_node
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Authority this node believes holds `dir`'s fragment.
    pub fn dir_authority(&self, dir: InodeId) -> Option<DirAuthority> {
        self.cache.dir(dir).map(|d| d.authority)
    }

    /// Walk cached dentries only, without discovery or side effects.
    pub fn lookup_cached(&self, path: &str) -> Option<InodeId> {
        let mut cur = ROOT_INO;
        if !self.cache.contains(cur) {
            return None;
        }
        for name in split_path(path).ok()? {
            cur = self.cache.dir(cur)?.lookup(&name)?;
        }
        Some(cur)
    }

    /// Nothing waiting, pending or in flight on this node.
    pub fn is_quiescent(&self) -> bool {
        self.waiters.is_empty()
            && self.retry.is_empty()
            && self.delayed.is_empty()
            && self.pending.is_empty()
            && self.freezing.is_empty()
            && self.requests.active_count() == 0
            && self.topology.is_quiet()
            && self.migrator.is_idle()
            && self.hasher.is_idle()
            && self.renamer.is_idle()
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Client request entry point. The reply goes out through the transport.
    pub fn submit(&mut self, req: ClientRequest) {
        debug!(node = self.id, id = %req.id(), op = req.op.name(), "client request");
        self.dispatch(req, Origin::Client);
        self.settle();
    }

    /// Peer message entry point.
    pub fn proc_message(&mut self, from: NodeId, msg: MdsMessage) {
        observability::record_message(msg.kind());
        trace!(node = self.id, from, kind = msg.kind(), "message");
        self.handle_message(from, msg);
        self.settle();
    }

    /// Advance the logical clock: expire deadlines, release delayed
    /// retries and trim the cache.
    pub fn tick(&mut self) {
        self.now += 1;
        self.expire_pending();
        self.expire_lock_gathers();
        self.migrator_tick();
        self.hasher_tick();
        self.renamer_tick();

        let now = self.now;
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.delayed = later;
        self.retry.extend(due.into_iter().map(|(_, w)| w));

        let max = self.config.cache.max_inodes;
        self.trim(max);
        observability::update_cache_size(self.cache.len());
        self.settle();
    }

    /// Evict down to `max` inodes, telling authorities about dropped replicas.
    pub fn trim(&mut self, max: usize) -> bool {
        let (reached, evicted) = self.cache.trim(max);
        if evicted.is_empty() {
            return reached;
        }
        observability::record_evictions(evicted.len() as u64);
        let mut expire: BTreeMap<NodeId, (Vec<InodeId>, Vec<InodeId>)> = BTreeMap::new();
        for ev in evicted {
            if !ev.was_auth {
                expire.entry(ev.authority).or_default().0.push(ev.ino);
            }
            if let Some(DirAuthority::Node(n)) = ev.dir_authority {
                if n != self.id {
                    expire.entry(n).or_default().1.push(ev.ino);
                }
            }
        }
        for (to, (inodes, dirs)) in expire {
            self.send(to, MdsMessage::CacheExpire { inodes, dirs });
        }
        reached
    }

    pub fn shutdown_begin(&mut self) {
        if !self.shutting_down {
            info!(node = self.id, "shutdown started");
            self.shutting_down = true;
        }
    }

    /// One drain round: trim and hand every import back to the root node.
    /// Returns `true` once nothing is left to drain.
    pub fn shutdown_step(&mut self) -> bool {
        if !self.shutting_down {
            self.shutdown_begin();
        }
        self.trim(0);
        let root = self.root_node();
        if self.id != root {
            let imports: Vec<InodeId> = self.topology.imports().iter().copied().collect();
            for dir in imports {
                if self.topology.is_busy(dir) {
                    continue;
                }
                if let Err(e) = self.export_dir(dir, root) {
                    debug!(node = self.id, dir, error = %e, "shutdown export deferred");
                }
            }
        }
        self.settle();
        let drained = (self.id == root || self.topology.imports().is_empty())
            && self.topology.is_quiet();
        if drained {
            info!(node = self.id, "shutdown drained");
        }
        drained
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn handle_message(&mut self, from: NodeId, msg: MdsMessage) {
        let kind = msg.kind();
        let result = match msg {
            MdsMessage::Discover { tid, target } => {
                self.handle_discover(from, tid, target);
                Ok(())
            }
            MdsMessage::DiscoverReply { tid, target, result } => {
                self.handle_discover_reply(from, tid, target, result)
            }
            MdsMessage::CacheExpire { inodes, dirs } => {
                self.handle_cache_expire(from, inodes, dirs);
                Ok(())
            }
            MdsMessage::DirUpdate { dir, authority } => {
                self.handle_dir_update(dir, authority);
                Ok(())
            }
            MdsMessage::ClientForward(req) => {
                self.dispatch(req, Origin::Peer);
                Ok(())
            }
            MdsMessage::Lock(m) => self.handle_lock_message(from, m),
            MdsMessage::Export(m) => self.handle_export_message(from, m),
            MdsMessage::Hash(m) => self.handle_hash_message(from, m),
            MdsMessage::Rename(m) => self.handle_rename_message(from, m),
        };
        if let Err(e) = result {
            match e {
                MdsError::ProtocolViolation(detail) => self.violation(from, detail),
                e => warn!(node = self.id, from, kind, error = %e, "message handling failed"),
            }
        }
    }

    /// Log and count a malformed or out-of-order message; it is dropped.
    pub(crate) fn violation(&self, from: NodeId, detail: impl fmt::Display) {
        warn!(node = self.id, from, %detail, "protocol violation");
        observability::record_protocol_violation();
    }

    /// Drain the retry queue and complete any drained freezes.
    fn settle(&mut self) {
        let mut rounds = 0;
        loop {
            self.check_freezes();
            let Some(waiter) = self.retry.pop_front() else {
                break;
            };
            match waiter {
                Waiter::Request(req) => self.dispatch(req, Origin::Resume),
                Waiter::Message { from, msg } => self.handle_message(from, msg),
            }
            rounds += 1;
            if rounds >= SETTLE_LIMIT {
                warn!(node = self.id, left = self.retry.len(), "retry queue not settling");
                break;
            }
        }
    }

    fn dispatch(&mut self, req: ClientRequest, origin: Origin) {
        let id = req.id();
        if origin != Origin::Resume {
            if let Some(reply) = self.requests.completed_reply(&id) {
                debug!(node = self.id, %id, "answering repeated request from memory");
                self.transport.reply(reply);
                return;
            }
            if self.parked.contains(&id) || self.requests.is_active(&id) {
                debug!(node = self.id, %id, "duplicate of in-flight request ignored");
                return;
            }
            if origin == Origin::Client {
                if let Some(dest) = self.requests.forwarded_to(&id) {
                    self.forward_request(req, dest);
                    return;
                }
            }
        }
        self.parked.remove(&id);
        if req.num_fwd > self.config.protocol.max_forwards {
            let err = MdsError::Timeout(format!("{} forwarded {} times", id, req.num_fwd));
            self.complete(&req, Err(err));
            return;
        }
        match self.execute(&req) {
            Ok(Flow::Ready(body)) => self.complete(&req, Ok(body)),
            Ok(Flow::Blocked(key)) => {
                if !key.retains_handle() {
                    self.release_request(id);
                }
                self.wait(key, Waiter::Request(req));
            }
            Ok(Flow::Forward(dest)) => self.forward_request(req, dest),
            Ok(Flow::Pending) => {}
            Err(e) => self.complete(&req, Err(e)),
        }
    }

    fn execute(&mut self, req: &ClientRequest) -> Result<Flow<ReplyBody>> {
        let ctx = Ctx {
            creds: req.creds,
            req: Some(req.id()),
            admitted: self.requests.is_active(&req.id()),
        };
        match &req.op {
            ClientOp::Lookup { path } => self.op_lookup(req, path, ctx),
            ClientOp::Stat { path } => self.op_stat(req, path, ctx),
            ClientOp::ReadSize { path } => self.op_read_size(req, path, ctx),
            ClientOp::Readdir { path } => self.op_readdir(req, path, ctx),
            ClientOp::Create { path, mode } => self.op_create(req, path, NewInode::File(*mode), ctx),
            ClientOp::Mkdir { path, mode } => self.op_create(req, path, NewInode::Dir(*mode), ctx),
            ClientOp::Symlink { path, target } => {
                self.op_create(req, path, NewInode::Symlink(target.clone()), ctx)
            }
            ClientOp::Unlink { path } => self.op_unlink(req, path, ctx),
            ClientOp::Rename { src, dst } => self.op_rename(req, src, dst, ctx),
            ClientOp::SetAttr {
                path,
                mode,
                uid,
                gid,
            } => self.op_setattr(req, path, (*mode, *uid, *gid), ctx),
            ClientOp::Write { path, size, mtime } => self.op_write(req, path, *size, *mtime, ctx),
        }
    }

    /// Reply to the client and release everything the request holds.
    pub(crate) fn complete(&mut self, req: &ClientRequest, result: Result<ReplyBody>) {
        let id = req.id();
        self.release_request(id);
        self.parked.remove(&id);
        let remember = match &result {
            Ok(_) => {
                observability::record_request("ok");
                true
            }
            Err(e) => {
                debug!(node = self.id, %id, error = %e, "request failed");
                observability::record_request("error");
                !e.is_retryable()
            }
        };
        let reply = ClientReply {
            client: req.client,
            req: req.req,
            served_by: self.id,
            result: result.map_err(|e| e.kind()),
        };
        if remember {
            self.requests.remember_reply(id, reply.clone());
        }
        self.transport.reply(reply);
    }

    pub(crate) fn release_request(&mut self, id: RequestId) {
        if let Some(active) = self.requests.finish(&mut self.cache, id) {
            self.release_held(active);
        }
    }

    fn release_held(&mut self, active: ActiveRequest) {
        for (ino, facet, mode) in active.locks {
            self.release_lock(ino, facet, mode);
        }
        for key in &active.xlocks {
            self.release_xlock(key, active.id);
        }
        for (key, node) in active.foreign_xlocks {
            self.send(
                node,
                MdsMessage::Lock(LockMessage::Unxlock {
                    key,
                    req: active.id,
                }),
            );
        }
        for key in active.trace {
            self.wake(&WaitKey::Dentry(key));
        }
    }

    pub(crate) fn forward_request(&mut self, mut req: ClientRequest, dest: NodeId) {
        let id = req.id();
        if dest == self.id {
            let err = MdsError::Internal(format!("{} forwarded to its own node", id));
            self.complete(&req, Err(err));
            return;
        }
        match self.requests.forward(&mut self.cache, id, dest) {
            Some(active) => self.release_held(active),
            None => self.requests.note_forwarded(id, dest),
        }
        self.parked.remove(&id);
        req.num_fwd += 1;
        debug!(node = self.id, %id, dest, num_fwd = req.num_fwd, "forwarding request");
        observability::record_request("forwarded");
        self.send(dest, MdsMessage::ClientForward(req));
    }

    // ------------------------------------------------------------------
    // Waiters
    // ------------------------------------------------------------------

    pub(crate) fn wait(&mut self, key: WaitKey, waiter: Waiter) {
        if let Waiter::Request(req) = &waiter {
            self.parked.insert(req.id());
        }
        trace!(node = self.id, ?key, "waiting");
        self.waiters.entry(key).or_default().push(waiter);
    }

    pub(crate) fn wake(&mut self, key: &WaitKey) {
        if let Some(list) = self.waiters.remove(key) {
            self.retry.extend(list);
        }
    }

    pub(crate) fn take_waiters(&mut self, key: &WaitKey) -> Vec<Waiter> {
        self.waiters.remove(key).unwrap_or_default()
    }

    /// Remove the waiter of request `id` under `key`, leaving the others.
    pub(crate) fn take_request_waiter(&mut self, key: &WaitKey, id: RequestId) -> Option<ClientRequest> {
        let list = self.waiters.get_mut(key)?;
        let pos = list
            .iter()
            .position(|w| matches!(w, Waiter::Request(r) if r.id() == id))?;
        let Waiter::Request(req) = list.remove(pos) else {
            return None;
        };
        if list.is_empty() {
            self.waiters.remove(key);
        }
        self.parked.remove(&id);
        Some(req)
    }

    pub(crate) fn fail_waiters(&mut self, key: &WaitKey, kind: ErrorKind, context: &str) {
        for waiter in self.take_waiters(key) {
            match waiter {
                Waiter::Request(req) => self.complete(&req, Err(kind.into_error(context))),
                Waiter::Message { from, msg } => self.abandon_message(from, msg, kind),
            }
        }
    }

    /// Answer a suspended peer message that can no longer be served.
    fn abandon_message(&mut self, from: NodeId, msg: MdsMessage, kind: ErrorKind) {
        match msg {
            MdsMessage::Discover { tid, target } => self.send(
                from,
                MdsMessage::DiscoverReply {
                    tid,
                    target,
                    result: Err(kind),
                },
            ),
            MdsMessage::ClientForward(req) => self.complete(&req, Err(kind.into_error("abandoned"))),
            MdsMessage::Export(ExportMessage::Discover { tid, dir, .. }) => self.send(
                from,
                MdsMessage::Export(ExportMessage::DiscoverAck {
                    tid,
                    dir,
                    error: Some(kind),
                }),
            ),
            MdsMessage::Hash(HashMessage::Discover { tid, dir, .. }) => self.send(
                from,
                MdsMessage::Hash(HashMessage::DiscoverAck {
                    tid,
                    dir,
                    error: Some(kind),
                }),
            ),
            MdsMessage::Hash(HashMessage::Readdir { tid, dir }) => self.send(
                from,
                MdsMessage::Hash(HashMessage::ReaddirReply {
                    tid,
                    dir,
                    result: Err(kind),
                }),
            ),
            other => debug!(node = self.id, from, kind = other.kind(), "abandoned message dropped"),
        }
    }

    /// Retry after `retry_delay_ticks`.
    pub(crate) fn delay(&mut self, waiter: Waiter) {
        if let Waiter::Request(req) = &waiter {
            self.parked.insert(req.id());
        }
        let at = self.now + self.config.protocol.retry_delay_ticks;
        self.delayed.push((at, waiter));
    }

    /// Queue a message for another node; messages to ourselves go through
    /// the retry queue so the sender's state is settled first.
    pub(crate) fn send(&mut self, to: NodeId, msg: MdsMessage) {
        if to == self.id {
            self.retry.push_back(Waiter::Message { from: self.id, msg });
        } else {
            self.transport.send(to, msg);
        }
    }

    pub(crate) fn peers(&self) -> Vec<NodeId> {
        self.config
            .cluster
            .nodes
            .iter()
            .copied()
            .filter(|n| *n != self.id)
            .collect()
    }

    pub(crate) fn next_tid(&mut self) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    fn alloc_ino(&mut self) -> InodeId {
        let ino = (self.id << INO_NODE_SHIFT) | self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn expire_pending(&mut self) {
        let now = self.now;
        let expired: Vec<Tid> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline() <= now)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in expired {
            let Some(pending) = self.pending.remove(&tid) else {
                continue;
            };
            match pending {
                Pending::Discover { target, .. } => {
                    warn!(node = self.id, ?target, "discover timed out");
                    self.discovering.remove(&target);
                    self.fail_waiters(&WaitKey::Discover(target), ErrorKind::Timeout, "discover timed out");
                }
                Pending::Readdir { request, dir, waiting, .. } => {
                    warn!(node = self.id, dir, ?waiting, "hashed readdir timed out");
                    let err = MdsError::Timeout(format!("readdir of {}", dir));
                    self.complete(&request, Err(err));
                }
                Pending::ForeignXlock { key, req, to, .. } => {
                    warn!(node = self.id, %key, to, "foreign xlock timed out");
                    self.foreign_xlock_failed(to, &key, req, ErrorKind::Timeout);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Path resolution
    // ------------------------------------------------------------------

    /// Resolve `path` from the root, fetching replicas as needed.
    pub fn path_resolve(&mut self, path: &str, follow: bool) -> Result<Flow<Trace>> {
        self.resolve(path, follow, Ctx::peer())
    }

    pub(crate) fn resolve(&mut self, path: &str, follow: bool, ctx: Ctx) -> Result<Flow<Trace>> {
        let mut names: VecDeque<String> = split_path(path)?.into();
        step!(self.open_root()?);
        let mut cur = ROOT_INO;
        let mut dentries = Vec::new();
        let mut links = 0;
        while let Some(name) = names.pop_front() {
            let last = names.is_empty();
            step!(self.enter_dir(cur, ctx)?);
            let key = DentryKey::new(cur, name);
            let ino = step!(self.lookup_dentry(&key, ctx)?);
            dentries.push(key);
            let inode = self
                .cache
                .get_or_null(ino)
                .ok_or_else(|| MdsError::NotFound(format!("inode {}", ino)))?;
            if inode.attrs.is_symlink() && (!last || follow) {
                links += 1;
                if links > self.config.protocol.max_symlink_depth {
                    return Err(MdsError::InvalidPath(format!("too many symlinks in {}", path)));
                }
                let target = inode.attrs.symlink_target.clone().unwrap_or_default();
                for part in split_path(&target)?.into_iter().rev() {
                    names.push_front(part);
                }
                if target.starts_with('/') {
                    cur = ROOT_INO;
                }
                continue;
            }
            cur = ino;
        }
        Ok(Flow::Ready(Trace {
            dentries,
            target: cur,
        }))
    }

    fn open_root(&mut self) -> Result<Flow<()>> {
        if self.cache.contains(ROOT_INO) {
            return Ok(Flow::Ready(()));
        }
        let root = self.root_node();
        if self.id == root {
            self.bootstrap_root()?;
            return Ok(Flow::Ready(()));
        }
        self.discover(DiscoverTarget::Root, root);
        Ok(Flow::Blocked(WaitKey::Discover(DiscoverTarget::Root)))
    }

    /// Check that `dir` can be traversed and its fragment admits us.
    pub(crate) fn enter_dir(&mut self, dir: InodeId, ctx: Ctx) -> Result<Flow<()>> {
        let inode = self
            .cache
            .get_or_null(dir)
            .ok_or_else(|| MdsError::NotFound(format!("inode {}", dir)))?;
        if !inode.attrs.is_dir() {
            return Err(MdsError::NotADirectory(format!("inode {}", dir)));
        }
        if !ctx.creds.is_root() && !inode.attrs.is_searchable() {
            return Err(MdsError::PermissionDenied(format!("search on {}", dir)));
        }
        let authority = inode.authority;
        if self.cache.dir(dir).is_none() {
            self.cache.open_dir(dir, DirAuthority::Node(authority))?;
        }
        if let Some(root) = self.blocking_freeze(dir, ctx.admitted) {
            trace!(node = self.id, dir, root, "waiting for unfreeze");
            return Ok(Flow::Blocked(WaitKey::Unfreeze(root)));
        }
        Ok(Flow::Ready(()))
    }

    fn lookup_dentry(&mut self, key: &DentryKey, ctx: Ctx) -> Result<Flow<InodeId>> {
        let authority = self.dentry_authority(key)?;
        if let Some(dn) = self.cache.dentry(key) {
            if let Some(holder) = dn.lock.xlock_by {
                if Some(holder) != ctx.req {
                    return Ok(Flow::Blocked(WaitKey::Dentry(key.clone())));
                }
            }
            if dn.lock.state == DentryLockState::Stale {
                return Ok(Flow::Blocked(WaitKey::Dentry(key.clone())));
            }
            if let Some(ino) = dn.ino {
                if self.cache.contains(ino) {
                    self.cache.touch(ino);
                    return Ok(Flow::Ready(ino));
                }
            }
        }
        if authority == self.id {
            let complete = self.cache.dir(key.dir).map(|d| d.complete).unwrap_or(false);
            if !complete {
                self.load_dir(key.dir)?;
                if let Some(ino) = self.cache.dentry(key).and_then(|dn| dn.ino) {
                    return Ok(Flow::Ready(ino));
                }
            }
            return Err(MdsError::NotFound(key.to_string()));
        }
        let target = DiscoverTarget::Dentry(key.clone());
        self.discover(target.clone(), authority);
        Ok(Flow::Blocked(WaitKey::Discover(target)))
    }

    /// Node authoritative for the entry `key`.
    pub(crate) fn dentry_authority(&self, key: &DentryKey) -> Result<NodeId> {
        let frag = self
            .cache
            .dir(key.dir)
            .ok_or_else(|| MdsError::NotFound(format!("dir {}", key.dir)))?;
        Ok(match frag.authority {
            DirAuthority::Node(n) => n,
            DirAuthority::Hashed => self.placement.authority_for(key.dir, &key.name),
        })
    }

    /// Open `key`'s fragment and make sure an authoritative lookup of the
    /// entry is definitive. Returns the entry's authority.
    pub(crate) fn prepare_dentry(&mut self, key: &DentryKey, ctx: Ctx) -> Result<Flow<NodeId>> {
        step!(self.enter_dir(key.dir, ctx)?);
        let authority = self.dentry_authority(key)?;
        if authority == self.id && self.cache.dentry(key).and_then(|d| d.ino).is_none() {
            let complete = self.cache.dir(key.dir).map(|d| d.complete).unwrap_or(false);
            if !complete {
                self.load_dir(key.dir)?;
            }
        }
        Ok(Flow::Ready(authority))
    }

    /// Read the entries of an authoritative fragment (or our shard of a
    /// hashed one) from the store.
    pub(crate) fn load_dir(&mut self, dir: InodeId) -> Result<()> {
        let hashed = self
            .cache
            .dir(dir)
            .ok_or_else(|| MdsError::NotFound(format!("dir {}", dir)))?
            .authority
            .is_hashed();
        let listing = self.store.load_dir(dir)?;
        let mut loaded = 0usize;
        for (name, ino) in listing {
            if hashed && self.placement.authority_for(dir, &name) != self.id {
                continue;
            }
            let key = DentryKey::new(dir, name);
            if self.cache.dentry(&key).map(|dn| dn.ino.is_some()).unwrap_or(false) {
                continue;
            }
            if !self.cache.contains(ino) {
                let Some(attrs) = self.store.load(ino)? else {
                    warn!(node = self.id, %key, ino, "entry without attributes in store");
                    continue;
                };
                self.cache.add(CInode::new(ino, attrs, self.id).with_parent(key.clone()))?;
            }
            self.cache.link(&key, ino)?;
            loaded += 1;
        }
        if let Some(frag) = self.cache.dir_mut(dir) {
            frag.complete = true;
        }
        debug!(node = self.id, dir, loaded, "fragment loaded");
        Ok(())
    }

    /// First fragment whose freeze blocks traversal of `dir`.
    pub(crate) fn blocking_freeze(&self, dir: InodeId, admitted: bool) -> Option<InodeId> {
        let mut cur = dir;
        for _ in 0..=self.cache.len() {
            if let Some(frag) = self.cache.dir(cur) {
                let covers = cur == dir || frag.freeze_tree;
                let blocks = match frag.freeze {
                    FreezeState::Thawed => false,
                    FreezeState::Freezing => !admitted,
                    FreezeState::Frozen => true,
                };
                if covers && blocks {
                    return Some(cur);
                }
            }
            if cur == ROOT_INO {
                break;
            }
            match self.cache.get_or_null(cur).and_then(|i| i.parent.as_ref()) {
                Some(parent) => cur = parent.dir,
                None => break,
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    pub(crate) fn discover(&mut self, target: DiscoverTarget, to: NodeId) {
        if self.discovering.contains_key(&target) {
            return;
        }
        let tid = self.next_tid();
        let deadline = self.now + self.config.protocol.ack_timeout_ticks;
        debug!(node = self.id, to, ?target, "discovering");
        self.discovering.insert(target.clone(), tid);
        self.pending.insert(
            tid,
            Pending::Discover {
                target: target.clone(),
                deadline,
            },
        );
        self.send(to, MdsMessage::Discover { tid, target });
    }

    fn handle_discover(&mut self, from: NodeId, tid: Tid, target: DiscoverTarget) {
        let result = match self.discover_replica(from, &target) {
            Ok(Flow::Ready(replica)) => Ok(replica),
            Ok(Flow::Blocked(key)) => {
                let msg = MdsMessage::Discover { tid, target };
                self.wait(key, Waiter::Message { from, msg });
                return;
            }
            Ok(Flow::Forward(n)) => Err(ErrorKind::NotAuthoritative(Some(n))),
            Ok(Flow::Pending) => return,
            Err(e) => Err(e.kind()),
        };
        self.send(from, MdsMessage::DiscoverReply { tid, target, result });
    }

    /// Authority side of discovery: register `from` as a replica holder.
    fn discover_replica(&mut self, from: NodeId, target: &DiscoverTarget) -> Result<Flow<Replica>> {
        let key = match target {
            DiscoverTarget::Root => {
                let root = self.root_node();
                if self.id != root {
                    return Ok(Flow::Forward(root));
                }
                step!(self.open_root()?);
                if let Some(inode) = self.cache.get_mut(ROOT_INO) {
                    inode.replicas.insert(from);
                }
                let me = DirAuthority::Node(self.id);
                if let Some(frag) = self.cache.dir_mut(ROOT_INO) {
                    if frag.authority == me {
                        frag.replicas.insert(from);
                    }
                }
                return Ok(Flow::Ready(self.replica_of(ROOT_INO)?));
            }
            DiscoverTarget::Dentry(key) => key,
        };
        if self.cache.dir(key.dir).is_none() {
            let authority = match self.cache.get_or_null(key.dir) {
                Some(inode) if inode.attrs.is_dir() => inode.authority,
                _ => return Err(MdsError::NotAuthoritative { redirect: None }),
            };
            self.cache.open_dir(key.dir, DirAuthority::Node(authority))?;
        }
        if let Some(root) = self.blocking_freeze(key.dir, false) {
            return Ok(Flow::Blocked(WaitKey::Unfreeze(root)));
        }
        let authority = self.dentry_authority(key)?;
        if authority != self.id {
            return Ok(Flow::Forward(authority));
        }
        if self.cache.dentry(key).map(|dn| dn.lock.is_xlocked()).unwrap_or(false) {
            return Ok(Flow::Blocked(WaitKey::Dentry(key.clone())));
        }
        let ino = match self.cache.dentry(key).and_then(|dn| dn.ino) {
            Some(ino) => ino,
            None => {
                let complete = self.cache.dir(key.dir).map(|d| d.complete).unwrap_or(false);
                if !complete {
                    self.load_dir(key.dir)?;
                }
                self.cache
                    .dentry(key)
                    .and_then(|dn| dn.ino)
                    .ok_or_else(|| MdsError::NotFound(key.to_string()))?
            }
        };

        if let Some(frag) = self.cache.dir_mut(key.dir) {
            frag.replicas.insert(from);
        }
        let is_dir = match self.cache.get_mut(ino) {
            Some(inode) => {
                inode.replicas.insert(from);
                inode.attrs.is_dir()
            }
            None => return Err(MdsError::NotFound(format!("inode {}", ino))),
        };
        if is_dir {
            let me = DirAuthority::Node(self.id);
            let frag = self.cache.open_dir(ino, me)?;
            if frag.authority == me {
                frag.replicas.insert(from);
            }
        }
        self.cache.touch(ino);
        Ok(Flow::Ready(self.replica_of(ino)?))
    }

    /// Replica description of an inode we hold.
    pub(crate) fn replica_of(&self, ino: InodeId) -> Result<Replica> {
        let inode = self
            .cache
            .get_or_null(ino)
            .ok_or_else(|| MdsError::NotFound(format!("inode {}", ino)))?;
        let dir_auth = inode.attrs.is_dir().then(|| {
            self.cache
                .dir(ino)
                .map(|d| d.authority)
                .unwrap_or(DirAuthority::Node(inode.authority))
        });
        Ok(Replica {
            parent: inode.parent.clone(),
            ino,
            attrs: inode.attrs.clone(),
            authority: inode.authority,
            dir_auth,
            hard_sync: inode.hard.state == LockState::Sync,
            file_sync: inode.file.state == LockState::Sync,
        })
    }

    fn handle_discover_reply(
        &mut self,
        from: NodeId,
        tid: Tid,
        target: DiscoverTarget,
        result: std::result::Result<Replica, ErrorKind>,
    ) -> Result<()> {
        match self.pending.remove(&tid) {
            Some(Pending::Discover { target: t, .. }) if t == target => {}
            Some(other) => {
                self.pending.insert(tid, other);
                return Err(MdsError::ProtocolViolation(format!("discover reply {} mismatched", tid)));
            }
            None => {
                return Err(MdsError::ProtocolViolation(format!(
                    "unexpected discover reply {}",
                    tid
                )))
            }
        }
        self.discovering.remove(&target);
        let key = WaitKey::Discover(target.clone());
        match result {
            Ok(replica) => {
                if let Err(e) = self.install_replica(&replica) {
                    self.fail_waiters(&key, e.kind(), "replica install failed");
                    return Err(e);
                }
                self.wake(&key);
            }
            Err(ErrorKind::NotAuthoritative(Some(n))) if n != self.id && n != from => {
                debug!(node = self.id, ?target, redirect = n, "discover redirected");
                if let DiscoverTarget::Dentry(k) = &target {
                    self.note_dir_authority(k.dir, n);
                }
                self.wake(&key);
            }
            Err(kind) => self.fail_waiters(&key, kind, "discover failed"),
        }
        Ok(())
    }

    /// Adopt a redirect hint for a fragment we do not own.
    pub(crate) fn note_dir_authority(&mut self, dir: InodeId, authority: NodeId) {
        let me = DirAuthority::Node(self.id);
        if let Some(frag) = self.cache.dir_mut(dir) {
            if frag.authority != me {
                frag.authority = DirAuthority::Node(authority);
            }
        }
    }

    /// Install or refresh a replica handed out by its authority.
    pub(crate) fn install_replica(&mut self, rep: &Replica) -> Result<()> {
        let ino = rep.ino;
        if self.cache.is_auth(ino) {
            return Ok(());
        }
        if !self.cache.contains(ino) {
            self.cache
                .add(CInode::new(ino, rep.attrs.clone(), rep.authority))?;
        }
        self.cache.set_authority(ino, rep.authority);
        if let Some(inode) = self.cache.get_mut(ino) {
            inode.attrs = rep.attrs.clone();
            inode.hard.state = if rep.hard_sync { LockState::Sync } else { LockState::Lock };
            inode.file.state = if rep.file_sync { LockState::Sync } else { LockState::Lock };
        }
        if let Some(parent) = &rep.parent {
            if self.cache.dir(parent.dir).is_some() {
                self.cache.link(parent, ino)?;
            } else if let Some(inode) = self.cache.get_mut(ino) {
                inode.parent = Some(parent.clone());
            }
        }
        if let Some(authority) = rep.dir_auth {
            let me = DirAuthority::Node(self.id);
            match self.cache.dir_mut(ino) {
                Some(frag) if frag.authority != me => frag.authority = authority,
                Some(_) => {}
                None => {
                    self.cache.open_dir(ino, authority)?;
                }
            }
        }
        self.cache.touch(ino);
        Ok(())
    }

    fn handle_cache_expire(&mut self, from: NodeId, inodes: Vec<InodeId>, dirs: Vec<InodeId>) {
        trace!(node = self.id, from, inodes = inodes.len(), dirs = dirs.len(), "cache expire");
        for ino in inodes {
            if let Some(inode) = self.cache.get_mut(ino) {
                if inode.authority == self.id {
                    inode.replicas.remove(&from);
                }
            }
            self.drop_lock_replica(ino, from);
        }
        let me = DirAuthority::Node(self.id);
        for dir in dirs {
            if let Some(frag) = self.cache.dir_mut(dir) {
                if frag.authority == me {
                    frag.replicas.remove(&from);
                }
            }
        }
    }

    fn handle_dir_update(&mut self, dir: InodeId, authority: DirAuthority) {
        let me = DirAuthority::Node(self.id);
        if self.cache.dir(dir).map(|d| d.authority == me).unwrap_or(true) {
            return;
        }
        debug!(node = self.id, dir, %authority, "fragment authority updated");
        self.set_dir_authority(dir, authority);
    }

    /// Point `dir` and every cached child at `authority`.
    pub(crate) fn set_dir_authority(&mut self, dir: InodeId, authority: DirAuthority) {
        let me = DirAuthority::Node(self.id);
        let Some(frag) = self.cache.dir_mut(dir) else {
            return;
        };
        let was_auth = frag.authority == me;
        frag.authority = authority;
        if was_auth && authority != me {
            frag.replicas.clear();
            frag.complete = false;
        }
        let children: Vec<(String, InodeId)> =
            frag.linked().map(|(name, ino)| (name.clone(), ino)).collect();
        for (name, ino) in children {
            let owner = match authority {
                DirAuthority::Node(n) => n,
                DirAuthority::Hashed => self.placement.authority_for(dir, &name),
            };
            self.cache.set_authority(ino, owner);
        }
    }

    /// Auth fragments reachable from `root` without crossing a boundary,
    /// parents first.
    pub(crate) fn subtree_dirs(&self, root: InodeId) -> Vec<InodeId> {
        let me = DirAuthority::Node(self.id);
        let mut out = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(dir) = queue.pop_front() {
            let Some(frag) = self.cache.dir(dir) else {
                continue;
            };
            if frag.authority != me {
                continue;
            }
            out.push(dir);
            for (_, ino) in frag.linked() {
                if self.cache.dir(ino).is_some() {
                    queue.push_back(ino);
                }
            }
        }
        out
    }

    /// Nearest import root above `dir`, or the namespace root.
    pub(crate) fn containing_root(&self, dir: InodeId) -> InodeId {
        let mut cur = self
            .cache
            .get_or_null(dir)
            .and_then(|i| i.parent.as_ref())
            .map(|p| p.dir);
        let mut steps = 0;
        while let Some(d) = cur {
            if self.topology.is_import(d) {
                return d;
            }
            if d == ROOT_INO || steps > self.cache.len() {
                break;
            }
            cur = self
                .cache
                .get_or_null(d)
                .and_then(|i| i.parent.as_ref())
                .map(|p| p.dir);
            steps += 1;
        }
        ROOT_INO
    }

    /// Write one inode through to the store.
    pub(crate) fn persist(&mut self, ino: InodeId) -> Result<()> {
        let attrs = self
            .cache
            .get_or_null(ino)
            .map(|i| i.attrs.clone())
            .ok_or_else(|| MdsError::NotFound(format!("inode {}", ino)))?;
        self.cache.mark_dirty(ino);
        self.store.store(ino, &attrs)?;
        self.cache.mark_clean(ino);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Freezes
    // ------------------------------------------------------------------

    /// Stop admitting new requests into `dir` (and below it if `tree`);
    /// `owner` is told once admitted requests have drained.
    pub(crate) fn start_freeze(&mut self, dir: InodeId, tree: bool, owner: FreezeOwner) -> Result<()> {
        let frag = self
            .cache
            .dir_mut(dir)
            .ok_or_else(|| MdsError::NotFound(format!("dir {}", dir)))?;
        frag.freeze = FreezeState::Freezing;
        frag.freeze_tree = tree;
        self.freezing.insert(dir, owner);
        debug!(node = self.id, dir, tree, ?owner, "freezing");
        Ok(())
    }

    /// Freeze immediately, with nothing to drain (imports, shards).
    pub(crate) fn freeze_now(&mut self, dir: InodeId, tree: bool) {
        if let Some(frag) = self.cache.dir_mut(dir) {
            frag.freeze = FreezeState::Frozen;
            frag.freeze_tree = tree;
        }
    }

    pub(crate) fn unfreeze(&mut self, dir: InodeId) {
        self.freezing.remove(&dir);
        if let Some(frag) = self.cache.dir_mut(dir) {
            frag.freeze = FreezeState::Thawed;
            frag.freeze_tree = false;
        }
        debug!(node = self.id, dir, "unfrozen");
        self.wake(&WaitKey::Unfreeze(dir));
    }

    fn check_freezes(&mut self) {
        if self.freezing.is_empty() {
            return;
        }
        let candidates: Vec<(InodeId, FreezeOwner)> =
            self.freezing.iter().map(|(d, o)| (*d, *o)).collect();
        for (dir, owner) in candidates {
            if !self.freeze_drained(dir) {
                continue;
            }
            self.freezing.remove(&dir);
            if let Some(frag) = self.cache.dir_mut(dir) {
                frag.freeze = FreezeState::Frozen;
            }
            debug!(node = self.id, dir, "frozen");
            let result = match owner {
                FreezeOwner::Export => self.export_frozen(dir),
                FreezeOwner::Hash => self.hash_frozen(dir),
                FreezeOwner::UnhashDriver => self.unhash_driver_frozen(dir),
                FreezeOwner::UnhashPeer { driver, tid } => {
                    self.unhash_peer_frozen(dir, driver, tid);
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!(node = self.id, dir, error = %e, "frozen fragment handling failed");
            }
        }
    }

    /// No active request touches anything under the freeze.
    fn freeze_drained(&self, dir: InodeId) -> bool {
        let Some(frag) = self.cache.dir(dir) else {
            return true;
        };
        let tree = frag.freeze_tree;
        let in_scope = |d: InodeId| {
            if tree {
                self.cache.is_ancestor(dir, d)
            } else {
                d == dir
            }
        };
        for req in self.requests.active() {
            let touches = req.trace.iter().any(|k| in_scope(k.dir))
                || req.xlocks.iter().any(|k| in_scope(k.dir))
                || req.dir_pins.iter().any(|d| in_scope(*d))
                || req.inode_pins.iter().any(|i| {
                    in_scope(*i)
                        || self
                            .cache
                            .get_or_null(*i)
                            .and_then(|n| n.parent.as_ref())
                            .map(|p| in_scope(p.dir))
                            .unwrap_or(false)
                });
            if touches {
                return false;
            }
        }
        !self.foreign_grants.keys().any(|k| in_scope(k.dir))
    }

    // ------------------------------------------------------------------
    // Client operations
    // ------------------------------------------------------------------

    fn inode_body(&mut self, ino: InodeId) -> Result<ReplyBody> {
        self.cache.touch(ino);
        let inode = self
            .cache
            .get_or_null(ino)
            .ok_or_else(|| MdsError::NotFound(format!("inode {}", ino)))?;
        Ok(ReplyBody::Inode {
            ino,
            attrs: inode.attrs.clone(),
        })
    }

    fn op_lookup(&mut self, req: &ClientRequest, path: &str, ctx: Ctx) -> Result<Flow<ReplyBody>> {
        let trace = step!(self.resolve(path, false, ctx)?);
        self.requests
            .begin(&mut self.cache, req.id(), Some(trace.target), &trace.dentries)?;
        Ok(Flow::Ready(self.inode_body(trace.target)?))
    }

    fn op_stat(&mut self, req: &ClientRequest, path: &str, ctx: Ctx) -> Result<Flow<ReplyBody>> {
        let trace = step!(self.resolve(path, true, ctx)?);
        let id = req.id();
        self.requests
            .begin(&mut self.cache, id, Some(trace.target), &trace.dentries)?;
        step!(self.acquire_lock(id, trace.target, LockFacet::Hard, LockMode::Read)?);
        Ok(Flow::Ready(self.inode_body(trace.target)?))
    }

    fn op_read_size(&mut self, req: &ClientRequest, path: &str, ctx: Ctx) -> Result<Flow<ReplyBody>> {
        let trace = step!(self.resolve(path, true, ctx)?);
        let id = req.id();
        self.requests
            .begin(&mut self.cache, id, Some(trace.target), &trace.dentries)?;
        step!(self.acquire_lock(id, trace.target, LockFacet::File, LockMode::Read)?);
        let size = self
            .cache
            .get_or_null(trace.target)
            .map(|i| i.attrs.size)
            .ok_or_else(|| MdsError::NotFound(format!("inode {}", trace.target)))?;
        Ok(Flow::Ready(ReplyBody::Size(size)))
    }

    fn op_readdir(&mut self, req: &ClientRequest, path: &str, ctx: Ctx) -> Result<Flow<ReplyBody>> {
        let trace = step!(self.resolve(path, true, ctx)?);
        let dir = trace.target;
        step!(self.enter_dir(dir, ctx)?);
        let authority = self
            .dir_authority(dir)
            .ok_or_else(|| MdsError::NotFound(format!("dir {}", dir)))?;
        match authority {
            DirAuthority::Node(n) if n != self.id => Ok(Flow::Forward(n)),
            DirAuthority::Node(_) => {
                let complete = self.cache.dir(dir).map(|d| d.complete).unwrap_or(false);
                if !complete {
                    self.load_dir(dir)?;
                }
                self.requests
                    .begin(&mut self.cache, req.id(), Some(dir), &trace.dentries)?;
                let entries: Vec<DirEntry> = self
                    .cache
                    .dir(dir)
                    .map(|d| {
                        d.linked()
                            .map(|(name, ino)| DirEntry {
                                name: name.clone(),
                                ino,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Flow::Ready(ReplyBody::Entries(entries)))
            }
            DirAuthority::Hashed => {
                self.requests
                    .begin(&mut self.cache, req.id(), Some(dir), &trace.dentries)?;
                self.start_hashed_readdir(req.clone(), dir)
            }
        }
    }

    fn op_create(
        &mut self,
        req: &ClientRequest,
        path: &str,
        kind: NewInode,
        ctx: Ctx,
    ) -> Result<Flow<ReplyBody>> {
        let (parent_path, name) = split_parent(path)?;
        let parent = step!(self.resolve(&parent_path, true, ctx)?);
        let key = DentryKey::new(parent.target, name);
        let authority = step!(self.prepare_dentry(&key, ctx)?);
        if authority != self.id {
            return Ok(Flow::Forward(authority));
        }
        if self.cache.dentry(&key).and_then(|dn| dn.ino).is_some() {
            return Err(MdsError::AlreadyExists(path.to_string()));
        }
        let id = req.id();
        self.requests
            .begin(&mut self.cache, id, Some(parent.target), &parent.dentries)?;
        step!(self.acquire_xlock(id, &key)?);

        let ino = self.alloc_ino();
        let attrs = kind.attrs(req.creds, self.now);
        let is_dir = attrs.is_dir();
        self.cache
            .add(CInode::new(ino, attrs.clone(), self.id).with_parent(key.clone()))?;
        self.cache.link(&key, ino)?;
        if is_dir {
            self.cache.open_dir(ino, DirAuthority::Node(self.id))?.complete = true;
        }
        self.cache.mark_dirty(ino);
        self.store.store(ino, &attrs)?;
        self.store.link(key.dir, &key.name, ino)?;
        self.cache.mark_clean(ino);
        debug!(node = self.id, %key, ino, "created");
        Ok(Flow::Ready(ReplyBody::Inode { ino, attrs }))
    }

    fn op_unlink(&mut self, req: &ClientRequest, path: &str, ctx: Ctx) -> Result<Flow<ReplyBody>> {
        let (parent_path, name) = split_parent(path)?;
        let parent = step!(self.resolve(&parent_path, true, ctx)?);
        let key = DentryKey::new(parent.target, name);
        let authority = step!(self.prepare_dentry(&key, ctx)?);
        if authority != self.id {
            return Ok(Flow::Forward(authority));
        }
        let ino = self
            .cache
            .dentry(&key)
            .and_then(|dn| dn.ino)
            .ok_or_else(|| MdsError::NotFound(path.to_string()))?;
        let is_dir = self
            .cache
            .get_or_null(ino)
            .map(|i| i.attrs.is_dir())
            .ok_or_else(|| MdsError::NotFound(format!("inode {}", ino)))?;
        if is_dir {
            if self.topology.is_busy(ino) || self.topology.is_import(ino) || self.topology.is_hashed(ino) {
                return Err(MdsError::Conflict(format!("{} is a subtree root", path)));
            }
            let me = DirAuthority::Node(self.id);
            let frag = self.cache.open_dir(ino, me)?;
            if frag.authority != me {
                return Err(MdsError::Conflict(format!("{} is owned by {}", path, frag.authority)));
            }
            if !frag.complete {
                self.load_dir(ino)?;
            }
            if self.cache.dir(ino).map(|d| d.linked().next().is_some()).unwrap_or(false) {
                return Err(MdsError::DirectoryNotEmpty(path.to_string()));
            }
        }
        let id = req.id();
        self.requests
            .begin(&mut self.cache, id, Some(parent.target), &parent.dentries)?;
        step!(self.acquire_xlock(id, &key)?);

        self.cache.unlink(&key);
        self.store.unlink(key.dir, &key.name)?;
        self.store.remove(ino)?;
        if self.cache.get_or_null(ino).map(|i| i.ref_count() == 0).unwrap_or(false) {
            self.cache.remove_inode(ino);
        }
        debug!(node = self.id, %key, ino, "unlinked");
        Ok(Flow::Ready(ReplyBody::Done))
    }

    fn op_setattr(
        &mut self,
        req: &ClientRequest,
        path: &str,
        (mode, uid, gid): (Option<u32>, Option<u32>, Option<u32>),
        ctx: Ctx,
    ) -> Result<Flow<ReplyBody>> {
        let trace = step!(self.resolve(path, true, ctx)?);
        let ino = trace.target;
        let id = req.id();
        if let Some(authority) = self.cache.get_or_null(ino).map(|i| i.authority) {
            if authority != self.id {
                return Ok(Flow::Forward(authority));
            }
        }
        self.requests
            .begin(&mut self.cache, id, Some(ino), &trace.dentries)?;
        step!(self.acquire_lock(id, ino, LockFacet::Hard, LockMode::Write)?);
        let now = self.now;
        if let Some(inode) = self.cache.get_mut(ino) {
            if let Some(mode) = mode {
                inode.attrs.mode = mode;
            }
            if let Some(uid) = uid {
                inode.attrs.uid = uid;
            }
            if let Some(gid) = gid {
                inode.attrs.gid = gid;
            }
            inode.attrs.ctime = now;
            inode.attrs.version += 1;
        }
        self.persist(ino)?;
        Ok(Flow::Ready(self.inode_body(ino)?))
    }

    fn op_write(
        &mut self,
        req: &ClientRequest,
        path: &str,
        size: u64,
        mtime: u64,
        ctx: Ctx,
    ) -> Result<Flow<ReplyBody>> {
        let trace = step!(self.resolve(path, true, ctx)?);
        let ino = trace.target;
        let id = req.id();
        if let Some(authority) = self.cache.get_or_null(ino).map(|i| i.authority) {
            if authority != self.id {
                return Ok(Flow::Forward(authority));
            }
        }
        self.requests
            .begin(&mut self.cache, id, Some(ino), &trace.dentries)?;
        step!(self.acquire_lock(id, ino, LockFacet::File, LockMode::Write)?);
        if let Some(inode) = self.cache.get_mut(ino) {
            if inode.attrs.is_dir() {
                return Err(MdsError::InvalidOperation(format!("{} is a directory", path)));
            }
            inode.attrs.size = size;
            inode.attrs.mtime = mtime;
            inode.attrs.version += 1;
        }
        self.persist(ino)?;
        Ok(Flow::Ready(self.inode_body(ino)?))
    }
}

/// Split `path` into its parent path and final name.
pub(crate) fn split_parent(path: &str) -> Result<(String, String)> {
    let mut parts = split_path(path)?;
    let name = parts
        .pop()
        .ok_or_else(|| MdsError::InvalidPath(format!("{} has no final component", path)))?;
    Ok((format!("/{}", parts.join("/")), name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("/a/b/c").unwrap(), ("/a/b".to_string(), "c".to_string()));
        assert_eq!(split_parent("/a").unwrap(), ("/".to_string(), "a".to_string()));
        assert!(split_parent("/").is_err());
    }

    #[test]
    fn test_wait_keys_that_keep_handles() {
        let key = DentryKey::new(1, "a");
        assert!(WaitKey::Lock(1, LockFacet::Hard).retains_handle());
        assert!(WaitKey::XlockGather(key.clone()).retains_handle());
        assert!(WaitKey::ForeignXlock(key.clone()).retains_handle());
        assert!(!WaitKey::Dentry(key).retains_handle());
        assert!(!WaitKey::Unfreeze(1).retains_handle());
        assert!(!WaitKey::Discover(DiscoverTarget::Root).retains_handle());
    }
}
