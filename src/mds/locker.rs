//! Lock Manager.
//!
//! Every inode carries two [`SimpleLock`]s (hard attributes and file data)
//! and every dentry a [`DentryLock`]. Only the authority moves a lock out of
//! `Sync`; replicas mirror the state the authority pushes to them and read
//! locally only while in `Sync`.
//!
//! Write access on an object with replicas first gathers a `LockAck` from
//! every replica. Dentry xlocks gather the same way from the fragment's
//! replicas, which mark the entry stale until the unlock pushes the new
//! binding. An xlock on a dentry owned by another node is a foreign xlock,
//! negotiated with `ReqXlock` and released with `Unxlock`.

use crate::error::{ErrorKind, MdsError, Result};
use crate::mds::messages::{LockMessage, MdsMessage, Replica};
use crate::mds::node::{Flow, MdsNode, Pending, WaitKey, Waiter};
use crate::mds::request::RequestId;
use crate::types::{DentryKey, DirAuthority, Epoch, InodeId, NodeId, Tick, Tid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

/// Lockable facet of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockFacet {
    /// Mode, ownership, link count.
    Hard,
    /// Size and modification time.
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    /// Shared read everywhere; replicas are current.
    #[default]
    Sync,
    /// The authority may write; replicas are stale.
    Lock,
    /// File facet only: readers and writers coexist on the authority.
    Mixed,
    /// Waiting for replicas to acknowledge a move to `Lock`.
    GatherLock,
}

/// Outcome of a write request against a [`SimpleLock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStep {
    Granted,
    Wait,
    /// Send `Lock { epoch }` to these replicas, then wait.
    Gather { to: Vec<NodeId>, epoch: Epoch },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Wrong epoch, unknown sender or no gather in progress.
    Stale,
    Pending,
    Complete,
}

/// Read/write state machine of one inode facet.
#[derive(Debug, Clone, Default)]
pub struct SimpleLock {
    pub state: LockState,
    pub readers: u32,
    pub writers: u32,
    gather: BTreeSet<NodeId>,
    epoch: Epoch,
    pub deadline: Option<Tick>,
}

impl SimpleLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// No holders and no gather outstanding.
    pub fn is_idle(&self) -> bool {
        self.readers == 0 && self.writers == 0 && self.gather.is_empty()
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn gathering(&self) -> &BTreeSet<NodeId> {
        &self.gather
    }

    /// Read on the authority. Returns whether the read was granted.
    pub fn auth_read(&mut self, facet: LockFacet) -> bool {
        let granted = match self.state {
            LockState::Sync | LockState::Mixed => true,
            LockState::Lock if self.writers == 0 => true,
            LockState::Lock => {
                if facet == LockFacet::File {
                    self.state = LockState::Mixed;
                    true
                } else {
                    false
                }
            }
            LockState::GatherLock => false,
        };
        if granted {
            self.readers += 1;
        }
        granted
    }

    /// Write on the authority.
    pub fn auth_write(
        &mut self,
        facet: LockFacet,
        replicas: &BTreeSet<NodeId>,
        deadline: Tick,
    ) -> WriteStep {
        match self.state {
            LockState::GatherLock => WriteStep::Wait,
            LockState::Sync if !replicas.is_empty() => {
                self.epoch += 1;
                self.gather = replicas.clone();
                self.state = LockState::GatherLock;
                self.deadline = Some(deadline);
                WriteStep::Gather {
                    to: replicas.iter().copied().collect(),
                    epoch: self.epoch,
                }
            }
            LockState::Mixed => {
                self.writers += 1;
                WriteStep::Granted
            }
            LockState::Sync | LockState::Lock => match facet {
                LockFacet::Hard if self.writers > 0 || self.readers > 0 => WriteStep::Wait,
                LockFacet::File if self.writers > 0 => WriteStep::Wait,
                _ => {
                    self.state = if facet == LockFacet::File && self.readers > 0 {
                        LockState::Mixed
                    } else {
                        LockState::Lock
                    };
                    self.writers += 1;
                    WriteStep::Granted
                }
            },
        }
    }

    pub fn ack(&mut self, from: NodeId, epoch: Epoch) -> AckOutcome {
        if self.state != LockState::GatherLock || epoch != self.epoch || !self.gather.remove(&from) {
            return AckOutcome::Stale;
        }
        self.finish_gather()
    }

    /// A replica went away while we were gathering from it.
    pub fn drop_replica(&mut self, node: NodeId) -> AckOutcome {
        if self.state != LockState::GatherLock || !self.gather.remove(&node) {
            return AckOutcome::Stale;
        }
        self.finish_gather()
    }

    fn finish_gather(&mut self) -> AckOutcome {
        if self.gather.is_empty() {
            self.state = LockState::Lock;
            self.deadline = None;
            AckOutcome::Complete
        } else {
            AckOutcome::Pending
        }
    }

    pub fn release(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.readers = self.readers.saturating_sub(1),
            LockMode::Write => self.writers = self.writers.saturating_sub(1),
        }
    }

    /// Return to `Sync` once no writer remains. Returns `true` if the state
    /// changed and replicas need the authoritative value.
    pub fn eval(&mut self) -> bool {
        if self.writers == 0 && matches!(self.state, LockState::Lock | LockState::Mixed) {
            self.state = LockState::Sync;
            true
        } else {
            false
        }
    }

    /// Abandon an expired gather. Returns `true` if one was abandoned.
    pub fn expire(&mut self, now: Tick) -> bool {
        match self.deadline {
            Some(deadline) if self.state == LockState::GatherLock && deadline <= now => {
                self.state = LockState::Sync;
                self.gather.clear();
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Replica side: reads are local only while the authority keeps us in sync.
    pub fn replica_readable(&self) -> bool {
        self.state == LockState::Sync
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DentryLockState {
    #[default]
    Sync,
    /// Authority: waiting for fragment replicas to mark the entry stale.
    GatherXlock,
    /// Authority: exclusively held.
    Xlock,
    /// Replica: the authority holds an xlock; the binding may change.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XlockStep {
    Granted,
    /// Another request holds the xlock or has the entry path-pinned.
    Busy,
    /// Send `DentryLock { epoch }` to these replicas, then wait.
    Gather { to: Vec<NodeId>, epoch: Epoch },
    /// Already reserved by this request; the gather is still running.
    Pending,
}

/// Exclusive lock on one directory entry.
#[derive(Debug, Clone, Default)]
pub struct DentryLock {
    pub state: DentryLockState,
    pub xlock_by: Option<RequestId>,
    gather: BTreeSet<NodeId>,
    epoch: Epoch,
    pub deadline: Option<Tick>,
}

impl DentryLock {
    pub fn is_xlocked(&self) -> bool {
        self.xlock_by.is_some()
    }

    pub fn try_xlock(
        &mut self,
        id: RequestId,
        replicas: &BTreeSet<NodeId>,
        pinned_by_others: bool,
        deadline: Tick,
    ) -> XlockStep {
        match self.xlock_by {
            Some(holder) if holder != id => XlockStep::Busy,
            Some(_) if self.state == DentryLockState::Xlock => XlockStep::Granted,
            Some(_) => XlockStep::Pending,
            None if pinned_by_others => XlockStep::Busy,
            None => {
                self.xlock_by = Some(id);
                if replicas.is_empty() {
                    self.state = DentryLockState::Xlock;
                    XlockStep::Granted
                } else {
                    self.epoch += 1;
                    self.gather = replicas.clone();
                    self.state = DentryLockState::GatherXlock;
                    self.deadline = Some(deadline);
                    XlockStep::Gather {
                        to: replicas.iter().copied().collect(),
                        epoch: self.epoch,
                    }
                }
            }
        }
    }

    pub fn ack(&mut self, from: NodeId, epoch: Epoch) -> AckOutcome {
        if self.state != DentryLockState::GatherXlock
            || epoch != self.epoch
            || !self.gather.remove(&from)
        {
            return AckOutcome::Stale;
        }
        if self.gather.is_empty() {
            self.state = DentryLockState::Xlock;
            self.deadline = None;
            AckOutcome::Complete
        } else {
            AckOutcome::Pending
        }
    }

    /// Release if held by `id`.
    pub fn unlock(&mut self, id: RequestId) -> bool {
        if self.xlock_by != Some(id) {
            return false;
        }
        self.xlock_by = None;
        self.state = DentryLockState::Sync;
        self.gather.clear();
        self.deadline = None;
        true
    }

    /// Holder of an expired gather, which loses the xlock.
    pub fn expire(&mut self, now: Tick) -> Option<RequestId> {
        match (self.deadline, self.xlock_by) {
            (Some(deadline), Some(holder))
                if self.state == DentryLockState::GatherXlock && deadline <= now =>
            {
                self.unlock(holder);
                Some(holder)
            }
            _ => None,
        }
    }
}

/// An xlock held on behalf of a request running on another node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ForeignGrant {
    pub from: NodeId,
    pub tid: Tid,
    pub req: RequestId,
    pub acked: bool,
}

impl MdsNode {
    /// Acquire `facet` of `ino` in `mode` for request `id`.
    ///
    /// Writes must run on the authority; a replica answers `Forward`.
    pub(crate) fn acquire_lock(
        &mut self,
        id: RequestId,
        ino: InodeId,
        facet: LockFacet,
        mode: LockMode,
    ) -> Result<Flow<()>> {
        if self
            .requests
            .get(&id)
            .map(|r| r.holds_lock(ino, facet, mode))
            .unwrap_or(false)
        {
            return Ok(Flow::Ready(()));
        }
        let deadline = self.now + self.config.protocol.ack_timeout_ticks;
        let inode = self
            .cache
            .get_mut(ino)
            .ok_or_else(|| MdsError::NotFound(format!("inode {}", ino)))?;
        let authority = inode.authority;

        if authority != self.id {
            if mode == LockMode::Write {
                return Ok(Flow::Forward(authority));
            }
            let lock = inode.lock_mut(facet);
            if lock.replica_readable() {
                lock.readers += 1;
                self.requests
                    .record_lock(&mut self.cache, id, ino, facet, mode)?;
                return Ok(Flow::Ready(()));
            }
            trace!(node = self.id, ino, ?facet, "replica read waits for sync");
            self.send(authority, MdsMessage::Lock(LockMessage::ReqRead { ino, facet }));
            return Ok(Flow::Blocked(WaitKey::Lock(ino, facet)));
        }

        let replicas = inode.replicas.clone();
        let lock = inode.lock_mut(facet);
        let step = match mode {
            LockMode::Read => {
                if lock.auth_read(facet) {
                    WriteStep::Granted
                } else {
                    WriteStep::Wait
                }
            }
            LockMode::Write => lock.auth_write(facet, &replicas, deadline),
        };
        match step {
            WriteStep::Granted => {
                self.requests
                    .record_lock(&mut self.cache, id, ino, facet, mode)?;
                Ok(Flow::Ready(()))
            }
            WriteStep::Wait => Ok(Flow::Blocked(WaitKey::Lock(ino, facet))),
            WriteStep::Gather { to, epoch } => {
                debug!(node = self.id, ino, ?facet, epoch, replicas = ?to, "gathering lock");
                self.gathering_locks.insert((ino, facet));
                for node in to {
                    self.send(node, MdsMessage::Lock(LockMessage::Lock { ino, facet, epoch }));
                }
                Ok(Flow::Blocked(WaitKey::Lock(ino, facet)))
            }
        }
    }

    pub(crate) fn release_lock(&mut self, ino: InodeId, facet: LockFacet, mode: LockMode) {
        let Some(inode) = self.cache.get_mut(ino) else {
            return;
        };
        inode.lock_mut(facet).release(mode);
        if inode.authority == self.id {
            self.eval_lock(ino, facet);
        }
        self.wake(&WaitKey::Lock(ino, facet));
    }

    /// Drop an idle authoritative lock back to `Sync`, pushing the value.
    pub(crate) fn eval_lock(&mut self, ino: InodeId, facet: LockFacet) {
        let Some(inode) = self.cache.get_mut(ino) else {
            return;
        };
        if !inode.lock_mut(facet).eval() {
            return;
        }
        let attrs = inode.attrs.clone();
        let replicas: Vec<NodeId> = inode.replicas.iter().copied().collect();
        trace!(node = self.id, ino, ?facet, "lock back to sync");
        for node in replicas {
            self.send(
                node,
                MdsMessage::Lock(LockMessage::Sync {
                    ino,
                    facet,
                    attrs: attrs.clone(),
                }),
            );
        }
        self.wake(&WaitKey::Lock(ino, facet));
    }

    /// Take the xlock on `key`, which must be authoritative here.
    pub(crate) fn acquire_xlock(&mut self, id: RequestId, key: &DentryKey) -> Result<Flow<()>> {
        let deadline = self.now + self.config.protocol.ack_timeout_ticks;
        let own_pin = self
            .requests
            .get(&id)
            .map(|r| r.trace.contains(key))
            .unwrap_or(false);
        let frag = self
            .cache
            .dir_mut(key.dir)
            .ok_or_else(|| MdsError::NotFound(format!("dir {}", key.dir)))?;
        let replicas = frag.replicas.clone();
        let dn = frag.entries.entry(key.name.clone()).or_default();
        let others = dn.pins.saturating_sub(u32::from(own_pin)) > 0;

        match dn.lock.try_xlock(id, &replicas, others, deadline) {
            XlockStep::Granted => {
                self.requests.record_xlock(id, key.clone());
                Ok(Flow::Ready(()))
            }
            XlockStep::Pending => Ok(Flow::Blocked(WaitKey::XlockGather(key.clone()))),
            XlockStep::Gather { to, epoch } => {
                debug!(node = self.id, %key, epoch, "gathering dentry xlock");
                self.requests.record_xlock(id, key.clone());
                self.gathering_dentries.insert(key.clone());
                for node in to {
                    self.send(
                        node,
                        MdsMessage::Lock(LockMessage::DentryLock {
                            key: key.clone(),
                            epoch,
                        }),
                    );
                }
                Ok(Flow::Blocked(WaitKey::XlockGather(key.clone())))
            }
            XlockStep::Busy => {
                self.drop_idle_null(key);
                Ok(Flow::Blocked(WaitKey::Dentry(key.clone())))
            }
        }
    }

    /// Release `id`'s xlock on `key` and push the entry's binding to the
    /// fragment replicas.
    pub(crate) fn release_xlock(&mut self, key: &DentryKey, id: RequestId) {
        let released = self
            .cache
            .dentry_mut(key)
            .map(|dn| dn.lock.unlock(id))
            .unwrap_or(false);
        if !released {
            return;
        }
        self.gathering_dentries.remove(key);
        if self
            .foreign_grants
            .get(key)
            .map(|g| g.req == id)
            .unwrap_or(false)
        {
            self.foreign_grants.remove(key);
        }
        self.push_binding(key);
        self.drop_idle_null(key);
        self.wake(&WaitKey::Dentry(key.clone()));
        self.wake(&WaitKey::XlockGather(key.clone()));
    }

    /// Send the current binding of `key` to every replica of its fragment.
    fn push_binding(&mut self, key: &DentryKey) {
        let Some(frag) = self.cache.dir(key.dir) else {
            return;
        };
        let replicas: Vec<NodeId> = frag.replicas.iter().copied().collect();
        if replicas.is_empty() {
            return;
        }
        let binding = frag.lookup(&key.name);
        if let Some(ino) = binding {
            if let Some(inode) = self.cache.get_mut(ino) {
                if inode.authority == self.id {
                    inode.replicas.extend(replicas.iter().copied());
                }
            }
        }
        let binding: Option<Replica> = binding.and_then(|ino| self.replica_of(ino).ok());
        for node in replicas {
            self.send(
                node,
                MdsMessage::Lock(LockMessage::DentryUnlock {
                    key: key.clone(),
                    binding: binding.clone(),
                }),
            );
        }
    }

    fn drop_idle_null(&mut self, key: &DentryKey) {
        let Some(frag) = self.cache.dir_mut(key.dir) else {
            return;
        };
        let idle = frag
            .entries
            .get(&key.name)
            .map(|dn| dn.ino.is_none() && dn.pins == 0 && !dn.lock.is_xlocked())
            .unwrap_or(false);
        if idle {
            frag.entries.remove(&key.name);
        }
    }

    /// Ask `to`, the authority of `key`, for an xlock on behalf of `id`.
    pub(crate) fn request_foreign_xlock(
        &mut self,
        id: RequestId,
        key: &DentryKey,
        to: NodeId,
    ) -> Result<Flow<()>> {
        if self
            .requests
            .get(&id)
            .map(|r| r.foreign_xlocks.contains_key(key))
            .unwrap_or(false)
        {
            return Ok(Flow::Ready(()));
        }
        let outstanding = self.pending.values().any(|p| {
            matches!(p, Pending::ForeignXlock { key: k, req, .. } if k == key && *req == id)
        });
        if !outstanding {
            let tid = self.next_tid();
            let deadline = self.now + self.config.protocol.ack_timeout_ticks;
            self.pending.insert(
                tid,
                Pending::ForeignXlock {
                    key: key.clone(),
                    req: id,
                    to,
                    deadline,
                },
            );
            debug!(node = self.id, %key, to, %id, "requesting foreign xlock");
            self.send(
                to,
                MdsMessage::Lock(LockMessage::ReqXlock {
                    tid,
                    key: key.clone(),
                    req: id,
                }),
            );
        }
        Ok(Flow::Blocked(WaitKey::ForeignXlock(key.clone())))
    }

    /// A foreign xlock request failed: drop the request's handle, then
    /// retry it later or fail it.
    pub(crate) fn foreign_xlock_failed(
        &mut self,
        from: NodeId,
        key: &DentryKey,
        id: RequestId,
        error: ErrorKind,
    ) {
        let Some(req) = self.take_request_waiter(&WaitKey::ForeignXlock(key.clone()), id) else {
            debug!(node = self.id, %key, %id, "foreign xlock refused for a gone request");
            return;
        };
        self.release_request(id);
        match error {
            ErrorKind::NotAuthoritative(Some(n)) if n != from => {
                self.note_dir_authority(key.dir, n);
                self.delay(Waiter::Request(req));
            }
            ErrorKind::Conflict | ErrorKind::Frozen | ErrorKind::NotAuthoritative(_) => {
                self.delay(Waiter::Request(req))
            }
            kind => self.complete(&req, Err(kind.into_error(format!("xlock on {}", key)))),
        }
    }

    /// Authority side of `ReqXlock`.
    fn grant_foreign_xlock(&mut self, from: NodeId, tid: Tid, key: DentryKey, req: RequestId) {
        let nak = |error| {
            MdsMessage::Lock(LockMessage::XlockNak {
                tid,
                key: key.clone(),
                error,
            })
        };
        if let Some(grant) = self.foreign_grants.get(&key) {
            if grant.req == req {
                let acked = grant.acked;
                let grant_tid = grant.tid;
                if acked {
                    self.send(
                        from,
                        MdsMessage::Lock(LockMessage::XlockAck {
                            tid: grant_tid,
                            key,
                            req,
                        }),
                    );
                }
                return;
            }
            self.send(from, nak(ErrorKind::Conflict));
            return;
        }
        let authority = match self.prepare_foreign_target(&key) {
            Ok(auth) => auth,
            Err(e) => {
                self.send(from, nak(e.kind()));
                return;
            }
        };
        if authority != self.id {
            self.send(from, nak(ErrorKind::NotAuthoritative(Some(authority))));
            return;
        }
        if self.blocking_freeze(key.dir, false).is_some() {
            self.send(from, nak(ErrorKind::Frozen));
            return;
        }
        if self.cache.dentry(&key).and_then(|dn| dn.ino).is_some() {
            self.send(from, nak(ErrorKind::AlreadyExists));
            return;
        }
        let deadline = self.now + self.config.protocol.ack_timeout_ticks;
        let Some(frag) = self.cache.dir_mut(key.dir) else {
            self.send(from, nak(ErrorKind::NotFound));
            return;
        };
        let replicas = frag.replicas.clone();
        let dn = frag.entries.entry(key.name.clone()).or_default();
        let busy = dn.pins > 0;
        match dn.lock.try_xlock(req, &replicas, busy, deadline) {
            XlockStep::Granted => {
                debug!(node = self.id, %key, %req, from, "foreign xlock granted");
                self.foreign_grants.insert(
                    key.clone(),
                    ForeignGrant {
                        from,
                        tid,
                        req,
                        acked: true,
                    },
                );
                self.send(from, MdsMessage::Lock(LockMessage::XlockAck { tid, key, req }));
            }
            XlockStep::Gather { to, epoch } => {
                self.foreign_grants.insert(
                    key.clone(),
                    ForeignGrant {
                        from,
                        tid,
                        req,
                        acked: false,
                    },
                );
                self.gathering_dentries.insert(key.clone());
                for node in to {
                    self.send(
                        node,
                        MdsMessage::Lock(LockMessage::DentryLock {
                            key: key.clone(),
                            epoch,
                        }),
                    );
                }
            }
            XlockStep::Busy | XlockStep::Pending => {
                self.drop_idle_null(&key);
                self.send(from, nak(ErrorKind::Conflict));
            }
        }
    }

    /// Make sure the fragment of `key` is open and its entries known.
    /// Returns the dentry's authority.
    fn prepare_foreign_target(&mut self, key: &DentryKey) -> Result<NodeId> {
        if self.cache.dir(key.dir).is_none() {
            let inode = self
                .cache
                .get_or_null(key.dir)
                .ok_or(MdsError::NotAuthoritative { redirect: None })?;
            let authority = inode.authority;
            self.cache.open_dir(key.dir, DirAuthority::Node(authority))?;
        }
        let authority = self.dentry_authority(key)?;
        if authority == self.id {
            let complete = self.cache.dir(key.dir).map(|d| d.complete).unwrap_or(false);
            if !complete && self.cache.dentry(key).is_none() {
                self.load_dir(key.dir)?;
            }
        }
        Ok(authority)
    }

    pub(crate) fn handle_lock_message(&mut self, from: NodeId, msg: LockMessage) -> Result<()> {
        match msg {
            LockMessage::Lock { ino, facet, epoch } => {
                if let Some(inode) = self.cache.get_mut(ino) {
                    if inode.authority != self.id {
                        inode.lock_mut(facet).state = LockState::Lock;
                    }
                }
                self.send(from, MdsMessage::Lock(LockMessage::LockAck { ino, facet, epoch }));
            }
            LockMessage::LockAck { ino, facet, epoch } => {
                let inode = self.cache.get_mut(ino).ok_or_else(|| {
                    MdsError::ProtocolViolation(format!("lock ack for uncached inode {}", ino))
                })?;
                match inode.lock_mut(facet).ack(from, epoch) {
                    AckOutcome::Complete => {
                        trace!(node = self.id, ino, ?facet, "lock gather complete");
                        self.gathering_locks.remove(&(ino, facet));
                        self.wake(&WaitKey::Lock(ino, facet));
                    }
                    AckOutcome::Pending => {}
                    AckOutcome::Stale => {
                        return Err(MdsError::ProtocolViolation(format!(
                            "stale lock ack for {} epoch {}",
                            ino, epoch
                        )))
                    }
                }
            }
            LockMessage::Sync { ino, facet, attrs } => {
                if let Some(inode) = self.cache.get_mut(ino) {
                    if inode.authority != self.id {
                        inode.apply_facet(facet, &attrs);
                        inode.lock_mut(facet).state = LockState::Sync;
                        self.wake(&WaitKey::Lock(ino, facet));
                    }
                }
            }
            LockMessage::ReqRead { ino, facet } => {
                let Some(inode) = self.cache.get_mut(ino) else {
                    debug!(node = self.id, ino, "read request for uncached inode dropped");
                    return Ok(());
                };
                if inode.authority != self.id {
                    let authority = inode.authority;
                    if authority != from {
                        self.send(authority, MdsMessage::Lock(LockMessage::ReqRead { ino, facet }));
                    }
                    return Ok(());
                }
                inode.replicas.insert(from);
                if inode.lock(facet).state == LockState::Sync {
                    let attrs = inode.attrs.clone();
                    self.send(from, MdsMessage::Lock(LockMessage::Sync { ino, facet, attrs }));
                } else {
                    self.eval_lock(ino, facet);
                }
            }
            LockMessage::DentryLock { key, epoch } => {
                let owner = self.dentry_authority(&key).ok();
                if owner != Some(self.id) {
                    if let Some(dn) = self.cache.dentry_mut(&key) {
                        dn.lock.state = DentryLockState::Stale;
                    }
                }
                self.send(from, MdsMessage::Lock(LockMessage::DentryLockAck { key, epoch }));
            }
            LockMessage::DentryLockAck { key, epoch } => {
                let outcome = self
                    .cache
                    .dentry_mut(&key)
                    .map(|dn| dn.lock.ack(from, epoch))
                    .unwrap_or(AckOutcome::Stale);
                match outcome {
                    AckOutcome::Complete => {
                        self.gathering_dentries.remove(&key);
                        let grant = self.foreign_grants.get_mut(&key).filter(|g| !g.acked).map(|g| {
                            g.acked = true;
                            (g.from, g.tid, g.req)
                        });
                        if let Some((to, tid, req)) = grant {
                            self.send(
                                to,
                                MdsMessage::Lock(LockMessage::XlockAck {
                                    tid,
                                    key: key.clone(),
                                    req,
                                }),
                            );
                        }
                        self.wake(&WaitKey::XlockGather(key));
                    }
                    AckOutcome::Pending => {}
                    AckOutcome::Stale => {
                        return Err(MdsError::ProtocolViolation(format!(
                            "stale dentry lock ack for {}",
                            key
                        )))
                    }
                }
            }
            LockMessage::DentryUnlock { key, binding } => self.apply_dentry_unlock(key, binding)?,
            LockMessage::ReqXlock { tid, key, req } => self.grant_foreign_xlock(from, tid, key, req),
            LockMessage::XlockAck { tid, key, req } => {
                match self.pending.remove(&tid) {
                    Some(Pending::ForeignXlock { req: r, key: k, .. }) if k == key && r == req => {}
                    Some(other) => {
                        self.pending.insert(tid, other);
                        return Err(MdsError::ProtocolViolation(format!("xlock ack {} mismatched", tid)));
                    }
                    None => {
                        // The request gave up; hand the xlock straight back.
                        warn!(node = self.id, %key, from, "late foreign xlock returned");
                        self.send(from, MdsMessage::Lock(LockMessage::Unxlock { key, req }));
                        return Ok(());
                    }
                }
                if self.requests.is_active(&req) {
                    self.requests.record_foreign_xlock(req, key.clone(), from);
                    self.wake(&WaitKey::ForeignXlock(key));
                } else {
                    self.send(from, MdsMessage::Lock(LockMessage::Unxlock { key, req }));
                }
            }
            LockMessage::XlockNak { tid, key, error } => match self.pending.remove(&tid) {
                Some(Pending::ForeignXlock { req, .. }) => {
                    debug!(node = self.id, %key, ?error, "foreign xlock refused");
                    self.foreign_xlock_failed(from, &key, req, error);
                }
                Some(other) => {
                    self.pending.insert(tid, other);
                    return Err(MdsError::ProtocolViolation(format!("xlock nak {} mismatched", tid)));
                }
                None => debug!(node = self.id, tid, "stale xlock nak dropped"),
            },
            LockMessage::Unxlock { key, req } => {
                self.release_xlock(&key, req);
                self.rename_dest_released(req);
            }
        }
        Ok(())
    }

    /// Replica side of an xlock release.
    fn apply_dentry_unlock(&mut self, key: DentryKey, binding: Option<Replica>) -> Result<()> {
        if self.cache.dir(key.dir).is_none() {
            return Ok(());
        }
        match binding {
            Some(rep) => self.install_replica(&rep)?,
            None => {
                if let Some(ino) = self.cache.unlink(&key) {
                    let orphan = self
                        .cache
                        .get_or_null(ino)
                        .map(|i| i.ref_count() == 0 && i.authority != self.id)
                        .unwrap_or(false);
                    if orphan && self.cache.dir(ino).map(|d| d.entries.is_empty()).unwrap_or(true) {
                        self.cache.remove_inode(ino);
                    }
                }
            }
        }
        if let Some(dn) = self.cache.dentry_mut(&key) {
            if dn.lock.state == DentryLockState::Stale {
                dn.lock.state = DentryLockState::Sync;
            }
        }
        self.wake(&WaitKey::Dentry(key));
        Ok(())
    }

    /// Abandon lock and xlock gathers whose deadline passed.
    pub(crate) fn expire_lock_gathers(&mut self) {
        let now = self.now;
        let locks: Vec<(InodeId, LockFacet)> = self.gathering_locks.iter().copied().collect();
        for (ino, facet) in locks {
            let Some(inode) = self.cache.get_mut(ino) else {
                self.gathering_locks.remove(&(ino, facet));
                continue;
            };
            if !inode.lock_mut(facet).expire(now) {
                continue;
            }
            warn!(node = self.id, ino, ?facet, "lock gather timed out");
            self.gathering_locks.remove(&(ino, facet));
            let attrs = inode.attrs.clone();
            let replicas: Vec<NodeId> = inode.replicas.iter().copied().collect();
            for node in replicas {
                self.send(
                    node,
                    MdsMessage::Lock(LockMessage::Sync {
                        ino,
                        facet,
                        attrs: attrs.clone(),
                    }),
                );
            }
            self.fail_waiters(&WaitKey::Lock(ino, facet), ErrorKind::Timeout, "lock gather timed out");
        }

        let dentries: Vec<DentryKey> = self.gathering_dentries.iter().cloned().collect();
        for key in dentries {
            let holder = self.cache.dentry_mut(&key).and_then(|dn| dn.lock.expire(now));
            let Some(holder) = holder else {
                if self.cache.dentry(&key).map(|dn| !dn.lock.is_xlocked()).unwrap_or(true) {
                    self.gathering_dentries.remove(&key);
                }
                continue;
            };
            warn!(node = self.id, %key, %holder, "dentry xlock gather timed out");
            self.gathering_dentries.remove(&key);
            self.push_binding(&key);
            if let Some(grant) = self.foreign_grants.remove(&key) {
                self.send(
                    grant.from,
                    MdsMessage::Lock(LockMessage::XlockNak {
                        tid: grant.tid,
                        key: key.clone(),
                        error: ErrorKind::Timeout,
                    }),
                );
            }
            self.drop_idle_null(&key);
            self.fail_waiters(
                &WaitKey::XlockGather(key.clone()),
                ErrorKind::Timeout,
                "dentry xlock gather timed out",
            );
            self.wake(&WaitKey::Dentry(key));
        }
    }

    /// A replica holder expired its copy of `ino`; stop waiting on it.
    pub(crate) fn drop_lock_replica(&mut self, ino: InodeId, node: NodeId) {
        for facet in [LockFacet::Hard, LockFacet::File] {
            let Some(inode) = self.cache.get_mut(ino) else {
                return;
            };
            if inode.lock_mut(facet).drop_replica(node) == AckOutcome::Complete {
                self.gathering_locks.remove(&(ino, facet));
                self.wake(&WaitKey::Lock(ino, facet));
            }
        }
    }
}
