//! Rename.
//!
//! When source and destination entries share an authority the rename is a
//! pair of local xlocks and a relink; replicas learn about it through the
//! xlock gather and the binding pushed on release.
//!
//! Otherwise three roles take part. The source (initiator) xlocks the old
//! entry, takes a foreign xlock on the new one and sends `Request`. The
//! destination warns every bystander, links the inode once all warnings are
//! acknowledged, and answers `Ack`. The source then unlinks, notifies the
//! bystanders and only releases its xlocks after their `NotifyAck`s. A
//! bystander treats both names as stale between the warning and the notify.
//!
//! The destination's `Ack` is the commit point. A source that hears
//! nothing sends `Cancel`, which only aborts a rename still warning its
//! bystanders; a committed destination answers it with another `Ack`.

use crate::error::{ErrorKind, MdsError, Result};
use crate::mds::cache::CInode;
use crate::mds::locker::DentryLockState;
use crate::mds::messages::{ClientRequest, MdsMessage, RenameMessage, ReplyBody};
use crate::mds::node::{split_parent, Ctx, Flow, MdsNode, WaitKey, Waiter};
use crate::mds::request::RequestId;
use crate::observability;
use crate::types::{DentryKey, DirAuthority, InodeAttrs, InodeId, NodeId, Tick, Tid};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorPhase {
    AwaitingAck,
    /// Request resends ran out; asking the destination whether it committed.
    Cancelling,
    Notifying,
}

#[derive(Debug, Clone)]
pub(crate) struct InitiatorRename {
    pub request: ClientRequest,
    pub src: DentryKey,
    pub dst: DentryKey,
    pub ino: InodeId,
    pub attrs: InodeAttrs,
    pub dir_auth: Option<DirAuthority>,
    pub dest: NodeId,
    pub phase: InitiatorPhase,
    pub bystanders: BTreeSet<NodeId>,
    pub notify_waiting: BTreeSet<NodeId>,
    pub deadline: Tick,
    pub resends: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestPhase {
    Warning,
    Committed,
}

#[derive(Debug, Clone)]
pub(crate) struct DestRename {
    pub src: DentryKey,
    pub dst: DentryKey,
    pub ino: InodeId,
    pub attrs: InodeAttrs,
    pub dir_auth: Option<DirAuthority>,
    pub req: RequestId,
    pub phase: DestPhase,
    pub bystanders: BTreeSet<NodeId>,
    pub warn_waiting: BTreeSet<NodeId>,
    pub deadline: Tick,
}

/// A warning a bystander holds while it is busy with the inode.
#[derive(Debug, Clone)]
pub(crate) struct QueuedWarning {
    pub from: NodeId,
    pub initiator: NodeId,
    pub tid: Tid,
    pub src: DentryKey,
    pub dst: DentryKey,
}

/// Rename in progress on a bystander, between warning and notify.
#[derive(Debug, Clone)]
pub(crate) struct BusyRename {
    pub initiator: NodeId,
    pub tid: Tid,
    pub src: DentryKey,
    pub dst: DentryKey,
}

#[derive(Debug, Default)]
pub(crate) struct Renamer {
    pub initiated: HashMap<Tid, InitiatorRename>,
    pub incoming: HashMap<(NodeId, Tid), DestRename>,
    pub rename_busy: HashMap<InodeId, BusyRename>,
    pub queued_warnings: HashMap<InodeId, VecDeque<QueuedWarning>>,
    /// Notifies that overtook their warning, with the tick they arrived.
    pub stray_notifies: HashMap<(NodeId, Tid), Tick>,
}

impl Renamer {
    pub fn is_idle(&self) -> bool {
        self.initiated.is_empty()
            && self.incoming.is_empty()
            && self.rename_busy.is_empty()
            && self.queued_warnings.is_empty()
    }
}

impl MdsNode {
    pub(crate) fn op_rename(
        &mut self,
        req: &ClientRequest,
        src: &str,
        dst: &str,
        ctx: Ctx,
    ) -> Result<Flow<ReplyBody>> {
        let (src_parent, src_name) = split_parent(src)?;
        let (dst_parent, dst_name) = split_parent(dst)?;
        let sp = step!(self.resolve(&src_parent, true, ctx)?);
        let src_key = DentryKey::new(sp.target, src_name);
        let src_auth = step!(self.prepare_dentry(&src_key, ctx)?);
        if src_auth != self.id {
            return Ok(Flow::Forward(src_auth));
        }
        let ino = self
            .cache
            .dentry(&src_key)
            .and_then(|dn| dn.ino)
            .ok_or_else(|| MdsError::NotFound(src.to_string()))?;
        let is_dir = self
            .cache
            .get_or_null(ino)
            .map(|i| i.attrs.is_dir())
            .ok_or_else(|| MdsError::NotFound(format!("inode {}", ino)))?;
        if is_dir
            && (self.topology.is_busy(ino) || self.topology.is_import(ino) || self.topology.is_hashed(ino))
        {
            return Err(MdsError::Conflict(format!("{} is a subtree root", src)));
        }

        let dp = step!(self.resolve(&dst_parent, true, ctx)?);
        let dst_key = DentryKey::new(dp.target, dst_name);
        if dst_key == src_key {
            return Ok(Flow::Ready(ReplyBody::Done));
        }
        if is_dir && self.cache.is_ancestor(ino, dp.target) {
            return Err(MdsError::InvalidOperation(format!("cannot move {} under itself", src)));
        }
        let dst_auth = step!(self.prepare_dentry(&dst_key, ctx)?);

        let id = req.id();
        self.requests
            .begin(&mut self.cache, id, Some(ino), &sp.dentries)?;
        self.requests.begin(&mut self.cache, id, None, &dp.dentries)?;

        if dst_auth == self.id {
            if self.cache.dentry(&dst_key).and_then(|dn| dn.ino).is_some() {
                return Err(MdsError::AlreadyExists(dst.to_string()));
            }
            step!(self.acquire_xlock(id, &src_key)?);
            step!(self.acquire_xlock(id, &dst_key)?);
            self.rename_local(&src_key, &dst_key, ino)?;
            observability::record_rename();
            return Ok(Flow::Ready(ReplyBody::Done));
        }

        step!(self.acquire_xlock(id, &src_key)?);
        step!(self.request_foreign_xlock(id, &dst_key, dst_auth)?);
        self.initiate_rename(req, src_key, dst_key, ino, dst_auth)?;
        Ok(Flow::Pending)
    }

    fn rename_local(&mut self, src: &DentryKey, dst: &DentryKey, ino: InodeId) -> Result<()> {
        self.cache.unlink(src);
        self.cache.link(dst, ino)?;
        let now = self.now;
        if let Some(inode) = self.cache.get_mut(ino) {
            inode.attrs.ctime = now;
            inode.attrs.version += 1;
        }
        self.store.link(dst.dir, &dst.name, ino)?;
        self.store.unlink(src.dir, &src.name)?;
        self.persist(ino)?;
        debug!(node = self.id, %src, %dst, ino, "renamed locally");
        Ok(())
    }

    fn initiate_rename(
        &mut self,
        req: &ClientRequest,
        src: DentryKey,
        dst: DentryKey,
        ino: InodeId,
        dest: NodeId,
    ) -> Result<()> {
        let inode = self
            .cache
            .get_or_null(ino)
            .ok_or_else(|| MdsError::NotFound(format!("inode {}", ino)))?;
        let mut attrs = inode.attrs.clone();
        attrs.ctime = self.now;
        attrs.version += 1;
        let mut bystanders = inode.replicas.clone();
        let dir_auth = attrs.is_dir().then(|| {
            self.cache
                .dir(ino)
                .map(|d| d.authority)
                .unwrap_or(DirAuthority::Node(self.id))
        });
        if let Some(frag) = self.cache.dir(src.dir) {
            bystanders.extend(frag.replicas.iter().copied());
        }
        bystanders.remove(&self.id);
        bystanders.remove(&dest);

        let tid = self.next_tid();
        let msg = RenameMessage::Request {
            tid,
            src: src.clone(),
            dst: dst.clone(),
            ino,
            attrs: attrs.clone(),
            dir_auth,
            bystanders: bystanders.iter().copied().collect(),
            req: req.id(),
        };
        info!(node = self.id, %src, %dst, ino, dest, tid, "rename started");
        self.renamer.initiated.insert(
            tid,
            InitiatorRename {
                request: req.clone(),
                src,
                dst,
                ino,
                attrs,
                dir_auth,
                dest,
                phase: InitiatorPhase::AwaitingAck,
                bystanders,
                notify_waiting: BTreeSet::new(),
                deadline: self.now + self.config.protocol.ack_timeout_ticks,
                resends: 0,
            },
        );
        self.send(dest, MdsMessage::Rename(msg));
        Ok(())
    }

    pub(crate) fn handle_rename_message(&mut self, from: NodeId, msg: RenameMessage) -> Result<()> {
        match msg {
            RenameMessage::Request {
                tid,
                src,
                dst,
                ino,
                attrs,
                dir_auth,
                bystanders,
                req,
            } => self.rename_request(
                from,
                tid,
                DestRename {
                    src,
                    dst,
                    ino,
                    attrs,
                    dir_auth,
                    req,
                    phase: DestPhase::Warning,
                    bystanders: bystanders.into_iter().collect(),
                    warn_waiting: BTreeSet::new(),
                    deadline: 0,
                },
            ),
            RenameMessage::Warning {
                initiator,
                tid,
                ino,
                src,
                dst,
            } => {
                self.bystander_warning(ino, QueuedWarning { from, initiator, tid, src, dst });
                Ok(())
            }
            RenameMessage::WarningAck { initiator, tid } => {
                let acked = match self.renamer.incoming.get_mut(&(initiator, tid)) {
                    Some(r) if r.phase == DestPhase::Warning => r.warn_waiting.remove(&from),
                    _ => false,
                };
                if !acked {
                    return Err(MdsError::ProtocolViolation(format!(
                        "unexpected rename warning ack for mds{}:{} from mds{}",
                        initiator, tid, from
                    )));
                }
                self.rename_maybe_commit(initiator, tid)
            }
            RenameMessage::Ack { tid, bystanders } => self.rename_acked(from, tid, bystanders),
            RenameMessage::Nak { tid, error } => self.rename_nak(from, tid, error),
            RenameMessage::Notify {
                initiator,
                tid,
                ino,
                src,
                dst,
                dir_auth,
            } => {
                self.bystander_notify(from, initiator, tid, ino, src, dst, dir_auth);
                Ok(())
            }
            RenameMessage::NotifyAck { tid } => {
                let done = match self.renamer.initiated.get_mut(&tid) {
                    Some(r) if r.phase == InitiatorPhase::Notifying && r.notify_waiting.contains(&from) => {
                        r.notify_waiting.remove(&from);
                        r.notify_waiting.is_empty()
                    }
                    _ => {
                        return Err(MdsError::ProtocolViolation(format!(
                            "unexpected rename notify ack {} from mds{}",
                            tid, from
                        )))
                    }
                };
                if done {
                    self.finish_rename(tid);
                }
                Ok(())
            }
            RenameMessage::Cancel { tid } => {
                self.rename_cancelled(from, tid);
                Ok(())
            }
            RenameMessage::Abort { initiator, tid, ino } => {
                self.bystander_abort(initiator, tid, ino);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Destination
    // ------------------------------------------------------------------

    fn rename_request(&mut self, from: NodeId, tid: Tid, mut incoming: DestRename) -> Result<()> {
        if let Some(existing) = self.renamer.incoming.get(&(from, tid)) {
            if existing.phase == DestPhase::Committed {
                let bystanders = existing.bystanders.iter().copied().collect();
                debug!(node = self.id, from, tid, "repeated rename request, re-acking");
                self.send(from, MdsMessage::Rename(RenameMessage::Ack { tid, bystanders }));
            }
            return Ok(());
        }
        if !self.holds_dest_grant(&incoming.dst, incoming.req) {
            warn!(node = self.id, dst = %incoming.dst, from, "rename without destination xlock");
            self.send(
                from,
                MdsMessage::Rename(RenameMessage::Nak {
                    tid,
                    error: ErrorKind::Conflict,
                }),
            );
            return Ok(());
        }
        if let Some(frag) = self.cache.dir(incoming.dst.dir) {
            incoming.bystanders.extend(frag.replicas.iter().copied());
        }
        incoming.bystanders.remove(&self.id);
        incoming.bystanders.remove(&from);
        incoming.warn_waiting = incoming.bystanders.clone();
        incoming.deadline = self.now + self.config.protocol.ack_timeout_ticks;

        let warning = RenameMessage::Warning {
            initiator: from,
            tid,
            ino: incoming.ino,
            src: incoming.src.clone(),
            dst: incoming.dst.clone(),
        };
        let warned: Vec<NodeId> = incoming.bystanders.iter().copied().collect();
        debug!(node = self.id, from, tid, bystanders = warned.len(), "rename warning bystanders");
        self.renamer.incoming.insert((from, tid), incoming);
        for node in warned {
            self.send(node, MdsMessage::Rename(warning.clone()));
        }
        self.rename_maybe_commit(from, tid)
    }

    fn holds_dest_grant(&self, key: &DentryKey, req: RequestId) -> bool {
        self.foreign_grants
            .get(key)
            .map(|g| g.req == req && g.acked)
            .unwrap_or(false)
    }

    /// Link the inode once every bystander acknowledged the warning.
    fn rename_maybe_commit(&mut self, initiator: NodeId, tid: Tid) -> Result<()> {
        let rename = match self.renamer.incoming.get(&(initiator, tid)) {
            Some(r) if r.phase == DestPhase::Warning && r.warn_waiting.is_empty() => r.clone(),
            _ => return Ok(()),
        };
        if !self.holds_dest_grant(&rename.dst, rename.req) {
            self.abort_incoming(initiator, tid, ErrorKind::Conflict);
            return Ok(());
        }

        let ino = rename.ino;
        if self.cache.contains(ino) {
            self.cache.set_authority(ino, self.id);
        } else {
            self.cache.add(
                CInode::new(ino, rename.attrs.clone(), self.id).with_parent(rename.dst.clone()),
            )?;
        }
        if let Some(inode) = self.cache.get_mut(ino) {
            inode.attrs = rename.attrs.clone();
            inode.replicas = rename.bystanders.iter().copied().collect();
            inode.replicas.insert(initiator);
        }
        self.cache.link(&rename.dst, ino)?;
        if let Some(authority) = rename.dir_auth {
            if self.cache.dir(ino).is_some() {
                self.set_dir_authority(ino, authority);
            } else {
                self.cache.open_dir(ino, authority)?;
            }
            if authority == DirAuthority::Node(self.id) {
                self.topology.remove_import(ino);
            }
        }
        self.store.link(rename.dst.dir, &rename.dst.name, ino)?;
        self.persist(ino)?;

        if let Some(r) = self.renamer.incoming.get_mut(&(initiator, tid)) {
            r.phase = DestPhase::Committed;
        }
        info!(node = self.id, dst = %rename.dst, ino, initiator, "rename committed");
        let bystanders = rename.bystanders.iter().copied().collect();
        self.send(initiator, MdsMessage::Rename(RenameMessage::Ack { tid, bystanders }));
        Ok(())
    }

    /// Give up before commit: release warned bystanders and tell the source.
    fn abort_incoming(&mut self, initiator: NodeId, tid: Tid, error: ErrorKind) {
        let Some(rename) = self.renamer.incoming.remove(&(initiator, tid)) else {
            return;
        };
        warn!(node = self.id, initiator, tid, ?error, "rename aborted at destination");
        for node in &rename.bystanders {
            self.send(
                *node,
                MdsMessage::Rename(RenameMessage::Abort {
                    initiator,
                    tid,
                    ino: rename.ino,
                }),
            );
        }
        self.send(initiator, MdsMessage::Rename(RenameMessage::Nak { tid, error }));
    }

    fn rename_cancelled(&mut self, from: NodeId, tid: Tid) {
        let Some(rename) = self.renamer.incoming.get(&(from, tid)) else {
            debug!(node = self.id, from, tid, "cancel for unknown rename");
            self.send(
                from,
                MdsMessage::Rename(RenameMessage::Nak {
                    tid,
                    error: ErrorKind::Timeout,
                }),
            );
            return;
        };
        match rename.phase {
            DestPhase::Warning => self.abort_incoming(from, tid, ErrorKind::Timeout),
            DestPhase::Committed => {
                let bystanders = rename.bystanders.iter().copied().collect();
                debug!(node = self.id, from, tid, dst = %rename.dst, "cancel after commit, re-acking");
                self.send(from, MdsMessage::Rename(RenameMessage::Ack { tid, bystanders }));
            }
        }
    }

    /// The foreign xlock held for `req` was released: its rename is over.
    pub(crate) fn rename_dest_released(&mut self, req: RequestId) {
        let done: Vec<((NodeId, Tid), DestPhase)> = self
            .renamer
            .incoming
            .iter()
            .filter(|(_, r)| r.req == req)
            .map(|(k, r)| (*k, r.phase))
            .collect();
        for ((initiator, tid), phase) in done {
            match phase {
                DestPhase::Committed => {
                    self.renamer.incoming.remove(&(initiator, tid));
                    debug!(node = self.id, initiator, tid, "rename released at destination");
                }
                DestPhase::Warning => self.abort_incoming(initiator, tid, ErrorKind::Conflict),
            }
        }
    }

    // ------------------------------------------------------------------
    // Source
    // ------------------------------------------------------------------

    fn rename_acked(&mut self, from: NodeId, tid: Tid, extra: Vec<NodeId>) -> Result<()> {
        let rename = match self.renamer.initiated.get(&tid) {
            Some(r) if r.dest == from && r.phase != InitiatorPhase::Notifying => r.clone(),
            Some(r) if r.dest == from => {
                debug!(node = self.id, tid, "duplicate rename ack ignored");
                return Ok(());
            }
            _ => {
                return Err(MdsError::ProtocolViolation(format!(
                    "unexpected rename ack {} from mds{}",
                    tid, from
                )))
            }
        };
        let ino = rename.ino;
        self.cache.unlink(&rename.src);
        self.store.unlink(rename.src.dir, &rename.src.name)?;
        self.cache.set_authority(ino, from);
        if let Some(inode) = self.cache.get_mut(ino) {
            inode.attrs = rename.attrs.clone();
        }
        if self.cache.dir(rename.dst.dir).is_some() {
            self.cache.link(&rename.dst, ino)?;
        }
        let me = DirAuthority::Node(self.id);
        let mut announce = false;
        if self.cache.dir(ino).map(|d| d.authority == me).unwrap_or(false) {
            self.topology.add_import(ino);
            announce = true;
        }

        let mut notify: BTreeSet<NodeId> = rename.bystanders.clone();
        notify.extend(extra);
        notify.remove(&self.id);
        notify.remove(&from);
        for node in &notify {
            self.send(
                *node,
                MdsMessage::Rename(RenameMessage::Notify {
                    initiator: self.id,
                    tid,
                    ino,
                    src: rename.src.clone(),
                    dst: rename.dst.clone(),
                    dir_auth: rename.dir_auth,
                }),
            );
        }
        if announce {
            for node in self.peers() {
                if node != from && !notify.contains(&node) {
                    self.send(node, MdsMessage::DirUpdate { dir: ino, authority: me });
                }
            }
        }
        let deadline = self.now + self.config.protocol.ack_timeout_ticks;
        let done = notify.is_empty();
        if let Some(r) = self.renamer.initiated.get_mut(&tid) {
            r.phase = InitiatorPhase::Notifying;
            r.notify_waiting = notify;
            r.deadline = deadline;
        }
        debug!(node = self.id, tid, ino, "rename unlinked at source");
        if done {
            self.finish_rename(tid);
        }
        Ok(())
    }

    fn rename_nak(&mut self, from: NodeId, tid: Tid, error: ErrorKind) -> Result<()> {
        let (request, phase) = match self.renamer.initiated.get(&tid) {
            Some(r) if r.dest == from && r.phase != InitiatorPhase::Notifying => {
                (r.request.clone(), r.phase)
            }
            _ => {
                return Err(MdsError::ProtocolViolation(format!(
                    "unexpected rename nak {} from mds{}",
                    tid, from
                )))
            }
        };
        self.renamer.initiated.remove(&tid);
        let err = error.into_error(format!("rename at mds{}", from));
        if phase == InitiatorPhase::AwaitingAck && err.is_retryable() {
            debug!(node = self.id, tid, %err, "rename refused, retrying");
            self.release_request(request.id());
            self.delay(Waiter::Request(request));
        } else {
            self.complete(&request, Err(err));
        }
        Ok(())
    }

    /// Bystanders are done: reply and release both xlocks.
    fn finish_rename(&mut self, tid: Tid) {
        let Some(rename) = self.renamer.initiated.remove(&tid) else {
            return;
        };
        info!(node = self.id, src = %rename.src, dst = %rename.dst, ino = rename.ino, "rename finished");
        observability::record_rename();
        self.complete(&rename.request, Ok(ReplyBody::Done));
    }

    // ------------------------------------------------------------------
    // Bystander
    // ------------------------------------------------------------------

    fn bystander_warning(&mut self, ino: InodeId, warning: QueuedWarning) {
        let key = (warning.initiator, warning.tid);
        if self.renamer.stray_notifies.remove(&key).is_some() {
            debug!(node = self.id, initiator = warning.initiator, tid = warning.tid, "warning after its notify");
            self.ack_warning(&warning);
            return;
        }
        if self.renamer.rename_busy.contains_key(&ino) {
            debug!(node = self.id, ino, tid = warning.tid, "rename warning queued");
            self.renamer
                .queued_warnings
                .entry(ino)
                .or_default()
                .push_back(warning);
            return;
        }
        for key in [&warning.src, &warning.dst] {
            if let Some(dn) = self.cache.dentry_mut(key) {
                dn.lock.state = DentryLockState::Stale;
            }
        }
        self.renamer.rename_busy.insert(
            ino,
            BusyRename {
                initiator: warning.initiator,
                tid: warning.tid,
                src: warning.src.clone(),
                dst: warning.dst.clone(),
            },
        );
        self.ack_warning(&warning);
    }

    fn ack_warning(&mut self, warning: &QueuedWarning) {
        self.send(
            warning.from,
            MdsMessage::Rename(RenameMessage::WarningAck {
                initiator: warning.initiator,
                tid: warning.tid,
            }),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn bystander_notify(
        &mut self,
        from: NodeId,
        initiator: NodeId,
        tid: Tid,
        ino: InodeId,
        src: DentryKey,
        dst: DentryKey,
        dir_auth: Option<DirAuthority>,
    ) {
        let ours = self
            .renamer
            .rename_busy
            .get(&ino)
            .map(|b| b.initiator == initiator && b.tid == tid)
            .unwrap_or(false);
        if !ours {
            self.renamer.stray_notifies.insert((initiator, tid), self.now);
        }

        if self.cache.dentry(&src).and_then(|dn| dn.ino) == Some(ino) {
            self.cache.unlink(&src);
        }
        if self.cache.contains(ino) && self.cache.dir(dst.dir).is_some() {
            if let Err(e) = self.cache.link(&dst, ino) {
                warn!(node = self.id, %dst, error = %e, "could not relink renamed inode");
            }
            if let Ok(authority) = self.dentry_authority(&dst) {
                if authority != self.id {
                    self.cache.set_authority(ino, authority);
                }
            }
        }
        let me = DirAuthority::Node(self.id);
        if let Some(authority) = dir_auth {
            if self.cache.dir(ino).map(|d| d.authority != me).unwrap_or(false) {
                self.set_dir_authority(ino, authority);
            }
        }
        debug!(node = self.id, %src, %dst, ino, "bystander applied rename");
        self.send(from, MdsMessage::Rename(RenameMessage::NotifyAck { tid }));
        if ours {
            self.release_bystander(ino);
        } else {
            self.clear_stale(&src, &dst);
        }
    }

    fn bystander_abort(&mut self, initiator: NodeId, tid: Tid, ino: InodeId) {
        let ours = self
            .renamer
            .rename_busy
            .get(&ino)
            .map(|b| b.initiator == initiator && b.tid == tid)
            .unwrap_or(false);
        if ours {
            debug!(node = self.id, ino, tid, "rename aborted, names trusted again");
            self.release_bystander(ino);
            return;
        }
        if let Some(queue) = self.renamer.queued_warnings.get_mut(&ino) {
            queue.retain(|w| !(w.initiator == initiator && w.tid == tid));
            if queue.is_empty() {
                self.renamer.queued_warnings.remove(&ino);
            }
        }
    }

    /// Trust both names of the finished rename of `ino` again and move on
    /// to the next queued warning.
    fn release_bystander(&mut self, ino: InodeId) {
        if let Some(busy) = self.renamer.rename_busy.remove(&ino) {
            self.clear_stale(&busy.src, &busy.dst);
        }
        let next = match self.renamer.queued_warnings.get_mut(&ino) {
            Some(queue) => {
                let next = queue.pop_front();
                if queue.is_empty() {
                    self.renamer.queued_warnings.remove(&ino);
                }
                next
            }
            None => None,
        };
        if let Some(warning) = next {
            self.bystander_warning(ino, warning);
        }
    }

    fn clear_stale(&mut self, src: &DentryKey, dst: &DentryKey) {
        for key in [src, dst] {
            if let Some(dn) = self.cache.dentry_mut(key) {
                if dn.lock.state == DentryLockState::Stale {
                    dn.lock.state = DentryLockState::Sync;
                }
            }
            self.wake(&WaitKey::Dentry(key.clone()));
        }
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    pub(crate) fn renamer_tick(&mut self) {
        let now = self.now;
        let max = self.config.protocol.max_resends;
        let ack_timeout = self.config.protocol.ack_timeout_ticks;

        let due: Vec<(Tid, InitiatorPhase)> = self
            .renamer
            .initiated
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(t, r)| (*t, r.phase))
            .collect();
        for (tid, phase) in due {
            match phase {
                InitiatorPhase::AwaitingAck => {
                    let Some(r) = self.renamer.initiated.get_mut(&tid) else {
                        continue;
                    };
                    if r.resends < max {
                        r.resends += 1;
                        r.deadline = now + ack_timeout;
                        let msg = RenameMessage::Request {
                            tid,
                            src: r.src.clone(),
                            dst: r.dst.clone(),
                            ino: r.ino,
                            attrs: r.attrs.clone(),
                            dir_auth: r.dir_auth,
                            bystanders: r.bystanders.iter().copied().collect(),
                            req: r.request.id(),
                        };
                        let dest = r.dest;
                        debug!(node = self.id, tid, dest, "resending rename request");
                        self.send(dest, MdsMessage::Rename(msg));
                        continue;
                    }
                    r.phase = InitiatorPhase::Cancelling;
                    r.deadline = now + ack_timeout;
                    let dest = r.dest;
                    warn!(node = self.id, tid, dest, "rename destination silent, cancelling");
                    self.send(dest, MdsMessage::Rename(RenameMessage::Cancel { tid }));
                }
                InitiatorPhase::Cancelling => {
                    let Some(r) = self.renamer.initiated.get_mut(&tid) else {
                        continue;
                    };
                    r.deadline = now + ack_timeout;
                    let dest = r.dest;
                    debug!(node = self.id, tid, dest, "resending rename cancel");
                    self.send(dest, MdsMessage::Rename(RenameMessage::Cancel { tid }));
                }
                InitiatorPhase::Notifying => {
                    if let Some(r) = self.renamer.initiated.get(&tid) {
                        warn!(node = self.id, tid, silent = ?r.notify_waiting, "dropping silent rename bystanders");
                    }
                    self.finish_rename(tid);
                }
            }
        }

        let due: Vec<(NodeId, Tid)> = self
            .renamer
            .incoming
            .iter()
            .filter(|(_, r)| r.phase == DestPhase::Warning && r.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        for (initiator, tid) in due {
            self.abort_incoming(initiator, tid, ErrorKind::Timeout);
        }

        let patience = 4 * ack_timeout;
        self.renamer
            .stray_notifies
            .retain(|_, at| *at + patience >= now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renamer_idle_by_default() {
        let r = Renamer::default();
        assert!(r.is_idle());
    }
}
