//! Subtree migration: export on the current authority, import on the
//! destination, authority updates on bystanders.
//!
//! Exporter phases run `Discovering -> Prepping -> Freezing -> Exporting ->
//! Notifying`; the importer mirrors them as `Discovered -> Prepped ->
//! Imported`. Everything up to the `Dir` message may be cancelled. Once
//! `Dir` is sent the export always completes: a silent importer gets the
//! payload re-sent up to `max_resends` times and silent bystanders are
//! dropped from the notify gather.

use crate::error::{ErrorKind, MdsError, Result};
use crate::mds::cache::CInode;
use crate::mds::messages::{ExportMessage, ExportPayload, ExportedDentry, ExportedDir, MdsMessage};
use crate::mds::node::{Ctx, Flow, FreezeOwner, MdsNode, WaitKey, Waiter};
use crate::observability;
use crate::types::{DentryKey, DirAuthority, InodeId, NodeId, Tick, Tid, ROOT_INO};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPhase {
    Discovering,
    Prepping,
    Freezing,
    Exporting,
    Notifying,
}

#[derive(Debug, Clone)]
pub(crate) struct ExportState {
    pub dest: NodeId,
    pub tid: Tid,
    pub phase: ExportPhase,
    pub deadline: Tick,
    pub bystanders: BTreeSet<NodeId>,
    /// Fragments shipped in the payload, parents first.
    pub dirs: Vec<InodeId>,
    pub notify_waiting: BTreeSet<NodeId>,
    /// Notify acks that beat the importer's `DirAck`.
    pub early_acks: BTreeSet<NodeId>,
    pub payload: Vec<u8>,
    pub resends: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    Discovered,
    Prepped,
    Imported,
}

#[derive(Debug, Clone)]
pub(crate) struct ImportState {
    pub exporter: NodeId,
    pub tid: Tid,
    pub phase: ImportPhase,
    /// Tick of the last step, for expiring abandoned imports.
    pub since: Tick,
}

/// Migration state of one node.
#[derive(Debug, Default)]
pub(crate) struct Migrator {
    pub exports: BTreeMap<InodeId, ExportState>,
    pub imports: BTreeMap<InodeId, ImportState>,
    /// Warned bystander moves: fragment to (exporter, tid).
    pub warned: BTreeMap<InodeId, (NodeId, Tid)>,
}

impl Migrator {
    pub fn is_idle(&self) -> bool {
        self.exports.is_empty() && self.imports.is_empty()
    }
}

impl MdsNode {
    /// Start exporting the subtree rooted at fragment `dir` to `dest`.
    pub fn export_dir(&mut self, dir: InodeId, dest: NodeId) -> Result<()> {
        if dest == self.id || !self.config.cluster.nodes.contains(&dest) {
            return Err(MdsError::InvalidOperation(format!("cannot export to mds{}", dest)));
        }
        if dir == ROOT_INO {
            return Err(MdsError::InvalidOperation("the root fragment is not exportable".into()));
        }
        let frag = self
            .cache
            .dir(dir)
            .ok_or_else(|| MdsError::NotFound(format!("dir {}", dir)))?;
        match frag.authority {
            DirAuthority::Node(n) if n == self.id => {}
            DirAuthority::Node(n) => return Err(MdsError::NotAuthoritative { redirect: Some(n) }),
            DirAuthority::Hashed => {
                return Err(MdsError::Conflict(format!("{} is hashed", dir)));
            }
        }
        if self.blocking_freeze(dir, false).is_some() {
            return Err(MdsError::Conflict(format!("{} is inside a freeze", dir)));
        }
        let subtree = self.subtree_dirs(dir);
        if let Some(busy) = subtree
            .iter()
            .find(|d| self.topology.is_busy(**d) || self.topology.is_hashed(**d))
        {
            return Err(MdsError::Conflict(format!("{} contains {} in flight or hashed", dir, busy)));
        }
        let path = self
            .cache
            .path_of(dir)
            .ok_or_else(|| MdsError::NotFound(format!("path of {}", dir)))?;
        let root = self.containing_root(dir);
        self.topology.begin_export(dir, root)?;
        self.cache.pin_inode(dir)?;
        self.cache.pin_dir(dir)?;

        let tid = self.next_tid();
        let deadline = self.now + self.config.protocol.ack_timeout_ticks;
        info!(node = self.id, dir, dest, tid, "export started");
        self.migrator.exports.insert(
            dir,
            ExportState {
                dest,
                tid,
                phase: ExportPhase::Discovering,
                deadline,
                bystanders: BTreeSet::new(),
                dirs: Vec::new(),
                notify_waiting: BTreeSet::new(),
                early_acks: BTreeSet::new(),
                payload: Vec::new(),
                resends: 0,
            },
        );
        self.send(dest, MdsMessage::Export(ExportMessage::Discover { tid, dir, path }));
        Ok(())
    }

    pub(crate) fn handle_export_message(&mut self, from: NodeId, msg: ExportMessage) -> Result<()> {
        match msg {
            ExportMessage::Discover { tid, dir, path } => {
                self.import_discover(from, tid, dir, path);
                Ok(())
            }
            ExportMessage::DiscoverAck { tid, dir, error } => {
                self.export_discovered(from, tid, dir, error)
            }
            ExportMessage::Prep {
                tid,
                dir,
                nested,
                bystanders,
            } => self.import_prep(from, tid, dir, nested, bystanders),
            ExportMessage::PrepAck { tid, dir } => self.export_prepped(from, tid, dir),
            ExportMessage::Dir {
                tid,
                dir,
                payload,
                bystanders,
            } => self.import_dir(from, tid, dir, &payload, bystanders),
            ExportMessage::DirAck { tid, dir } => self.export_acked(from, tid, dir),
            ExportMessage::Warning {
                tid,
                dir,
                dirs,
                importer,
            } => {
                debug!(node = self.id, dir, importer, dirs = dirs.len(), "export warning");
                self.migrator.warned.insert(dir, (from, tid));
                Ok(())
            }
            ExportMessage::Notify {
                tid,
                dir,
                dirs,
                exporter,
            } => {
                self.export_bystander_notify(from, dir, &dirs, exporter);
                self.send(exporter, MdsMessage::Export(ExportMessage::NotifyAck { tid, dir }));
                Ok(())
            }
            ExportMessage::NotifyAck { tid, dir } => self.export_notify_acked(from, tid, dir),
            ExportMessage::Finish { tid, dir } => self.import_finish(from, tid, dir),
            ExportMessage::Cancel { tid, dir } => self.import_cancel(from, tid, dir),
        }
    }

    /// Look up our export of `dir` and check that `tid` and `from` match it.
    fn export_for(&self, from: NodeId, tid: Tid, dir: InodeId) -> Result<&ExportState> {
        match self.migrator.exports.get(&dir) {
            Some(state) if state.tid == tid => {
                if state.dest != from && !state.bystanders.contains(&from) {
                    return Err(MdsError::ProtocolViolation(format!(
                        "export {} message from unrelated mds{}",
                        dir, from
                    )));
                }
                Ok(state)
            }
            _ => Err(MdsError::ProtocolViolation(format!(
                "no export of {} with tid {}",
                dir, tid
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Exporter
    // ------------------------------------------------------------------

    fn export_discovered(
        &mut self,
        from: NodeId,
        tid: Tid,
        dir: InodeId,
        error: Option<ErrorKind>,
    ) -> Result<()> {
        if self.export_for(from, tid, dir)?.phase != ExportPhase::Discovering {
            return Err(MdsError::ProtocolViolation(format!("duplicate discover ack for {}", dir)));
        }
        if let Some(kind) = error {
            warn!(node = self.id, dir, ?kind, "importer could not open export target");
            self.abort_export(dir, "discover failed");
            return Ok(());
        }

        let dirs = self.subtree_dirs(dir);
        let mut bystanders = BTreeSet::new();
        let mut nested = Vec::new();
        let me = DirAuthority::Node(self.id);
        if let Some(inode) = self.cache.get_or_null(dir) {
            bystanders.extend(inode.replicas.iter().copied());
        }
        for d in &dirs {
            let Some(frag) = self.cache.dir(*d) else {
                continue;
            };
            bystanders.extend(frag.replicas.iter().copied());
            for (_, ino) in frag.linked() {
                if let Some(inode) = self.cache.get_or_null(ino) {
                    bystanders.extend(inode.replicas.iter().copied());
                }
                if let Some(child) = self.cache.dir(ino) {
                    if child.authority != me {
                        nested.push((ino, child.authority));
                    }
                }
            }
        }
        let dest = self.export_state(dir)?.dest;
        bystanders.remove(&self.id);
        bystanders.remove(&dest);

        let deadline = self.now + self.config.protocol.ack_timeout_ticks;
        if let Some(state) = self.migrator.exports.get_mut(&dir) {
            state.phase = ExportPhase::Prepping;
            state.deadline = deadline;
            state.bystanders = bystanders.clone();
            state.dirs = dirs;
        }
        debug!(node = self.id, dir, nested = nested.len(), bystanders = bystanders.len(), "export prep");
        self.send(
            dest,
            MdsMessage::Export(ExportMessage::Prep {
                tid,
                dir,
                nested,
                bystanders: bystanders.into_iter().collect(),
            }),
        );
        Ok(())
    }

    fn export_state(&self, dir: InodeId) -> Result<&ExportState> {
        self.migrator
            .exports
            .get(&dir)
            .ok_or_else(|| MdsError::Internal(format!("export state of {} missing", dir)))
    }

    fn export_prepped(&mut self, from: NodeId, tid: Tid, dir: InodeId) -> Result<()> {
        if self.export_for(from, tid, dir)?.phase != ExportPhase::Prepping {
            return Err(MdsError::ProtocolViolation(format!("duplicate prep ack for {}", dir)));
        }
        let deadline = self.now + self.config.protocol.freeze_timeout_ticks;
        if let Some(state) = self.migrator.exports.get_mut(&dir) {
            state.phase = ExportPhase::Freezing;
            state.deadline = deadline;
        }
        self.start_freeze(dir, true, FreezeOwner::Export)
    }

    /// The subtree is frozen: ship it.
    pub(crate) fn export_frozen(&mut self, dir: InodeId) -> Result<()> {
        let (dest, tid, bystanders) = match self.migrator.exports.get(&dir) {
            Some(s) if s.phase == ExportPhase::Freezing => (s.dest, s.tid, s.bystanders.clone()),
            _ => return Ok(()),
        };
        // The tree may have grown between prep and the freeze completing.
        let dirs = self.subtree_dirs(dir);
        let payload = self.encode_subtree(dir, &dirs, dest)?;
        for d in &dirs {
            let entries: Vec<InodeId> = self
                .cache
                .dir(*d)
                .map(|f| f.linked().map(|(_, ino)| ino).collect())
                .unwrap_or_default();
            for ino in entries {
                if self.cache.get_or_null(ino).map(|i| i.dirty).unwrap_or(false) {
                    self.persist(ino)?;
                }
            }
        }

        for node in &bystanders {
            self.send(
                *node,
                MdsMessage::Export(ExportMessage::Warning {
                    tid,
                    dir,
                    dirs: dirs.clone(),
                    importer: dest,
                }),
            );
        }
        let deadline = self.now + self.config.protocol.ack_timeout_ticks;
        if let Some(state) = self.migrator.exports.get_mut(&dir) {
            state.phase = ExportPhase::Exporting;
            state.deadline = deadline;
            state.dirs = dirs;
            state.payload = payload.clone();
        }
        info!(node = self.id, dir, dest, bytes = payload.len(), "export go");
        self.send(
            dest,
            MdsMessage::Export(ExportMessage::Dir {
                tid,
                dir,
                payload,
                bystanders: bystanders.into_iter().collect(),
            }),
        );
        Ok(())
    }

    fn encode_subtree(&self, root: InodeId, dirs: &[InodeId], dest: NodeId) -> Result<Vec<u8>> {
        let me = DirAuthority::Node(self.id);
        let mut out = Vec::with_capacity(dirs.len());
        for d in dirs {
            let Some(frag) = self.cache.dir(*d) else {
                continue;
            };
            let mut replicas: BTreeSet<NodeId> = frag.replicas.clone();
            replicas.insert(self.id);
            replicas.remove(&dest);
            let mut entries = Vec::new();
            for (name, ino) in frag.linked() {
                let Some(inode) = self.cache.get_or_null(ino) else {
                    continue;
                };
                let mut inode_replicas = inode.replicas.clone();
                inode_replicas.insert(self.id);
                inode_replicas.remove(&dest);
                let dir_auth = self
                    .cache
                    .dir(ino)
                    .map(|child| child.authority)
                    .filter(|a| *a != me);
                entries.push(ExportedDentry {
                    name: name.clone(),
                    ino,
                    attrs: inode.attrs.clone(),
                    replicas: inode_replicas.into_iter().collect(),
                    dir_auth,
                });
            }
            out.push(ExportedDir {
                ino: *d,
                complete: frag.complete,
                replicas: replicas.into_iter().collect(),
                entries,
            });
        }
        Ok(bincode::serialize(&ExportPayload { root, dirs: out })?)
    }

    fn export_acked(&mut self, from: NodeId, tid: Tid, dir: InodeId) -> Result<()> {
        let state = self.export_for(from, tid, dir)?;
        if state.phase != ExportPhase::Exporting || from != state.dest {
            return Err(MdsError::ProtocolViolation(format!("duplicate dir ack for {}", dir)));
        }
        let dest = state.dest;
        let dirs = state.dirs.clone();
        self.commit_export(dir, dest, &dirs);

        let deadline = self.now + self.config.protocol.ack_timeout_ticks;
        let done = match self.migrator.exports.get_mut(&dir) {
            Some(state) => {
                state.phase = ExportPhase::Notifying;
                state.deadline = deadline;
                state.payload.clear();
                state.notify_waiting = state
                    .bystanders
                    .difference(&state.early_acks)
                    .copied()
                    .collect();
                state.notify_waiting.is_empty()
            }
            None => false,
        };
        if done {
            self.finish_export(dir);
        }
        Ok(())
    }

    /// Hand the exported fragments to `dest`; we keep them as replicas.
    fn commit_export(&mut self, dir: InodeId, dest: NodeId, dirs: &[InodeId]) {
        for d in dirs {
            self.set_dir_authority(*d, DirAuthority::Node(dest));
            if *d != dir {
                self.topology.remove_import(*d);
            }
            let children: Vec<InodeId> = self
                .cache
                .dir(*d)
                .map(|f| f.linked().map(|(_, ino)| ino).collect())
                .unwrap_or_default();
            for ino in children {
                if let Some(inode) = self.cache.get_mut(ino) {
                    inode.hard = Default::default();
                    inode.file = Default::default();
                }
            }
        }
        debug!(node = self.id, dir, dest, dirs = dirs.len(), "export committed");
    }

    fn export_notify_acked(&mut self, from: NodeId, tid: Tid, dir: InodeId) -> Result<()> {
        let phase = self.export_for(from, tid, dir)?.phase;
        let state = self
            .migrator
            .exports
            .get_mut(&dir)
            .ok_or_else(|| MdsError::Internal(format!("export state of {} missing", dir)))?;
        match phase {
            ExportPhase::Exporting => {
                if !state.bystanders.contains(&from) || !state.early_acks.insert(from) {
                    return Err(MdsError::ProtocolViolation(format!(
                        "duplicate early notify ack for {} from mds{}",
                        dir, from
                    )));
                }
                debug!(node = self.id, dir, from, "buffered early notify ack");
                Ok(())
            }
            ExportPhase::Notifying => {
                if !state.notify_waiting.remove(&from) {
                    return Err(MdsError::ProtocolViolation(format!(
                        "unexpected notify ack for {} from mds{}",
                        dir, from
                    )));
                }
                if state.notify_waiting.is_empty() {
                    self.finish_export(dir);
                }
                Ok(())
            }
            _ => Err(MdsError::ProtocolViolation(format!(
                "notify ack for {} before go",
                dir
            ))),
        }
    }

    fn finish_export(&mut self, dir: InodeId) {
        let Some(state) = self.migrator.exports.remove(&dir) else {
            return;
        };
        self.send(
            state.dest,
            MdsMessage::Export(ExportMessage::Finish {
                tid: state.tid,
                dir,
            }),
        );
        self.topology.end_export(dir, true);
        self.cache.unpin_dir(dir);
        self.cache.unpin_inode(dir);

        // Requests parked on the freeze go straight to the new authority.
        let parked = self.take_waiters(&WaitKey::Unfreeze(dir));
        self.unfreeze(dir);
        for waiter in parked {
            match waiter {
                Waiter::Request(req) => self.forward_request(req, state.dest),
                other => self.delay(other),
            }
        }
        observability::record_export("completed");
        info!(node = self.id, dir, dest = state.dest, "export finished");
    }

    /// Undo an export that has not shipped its payload.
    fn abort_export(&mut self, dir: InodeId, reason: &str) {
        let Some(state) = self.migrator.exports.remove(&dir) else {
            return;
        };
        warn!(node = self.id, dir, dest = state.dest, phase = ?state.phase, reason, "export aborted");
        self.send(
            state.dest,
            MdsMessage::Export(ExportMessage::Cancel {
                tid: state.tid,
                dir,
            }),
        );
        self.topology.end_export(dir, false);
        self.cache.unpin_dir(dir);
        self.cache.unpin_inode(dir);
        if state.phase == ExportPhase::Freezing {
            self.unfreeze(dir);
        }
        observability::record_export("aborted");
    }

    pub(crate) fn migrator_tick(&mut self) {
        let now = self.now;
        let due: Vec<(InodeId, ExportPhase)> = self
            .migrator
            .exports
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(d, s)| (*d, s.phase))
            .collect();
        for (dir, phase) in due {
            match phase {
                ExportPhase::Discovering | ExportPhase::Prepping => {
                    self.abort_export(dir, "importer timed out")
                }
                ExportPhase::Freezing => self.abort_export(dir, "freeze timed out"),
                ExportPhase::Exporting => self.resend_export(dir),
                ExportPhase::Notifying => {
                    if let Some(state) = self.migrator.exports.get_mut(&dir) {
                        warn!(node = self.id, dir, silent = ?state.notify_waiting, "dropping silent bystanders");
                        state.notify_waiting.clear();
                    }
                    self.finish_export(dir);
                }
            }
        }

        let patience =
            self.config.protocol.freeze_timeout_ticks + 2 * self.config.protocol.ack_timeout_ticks;
        let expired: Vec<InodeId> = self
            .migrator
            .imports
            .iter()
            .filter(|(_, s)| s.phase != ImportPhase::Imported && s.since + patience < now)
            .map(|(d, _)| *d)
            .collect();
        for dir in expired {
            warn!(node = self.id, dir, "abandoned import dropped");
            self.migrator.imports.remove(&dir);
            self.cache.unpin_inode(dir);
        }
    }

    fn resend_export(&mut self, dir: InodeId) {
        let max = self.config.protocol.max_resends;
        let deadline = self.now + self.config.protocol.ack_timeout_ticks;
        let Some(state) = self.migrator.exports.get_mut(&dir) else {
            return;
        };
        if state.resends >= max {
            warn!(node = self.id, dir, dest = state.dest, "importer silent, committing export");
            let (dest, dirs) = (state.dest, state.dirs.clone());
            state.phase = ExportPhase::Notifying;
            state.deadline = deadline;
            state.notify_waiting = state.bystanders.difference(&state.early_acks).copied().collect();
            let done = state.notify_waiting.is_empty();
            self.commit_export(dir, dest, &dirs);
            if done {
                self.finish_export(dir);
            }
            return;
        }
        state.resends += 1;
        state.deadline = deadline;
        let msg = ExportMessage::Dir {
            tid: state.tid,
            dir,
            payload: state.payload.clone(),
            bystanders: state.bystanders.iter().copied().collect(),
        };
        let dest = state.dest;
        debug!(node = self.id, dir, dest, "resending export payload");
        self.send(dest, MdsMessage::Export(msg));
    }

    // ------------------------------------------------------------------
    // Importer
    // ------------------------------------------------------------------

    fn import_discover(&mut self, from: NodeId, tid: Tid, dir: InodeId, path: Vec<String>) {
        let path_str = format!("/{}", path.join("/"));
        let error = match self.resolve(&path_str, false, Ctx::peer()) {
            Ok(Flow::Ready(trace)) if trace.target == dir => {
                match self.cache.pin_inode(dir) {
                    Ok(()) => {
                        let since = self.now;
                        if let Some(old) = self.migrator.imports.insert(
                            dir,
                            ImportState {
                                exporter: from,
                                tid,
                                phase: ImportPhase::Discovered,
                                since,
                            },
                        ) {
                            // A restarted export replaces the previous attempt.
                            debug!(node = self.id, dir, old_tid = old.tid, "replacing import state");
                            self.cache.unpin_inode(dir);
                        }
                        None
                    }
                    Err(e) => Some(e.kind()),
                }
            }
            Ok(Flow::Ready(_)) => Some(ErrorKind::NotFound),
            Ok(Flow::Blocked(key)) => {
                let msg = MdsMessage::Export(ExportMessage::Discover { tid, dir, path });
                self.wait(key, Waiter::Message { from, msg });
                return;
            }
            Ok(Flow::Forward(_)) | Ok(Flow::Pending) => Some(ErrorKind::Internal),
            Err(e) => Some(e.kind()),
        };
        debug!(node = self.id, dir, from, ?error, "import discover");
        self.send(from, MdsMessage::Export(ExportMessage::DiscoverAck { tid, dir, error }));
    }

    fn import_state(&mut self, from: NodeId, tid: Tid, dir: InodeId) -> Result<&mut ImportState> {
        match self.migrator.imports.get_mut(&dir) {
            Some(state) if state.exporter == from && state.tid == tid => Ok(state),
            _ => Err(MdsError::ProtocolViolation(format!(
                "no import of {} from mds{} tid {}",
                dir, from, tid
            ))),
        }
    }

    fn import_prep(
        &mut self,
        from: NodeId,
        tid: Tid,
        dir: InodeId,
        nested: Vec<(InodeId, DirAuthority)>,
        bystanders: Vec<NodeId>,
    ) -> Result<()> {
        let now = self.now;
        let state = self.import_state(from, tid, dir)?;
        if state.phase != ImportPhase::Discovered {
            return Err(MdsError::ProtocolViolation(format!("duplicate prep for {}", dir)));
        }
        state.phase = ImportPhase::Prepped;
        state.since = now;
        debug!(
            node = self.id,
            dir,
            nested = nested.len(),
            bystanders = bystanders.len(),
            "import prepped"
        );
        self.send(from, MdsMessage::Export(ExportMessage::PrepAck { tid, dir }));
        Ok(())
    }

    fn import_dir(
        &mut self,
        from: NodeId,
        tid: Tid,
        dir: InodeId,
        payload: &[u8],
        bystanders: Vec<NodeId>,
    ) -> Result<()> {
        let phase = self.import_state(from, tid, dir)?.phase;
        if phase == ImportPhase::Imported {
            debug!(node = self.id, dir, "repeated export payload, re-acking");
            self.send(from, MdsMessage::Export(ExportMessage::DirAck { tid, dir }));
            return Ok(());
        }
        let payload: ExportPayload = bincode::deserialize(payload)?;
        if payload.root != dir {
            return Err(MdsError::ProtocolViolation(format!(
                "payload root {} for export of {}",
                payload.root, dir
            )));
        }
        let dirs = self.install_subtree(&payload)?;

        self.freeze_now(dir, true);
        self.topology.add_import(dir);
        if let Some(state) = self.migrator.imports.get_mut(&dir) {
            state.phase = ImportPhase::Imported;
        }
        info!(node = self.id, dir, exporter = from, dirs = dirs.len(), "subtree imported");
        for node in bystanders {
            if node == self.id || node == from {
                continue;
            }
            self.send(
                node,
                MdsMessage::Export(ExportMessage::Notify {
                    tid,
                    dir,
                    dirs: dirs.clone(),
                    exporter: from,
                }),
            );
        }
        self.send(from, MdsMessage::Export(ExportMessage::DirAck { tid, dir }));
        Ok(())
    }

    /// Install every fragment of `payload` as authoritative here.
    fn install_subtree(&mut self, payload: &ExportPayload) -> Result<Vec<InodeId>> {
        let me = DirAuthority::Node(self.id);
        let mut installed = Vec::with_capacity(payload.dirs.len());
        for exported in &payload.dirs {
            let frag = self.cache.open_dir(exported.ino, me)?;
            frag.authority = me;
            frag.complete = exported.complete;
            frag.replicas = exported.replicas.iter().copied().collect();
            if exported.ino != payload.root && self.topology.remove_import(exported.ino) {
                debug!(node = self.id, dir = exported.ino, "import merged into parent import");
            }
            for entry in &exported.entries {
                let key = DentryKey::new(exported.ino, entry.name.clone());
                if self.cache.contains(entry.ino) {
                    self.cache.set_authority(entry.ino, self.id);
                } else {
                    self.cache.add(
                        CInode::new(entry.ino, entry.attrs.clone(), self.id).with_parent(key.clone()),
                    )?;
                }
                if let Some(inode) = self.cache.get_mut(entry.ino) {
                    inode.attrs = entry.attrs.clone();
                    inode.replicas = entry.replicas.iter().copied().collect();
                    inode.hard = Default::default();
                    inode.file = Default::default();
                }
                self.cache.link(&key, entry.ino)?;
                if let Some(authority) = entry.dir_auth {
                    if authority == me {
                        self.topology.remove_import(entry.ino);
                    }
                    match self.cache.dir_mut(entry.ino) {
                        Some(child) => child.authority = authority,
                        None => {
                            self.cache.open_dir(entry.ino, authority)?;
                        }
                    }
                }
                self.cache.touch(entry.ino);
            }
            installed.push(exported.ino);
        }
        Ok(installed)
    }

    fn import_finish(&mut self, from: NodeId, tid: Tid, dir: InodeId) -> Result<()> {
        if self.import_state(from, tid, dir)?.phase != ImportPhase::Imported {
            return Err(MdsError::ProtocolViolation(format!("finish before payload for {}", dir)));
        }
        self.migrator.imports.remove(&dir);
        self.cache.unpin_inode(dir);
        self.unfreeze(dir);
        observability::record_export("imported");
        info!(node = self.id, dir, exporter = from, "import finished");
        Ok(())
    }

    fn import_cancel(&mut self, from: NodeId, tid: Tid, dir: InodeId) -> Result<()> {
        if self.import_state(from, tid, dir)?.phase == ImportPhase::Imported {
            return Err(MdsError::ProtocolViolation(format!("cancel after payload for {}", dir)));
        }
        self.migrator.imports.remove(&dir);
        self.cache.unpin_inode(dir);
        debug!(node = self.id, dir, "import cancelled");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bystander
    // ------------------------------------------------------------------

    fn export_bystander_notify(&mut self, importer: NodeId, dir: InodeId, dirs: &[InodeId], exporter: NodeId) {
        self.migrator.warned.remove(&dir);
        for d in dirs {
            if self.cache.dir(*d).is_some() {
                self.set_dir_authority(*d, DirAuthority::Node(importer));
            }
        }
        debug!(node = self.id, dir, importer, exporter, "bystander updated authority");
    }
}
