//! Request Tracker.
//!
//! Every in-flight client request owns one [`ActiveRequest`] recording the
//! dentries it traversed, the inodes and fragments it pinned and the locks
//! it holds. [`RequestTracker::finish`] and [`RequestTracker::forward`]
//! remove the record and drop every cache pin it accounts for, so each
//! resource is released exactly once whatever the exit path. The returned
//! record tells the caller which locks and xlocks still need releasing
//! through the lock manager.

use crate::error::{MdsError, Result};
use crate::mds::cache::MdCache;
use crate::mds::locker::{LockFacet, LockMode};
use crate::mds::messages::ClientReply;
use crate::types::{ClientId, DentryKey, InodeId, NodeId, ReqId};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use tracing::trace;

/// Identifies one client request across forwards and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    pub client: ClientId,
    pub req: ReqId,
}

impl RequestId {
    pub fn new(client: ClientId, req: ReqId) -> Self {
        Self { client, req }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client{}:{}", self.client, self.req)
    }
}

/// Resources held by one in-flight request.
#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub id: RequestId,
    pub ref_ino: Option<InodeId>,
    /// Path-pinned dentries, in traversal order.
    pub trace: Vec<DentryKey>,
    pub inode_pins: BTreeSet<InodeId>,
    pub dir_pins: BTreeSet<InodeId>,
    pub xlocks: BTreeSet<DentryKey>,
    /// Xlocks granted by another node, keyed by dentry.
    pub foreign_xlocks: BTreeMap<DentryKey, NodeId>,
    pub locks: Vec<(InodeId, LockFacet, LockMode)>,
}

impl ActiveRequest {
    fn new(id: RequestId, ref_ino: Option<InodeId>) -> Self {
        Self {
            id,
            ref_ino,
            trace: Vec::new(),
            inode_pins: BTreeSet::new(),
            dir_pins: BTreeSet::new(),
            xlocks: BTreeSet::new(),
            foreign_xlocks: BTreeMap::new(),
            locks: Vec::new(),
        }
    }

    pub fn holds_lock(&self, ino: InodeId, facet: LockFacet, mode: LockMode) -> bool {
        self.locks.contains(&(ino, facet, mode))
    }

    /// Whether this request pinned or locked anything at all.
    pub fn is_empty(&self) -> bool {
        self.trace.is_empty()
            && self.inode_pins.is_empty()
            && self.dir_pins.is_empty()
            && self.xlocks.is_empty()
            && self.foreign_xlocks.is_empty()
            && self.locks.is_empty()
    }
}

pub struct RequestTracker {
    active: HashMap<RequestId, ActiveRequest>,
    completed: LruCache<RequestId, ClientReply>,
    forwarded: LruCache<RequestId, NodeId>,
}

impl RequestTracker {
    /// `memory` bounds how many finished and forwarded ids are remembered.
    pub fn new(memory: usize) -> Self {
        let cap = NonZeroUsize::new(memory.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            active: HashMap::new(),
            completed: LruCache::new(cap),
            forwarded: LruCache::new(cap),
        }
    }

    /// Open a handle for `id`, path-pinning every dentry of `trace`.
    ///
    /// Fails with `Conflict` if another request holds an xlock on one of
    /// them; the caller queues and retries instead of waiting here. Calling
    /// it again for an open handle only adds the new dentries.
    pub fn begin(
        &mut self,
        cache: &mut MdCache,
        id: RequestId,
        ref_ino: Option<InodeId>,
        trace: &[DentryKey],
    ) -> Result<()> {
        if let Some(key) = Self::blocking_xlock(cache, id, trace) {
            return Err(MdsError::Conflict(format!("{} is xlocked", key)));
        }
        let fresh = !self.active.contains_key(&id);
        if fresh {
            self.active.insert(id, ActiveRequest::new(id, ref_ino));
        }
        if let Err(e) = self.add_trace(cache, id, trace) {
            if fresh {
                self.finish(cache, id);
            }
            return Err(e);
        }
        if let Some(ino) = ref_ino {
            self.pin_inode(cache, id, ino)?;
        }
        trace!(%id, depth = trace.len(), "request begun");
        Ok(())
    }

    /// First dentry of `trace` xlocked by a request other than `id`.
    pub fn blocking_xlock(cache: &MdCache, id: RequestId, trace: &[DentryKey]) -> Option<DentryKey> {
        trace
            .iter()
            .find(|key| {
                cache
                    .dentry(key)
                    .and_then(|dn| dn.lock.xlock_by)
                    .map(|holder| holder != id)
                    .unwrap_or(false)
            })
            .cloned()
    }

    fn add_trace(&mut self, cache: &mut MdCache, id: RequestId, trace: &[DentryKey]) -> Result<()> {
        let req = self
            .active
            .get_mut(&id)
            .ok_or_else(|| MdsError::Internal(format!("no handle for {}", id)))?;
        for key in trace {
            if req.trace.contains(key) {
                continue;
            }
            cache.pin_dentry(key)?;
            req.trace.push(key.clone());
        }
        Ok(())
    }

    pub fn is_active(&self, id: &RequestId) -> bool {
        self.active.contains_key(id)
    }

    pub fn get(&self, id: &RequestId) -> Option<&ActiveRequest> {
        self.active.get(id)
    }

    pub fn active(&self) -> impl Iterator<Item = &ActiveRequest> {
        self.active.values()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Pin an inode for the request. Idempotent.
    pub fn pin_inode(&mut self, cache: &mut MdCache, id: RequestId, ino: InodeId) -> Result<()> {
        let req = self
            .active
            .get_mut(&id)
            .ok_or_else(|| MdsError::Internal(format!("no handle for {}", id)))?;
        if !req.inode_pins.contains(&ino) {
            cache.pin_inode(ino)?;
            req.inode_pins.insert(ino);
        }
        Ok(())
    }

    /// Pin a fragment for the request. Idempotent.
    pub fn pin_dir(&mut self, cache: &mut MdCache, id: RequestId, dir: InodeId) -> Result<()> {
        let req = self
            .active
            .get_mut(&id)
            .ok_or_else(|| MdsError::Internal(format!("no handle for {}", id)))?;
        if !req.dir_pins.contains(&dir) {
            cache.pin_dir(dir)?;
            req.dir_pins.insert(dir);
        }
        Ok(())
    }

    pub fn record_lock(
        &mut self,
        cache: &mut MdCache,
        id: RequestId,
        ino: InodeId,
        facet: LockFacet,
        mode: LockMode,
    ) -> Result<()> {
        self.pin_inode(cache, id, ino)?;
        if let Some(req) = self.active.get_mut(&id) {
            if !req.locks.contains(&(ino, facet, mode)) {
                req.locks.push((ino, facet, mode));
            }
        }
        Ok(())
    }

    pub fn record_xlock(&mut self, id: RequestId, key: DentryKey) {
        if let Some(req) = self.active.get_mut(&id) {
            req.xlocks.insert(key);
        }
    }

    pub fn record_foreign_xlock(&mut self, id: RequestId, key: DentryKey, node: NodeId) {
        if let Some(req) = self.active.get_mut(&id) {
            req.foreign_xlocks.insert(key, node);
        }
    }

    /// Close the handle, dropping every cache pin it accounts for.
    ///
    /// The record is handed back so the caller can release its locks,
    /// xlocks and foreign xlocks. A second call returns `None`.
    pub fn finish(&mut self, cache: &mut MdCache, id: RequestId) -> Option<ActiveRequest> {
        let req = self.active.remove(&id)?;
        for key in &req.trace {
            cache.unpin_dentry(key);
        }
        for ino in &req.inode_pins {
            cache.unpin_inode(*ino);
        }
        for dir in &req.dir_pins {
            cache.unpin_dir(*dir);
        }
        trace!(%id, "request finished");
        Some(req)
    }

    /// Like [`Self::finish`], but remembers where the request went so a
    /// retry is re-forwarded instead of executed again.
    pub fn forward(&mut self, cache: &mut MdCache, id: RequestId, dest: NodeId) -> Option<ActiveRequest> {
        self.forwarded.put(id, dest);
        self.finish(cache, id)
    }

    pub fn note_forwarded(&mut self, id: RequestId, dest: NodeId) {
        self.forwarded.put(id, dest);
    }

    pub fn forwarded_to(&mut self, id: &RequestId) -> Option<NodeId> {
        self.forwarded.get(id).copied()
    }

    pub fn remember_reply(&mut self, id: RequestId, reply: ClientReply) {
        self.forwarded.pop(&id);
        self.completed.put(id, reply);
    }

    pub fn completed_reply(&mut self, id: &RequestId) -> Option<ClientReply> {
        self.completed.get(id).cloned()
    }
}
