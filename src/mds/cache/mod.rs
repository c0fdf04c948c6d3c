//! Cache Manager: the identifier-indexed arena of namespace objects, the
//! eviction list and the pin accounting that guards both.
//!
//! An inode is on the eviction list exactly when it carries no explicit
//! pin and is clean. Implicit pins (cached children, live replicas, a
//! subtree boundary, held locks, topology membership expressed as a
//! fragment pin) are checked when a victim is popped, so [`MdCache::trim`]
//! never evicts anything that is still referenced.

mod lru;
mod object;

pub use lru::{CacheLru, Segment};
pub use object::{CDentry, CDir, CInode, FreezeState};

use crate::error::{MdsError, Result};
use crate::types::{DentryKey, DirAuthority, InodeId, NodeId, ROOT_INO};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Record of one evicted inode, used to notify its authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted {
    pub ino: InodeId,
    pub authority: NodeId,
    pub was_auth: bool,
    /// Authority of the inode's fragment, if it was cached too and went
    /// with it.
    pub dir_authority: Option<DirAuthority>,
}

/// The per-node object graph.
pub struct MdCache {
    node: NodeId,
    inodes: HashMap<InodeId, CInode>,
    dirs: HashMap<InodeId, CDir>,
    lru: CacheLru,
}

impl MdCache {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            inodes: HashMap::new(),
            dirs: HashMap::new(),
            lru: CacheLru::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Number of cached inodes.
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    pub fn lru(&self) -> &CacheLru {
        &self.lru
    }

    // ------------------------------------------------------------------
    // Inodes
    // ------------------------------------------------------------------

    /// O(1) lookup; never changes pin state.
    pub fn get_or_null(&self, ino: InodeId) -> Option<&CInode> {
        self.inodes.get(&ino)
    }

    pub fn get_mut(&mut self, ino: InodeId) -> Option<&mut CInode> {
        self.inodes.get_mut(&ino)
    }

    pub fn contains(&self, ino: InodeId) -> bool {
        self.inodes.contains_key(&ino)
    }

    pub fn inodes(&self) -> impl Iterator<Item = &CInode> {
        self.inodes.values()
    }

    pub fn is_auth(&self, ino: InodeId) -> bool {
        self.inodes
            .get(&ino)
            .map(|inode| inode.authority == self.node)
            .unwrap_or(false)
    }

    /// Insert a new inode. Fails if the identifier is already cached.
    pub fn add(&mut self, inode: CInode) -> Result<()> {
        if self.inodes.contains_key(&inode.ino) {
            return Err(MdsError::AlreadyExists(format!("inode {}", inode.ino)));
        }
        let ino = inode.ino;
        let auth = inode.authority == self.node;
        let eligible = inode.ref_count == 0 && !inode.dirty;
        self.inodes.insert(ino, inode);
        if eligible {
            self.lru.touch(ino, auth);
        }
        Ok(())
    }

    /// Change the believed authority of an inode and re-file it.
    pub fn set_authority(&mut self, ino: InodeId, authority: NodeId) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.authority = authority;
            if authority != self.node {
                inode.replicas.clear();
            }
            self.lru.rehome(ino, authority == self.node);
        }
    }

    /// Move an inode and its ancestors toward the recently used end.
    ///
    /// Ancestors are touched first so a child is always more recent than
    /// its parent and gets evicted before it.
    pub fn touch(&mut self, ino: InodeId) {
        let mut chain = Vec::new();
        let mut cur = Some(ino);
        while let Some(i) = cur {
            let Some(inode) = self.inodes.get(&i) else {
                break;
            };
            chain.push((i, inode.authority == self.node));
            cur = inode.parent.as_ref().map(|p| p.dir);
            if chain.len() > self.inodes.len() {
                break;
            }
        }
        for (i, auth) in chain.into_iter().rev() {
            if self.lru.contains(i) {
                self.lru.touch(i, auth);
            }
        }
    }

    /// Remove an inode outright (unlink). Its dentry and fragment go too.
    pub fn remove_inode(&mut self, ino: InodeId) -> Option<CInode> {
        let inode = self.inodes.remove(&ino)?;
        self.lru.remove(ino);
        self.dirs.remove(&ino);
        if let Some(parent) = &inode.parent {
            if let Some(dir) = self.dirs.get_mut(&parent.dir) {
                let drop_entry = match dir.entries.get_mut(&parent.name) {
                    Some(dn) if dn.ino == Some(ino) => {
                        dn.ino = None;
                        dn.pins == 0 && dn.lock.xlock_by.is_none()
                    }
                    _ => false,
                };
                if drop_entry {
                    dir.entries.remove(&parent.name);
                }
            }
        }
        Some(inode)
    }

    // ------------------------------------------------------------------
    // Fragments and dentries
    // ------------------------------------------------------------------

    pub fn dir(&self, ino: InodeId) -> Option<&CDir> {
        self.dirs.get(&ino)
    }

    pub fn dir_mut(&mut self, ino: InodeId) -> Option<&mut CDir> {
        self.dirs.get_mut(&ino)
    }

    pub fn dirs(&self) -> impl Iterator<Item = &CDir> {
        self.dirs.values()
    }

    /// Open (or return) the fragment of a cached directory inode.
    pub fn open_dir(&mut self, ino: InodeId, authority: DirAuthority) -> Result<&mut CDir> {
        match self.inodes.get(&ino) {
            Some(inode) if inode.attrs.is_dir() => {}
            Some(_) => return Err(MdsError::NotADirectory(format!("inode {}", ino))),
            None => return Err(MdsError::NotFound(format!("inode {}", ino))),
        }
        Ok(self
            .dirs
            .entry(ino)
            .or_insert_with(|| CDir::new(ino, authority)))
    }

    pub fn dentry(&self, key: &DentryKey) -> Option<&CDentry> {
        self.dirs.get(&key.dir).and_then(|d| d.entries.get(&key.name))
    }

    pub fn dentry_mut(&mut self, key: &DentryKey) -> Option<&mut CDentry> {
        self.dirs
            .get_mut(&key.dir)
            .and_then(|d| d.entries.get_mut(&key.name))
    }

    /// Bind `key` to a cached inode, keeping any pins or lock on the dentry.
    pub fn link(&mut self, key: &DentryKey, ino: InodeId) -> Result<()> {
        if !self.inodes.contains_key(&ino) {
            return Err(MdsError::NotFound(format!("inode {}", ino)));
        }
        let dir = self
            .dirs
            .get_mut(&key.dir)
            .ok_or_else(|| MdsError::NotFound(format!("dir {}", key.dir)))?;
        dir.entries.entry(key.name.clone()).or_default().ino = Some(ino);
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.parent = Some(key.clone());
        }
        Ok(())
    }

    /// Remove the binding at `key`. A pinned or locked dentry stays as a
    /// null dentry. Returns the inode that was linked.
    pub fn unlink(&mut self, key: &DentryKey) -> Option<InodeId> {
        let dir = self.dirs.get_mut(&key.dir)?;
        let dn = dir.entries.get_mut(&key.name)?;
        let ino = dn.ino.take();
        if dn.pins == 0 && dn.lock.xlock_by.is_none() {
            dir.entries.remove(&key.name);
        }
        if let Some(ino) = ino {
            if let Some(inode) = self.inodes.get_mut(&ino) {
                if inode.parent.as_ref() == Some(key) {
                    inode.parent = None;
                }
            }
        }
        ino
    }

    /// Slash-separated names from the root to `ino`, if the chain is cached.
    pub fn path_of(&self, ino: InodeId) -> Option<Vec<String>> {
        let mut names = Vec::new();
        let mut cur = ino;
        while cur != ROOT_INO {
            let parent = self.inodes.get(&cur)?.parent.as_ref()?;
            names.push(parent.name.clone());
            cur = parent.dir;
            if names.len() > self.inodes.len() {
                return None;
            }
        }
        names.reverse();
        Some(names)
    }

    /// Whether `ancestor` is `ino` or lies on its cached parent chain.
    pub fn is_ancestor(&self, ancestor: InodeId, ino: InodeId) -> bool {
        let mut cur = ino;
        let mut steps = 0;
        loop {
            if cur == ancestor {
                return true;
            }
            match self.inodes.get(&cur).and_then(|i| i.parent.as_ref()) {
                Some(parent) => cur = parent.dir,
                None => return false,
            }
            steps += 1;
            if steps > self.inodes.len() {
                return false;
            }
        }
    }

    /// A fragment whose authority differs from the fragment containing it.
    ///
    /// Such a boundary is pinned on the parent's authority, which must keep
    /// answering discovery with the right redirect.
    pub fn is_pinned_boundary(&self, dir: InodeId) -> bool {
        let Some(frag) = self.dirs.get(&dir) else {
            return false;
        };
        let Some(parent) = self.inodes.get(&dir).and_then(|i| i.parent.as_ref()) else {
            return false;
        };
        match self.dirs.get(&parent.dir) {
            Some(pdir) => {
                pdir.authority == DirAuthority::Node(self.node) && frag.authority != pdir.authority
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Pins
    // ------------------------------------------------------------------

    /// Explicit pin. The first pin takes the inode off the eviction list.
    pub fn pin_inode(&mut self, ino: InodeId) -> Result<()> {
        let inode = self
            .inodes
            .get_mut(&ino)
            .ok_or_else(|| MdsError::NotFound(format!("inode {}", ino)))?;
        inode.ref_count += 1;
        if inode.ref_count == 1 {
            self.lru.remove(ino);
        }
        Ok(())
    }

    /// Drop one explicit pin. The last one puts the inode back on the list.
    pub fn unpin_inode(&mut self, ino: InodeId) {
        let node = self.node;
        if let Some(inode) = self.inodes.get_mut(&ino) {
            if inode.ref_count == 0 {
                debug!(ino, "unpin of unpinned inode ignored");
                return;
            }
            inode.ref_count -= 1;
            if inode.ref_count == 0 && !inode.dirty {
                self.lru.touch(ino, inode.authority == node);
            }
        }
    }

    pub fn pin_dir(&mut self, dir: InodeId) -> Result<()> {
        let frag = self
            .dirs
            .get_mut(&dir)
            .ok_or_else(|| MdsError::NotFound(format!("dir {}", dir)))?;
        frag.ref_count += 1;
        Ok(())
    }

    pub fn unpin_dir(&mut self, dir: InodeId) {
        if let Some(frag) = self.dirs.get_mut(&dir) {
            frag.ref_count = frag.ref_count.saturating_sub(1);
        }
    }

    pub fn pin_dentry(&mut self, key: &DentryKey) -> Result<()> {
        let dn = self
            .dentry_mut(key)
            .ok_or_else(|| MdsError::NotFound(key.to_string()))?;
        dn.pins += 1;
        Ok(())
    }

    pub fn unpin_dentry(&mut self, key: &DentryKey) {
        let Some(dir) = self.dirs.get_mut(&key.dir) else {
            return;
        };
        let remove = match dir.entries.get_mut(&key.name) {
            Some(dn) => {
                dn.pins = dn.pins.saturating_sub(1);
                dn.pins == 0 && dn.ino.is_none() && dn.lock.xlock_by.is_none()
            }
            None => false,
        };
        if remove {
            dir.entries.remove(&key.name);
        }
    }

    /// Dirty inodes hold an implicit pin until cleaned.
    pub fn mark_dirty(&mut self, ino: InodeId) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            if !inode.dirty {
                inode.dirty = true;
                self.lru.remove(ino);
            }
        }
    }

    pub fn mark_clean(&mut self, ino: InodeId) {
        let node = self.node;
        if let Some(inode) = self.inodes.get_mut(&ino) {
            if inode.dirty {
                inode.dirty = false;
                if inode.ref_count == 0 {
                    self.lru.touch(ino, inode.authority == node);
                }
            }
        }
    }

    /// Whether nothing references the inode any more.
    pub fn is_evictable(&self, ino: InodeId) -> bool {
        if ino == ROOT_INO {
            return false;
        }
        let Some(inode) = self.inodes.get(&ino) else {
            return false;
        };
        if inode.ref_count > 0 || inode.dirty {
            return false;
        }
        if inode.authority == self.node && !inode.replicas.is_empty() {
            return false;
        }
        if !inode.hard.is_idle() || !inode.file.is_idle() {
            return false;
        }
        if let Some(dir) = self.dirs.get(&ino) {
            if !dir.entries.is_empty()
                || dir.ref_count > 0
                || !dir.replicas.is_empty()
                || dir.freeze != FreezeState::Thawed
                || self.is_pinned_boundary(ino)
            {
                return false;
            }
        }
        if let Some(parent) = &inode.parent {
            if let Some(dn) = self.dentry(parent) {
                if dn.pins > 0 || dn.lock.xlock_by.is_some() {
                    return false;
                }
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Trim
    // ------------------------------------------------------------------

    /// Evict unpinned inodes until at most `max` remain.
    ///
    /// Replicas are exhausted before any authoritative inode is considered.
    /// Returns whether the target was reached, plus what was evicted.
    pub fn trim(&mut self, max: usize) -> (bool, Vec<Evicted>) {
        let mut evicted = Vec::new();
        for segment in [Segment::Bottom, Segment::Top] {
            loop {
                let mut progress = false;
                let mut skipped = Vec::new();
                while self.inodes.len() > max {
                    let Some(ino) = self.lru.pop(segment) else {
                        break;
                    };
                    if self.is_evictable(ino) {
                        if let Some(ev) = self.evict(ino) {
                            evicted.push(ev);
                            progress = true;
                        }
                    } else {
                        skipped.push(ino);
                    }
                }
                for ino in skipped {
                    let auth = self.is_auth(ino);
                    if let Some(inode) = self.inodes.get(&ino) {
                        if inode.ref_count == 0 && !inode.dirty {
                            self.lru.touch(ino, auth);
                        }
                    }
                }
                if !progress || self.inodes.len() <= max {
                    break;
                }
            }
        }
        if !evicted.is_empty() {
            trace!(count = evicted.len(), remaining = self.inodes.len(), "trimmed cache");
        }
        (self.inodes.len() <= max, evicted)
    }

    fn evict(&mut self, ino: InodeId) -> Option<Evicted> {
        let inode = self.inodes.remove(&ino)?;
        self.lru.remove(ino);
        let dir_authority = self.dirs.remove(&ino).map(|d| d.authority);
        if let Some(parent) = &inode.parent {
            if let Some(dir) = self.dirs.get_mut(&parent.dir) {
                if dir.entries.get(&parent.name).and_then(|d| d.ino) == Some(ino) {
                    dir.entries.remove(&parent.name);
                    dir.complete = false;
                }
            }
        }
        Some(Evicted {
            ino,
            authority: inode.authority,
            was_auth: inode.authority == self.node,
            dir_authority,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InodeAttrs;

    fn cache_with_root(node: NodeId, root_auth: NodeId) -> MdCache {
        let mut cache = MdCache::new(node);
        cache
            .add(CInode::new(
                ROOT_INO,
                InodeAttrs::new_directory(0o755, 0, 0),
                root_auth,
            ))
            .unwrap();
        cache
            .open_dir(ROOT_INO, DirAuthority::Node(root_auth))
            .unwrap();
        cache
    }

    fn add_file(cache: &mut MdCache, dir: InodeId, name: &str, ino: InodeId, auth: NodeId) {
        let key = DentryKey::new(dir, name);
        cache
            .add(CInode::new(ino, InodeAttrs::new_file(0o644, 0, 0), auth).with_parent(key.clone()))
            .unwrap();
        cache.link(&key, ino).unwrap();
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut cache = cache_with_root(0, 0);
        let dup = CInode::new(ROOT_INO, InodeAttrs::new_directory(0o755, 0, 0), 0);
        assert!(matches!(cache.add(dup), Err(MdsError::AlreadyExists(_))));
    }

    #[test]
    fn test_pin_removes_from_lru() {
        let mut cache = cache_with_root(0, 0);
        add_file(&mut cache, ROOT_INO, "a", 10, 0);
        assert!(cache.lru().contains(10));

        cache.pin_inode(10).unwrap();
        cache.pin_inode(10).unwrap();
        assert!(!cache.lru().contains(10));
        cache.unpin_inode(10);
        assert!(!cache.lru().contains(10));
        cache.unpin_inode(10);
        assert!(cache.lru().contains(10));
    }

    #[test]
    fn test_dirty_is_implicit_pin() {
        let mut cache = cache_with_root(0, 0);
        add_file(&mut cache, ROOT_INO, "a", 10, 0);
        cache.mark_dirty(10);
        let (reached, evicted) = cache.trim(1);
        assert!(!reached);
        assert!(evicted.is_empty());
        cache.mark_clean(10);
        let (reached, evicted) = cache.trim(1);
        assert!(reached);
        assert_eq!(evicted.len(), 1);
    }

    #[test]
    fn test_trim_prefers_replicas() {
        let mut cache = cache_with_root(1, 0);
        // "mine" is a fragment authoritative here under a replica root.
        let mine = DentryKey::new(ROOT_INO, "mine");
        cache
            .add(CInode::new(20, InodeAttrs::new_directory(0o755, 0, 0), 0).with_parent(mine.clone()))
            .unwrap();
        cache.link(&mine, 20).unwrap();
        cache.open_dir(20, DirAuthority::Node(1)).unwrap();
        for i in 0..3 {
            add_file(&mut cache, 20, &format!("auth{}", i), 100 + i, 1);
        }
        for i in 0..4 {
            add_file(&mut cache, ROOT_INO, &format!("rep{}", i), 200 + i, 0);
        }

        let total = cache.len();
        let (reached, evicted) = cache.trim(total - 4);
        assert!(reached);
        assert_eq!(evicted.len(), 4);
        assert!(evicted.iter().all(|e| !e.was_auth));
        assert!(evicted.iter().all(|e| e.ino >= 200));
        assert!(!cache.dir(ROOT_INO).unwrap().complete);
    }

    #[test]
    fn test_parent_evicted_after_children() {
        let mut cache = cache_with_root(0, 0);
        let d = DentryKey::new(ROOT_INO, "d");
        cache
            .add(CInode::new(5, InodeAttrs::new_directory(0o755, 0, 0), 0).with_parent(d.clone()))
            .unwrap();
        cache.link(&d, 5).unwrap();
        cache.open_dir(5, DirAuthority::Node(0)).unwrap();
        add_file(&mut cache, 5, "f", 6, 0);

        let (reached, evicted) = cache.trim(1);
        assert!(reached);
        let order: Vec<_> = evicted.iter().map(|e| e.ino).collect();
        assert_eq!(order, vec![6, 5]);
        assert!(cache.dir(5).is_none());
    }

    #[test]
    fn test_boundary_is_pinned_on_parent_authority() {
        let mut cache = cache_with_root(0, 0);
        let d = DentryKey::new(ROOT_INO, "exported");
        cache
            .add(CInode::new(5, InodeAttrs::new_directory(0o755, 0, 0), 0).with_parent(d.clone()))
            .unwrap();
        cache.link(&d, 5).unwrap();
        cache.open_dir(5, DirAuthority::Node(2)).unwrap();

        assert!(cache.is_pinned_boundary(5));
        let (reached, _) = cache.trim(1);
        assert!(!reached);
        assert!(cache.contains(5));
    }

    #[test]
    fn test_path_of_and_ancestry() {
        let mut cache = cache_with_root(0, 0);
        let d = DentryKey::new(ROOT_INO, "d");
        cache
            .add(CInode::new(5, InodeAttrs::new_directory(0o755, 0, 0), 0).with_parent(d.clone()))
            .unwrap();
        cache.link(&d, 5).unwrap();
        cache.open_dir(5, DirAuthority::Node(0)).unwrap();
        add_file(&mut cache, 5, "f", 6, 0);

        assert_eq!(cache.path_of(6).unwrap(), vec!["d", "f"]);
        assert!(cache.is_ancestor(5, 6));
        assert!(cache.is_ancestor(ROOT_INO, 6));
        assert!(!cache.is_ancestor(6, 5));
    }
}
