//! Two-segment eviction list.
//!
//! Authoritative inodes live in the top segment, replicas in the bottom
//! one. Victims are always taken from the bottom first: a replica can be
//! fetched again from its authority, authoritative state has to be reloaded
//! from the store.

use crate::types::InodeId;
use lru::LruCache;

/// Which segment an inode sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Top,
    Bottom,
}

pub struct CacheLru {
    top: LruCache<InodeId, ()>,
    bottom: LruCache<InodeId, ()>,
}

impl CacheLru {
    pub fn new() -> Self {
        Self {
            top: LruCache::unbounded(),
            bottom: LruCache::unbounded(),
        }
    }

    /// Move `ino` to the most recently used end of its segment.
    ///
    /// An authoritative inode goes to the top segment, a replica to the
    /// bottom one, which puts it in the middle of the combined list.
    pub fn touch(&mut self, ino: InodeId, auth: bool) {
        if auth {
            self.bottom.pop(&ino);
            self.top.put(ino, ());
        } else {
            self.top.pop(&ino);
            self.bottom.put(ino, ());
        }
    }

    /// Re-file an inode whose authority changed, keeping it eligible only
    /// if it already was.
    pub fn rehome(&mut self, ino: InodeId, auth: bool) {
        if self.contains(ino) {
            self.touch(ino, auth);
        }
    }

    pub fn remove(&mut self, ino: InodeId) -> bool {
        self.top.pop(&ino).is_some() | self.bottom.pop(&ino).is_some()
    }

    pub fn contains(&self, ino: InodeId) -> bool {
        self.top.contains(&ino) || self.bottom.contains(&ino)
    }

    /// Pop the least recently used inode of `segment`.
    pub fn pop(&mut self, segment: Segment) -> Option<InodeId> {
        let list = match segment {
            Segment::Top => &mut self.top,
            Segment::Bottom => &mut self.bottom,
        };
        list.pop_lru().map(|(ino, ())| ino)
    }

    pub fn len(&self) -> usize {
        self.top.len() + self.bottom.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segment_len(&self, segment: Segment) -> usize {
        match segment {
            Segment::Top => self.top.len(),
            Segment::Bottom => self.bottom.len(),
        }
    }
}

impl Default for CacheLru {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bottom_is_drained_first() {
        let mut lru = CacheLru::new();
        lru.touch(1, true);
        lru.touch(2, false);
        lru.touch(3, true);
        lru.touch(4, false);

        assert_eq!(lru.pop(Segment::Bottom), Some(2));
        assert_eq!(lru.pop(Segment::Bottom), Some(4));
        assert_eq!(lru.pop(Segment::Bottom), None);
        assert_eq!(lru.pop(Segment::Top), Some(1));
    }

    #[test]
    fn test_touch_moves_between_segments() {
        let mut lru = CacheLru::new();
        lru.touch(1, false);
        lru.touch(1, true);
        assert_eq!(lru.segment_len(Segment::Bottom), 0);
        assert_eq!(lru.segment_len(Segment::Top), 1);

        lru.rehome(1, false);
        assert_eq!(lru.segment_len(Segment::Bottom), 1);

        assert!(lru.remove(1));
        lru.rehome(1, true);
        assert!(lru.is_empty());
    }
}
