//! Intrusive doubly-linked lists over the erase-block arena.
//!
//! Blocks never move in memory; list membership is expressed through
//! prev/next arena indices embedded in each [`EraseBlock`]. Every block
//! carries two independent link sites: one for its lifecycle list and one
//! for its wear bucket, so it can be on exactly one of each at a time.

use std::marker::PhantomData;

use crate::block::{BlockId, EraseBlock, Link};

/// The lifecycle lists that partition all erase blocks by state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ListKind {
    /// Blocks 100% full of clean data
    Clean,
    /// Blocks with some dirty space
    Dirty,
    /// Blocks with at least half their space dirty
    VeryDirty,
    /// Blocks which are completely dirty and can be erased without GC
    Erasable,
    /// Blocks queued for erasing now
    ErasePending,
    /// Blocks currently being erased
    Erasing,
    /// Blocks erased but not yet returned to the free pool (header pending)
    EraseComplete,
    /// Blocks which are free and ready to be used
    Free,
    /// Bad blocks
    Bad,
    /// Bad blocks which still held valid data at the time of failure
    BadUsed,
}

/// Selects which of a block's two link sites a list threads through
pub trait LinkSite {
    fn link(block: &EraseBlock) -> &Link;
    fn link_mut(block: &mut EraseBlock) -> &mut Link;
}

/// The lifecycle-list link site
#[derive(Debug)]
pub struct ListLink;

impl LinkSite for ListLink {
    fn link(block: &EraseBlock) -> &Link {
        &block.list_link
    }
    fn link_mut(block: &mut EraseBlock) -> &mut Link {
        &mut block.list_link
    }
}

/// The wear-bucket link site
#[derive(Debug)]
pub struct HashLink;

impl LinkSite for HashLink {
    fn link(block: &EraseBlock) -> &Link {
        &block.hash_link
    }
    fn link_mut(block: &mut EraseBlock) -> &mut Link {
        &mut block.hash_link
    }
}

/// A doubly-linked list of blocks threaded through link site `S`
#[derive(Debug)]
pub struct IndexList<S> {
    head: Option<BlockId>,
    tail: Option<BlockId>,
    count: u32,
    _site: PhantomData<S>,
}

impl<S> Default for IndexList<S> {
    fn default() -> Self {
        Self {
            head: None,
            tail: None,
            count: 0,
            _site: PhantomData,
        }
    }
}

impl<S: LinkSite> IndexList<S> {
    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn front(&self) -> Option<BlockId> {
        self.head
    }

    /// Append `id` at the tail. The block must not currently be on any list
    /// using this link site.
    pub fn push_back(&mut self, arena: &mut [EraseBlock], id: BlockId) {
        let link = S::link_mut(&mut arena[id as usize]);
        debug_assert!(link.prev.is_none() && link.next.is_none());
        link.prev = self.tail;
        link.next = None;

        match self.tail {
            Some(tail) => S::link_mut(&mut arena[tail as usize]).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.count += 1;
    }

    /// Unlink `id` from wherever it sits in this list
    pub fn remove(&mut self, arena: &mut [EraseBlock], id: BlockId) {
        let link = std::mem::take(S::link_mut(&mut arena[id as usize]));

        match link.prev {
            Some(prev) => S::link_mut(&mut arena[prev as usize]).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => S::link_mut(&mut arena[next as usize]).prev = link.prev,
            None => self.tail = link.prev,
        }
        self.count -= 1;
    }

    /// Detach and return the head block
    pub fn pop_front(&mut self, arena: &mut [EraseBlock]) -> Option<BlockId> {
        let id = self.head?;
        self.remove(arena, id);
        Some(id)
    }

    /// Iterate block IDs front to back
    pub fn iter<'a>(&self, arena: &'a [EraseBlock]) -> ListIter<'a, S> {
        ListIter {
            arena,
            cur: self.head,
            _site: PhantomData,
        }
    }
}

pub struct ListIter<'a, S> {
    arena: &'a [EraseBlock],
    cur: Option<BlockId>,
    _site: PhantomData<S>,
}

impl<S: LinkSite> Iterator for ListIter<'_, S> {
    type Item = BlockId;

    fn next(&mut self) -> Option<BlockId> {
        let id = self.cur?;
        self.cur = S::link(&self.arena[id as usize]).next;
        Some(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn arena(n: u32) -> Vec<EraseBlock> {
        (0..n).map(|i| EraseBlock::new(i * 4096, 4096)).collect()
    }

    #[test]
    fn push_pop_preserves_order() {
        let mut blocks = arena(4);
        let mut list = IndexList::<ListLink>::default();

        for id in [2, 0, 3] {
            list.push_back(&mut blocks, id);
        }
        assert_eq!(list.len(), 3);
        assert_eq!(list.iter(&blocks).collect::<Vec<_>>(), vec![2, 0, 3]);

        assert_eq!(list.pop_front(&mut blocks), Some(2));
        assert_eq!(list.pop_front(&mut blocks), Some(0));
        assert_eq!(list.pop_front(&mut blocks), Some(3));
        assert_eq!(list.pop_front(&mut blocks), None);
        assert!(list.is_empty());
    }

    #[test]
    fn remove_from_middle() {
        let mut blocks = arena(4);
        let mut list = IndexList::<ListLink>::default();

        for id in 0..4 {
            list.push_back(&mut blocks, id);
        }
        list.remove(&mut blocks, 1);
        list.remove(&mut blocks, 3);
        assert_eq!(list.iter(&blocks).collect::<Vec<_>>(), vec![0, 2]);

        // Removed blocks can be reinserted
        list.push_back(&mut blocks, 1);
        assert_eq!(list.iter(&blocks).collect::<Vec<_>>(), vec![0, 2, 1]);
    }

    #[test]
    fn link_sites_are_independent() {
        let mut blocks = arena(2);
        let mut lifecycle = IndexList::<ListLink>::default();
        let mut bucket = IndexList::<HashLink>::default();

        lifecycle.push_back(&mut blocks, 0);
        bucket.push_back(&mut blocks, 0);
        lifecycle.remove(&mut blocks, 0);

        // Still on the bucket list after leaving the lifecycle list
        assert_eq!(bucket.iter(&blocks).collect::<Vec<_>>(), vec![0]);
    }
}
