//! Per-erase-block bookkeeping: the block descriptor, its chain of node
//! references, and the space-accounting moves.
//!
//! The five size counters partition the block at all times:
//! `free + used + dirty + wasted + unchecked == block_size`. The only
//! sanctioned mutations are the four `take_*` moves below (each shifts bytes
//! out of `free` into one category), obsoletion (`used`/`unchecked` into
//! `dirty`), and the full reset on erase completion. Anything that would
//! break the partition is a fatal consistency error, not a recoverable one.

use crate::error::{inconsistent, Result};
use crate::lists::ListKind;
use crate::summary::NodeInfo;

/// Index of an erase block within the registry arena
pub type BlockId = u32;

/// Intrusive doubly-linked list membership, stored as arena indices
#[derive(Debug, Default, Copy, Clone)]
pub struct Link {
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
}

/// The coarse lifecycle state of a block, derived from its list membership
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockState {
    Free,
    Clean,
    PartDirty,
    AllDirty,
    Erasing,
    Bad,
}

/// One written unit (node) on flash, as tracked by its owning block.
///
/// References are appended in write order and never reordered; "most recent
/// version wins" resolution in the node index depends on that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    /// Device-absolute byte offset of the node
    pub offset: u32,
    /// Total length of the node on flash
    pub len: u32,
    /// Set once the node has been superseded or deleted
    pub obsolete: bool,
    /// Stable identity of the node, preserved when GC relocates it; 0 means
    /// "assign one" to [`crate::registry::Registry::note_write`]
    pub seq: u64,
    /// Enough metadata to rebuild this node's summary entry without
    /// re-reading the node body
    pub info: NodeInfo,
}

/// One per physical erase unit
#[derive(Debug, Clone)]
pub struct EraseBlock {
    /// Byte offset of this block within the device; immutable after mount
    pub offset: u32,

    pub free_size: u32,
    pub used_size: u32,
    pub dirty_size: u32,
    pub wasted_size: u32,
    pub unchecked_size: u32,

    /// Number of times this block has been erased
    pub erase_count: u32,

    /// Ordered chain of every node written into this block, including
    /// obsoleted ones, until the block is erased
    pub refs: Vec<NodeRef>,

    /// Which lifecycle list this block is on; `None` only while the block is
    /// the active write target or the current GC victim
    pub list: Option<ListKind>,
    pub list_link: Link,

    /// Wear-bucket membership (free table or used table, never both)
    pub hash_link: Link,
}

impl EraseBlock {
    pub fn new(offset: u32, block_size: u32) -> Self {
        Self {
            offset,
            free_size: block_size,
            used_size: 0,
            dirty_size: 0,
            wasted_size: 0,
            unchecked_size: 0,
            erase_count: 0,
            refs: Vec::new(),
            list: None,
            list_link: Link::default(),
            hash_link: Link::default(),
        }
    }

    /// The block size this block was created with
    pub fn block_size(&self) -> u32 {
        self.free_size + self.used_size + self.dirty_size + self.wasted_size + self.unchecked_size
    }

    /// Device-absolute offset of the next append within this block
    pub fn write_offset(&self) -> u32 {
        self.offset + (self.block_size() - self.free_size)
    }

    /// Move `n` bytes from `free` to `used`
    pub fn take_used(&mut self, n: u32) -> Result<()> {
        self.take_free(n)?;
        self.used_size += n;
        Ok(())
    }

    /// Move `n` bytes from `free` to `dirty`
    pub fn take_dirty(&mut self, n: u32) -> Result<()> {
        self.take_free(n)?;
        self.dirty_size += n;
        Ok(())
    }

    /// Move `n` bytes from `free` to `wasted`
    pub fn take_wasted(&mut self, n: u32) -> Result<()> {
        self.take_free(n)?;
        self.wasted_size += n;
        Ok(())
    }

    /// Move `n` bytes from `free` to `unchecked`
    pub fn take_unchecked(&mut self, n: u32) -> Result<()> {
        self.take_free(n)?;
        self.unchecked_size += n;
        Ok(())
    }

    fn take_free(&mut self, n: u32) -> Result<()> {
        if n > self.free_size {
            inconsistent!(
                "block @{:#x}: claiming {} bytes with only {} free",
                self.offset,
                n,
                self.free_size
            );
        }
        self.free_size -= n;
        Ok(())
    }

    /// Move `n` bytes from `used` (or `unchecked`) to `dirty`: a node in this
    /// block has been superseded
    pub fn obsolete_bytes(&mut self, n: u32, was_unchecked: bool) -> Result<()> {
        let source = if was_unchecked {
            &mut self.unchecked_size
        } else {
            &mut self.used_size
        };
        if n > *source {
            inconsistent!(
                "block @{:#x}: obsoleting {} bytes with only {} accounted",
                self.offset,
                n,
                source
            );
        }
        *source -= n;
        self.dirty_size += n;
        Ok(())
    }

    /// Full reset on erase completion. Never a partial transition: counters,
    /// refs, and the erase count all change together.
    pub fn reset_after_erase(&mut self) {
        let block_size = self.block_size();
        self.free_size = block_size;
        self.used_size = 0;
        self.dirty_size = 0;
        self.wasted_size = 0;
        self.unchecked_size = 0;
        self.erase_count += 1;
        self.refs.clear();
    }

    /// Append a node reference; `offset` must continue the forward-only log
    pub fn push_ref(&mut self, node: NodeRef) -> Result<()> {
        if let Some(last) = self.refs.last() {
            if node.offset < last.offset + last.len {
                inconsistent!(
                    "block @{:#x}: node ref at {:#x} breaks append order",
                    self.offset,
                    node.offset
                );
            }
        }
        self.refs.push(node);
        Ok(())
    }

    /// Find the reference covering `offset`, if any
    pub fn ref_at(&self, offset: u32) -> Option<usize> {
        self.refs
            .binary_search_by_key(&offset, |r| r.offset)
            .ok()
    }

    /// The coarse state implied by the current counters and list
    pub fn state(&self) -> BlockState {
        match self.list {
            Some(ListKind::Free) => BlockState::Free,
            Some(ListKind::Bad | ListKind::BadUsed) => BlockState::Bad,
            Some(ListKind::Erasing | ListKind::ErasePending | ListKind::EraseComplete) => {
                BlockState::Erasing
            }
            Some(ListKind::Erasable) => BlockState::AllDirty,
            Some(ListKind::Clean) => BlockState::Clean,
            Some(ListKind::Dirty | ListKind::VeryDirty) => BlockState::PartDirty,
            // nextblock / gcblock: classify by counters
            None => {
                if self.dirty_size == 0 {
                    BlockState::Clean
                } else if self.used_size == 0 && self.unchecked_size == 0 {
                    BlockState::AllDirty
                } else {
                    BlockState::PartDirty
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn block() -> EraseBlock {
        EraseBlock::new(0x4000, 4096)
    }

    #[test]
    fn counters_partition_block() {
        let mut b = block();
        b.take_used(1000).unwrap();
        b.take_dirty(100).unwrap();
        b.take_wasted(20).unwrap();
        b.take_unchecked(76).unwrap();
        assert_eq!(b.block_size(), 4096);
        assert_eq!(b.free_size, 2900);
        assert_eq!(b.write_offset(), 0x4000 + 1196);
    }

    #[test]
    fn overdraw_is_fatal() {
        let mut b = block();
        b.take_used(4096).unwrap();
        assert!(b.take_used(1).unwrap_err().is_fatal());
        assert!(b.obsolete_bytes(5000, false).unwrap_err().is_fatal());
    }

    #[test]
    fn obsolete_moves_used_to_dirty() {
        let mut b = block();
        b.take_used(4096).unwrap();
        b.obsolete_bytes(100, false).unwrap();
        assert_eq!((b.used_size, b.dirty_size), (3996, 100));
        assert_eq!(b.state(), BlockState::PartDirty);
        b.obsolete_bytes(3996, false).unwrap();
        assert_eq!(b.state(), BlockState::AllDirty);
    }

    #[test]
    fn erase_resets_everything() {
        let mut b = block();
        b.take_used(4000).unwrap();
        b.take_wasted(96).unwrap();
        b.obsolete_bytes(4000, false).unwrap();
        b.reset_after_erase();
        assert_eq!(b.free_size, 4096);
        assert_eq!(b.dirty_size + b.used_size + b.wasted_size + b.unchecked_size, 0);
        assert_eq!(b.erase_count, 1);
        assert!(b.refs.is_empty());
    }

    #[test]
    fn refs_enforce_append_order() {
        let mut b = block();
        let node = |offset, len| NodeRef {
            offset,
            len,
            obsolete: false,
            seq: 0,
            info: NodeInfo::Padding,
        };
        b.push_ref(node(0x4000, 100)).unwrap();
        b.push_ref(node(0x4064, 50)).unwrap();
        assert!(b.push_ref(node(0x4000, 10)).is_err());
        assert_eq!(b.ref_at(0x4064), Some(1));
        assert_eq!(b.ref_at(0x4001), None);
    }
}
