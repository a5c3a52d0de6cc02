//! The erase-block registry: the arena of all block descriptors, the
//! lifecycle lists partitioning them, the two wear tables, and the
//! filesystem-wide aggregate counters.
//!
//! Everything in here is protected by the filesystem's completion lock (the
//! registry *is* that lock's contents) and none of it ever blocks on flash
//! I/O: callers stage I/O outside, then come back in to record the outcome.

use std::collections::HashMap;

use tracing::debug;

use crate::block::{BlockId, EraseBlock, NodeRef};
use crate::error::{inconsistent, Result};
use crate::lists::{IndexList, ListKind, ListLink};
use crate::summary::NodeInfo;
use crate::wear::WearTable;

/// Numbers of free blocks there must be before we...
#[derive(Debug, Copy, Clone)]
pub struct ResvBlocks {
    /// ... allow a normal filesystem write
    pub write: u32,
    /// ... allow a deletion (deletions make space, so this is lower)
    pub deletion: u32,
    /// ... let the GC thread sleep
    pub gctrigger: u32,
    /// ... spend a GC cycle retiring a block from the bad-used list
    pub gcbad: u32,
    /// ... let GC relocate at all (it must not exhaust its own headroom)
    pub gcmerge: u32,
}

impl ResvBlocks {
    /// Derive trigger levels from device geometry
    pub fn for_device(nr_blocks: u32) -> Self {
        let deletion = 2;
        let write = deletion + 1 + nr_blocks / 64;
        Self {
            write,
            deletion,
            gctrigger: write + 1,
            gcbad: write + 2,
            gcmerge: deletion,
        }
    }
}

/// Space totals reported by statfs
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SpaceStats {
    pub free: u64,
    pub used: u64,
    pub dirty: u64,
    pub wasted: u64,
    pub unchecked: u64,
}

#[derive(Debug, Default)]
struct Lists {
    clean: IndexList<ListLink>,
    dirty: IndexList<ListLink>,
    very_dirty: IndexList<ListLink>,
    erasable: IndexList<ListLink>,
    erase_pending: IndexList<ListLink>,
    erasing: IndexList<ListLink>,
    erase_complete: IndexList<ListLink>,
    free: IndexList<ListLink>,
    bad: IndexList<ListLink>,
    bad_used: IndexList<ListLink>,
}

impl Lists {
    fn get_mut(&mut self, kind: ListKind) -> &mut IndexList<ListLink> {
        match kind {
            ListKind::Clean => &mut self.clean,
            ListKind::Dirty => &mut self.dirty,
            ListKind::VeryDirty => &mut self.very_dirty,
            ListKind::Erasable => &mut self.erasable,
            ListKind::ErasePending => &mut self.erase_pending,
            ListKind::Erasing => &mut self.erasing,
            ListKind::EraseComplete => &mut self.erase_complete,
            ListKind::Free => &mut self.free,
            ListKind::Bad => &mut self.bad,
            ListKind::BadUsed => &mut self.bad_used,
        }
    }

    fn get(&self, kind: ListKind) -> &IndexList<ListLink> {
        match kind {
            ListKind::Clean => &self.clean,
            ListKind::Dirty => &self.dirty,
            ListKind::VeryDirty => &self.very_dirty,
            ListKind::Erasable => &self.erasable,
            ListKind::ErasePending => &self.erase_pending,
            ListKind::Erasing => &self.erasing,
            ListKind::EraseComplete => &self.erase_complete,
            ListKind::Free => &self.free,
            ListKind::Bad => &self.bad,
            ListKind::BadUsed => &self.bad_used,
        }
    }
}

const ALL_LISTS: [ListKind; 10] = [
    ListKind::Clean,
    ListKind::Dirty,
    ListKind::VeryDirty,
    ListKind::Erasable,
    ListKind::ErasePending,
    ListKind::Erasing,
    ListKind::EraseComplete,
    ListKind::Free,
    ListKind::Bad,
    ListKind::BadUsed,
];

/// Which wear table (if any) accompanies membership of a given list
fn wear_site(kind: ListKind) -> Option<Wear> {
    match kind {
        ListKind::Free => Some(Wear::Free),
        ListKind::Clean | ListKind::Dirty | ListKind::VeryDirty => Some(Wear::Used),
        _ => None,
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Wear {
    Free,
    Used,
}

#[derive(Debug)]
pub struct Registry {
    blocks: Vec<EraseBlock>,
    block_size: u32,

    lists: Lists,
    free_table: WearTable,
    used_table: WearTable,

    /// The block we're currently filling; off-list while it holds this slot
    pub nextblock: Option<BlockId>,
    /// The block we're currently garbage-collecting; also off-list
    pub gcblock: Option<BlockId>,

    /// Every live (non-obsolete) node by its sequence id, pointing at its
    /// current (offset, len). GC relocation repoints entries here, which is
    /// what keeps callers' node handles valid across a move.
    live: HashMap<u64, (u32, u32)>,
    next_seq: u64,

    /// Filesystem-wide totals, maintained incrementally so statfs is O(1)
    free_size: u64,
    used_size: u64,
    dirty_size: u64,
    wasted_size: u64,
    unchecked_size: u64,

    pub total_erase_count: u64,
    pub max_erase_count: u32,

    pub resv: ResvBlocks,

    /// Set when an accounting violation has been detected; the filesystem is
    /// read-only from then on
    pub inconsistent: bool,
}

impl Registry {
    pub fn new(nr_blocks: u32, block_size: u32, resv: ResvBlocks) -> Self {
        let blocks = (0..nr_blocks)
            .map(|i| EraseBlock::new(i * block_size, block_size))
            .collect();

        Self {
            blocks,
            block_size,
            lists: Lists::default(),
            free_table: WearTable::default(),
            used_table: WearTable::default(),
            nextblock: None,
            gcblock: None,
            live: HashMap::new(),
            next_seq: 1,
            free_size: u64::from(nr_blocks) * u64::from(block_size),
            used_size: 0,
            dirty_size: 0,
            wasted_size: 0,
            unchecked_size: 0,
            total_erase_count: 0,
            max_erase_count: 0,
            resv,
            inconsistent: false,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn nr_blocks(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn block(&self, id: BlockId) -> &EraseBlock {
        &self.blocks[id as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut EraseBlock {
        &mut self.blocks[id as usize]
    }

    /// The block containing device offset `offset`
    pub fn block_of(&self, offset: u32) -> BlockId {
        offset / self.block_size
    }

    pub fn nr_free_blocks(&self) -> u32 {
        self.lists.free.len()
    }

    pub fn nr_bad_blocks(&self) -> u32 {
        self.lists.bad.len() + self.lists.bad_used.len()
    }

    pub fn nr_erasing_blocks(&self) -> u32 {
        self.lists.erasing.len() + self.lists.erase_pending.len() + self.lists.erase_complete.len()
    }

    pub fn stats(&self) -> SpaceStats {
        SpaceStats {
            free: self.free_size,
            used: self.used_size,
            dirty: self.dirty_size,
            wasted: self.wasted_size,
            unchecked: self.unchecked_size,
        }
    }

    // ----- list membership -----

    /// Put `id` on `kind`, updating the matching wear table. The block must
    /// currently be detached.
    pub fn attach(&mut self, id: BlockId, kind: ListKind) {
        debug_assert!(self.blocks[id as usize].list.is_none());
        self.lists.get_mut(kind).push_back(&mut self.blocks, id);
        self.blocks[id as usize].list = Some(kind);
        match wear_site(kind) {
            Some(Wear::Free) => self.free_table.insert(&mut self.blocks, id),
            Some(Wear::Used) => self.used_table.insert(&mut self.blocks, id),
            None => {}
        }
    }

    /// Take `id` off whatever list (and wear table) it is on
    pub fn detach(&mut self, id: BlockId) {
        let Some(kind) = self.blocks[id as usize].list.take() else {
            return;
        };
        self.lists.get_mut(kind).remove(&mut self.blocks, id);
        match wear_site(kind) {
            Some(Wear::Free) => self.free_table.remove(&mut self.blocks, id),
            Some(Wear::Used) => self.used_table.remove(&mut self.blocks, id),
            None => {}
        }
    }

    /// Move `id` between lists
    pub fn move_to(&mut self, id: BlockId, kind: ListKind) {
        self.detach(id);
        self.attach(id, kind);
    }

    /// The resting list for a block given its current counters
    pub fn resting_list(&self, id: BlockId) -> ListKind {
        let block = &self.blocks[id as usize];
        if block.dirty_size == 0 {
            ListKind::Clean
        } else if block.used_size == 0 && block.unchecked_size == 0 {
            ListKind::Erasable
        } else if block.dirty_size >= self.block_size / 2 {
            ListKind::VeryDirty
        } else {
            ListKind::Dirty
        }
    }

    /// Reposition a block after its counters changed, unless it is currently
    /// the write target, the GC victim, or already being erased
    fn settle(&mut self, id: BlockId) {
        match self.blocks[id as usize].list {
            Some(
                ListKind::Clean | ListKind::Dirty | ListKind::VeryDirty | ListKind::Erasable,
            ) => {
                let kind = self.resting_list(id);
                if self.blocks[id as usize].list != Some(kind) {
                    self.move_to(id, kind);
                }
            }
            _ => {}
        }
    }

    // ----- allocation -----

    /// Pop the least-worn free block for use as the next write target
    pub fn take_free_block(&mut self) -> Option<BlockId> {
        let id = self.free_table.peek_least_worn()?;
        self.detach(id);
        debug!(block = id, erase_count = self.blocks[id as usize].erase_count, "allocated block");
        Some(id)
    }

    /// Pop the least-worn block holding data, for GC's static-data rotation
    pub fn take_least_worn_used(&mut self) -> Option<BlockId> {
        let id = self.used_table.peek_least_worn()?;
        self.detach(id);
        Some(id)
    }

    // ----- space accounting -----
    //
    // The four moves mirror the block-level ones but also maintain the
    // filesystem aggregates, which is why they are the only sanctioned entry
    // points outside of mount.

    pub fn mark_used(&mut self, id: BlockId, n: u32) -> Result<()> {
        self.guarded(id, |b| b.take_used(n))?;
        self.free_size -= u64::from(n);
        self.used_size += u64::from(n);
        Ok(())
    }

    pub fn mark_dirty(&mut self, id: BlockId, n: u32) -> Result<()> {
        self.guarded(id, |b| b.take_dirty(n))?;
        self.free_size -= u64::from(n);
        self.dirty_size += u64::from(n);
        self.settle(id);
        Ok(())
    }

    pub fn mark_wasted(&mut self, id: BlockId, n: u32) -> Result<()> {
        self.guarded(id, |b| b.take_wasted(n))?;
        self.free_size -= u64::from(n);
        self.wasted_size += u64::from(n);
        Ok(())
    }

    pub fn mark_unchecked(&mut self, id: BlockId, n: u32) -> Result<()> {
        self.guarded(id, |b| b.take_unchecked(n))?;
        self.free_size -= u64::from(n);
        self.unchecked_size += u64::from(n);
        Ok(())
    }

    fn guarded<T>(&mut self, id: BlockId, op: impl FnOnce(&mut EraseBlock) -> Result<T>) -> Result<T> {
        match op(&mut self.blocks[id as usize]) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.inconsistent = true;
                Err(e)
            }
        }
    }

    /// Record a completed node write into `id`, registering the node in the
    /// live table. A zero `seq` gets a fresh id; GC passes the original's id
    /// so the relocated copy keeps answering to it. Returns the id.
    pub fn note_write(&mut self, id: BlockId, mut node: NodeRef) -> Result<u64> {
        if node.seq == 0 {
            node.seq = self.next_seq;
            self.next_seq += 1;
        }
        let (seq, offset, len) = (node.seq, node.offset, node.len);
        self.guarded(id, |b| b.push_ref(node))?;
        self.live.insert(seq, (offset, len));
        self.mark_used(id, len)?;
        Ok(seq)
    }

    /// Current location of the live node `seq`, or `None` once it has been
    /// obsoleted
    pub fn resolve(&self, seq: u64) -> Option<(u32, u32)> {
        self.live.get(&seq).copied()
    }

    /// A node has been superseded: move its bytes `used -> dirty`, flip its
    /// reference, and reposition the block. Returns the node's metadata (for
    /// inode-cache maintenance), or `None` if it was already obsolete.
    pub fn obsolete_at(&mut self, offset: u32, len: u32) -> Result<Option<NodeInfo>> {
        let id = self.block_of(offset);
        if id >= self.nr_blocks() {
            self.inconsistent = true;
            inconsistent!("obsolete at {:#x}: no such block", offset);
        }

        let Some(idx) = self.blocks[id as usize].ref_at(offset) else {
            self.inconsistent = true;
            inconsistent!("obsolete at {:#x}: no node reference there", offset);
        };
        let node = &mut self.blocks[id as usize].refs[idx];
        if node.obsolete {
            return Ok(None);
        }
        if node.len != len {
            self.inconsistent = true;
            inconsistent!(
                "obsolete at {:#x}: length mismatch ({} recorded, {} requested)",
                offset,
                node.len,
                len
            );
        }
        node.obsolete = true;
        let info = node.info.clone();
        let seq = node.seq;

        // Drop the live entry, unless relocation already repointed it at a
        // fresh copy elsewhere
        if self.live.get(&seq) == Some(&(offset, len)) {
            self.live.remove(&seq);
        }

        self.guarded(id, |b| b.obsolete_bytes(len, false))?;
        self.used_size -= u64::from(len);
        self.dirty_size += u64::from(len);
        self.settle(id);
        Ok(Some(info))
    }

    // ----- erase lifecycle -----

    /// A block's erase completed: reset counters, bump wear accounting, and
    /// park it on the erase-complete list pending its header write. The
    /// detach must happen before the counter reset, while the erase count
    /// the wear tables filed it under is still current.
    pub fn erase_done(&mut self, id: BlockId) {
        self.detach(id);
        {
            let block = &mut self.blocks[id as usize];
            let size = block.block_size();
            self.free_size += u64::from(size) - u64::from(block.free_size);
            self.used_size -= u64::from(block.used_size);
            self.dirty_size -= u64::from(block.dirty_size);
            self.wasted_size -= u64::from(block.wasted_size);
            self.unchecked_size -= u64::from(block.unchecked_size);
            block.reset_after_erase();
            self.total_erase_count += 1;
            self.max_erase_count = self.max_erase_count.max(block.erase_count);
        }
        self.attach(id, ListKind::EraseComplete);
    }

    /// The freshly erased block's header is on flash (or was never wanted):
    /// hand it back to the free pool
    pub fn release_erased(&mut self, id: BlockId) {
        self.move_to(id, ListKind::Free);
    }

    /// The flash driver failed to erase or program this block: pull it out of
    /// wear-leveling consideration entirely
    pub fn retire_bad(&mut self, id: BlockId) {
        let had_data = {
            let block = &self.blocks[id as usize];
            block.used_size > 0 || block.unchecked_size > 0
        };
        self.detach(id);
        if self.nextblock == Some(id) {
            self.nextblock = None;
        }
        if self.gcblock == Some(id) {
            self.gcblock = None;
        }

        // Whatever is still on the block may be readable, but nothing more
        // will ever be written to it: the unwritten tail is lost.
        let block = &mut self.blocks[id as usize];
        let lost = block.free_size;
        block.free_size = 0;
        block.wasted_size += lost;
        self.free_size -= u64::from(lost);
        self.wasted_size += u64::from(lost);

        let kind = if had_data {
            ListKind::BadUsed
        } else {
            ListKind::Bad
        };
        self.attach(id, kind);
    }

    // ----- GC support -----

    /// Should the background GC thread be running a pass right now?
    pub fn gc_wanted(&self) -> bool {
        self.nr_free_blocks() < self.resv.gctrigger
            || !self.lists.erase_pending.is_empty()
            || (!self.lists.erasable.is_empty() && self.nr_free_blocks() < self.resv.write)
    }

    /// Next block to erase, if any (pending first, then erasable)
    pub fn take_erase_candidate(&mut self) -> Option<BlockId> {
        let id = self
            .lists
            .erase_pending
            .front()
            .or_else(|| self.lists.erasable.front())?;
        self.detach(id);
        Some(id)
    }

    /// A failed block still holding live data, if any. Evacuating these is
    /// low-priority housekeeping, gated on the `gcbad` reserve.
    pub fn take_bad_used(&mut self) -> Option<BlockId> {
        let id = self
            .lists
            .bad_used
            .iter(&self.blocks)
            .find(|&id| self.blocks[id as usize].unchecked_size == 0)?;
        self.detach(id);
        Some(id)
    }

    /// Pick the GC victim with the most reclaimable space: the very-dirty
    /// list first, then the dirty list. Blocks with unchecked content are
    /// skipped; their nodes cannot be relocated without the scan module.
    pub fn pick_dirtiest_victim(&mut self) -> Option<BlockId> {
        for kind in [ListKind::VeryDirty, ListKind::Dirty] {
            let victim = self
                .lists
                .get(kind)
                .iter(&self.blocks)
                .filter(|&id| self.blocks[id as usize].unchecked_size == 0)
                .max_by_key(|&id| self.blocks[id as usize].dirty_size);
            if let Some(id) = victim {
                self.detach(id);
                return Some(id);
            }
        }
        None
    }

    /// Total blocks that could be made free without relocating anything
    pub fn reclaimable_blocks(&self) -> u32 {
        self.lists.erasable.len() + self.nr_erasing_blocks()
    }

    // ----- integrity -----

    /// Verify the structural invariants; used by tests and debug assertions.
    /// Every block is on exactly one list (or holds the nextblock/gcblock
    /// slot), counters partition each block, and wear-table membership
    /// matches list membership.
    pub fn check_invariants(&self) -> Result<()> {
        let mut seen = vec![false; self.blocks.len()];
        for kind in ALL_LISTS {
            for id in self.lists.get(kind).iter(&self.blocks) {
                if seen[id as usize] {
                    inconsistent!("block {} on more than one list", id);
                }
                seen[id as usize] = true;
                if self.blocks[id as usize].list != Some(kind) {
                    inconsistent!("block {} list tag does not match membership", id);
                }
            }
        }
        for (id, block) in self.blocks.iter().enumerate() {
            let id = id as u32;
            let active = self.nextblock == Some(id) || self.gcblock == Some(id);
            if seen[id as usize] == active {
                inconsistent!("block {} neither on a list nor active (or both)", id);
            }
            if block.block_size() != self.block_size {
                inconsistent!("block {} counters do not sum to block size", id);
            }
        }

        let stats = self.stats();
        let mut expect = SpaceStats::default();
        for block in &self.blocks {
            expect.free += u64::from(block.free_size);
            expect.used += u64::from(block.used_size);
            expect.dirty += u64::from(block.dirty_size);
            expect.wasted += u64::from(block.wasted_size);
            expect.unchecked += u64::from(block.unchecked_size);
        }
        if stats != expect {
            inconsistent!("aggregate counters have drifted from per-block sums");
        }

        for (&seq, &(offset, len)) in &self.live {
            let id = self.block_of(offset);
            let matches = id < self.nr_blocks()
                && self.blocks[id as usize].ref_at(offset).is_some_and(|idx| {
                    let r = &self.blocks[id as usize].refs[idx];
                    !r.obsolete && r.len == len && r.seq == seq
                });
            if !matches {
                inconsistent!("live node {} has no matching reference", seq);
            }
        }

        if self.free_table.len() != self.lists.free.len() {
            inconsistent!("free wear table does not match free list");
        }
        let used_listed =
            self.lists.clean.len() + self.lists.dirty.len() + self.lists.very_dirty.len();
        if self.used_table.len() != used_listed {
            inconsistent!("used wear table does not match clean/dirty lists");
        }
        Ok(())
    }
}
