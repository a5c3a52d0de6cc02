//! Erase-count-bucketed wear tables.
//!
//! Two of these exist per filesystem: one over free blocks (consulted by the
//! allocator) and one over used/dirty blocks (consulted by GC when it
//! rotates static data). Blocks land in bucket `erase_count >> BUCKET_RANGE_BITS`,
//! and `current_index` tracks the lowest non-empty bucket so "least-worn
//! block" is O(1) amortized: the forward scan after emptying a bucket visits
//! each bucket at most once until it is repopulated.
//!
//! Bucketing is deliberately approximate. Erase counts change by exactly one
//! per erase, so a perfectly sorted structure would pay O(log n) per update
//! to distinguish blocks the wear-leveling policy treats as equivalent
//! anyway.

use crate::block::{BlockId, EraseBlock};
use crate::lists::{HashLink, IndexList};

/// NAND and NOR parts are rated for roughly 100K erase cycles
pub const MAX_ERASE_COUNT_BITS: u32 = 18;

/// Target bound for (max erase count - min erase count) across the device
pub const WL_DELTA_BITS: u32 = 10;
pub const WL_DELTA: u32 = 1 << WL_DELTA_BITS;

/// Each bucket spans half the wear-leveling delta
const HASH_SIZE_BITS: u32 = MAX_ERASE_COUNT_BITS - WL_DELTA_BITS + 1;
pub const HASH_SIZE: usize = 1 << HASH_SIZE_BITS;
pub const BUCKET_RANGE_BITS: u32 = MAX_ERASE_COUNT_BITS - HASH_SIZE_BITS;

/// A fixed array of buckets plus the index of the lowest non-empty one
/// (`HASH_SIZE` when the whole table is empty)
#[derive(Debug)]
pub struct WearTable {
    buckets: Vec<IndexList<HashLink>>,
    current_index: usize,
}

impl Default for WearTable {
    fn default() -> Self {
        Self {
            buckets: (0..HASH_SIZE).map(|_| IndexList::default()).collect(),
            current_index: HASH_SIZE,
        }
    }
}

impl WearTable {
    fn bucket_of(block: &EraseBlock) -> usize {
        // Counts past the rated maximum all collapse into the last bucket;
        // such a block is end-of-life and never preferable anyway.
        std::cmp::min(
            (block.erase_count >> BUCKET_RANGE_BITS) as usize,
            HASH_SIZE - 1,
        )
    }

    /// Total number of blocks across all buckets
    pub fn len(&self) -> u32 {
        self.buckets.iter().map(IndexList::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.current_index == HASH_SIZE
    }

    /// Add `id` to the bucket for its current erase count
    pub fn insert(&mut self, arena: &mut [EraseBlock], id: BlockId) {
        let index = Self::bucket_of(&arena[id as usize]);
        self.buckets[index].push_back(arena, id);
        if index < self.current_index {
            self.current_index = index;
        }
    }

    /// Remove `id` from its bucket (it need not be the least worn)
    pub fn remove(&mut self, arena: &mut [EraseBlock], id: BlockId) {
        let index = Self::bucket_of(&arena[id as usize]);
        self.buckets[index].remove(arena, id);
        if index == self.current_index {
            self.advance_current();
        }
    }

    /// The least-worn block in the table, without removing it
    pub fn peek_least_worn(&self) -> Option<BlockId> {
        self.buckets.get(self.current_index)?.front()
    }

    /// Detach and return the least-worn block, or `None` if the table is
    /// exhausted
    pub fn take_least_worn(&mut self, arena: &mut [EraseBlock]) -> Option<BlockId> {
        let id = self.buckets.get_mut(self.current_index)?.pop_front(arena)?;
        self.advance_current();
        Some(id)
    }

    fn advance_current(&mut self) {
        while self.current_index < HASH_SIZE && self.buckets[self.current_index].is_empty() {
            self.current_index += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn arena_with_counts(counts: &[u32]) -> Vec<EraseBlock> {
        counts
            .iter()
            .enumerate()
            .map(|(i, &ec)| {
                let mut b = EraseBlock::new(i as u32 * 4096, 4096);
                b.erase_count = ec;
                b
            })
            .collect()
    }

    #[test]
    fn least_worn_first() {
        // Erase counts {5, 50} plus a freshly re-erased block at 6; the
        // 50-cycle block must never come out first.
        let mut blocks = arena_with_counts(&[5, 50 << BUCKET_RANGE_BITS, 6]);
        let mut table = WearTable::default();
        for id in 0..3 {
            table.insert(&mut blocks, id);
        }

        let first = table.take_least_worn(&mut blocks).unwrap();
        let second = table.take_least_worn(&mut blocks).unwrap();
        assert!(matches!(first, 0 | 2));
        assert!(matches!(second, 0 | 2));
        assert_eq!(table.take_least_worn(&mut blocks), Some(1));
        assert!(table.is_empty());
    }

    #[test]
    fn selection_is_globally_minimal() {
        // Stay below the clamp bucket so ordering is exact
        let counts: Vec<u32> = (0..64).map(|i| ((i * 37) % 500) << BUCKET_RANGE_BITS).collect();
        let mut blocks = arena_with_counts(&counts);
        let mut table = WearTable::default();
        for id in 0..counts.len() as u32 {
            table.insert(&mut blocks, id);
        }

        let mut last = 0;
        while let Some(id) = table.take_least_worn(&mut blocks) {
            let ec = blocks[id as usize].erase_count >> BUCKET_RANGE_BITS;
            assert!(ec >= last);
            last = ec;
        }
    }

    #[test]
    fn remove_rederives_current_index() {
        let mut blocks = arena_with_counts(&[0, 3 << BUCKET_RANGE_BITS]);
        let mut table = WearTable::default();
        table.insert(&mut blocks, 0);
        table.insert(&mut blocks, 1);

        // Pull the sole low-bucket entry out from under the table
        table.remove(&mut blocks, 0);
        assert_eq!(table.peek_least_worn(), Some(1));

        table.remove(&mut blocks, 1);
        assert!(table.is_empty());
        assert_eq!(table.take_least_worn(&mut blocks), None);
    }

    #[test]
    fn reinsertion_after_erase_moves_buckets() {
        let mut blocks = arena_with_counts(&[(1 << BUCKET_RANGE_BITS) - 1]);
        let mut table = WearTable::default();
        table.insert(&mut blocks, 0);
        table.remove(&mut blocks, 0);

        // One more erase pushes the block into the next bucket range
        blocks[0].erase_count += 1;
        table.insert(&mut blocks, 0);
        assert_eq!(table.peek_least_worn(), Some(0));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn overflow_counts_clamp_to_last_bucket() {
        let mut blocks = arena_with_counts(&[u32::MAX]);
        let mut table = WearTable::default();
        table.insert(&mut blocks, 0);
        assert_eq!(table.take_least_worn(&mut blocks), Some(0));
    }
}
