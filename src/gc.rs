//! Garbage collection: erasing reclaimable blocks and relocating live nodes
//! out of dirty ones.
//!
//! A pass does exactly one unit of work so callers stay responsive: either
//! service one pending erase, or relocate every live node out of one victim
//! block. The same passes run on the background thread and synchronously
//! from the allocator when it runs out of free blocks.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::block::{BlockId, NodeRef};
use crate::error::Result;
use crate::flash::FlashDevice;
use crate::fs::{append_node_locked, lock, wait, AllocState, ResvClass, Shared};
use crate::lists::ListKind;
use crate::summary::{EbhNode, NodeInfo};

/// Every this-many victim selections, GC takes the least-worn used block
/// instead of the dirtiest one, so long-lived data does not pin low-wear
/// blocks forever
const WEAR_ROTATION_PERIOD: u64 = 128;

/// One unit of GC work. Returns whether anything was erased or relocated.
/// Must be called with the `alloc` lock held (passed as `alloc`).
pub(crate) fn gc_pass<F: FlashDevice>(shared: &Shared<F>, alloc: &mut AllocState) -> Result<bool> {
    // Erases come first: they are what actually produce free blocks.
    let candidate = {
        let mut core = lock(&shared.core);
        core.take_erase_candidate().map(|id| {
            core.attach(id, ListKind::Erasing);
            (id, core.block(id).offset)
        })
    };
    if let Some((id, offset)) = candidate {
        erase_one(shared, id, offset)?;
        return Ok(true);
    }

    let victim = {
        let mut core = lock(&shared.core);
        if core.nr_free_blocks() < core.resv.gcmerge {
            // Relocating without headroom could consume the last free
            // blocks and wedge the filesystem.
            None
        } else {
            let pass = shared.gc_passes.fetch_add(1, Ordering::Relaxed);
            let mut picked = None;
            // With comfortable headroom, evacuate blocks that failed a write
            // while still holding live data. Once empty they go through the
            // normal erase ladder: either rehabilitated or marked bad for
            // good.
            if core.nr_free_blocks() >= core.resv.gcbad {
                picked = core.take_bad_used();
                if let Some(id) = picked {
                    debug!(block = id, "evacuating failed block");
                }
            }
            if picked.is_none() && pass % WEAR_ROTATION_PERIOD == WEAR_ROTATION_PERIOD - 1 {
                if let Some(id) = core.take_least_worn_used() {
                    if core.block(id).unchecked_size == 0 {
                        debug!(block = id, "rotating static data for wear leveling");
                        picked = Some(id);
                    } else {
                        let kind = core.resting_list(id);
                        core.attach(id, kind);
                    }
                }
            }
            let picked = picked.or_else(|| core.pick_dirtiest_victim());
            if let Some(id) = picked {
                core.gcblock = Some(id);
            }
            picked
        }
    };
    let Some(victim) = victim else {
        return Ok(false);
    };
    debug!(block = victim, "garbage collecting");

    let relocated = relocate_live_nodes(shared, alloc, victim);
    {
        let mut core = lock(&shared.core);
        core.gcblock = None;
        let mut kind = core.resting_list(victim);
        // A fully collected victim goes straight onto the erase queue
        if relocated.is_ok() && kind == ListKind::Erasable {
            kind = ListKind::ErasePending;
        }
        core.attach(victim, kind);
    }
    match relocated {
        Ok(()) => Ok(true),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            // Typically out of space mid-relocation; what was already moved
            // stays moved, and the victim simply waits for another pass.
            warn!(block = victim, "relocation aborted: {e}");
            Ok(false)
        }
    }
}

/// Erase the block and stamp its header. A failed erase (or a header write
/// that fails even after a second erase) retires the block as bad.
fn erase_one<F: FlashDevice>(shared: &Shared<F>, id: BlockId, offset: u32) -> Result<()> {
    let span = shared.opts.ebh_span();

    for attempt in 0..2 {
        match { lock(&shared.flash).erase(offset) } {
            Ok(()) => {}
            Err(e) => {
                warn!(block = offset, "erase failed: {e}");
                break;
            }
        }

        // Account the erase before writing the header so the incremented
        // count is what lands on flash. The block sits on the erase-complete
        // list until its header is down; the allocator must not see it yet.
        let erase_count = {
            let mut core = lock(&shared.core);
            core.erase_done(id);
            core.block(id).erase_count
        };
        debug!(block = offset, erase_count, "block erased");
        if span == 0 {
            lock(&shared.core).release_erased(id);
            return Ok(());
        }

        let mut bytes = vec![0xFFu8; span as usize];
        EbhNode::new(erase_count).encode(&mut bytes)?;
        match { lock(&shared.flash).write(offset, &bytes) } {
            Ok(()) => {
                let mut core = lock(&shared.core);
                core.note_write(
                    id,
                    NodeRef {
                        offset,
                        len: span,
                        obsolete: false,
                        seq: 0,
                        info: NodeInfo::EraseBlockHeader { erase_count },
                    },
                )?;
                core.release_erased(id);
                return Ok(());
            }
            Err(e) => {
                warn!(block = offset, attempt, "erase-block header write failed: {e}");
            }
        }
    }

    if let Err(e) = { lock(&shared.flash).mark_bad(offset) } {
        warn!(block = offset, "marking block bad also failed: {e}");
    }
    lock(&shared.core).retire_bad(id);
    Ok(())
}

/// Copy every live node out of `victim` until nothing on it is used
fn relocate_live_nodes<F: FlashDevice>(
    shared: &Shared<F>,
    alloc: &mut AllocState,
    victim: BlockId,
) -> Result<()> {
    loop {
        let next = {
            let core = lock(&shared.core);
            core.block(victim)
                .refs
                .iter()
                .find(|r| !r.obsolete)
                .map(|r| (r.offset, r.len, r.seq, r.info.clone()))
        };
        let Some((offset, len, seq, info)) = next else {
            return Ok(());
        };

        // Headers and padding are block-local; they die with the block.
        if !matches!(info, NodeInfo::Inode { .. } | NodeInfo::Dirent { .. }) {
            lock(&shared.core).obsolete_at(offset, len)?;
            continue;
        }

        let mut payload = vec![0u8; len as usize];
        if let Err(e) = { lock(&shared.flash).read(offset, &mut payload) } {
            // Nothing to salvage; the bytes become dirt and the node is
            // dropped from the cache.
            warn!(offset, "unreadable node dropped during GC: {e}");
            let dropped = { lock(&shared.core).obsolete_at(offset, len)? };
            forget_node(shared, dropped, offset);
            continue;
        }

        // The copy inherits the original's identity, so handles held by
        // callers chase it to the new offset.
        let new_loc = append_node_locked(shared, alloc, &info, &payload, ResvClass::Gc, seq)?;

        // Swap the copies: obsolete the original and repoint the cache. If
        // someone obsoleted the original while we copied it, the copy is
        // already garbage and gets obsoleted instead.
        let original = { lock(&shared.core).obsolete_at(offset, len)? };
        match original {
            Some(NodeInfo::Inode { ino, .. }) => {
                lock(&shared.inodes).relocate(ino, offset, new_loc.offset);
            }
            Some(NodeInfo::Dirent { pino, .. }) => {
                lock(&shared.inodes).relocate(pino, offset, new_loc.offset);
            }
            Some(_) => {}
            None => {
                lock(&shared.core).obsolete_at(new_loc.offset, new_loc.len)?;
                forget_node(shared, Some(info), new_loc.offset);
            }
        }
    }
}

fn forget_node<F: FlashDevice>(shared: &Shared<F>, info: Option<NodeInfo>, offset: u32) {
    match info {
        Some(NodeInfo::Inode { ino, .. }) => lock(&shared.inodes).drop_node(ino, offset),
        Some(NodeInfo::Dirent { pino, .. }) => lock(&shared.inodes).drop_node(pino, offset),
        _ => {}
    }
}

/// Background thread body: wait for pressure, run passes until the work is
/// done, repeat until shutdown
pub(crate) fn run<F: FlashDevice>(shared: Arc<Shared<F>>) {
    debug!("background garbage collector started");
    let mut core = lock(&shared.core);
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if core.inconsistent || !core.gc_wanted() {
            core = wait(&shared.gc_wake, core);
            continue;
        }
        drop(core);

        let result = {
            let mut alloc = lock(&shared.alloc);
            gc_pass(&shared, &mut alloc)
        };

        core = lock(&shared.core);
        match result {
            Ok(true) => {}
            Ok(false) => core = wait(&shared.gc_wake, core),
            Err(e) => {
                warn!("background garbage collection failed: {e}");
                if e.is_fatal() {
                    core.inconsistent = true;
                    shared.read_only.store(true, Ordering::Release);
                }
                core = wait(&shared.gc_wake, core);
            }
        }
    }
    debug!("background garbage collector exiting");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::flash::{FlashLayout, SimFault, SimFlash};
    use crate::fs::{Filesystem, MountOptions};

    fn mount(blocks: u32) -> Filesystem<SimFlash> {
        let flash = SimFlash::new(FlashLayout {
            blocks,
            block_size: 4096,
        });
        let opts = MountOptions {
            background_gc: false,
            summaries: false,
            ebh_size: 0,
            ..MountOptions::default()
        };
        Filesystem::mount(flash, opts).unwrap()
    }

    fn inode(ino: u32, version: u32) -> NodeInfo {
        NodeInfo::Inode { ino, version }
    }

    #[test]
    fn relocation_moves_live_data() {
        let fs = mount(8);

        let stale = fs.write_node(inode(1, 1), &[1u8; 2000]).unwrap();
        let live = fs.write_node(inode(2, 1), &[2u8; 2000]).unwrap();
        // Close the block, then dirty it
        fs.write_node(inode(3, 1), &[3u8; 500]).unwrap();
        fs.mark_obsolete(stale).unwrap();

        assert!(fs.run_gc().unwrap());
        let moved = fs.latest_node(2).unwrap();
        assert_ne!(moved.offset, live.offset);
        assert_eq!(fs.read_node(live).unwrap(), vec![2u8; 2000]);

        // The victim is now fully dirty; the next passes erase it
        while fs.run_gc().unwrap() {}
        let stats = fs.stats();
        assert!(stats.total_erase_count >= 1);
        lock(&fs_shared(&fs).core).check_invariants().unwrap();
    }

    #[test]
    fn erase_failure_retires_block_as_bad() {
        let fs = mount(8);

        let loc = fs.write_node(inode(1, 1), &[9u8; 4000]).unwrap();
        let id = loc.offset / 4096;
        fs.write_node(inode(2, 1), &[8u8; 100]).unwrap();
        fs.mark_obsolete(loc).unwrap();

        {
            let mut flash = lock(&fs_shared(&fs).flash);
            flash.inject_fault(id, SimFault::NextErase);
        }
        while fs.run_gc().unwrap() {}

        let stats = fs.stats();
        assert_eq!(stats.nr_bad_blocks, 1);
        lock(&fs_shared(&fs).core).check_invariants().unwrap();
    }

    #[test]
    fn failed_block_is_evacuated_and_rehabilitated() {
        let fs = mount(8);

        // One live node lands, then a write fault retires the block with
        // that data still on it
        let live = fs.write_node(inode(1, 1), &[1u8; 2000]).unwrap();
        {
            let mut flash = lock(&fs_shared(&fs).flash);
            flash.inject_fault(live.offset / 4096, SimFault::NextWrite);
        }
        fs.write_node(inode(2, 1), &[2u8; 1000]).unwrap();
        assert_eq!(fs.stats().nr_bad_blocks, 1);

        // GC evacuates the failed block and the erase ladder, succeeding
        // this time, brings it back into service
        while fs.run_gc().unwrap() {}
        assert_eq!(fs.stats().nr_bad_blocks, 0);
        let moved = fs.latest_node(1).unwrap();
        assert_ne!(moved.offset, live.offset);
        assert_eq!(fs.read_node(live).unwrap(), vec![1u8; 2000]);
        lock(&fs_shared(&fs).core).check_invariants().unwrap();
    }

    #[test]
    fn handles_survive_relocation() {
        let fs = mount(8);

        let stale = fs.write_node(inode(1, 1), &[1u8; 2000]).unwrap();
        let live = fs.write_node(inode(2, 1), &[2u8; 2000]).unwrap();
        fs.write_node(inode(3, 1), &[3u8; 500]).unwrap();
        fs.mark_obsolete(stale).unwrap();

        // Relocate the live node and erase the victim, so the handle's
        // original offset no longer has any reference at all
        while fs.run_gc().unwrap() {}
        assert!(fs.stats().total_erase_count >= 1);

        // The pre-relocation handle still reads and deletes the moved copy
        assert_eq!(fs.read_node(live).unwrap(), vec![2u8; 2000]);
        fs.mark_obsolete(live).unwrap();
        assert_eq!(fs.latest_node(2), None);

        // Deleting through the same handle again is a no-op
        fs.mark_obsolete(live).unwrap();
        lock(&fs_shared(&fs).core).check_invariants().unwrap();
    }

    #[test]
    fn erase_retry_crosses_wear_bucket_boundary() {
        // Header-write failure forces a second erase of the same block; the
        // count bump must not strand the block in the wrong wear bucket.
        let flash = SimFlash::new(FlashLayout {
            blocks: 8,
            block_size: 4096,
        });
        let opts = MountOptions {
            background_gc: false,
            summaries: false,
            ..MountOptions::default()
        };
        let fs = Filesystem::mount(flash, opts).unwrap();

        let loc = fs.write_node(inode(1, 1), &[9u8; 4000]).unwrap();
        let id = loc.offset / 4096;
        fs.write_node(inode(2, 1), &[8u8; 100]).unwrap();
        {
            let shared = fs_shared(&fs);
            lock(&shared.core).block_mut(id).erase_count =
                (1 << crate::wear::BUCKET_RANGE_BITS) - 1;
            lock(&shared.flash).inject_fault(id, SimFault::NextWrite);
        }
        fs.mark_obsolete(loc).unwrap();

        while fs.run_gc().unwrap() {}

        let core = lock(&fs_shared(&fs).core);
        let block = core.block(id);
        assert_eq!(block.list, Some(ListKind::Free));
        // Two erases: the failed header write restarted the ladder
        assert_eq!(block.erase_count, (1 << crate::wear::BUCKET_RANGE_BITS) + 1);
        core.check_invariants().unwrap();
    }

    #[test]
    fn rotation_eventually_moves_static_data() {
        let fs = mount(8);

        // Static data in a closed, perfectly clean block
        let old = fs.write_node(inode(1, 1), &[5u8; 4000]).unwrap();
        fs.write_node(inode(2, 1), &[6u8; 100]).unwrap();

        // Idle passes tick the rotation counter; within one period the
        // clean block gets picked despite having no dirt at all
        let mut rotated = false;
        for _ in 0..(WEAR_ROTATION_PERIOD + 1) {
            if fs.run_gc().unwrap() {
                rotated = true;
                break;
            }
        }
        assert!(rotated);

        let moved = fs.latest_node(1).unwrap();
        assert_ne!(moved.offset, old.offset);
        lock(&fs_shared(&fs).core).check_invariants().unwrap();
    }

    // Tests live beside the GC code but the shared state belongs to fs
    fn fs_shared<F: FlashDevice + Send + 'static>(fs: &Filesystem<F>) -> &Shared<F> {
        fs.shared_for_test()
    }
}
