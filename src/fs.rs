//! The mounted filesystem: scan/mount, the write-side allocator, and the
//! public node API.
//!
//! Lock order, outermost first: `alloc` (one writer at a time, held across
//! the flash I/O of a single node), `flash` (one driver call at a time),
//! `core` (the [`Registry`]; never held across flash I/O), `inodes`. Taking
//! them out of order is a deadlock; the GC path goes through the same
//! functions as user writes precisely so there is only one order to audit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::block::{BlockId, NodeRef};
use crate::error::{Error, Result};
use crate::flash::{FlashDevice, FlashLayout};
use crate::gc;
use crate::inode::{CachedNode, InodeCache};
use crate::lists::ListKind;
use crate::registry::{Registry, ResvBlocks, SpaceStats};
use crate::summary::{
    read_summary, EbhNode, NodeInfo, ParsedSummary, SumEntry, SummaryCollector, EBH_NODE_SIZE,
    SUM_HEADER_SIZE, SUM_MARKER_SIZE,
};

/// Mount-time knobs. The defaults are right for normal read-write use.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Refuse all writes; implies no garbage collection
    pub read_only: bool,
    /// Run the garbage collector on its own thread
    pub background_gc: bool,
    /// Write a summary node at the tail of each block as it is closed
    pub summaries: bool,
    /// Bytes reserved at the start of each freshly erased block for the
    /// erase-block header; 0 disables headers (erase counts then survive only
    /// through summaries)
    pub ebh_size: u32,
    /// Override the derived free-block reserve thresholds
    pub resv: Option<ResvBlocks>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            background_gc: true,
            summaries: true,
            ebh_size: EBH_NODE_SIZE,
            resv: None,
        }
    }
}

impl MountOptions {
    /// Actual byte span an erase-block header occupies, 0 when disabled
    pub(crate) fn ebh_span(&self) -> u32 {
        if self.ebh_size == 0 {
            0
        } else {
            self.ebh_size.max(EBH_NODE_SIZE)
        }
    }
}

/// Handle to a node on flash, as returned by the write API and consumed by
/// [`Filesystem::mark_obsolete`]. The handle stays valid when GC relocates
/// the node; `offset` then names where the node was first written, not where
/// it currently lives.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NodeLoc {
    pub offset: u32,
    pub len: u32,
    /// Stable identity, resolved through the registry's live-node table
    pub(crate) seq: u64,
}

/// statfs-style snapshot
#[derive(Debug, Copy, Clone)]
pub struct FsStats {
    pub space: SpaceStats,
    pub nr_free_blocks: u32,
    pub nr_erasing_blocks: u32,
    pub nr_bad_blocks: u32,
    pub total_erase_count: u64,
    pub max_erase_count: u32,
}

/// Which free-block reserve a reservation is entitled to dip into
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ResvClass {
    /// Ordinary data writes keep the largest reserve intact
    Write,
    /// Deletions net space back, so they may dig deeper
    Deletion,
    /// GC's own relocation writes; never recurse into another GC pass
    Gc,
}

/// Everything shared between the public handle and the GC thread
pub(crate) struct Shared<F> {
    pub(crate) flash: Mutex<F>,
    pub(crate) core: Mutex<Registry>,
    pub(crate) alloc: Mutex<AllocState>,
    pub(crate) inodes: Mutex<InodeCache>,
    /// Paired with `core`; signalled whenever GC may have new work
    pub(crate) gc_wake: Condvar,
    pub(crate) shutdown: AtomicBool,
    pub(crate) read_only: AtomicBool,
    /// Monotonic GC pass counter, drives the wear-rotation cadence
    pub(crate) gc_passes: AtomicU64,
    pub(crate) opts: MountOptions,
    pub(crate) layout: FlashLayout,
}

/// Writer-side state guarded by the `alloc` lock
pub(crate) struct AllocState {
    pub(crate) collector: SummaryCollector,
}

/// Mutex poisoning means a panic elsewhere; the registry guards its own
/// consistency, so continuing with the inner value is safe
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cv.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// A mounted flash filesystem over driver `F`
pub struct Filesystem<F: FlashDevice> {
    shared: Arc<Shared<F>>,
    gc_thread: Option<thread::JoinHandle<()>>,
}

impl<F: FlashDevice + Send + 'static> Filesystem<F> {
    /// Scan (or summary-replay) the device and mount it
    pub fn mount(mut flash: F, opts: MountOptions) -> Result<Self> {
        let layout = flash.layout();
        if layout.blocks == 0 {
            return Err(anyhow!("device has no erase blocks").into());
        }
        let min_block = SUM_HEADER_SIZE + SUM_MARKER_SIZE + opts.ebh_span() + 1;
        if layout.block_size < min_block {
            return Err(anyhow!(
                "block size {} too small (need at least {min_block})",
                layout.block_size
            )
            .into());
        }

        let resv = opts.resv.unwrap_or_else(|| ResvBlocks::for_device(layout.blocks));
        let (registry, inodes) = scan_device(&mut flash, layout, &opts, resv)?;
        info!(
            blocks = layout.blocks,
            free = registry.stats().free,
            bad = registry.nr_bad_blocks(),
            inodes = inodes.len(),
            "mounted"
        );

        let mut collector = SummaryCollector::default();
        if !opts.summaries || opts.read_only {
            collector.disable();
        }

        let shared = Arc::new(Shared {
            flash: Mutex::new(flash),
            core: Mutex::new(registry),
            alloc: Mutex::new(AllocState { collector }),
            inodes: Mutex::new(inodes),
            gc_wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            read_only: AtomicBool::new(opts.read_only),
            gc_passes: AtomicU64::new(0),
            opts: opts.clone(),
            layout,
        });

        let gc_thread = if opts.background_gc && !opts.read_only {
            let for_thread = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name("cinderfs-gc".into())
                .spawn(move || gc::run(for_thread))
                .map_err(anyhow::Error::from)?;
            Some(handle)
        } else {
            None
        };

        Ok(Self { shared, gc_thread })
    }

    /// Stop the GC thread, flush the open block's summary, and return the
    /// flash device
    pub fn unmount(mut self) -> Result<F> {
        self.stop_gc_thread();

        {
            let mut alloc = lock(&self.shared.alloc);
            let open = {
                let core = lock(&self.shared.core);
                if core.inconsistent {
                    None
                } else {
                    core.nextblock
                }
            };
            if let Some(id) = open {
                if !self.shared.read_only.load(Ordering::Acquire) {
                    close_block(&self.shared, &mut alloc, id)?;
                }
            }
        }
        info!("unmounted");

        let shared = Arc::clone(&self.shared);
        drop(self);
        let shared = Arc::try_unwrap(shared)
            .map_err(|_| Error::from(anyhow!("filesystem still referenced at unmount")))?;
        Ok(shared
            .flash
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner))
    }

    /// Append a node. The payload is written verbatim; `info` is what the
    /// block summary (and the inode cache) will record about it.
    pub fn write_node(&self, info: NodeInfo, payload: &[u8]) -> Result<NodeLoc> {
        self.write_internal(info, payload, ResvClass::Write)
    }

    /// Append a deletion node. Identical to [`Self::write_node`] but allowed
    /// to dip into the deletion reserve, since it will net space back.
    pub fn write_deletion_node(&self, info: NodeInfo, payload: &[u8]) -> Result<NodeLoc> {
        self.write_internal(info, payload, ResvClass::Deletion)
    }

    fn write_internal(&self, info: NodeInfo, payload: &[u8], class: ResvClass) -> Result<NodeLoc> {
        if self.shared.read_only.load(Ordering::Acquire) {
            return Err(Error::ReadOnly);
        }

        let loc = {
            let mut alloc = lock(&self.shared.alloc);
            append_node_locked(&self.shared, &mut alloc, &info, payload, class, 0)
        }
        .map_err(|e| self.note_fatal(e))?;

        match &info {
            NodeInfo::Inode { ino, version } => {
                lock(&self.shared.inodes).add_node(
                    *ino,
                    CachedNode {
                        version: *version,
                        offset: loc.offset,
                        len: loc.len,
                    },
                );
            }
            NodeInfo::Dirent { pino, version, .. } => {
                lock(&self.shared.inodes).add_node(
                    *pino,
                    CachedNode {
                        version: *version,
                        offset: loc.offset,
                        len: loc.len,
                    },
                );
            }
            _ => {}
        }

        self.kick_gc();
        Ok(loc)
    }

    /// A node has been superseded or deleted: turn its bytes into dirt.
    ///
    /// The handle is chased through any relocations GC has done; deleting a
    /// node that is already gone is a no-op. Taking the alloc lock here
    /// serializes obsoletion against an in-flight relocation of the same
    /// node.
    pub fn mark_obsolete(&self, loc: NodeLoc) -> Result<()> {
        let alloc = lock(&self.shared.alloc);
        let outcome = {
            let mut core = lock(&self.shared.core);
            let target = if loc.seq != 0 {
                core.resolve(loc.seq)
            } else {
                Some((loc.offset, loc.len))
            };
            match target {
                Some((offset, len)) => core
                    .obsolete_at(offset, len)
                    .map(|info| info.map(|i| (i, offset))),
                None => Ok(None),
            }
        }
        .map_err(|e| self.note_fatal(e))?;

        match outcome {
            Some((NodeInfo::Inode { ino, .. }, offset)) => {
                lock(&self.shared.inodes).drop_node(ino, offset);
            }
            Some((NodeInfo::Dirent { pino, .. }, offset)) => {
                lock(&self.shared.inodes).drop_node(pino, offset);
            }
            _ => {}
        }
        drop(alloc);

        self.kick_gc();
        Ok(())
    }

    /// Read a node's raw bytes back, following any relocation of the node
    pub fn read_node(&self, loc: NodeLoc) -> Result<Vec<u8>> {
        let (offset, len) = {
            let core = lock(&self.shared.core);
            core.resolve(loc.seq).unwrap_or((loc.offset, loc.len))
        };
        let mut buf = vec![0u8; len as usize];
        lock(&self.shared.flash).read(offset, &mut buf)?;
        Ok(buf)
    }

    /// Run one synchronous garbage-collection pass. Returns whether anything
    /// was reclaimed or relocated.
    pub fn run_gc(&self) -> Result<bool> {
        if self.shared.read_only.load(Ordering::Acquire) {
            return Ok(false);
        }
        let mut alloc = lock(&self.shared.alloc);
        gc::gc_pass(&self.shared, &mut alloc).map_err(|e| self.note_fatal(e))
    }

    pub fn stats(&self) -> FsStats {
        let core = lock(&self.shared.core);
        FsStats {
            space: core.stats(),
            nr_free_blocks: core.nr_free_blocks(),
            nr_erasing_blocks: core.nr_erasing_blocks(),
            nr_bad_blocks: core.nr_bad_blocks(),
            total_erase_count: core.total_erase_count,
            max_erase_count: core.max_erase_count,
        }
    }

    pub fn layout(&self) -> FlashLayout {
        self.shared.layout
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::Acquire)
    }

    /// Most recent cached node for `ino`, if any
    pub fn latest_node(&self, ino: u32) -> Option<CachedNode> {
        lock(&self.shared.inodes).latest(ino)
    }

    /// Allocate a fresh inode number, above anything seen on flash
    pub fn next_ino(&self) -> u32 {
        lock(&self.shared.inodes).next_ino()
    }

    /// Flip read-only and remember fatal errors; returns the error unchanged
    fn note_fatal(&self, e: Error) -> Error {
        if e.is_fatal() {
            warn!("consistency failure, forcing read-only: {e}");
            self.shared.read_only.store(true, Ordering::Release);
        }
        e
    }

    /// Nudge the background collector if thresholds say it has work
    fn kick_gc(&self) {
        let wanted = lock(&self.shared.core).gc_wanted();
        if wanted {
            self.shared.gc_wake.notify_all();
        }
    }

    #[cfg(test)]
    pub(crate) fn shared_for_test(&self) -> &Shared<F> {
        &self.shared
    }

    fn stop_gc_thread(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.gc_wake.notify_all();
        if let Some(handle) = self.gc_thread.take() {
            let _ = handle.join();
        }
    }
}

impl<F: FlashDevice> Drop for Filesystem<F> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.gc_wake.notify_all();
        if let Some(handle) = self.gc_thread.take() {
            let _ = handle.join();
        }
    }
}

// ----- the write-side allocator -----

enum Plan {
    Use(BlockId, u32),
    Close(BlockId),
    Collect,
}

impl ResvClass {
    fn threshold(self, resv: &ResvBlocks) -> u32 {
        match self {
            ResvClass::Write => resv.write,
            ResvClass::Deletion => resv.deletion,
            ResvClass::Gc => 0,
        }
    }
}

/// Find (or make) room for `len` bytes and return the write position.
/// Requires the `alloc` lock, passed as `alloc`.
fn reserve<F: FlashDevice>(
    shared: &Shared<F>,
    alloc: &mut AllocState,
    info: &NodeInfo,
    len: u32,
    class: ResvClass,
) -> Result<(BlockId, u32)> {
    let entry_size = SumEntry::size_for(info).unwrap_or(0);
    // Worst-case overhead on a freshly erased block: its header, the summary
    // header and marker, the header's summary entry, and this node's entry.
    let fresh_overhead = shared.opts.ebh_span()
        + if alloc.collector.is_disabled() {
            0
        } else {
            let ebh_entry = SumEntry::size_for(&NodeInfo::EraseBlockHeader { erase_count: 0 })
                .unwrap_or(0);
            SUM_HEADER_SIZE + SUM_MARKER_SIZE + ebh_entry + entry_size
        };
    if len + fresh_overhead > shared.layout.block_size {
        return Err(anyhow!("node of {len} bytes cannot fit in one erase block").into());
    }

    let mut gc_stalled = false;
    loop {
        let plan = {
            let mut core = lock(&shared.core);
            if core.inconsistent {
                return Err(Error::ReadOnly);
            }

            if let Some(id) = core.nextblock {
                let needed = len
                    + if alloc.collector.is_collecting() {
                        alloc.collector.required_space() + entry_size
                    } else {
                        0
                    };
                let block = core.block(id);
                if block.free_size >= needed {
                    Plan::Use(id, block.write_offset())
                } else {
                    Plan::Close(id)
                }
            } else if core.nr_free_blocks() + core.reclaimable_blocks()
                <= class.threshold(&core.resv)
            {
                Plan::Collect
            } else if let Some(id) = core.take_free_block() {
                core.nextblock = Some(id);
                // Re-seed the summary with anything already on the block
                // (normally just its erase-block header).
                alloc.collector.reset();
                let block = core.block(id);
                for node in &block.refs {
                    alloc
                        .collector
                        .add(node.offset - block.offset, node.len, &node.info);
                }
                Plan::Use(id, block.write_offset())
            } else {
                Plan::Collect
            }
        };

        match plan {
            Plan::Use(id, offset) => return Ok((id, offset)),
            Plan::Close(id) => close_block(shared, alloc, id)?,
            Plan::Collect => {
                if class == ResvClass::Gc || gc_stalled {
                    return Err(Error::OutOfSpace);
                }
                match gc::gc_pass(shared, alloc) {
                    Ok(true) => {}
                    Ok(false) => gc_stalled = true,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("synchronous garbage collection failed: {e}");
                        gc_stalled = true;
                    }
                }
            }
        }
    }
}

/// Retire the current write target: flush its summary (if collecting and it
/// fits), waste the unwritable tail, and file the block on its resting list
pub(crate) fn close_block<F: FlashDevice>(
    shared: &Shared<F>,
    alloc: &mut AllocState,
    id: BlockId,
) -> Result<()> {
    let (block_offset, free) = {
        let core = lock(&shared.core);
        let block = core.block(id);
        (block.offset, block.free_size)
    };

    let required = alloc.collector.required_space();
    // An empty summary describes nothing; don't bother writing one.
    if required <= SUM_HEADER_SIZE + SUM_MARKER_SIZE || required > free {
        alloc.collector.abandon();
    }

    if alloc.collector.is_collecting() {
        let sum_offset = shared.layout.block_size - required;
        let flushed = {
            let mut flash = lock(&shared.flash);
            alloc
                .collector
                .flush(&mut *flash, block_offset, shared.layout.block_size, sum_offset)
        };
        if let Err(e) = flushed {
            // The block's contents are still valid; mount will scan it.
            warn!(block = block_offset, "summary write failed: {e}");
        }
    } else {
        alloc.collector.reset();
    }

    let mut core = lock(&shared.core);
    let tail = core.block(id).free_size;
    core.mark_wasted(id, tail)?;
    core.nextblock = None;
    let kind = core.resting_list(id);
    core.attach(id, kind);
    debug!(block = block_offset, ?kind, "closed write target");
    Ok(())
}

/// The one node-append path, shared by user writes and GC relocation.
/// `seq` 0 mints a fresh node identity; GC passes the one it is moving.
pub(crate) fn append_node_locked<F: FlashDevice>(
    shared: &Shared<F>,
    alloc: &mut AllocState,
    info: &NodeInfo,
    payload: &[u8],
    class: ResvClass,
    seq: u64,
) -> Result<NodeLoc> {
    let len = u32::try_from(payload.len())
        .map_err(|_| anyhow!("node of {} bytes cannot fit in one erase block", payload.len()))?;
    loop {
        let (id, offset) = reserve(shared, alloc, info, len, class)?;

        let written = { lock(&shared.flash).write(offset, payload) };
        match written {
            Ok(()) => {
                let mut core = lock(&shared.core);
                let seq = core.note_write(
                    id,
                    NodeRef {
                        offset,
                        len,
                        obsolete: false,
                        seq,
                        info: info.clone(),
                    },
                )?;
                let rel = offset - core.block(id).offset;
                drop(core);
                alloc.collector.add(rel, len, info);
                return Ok(NodeLoc { offset, len, seq });
            }
            Err(e) => {
                // The data already on the block stays readable; only further
                // writes are off the table. Retry on a different block.
                warn!(offset, "node write failed, retiring block: {e}");
                lock(&shared.core).retire_bad(id);
                alloc.collector.abandon();
            }
        }
    }
}

// ----- mount-time scanning -----

enum Scanned {
    Bad,
    Erased { ec: Option<u32> },
    Summarized(ParsedSummary),
    Data { watermark: u32, ec: Option<u32> },
}

fn summary_erase_count(parsed: &ParsedSummary) -> Option<u32> {
    parsed.entries.iter().find_map(|e| match e {
        SumEntry::EraseBlockHeader { erase_count, .. } => Some(*erase_count),
        _ => None,
    })
}

/// Classify every block, then build the registry and inode cache.
///
/// Blocks with a valid summary are replayed from it; everything else falls
/// back to raw classification: erased, erased-with-header, data beyond the
/// header (kept as unchecked), or unrecognizable (all dirt).
fn scan_device<F: FlashDevice>(
    flash: &mut F,
    layout: FlashLayout,
    opts: &MountOptions,
    resv: ResvBlocks,
) -> Result<(Registry, InodeCache)> {
    let rpt = howudoin::new()
        .label("Scanning blocks")
        .set_len(u64::from(layout.blocks));

    let mut scans = Vec::with_capacity(layout.blocks as usize);
    let mut buf = vec![0u8; layout.block_size as usize];
    for index in 0..layout.blocks {
        let offset = layout.block_offset(index);
        let scanned = if flash.is_bad(offset)? {
            Scanned::Bad
        } else if let Some(parsed) = read_summary(flash, offset, layout.block_size)? {
            Scanned::Summarized(parsed)
        } else {
            flash.read(offset, &mut buf)?;
            let watermark = buf
                .iter()
                .rposition(|&b| b != 0xFF)
                .map_or(0, |pos| pos as u32 + 1);
            let ec = EbhNode::decode(&buf[..EBH_NODE_SIZE as usize]).map(|n| n.erase_count);
            let header_span = if ec.is_some() {
                EBH_NODE_SIZE.max(opts.ebh_size)
            } else {
                0
            };
            if watermark <= header_span {
                Scanned::Erased { ec }
            } else {
                Scanned::Data { watermark, ec }
            }
        };
        rpt.inc();
        scans.push(scanned);
    }
    rpt.close();

    // Blocks that never recorded an erase count inherit the device average,
    // so one unreadable header doesn't skew wear leveling forever.
    let known: Vec<u32> = scans
        .iter()
        .filter_map(|s| match s {
            Scanned::Erased { ec } => *ec,
            Scanned::Data { ec, .. } => *ec,
            Scanned::Summarized(parsed) => summary_erase_count(parsed),
            Scanned::Bad => None,
        })
        .collect();
    let mean_ec = if known.is_empty() {
        0
    } else {
        (known.iter().map(|&e| u64::from(e)).sum::<u64>() / known.len() as u64) as u32
    };

    let mut registry = Registry::new(layout.blocks, layout.block_size, resv);
    let mut inodes = InodeCache::default();

    for (index, scanned) in scans.into_iter().enumerate() {
        let id = index as u32;
        let base = layout.block_offset(id);
        match scanned {
            Scanned::Bad => {
                registry.mark_wasted(id, layout.block_size)?;
                registry.attach(id, ListKind::Bad);
            }

            Scanned::Erased { ec } => {
                registry.block_mut(id).erase_count = ec.unwrap_or(mean_ec);
                if let Some(erase_count) = ec {
                    let span = EBH_NODE_SIZE.max(opts.ebh_size);
                    registry.note_write(
                        id,
                        NodeRef {
                            offset: base,
                            len: span,
                            obsolete: false,
                            seq: 0,
                            info: NodeInfo::EraseBlockHeader { erase_count },
                        },
                    )?;
                }
                registry.attach(id, ListKind::Free);
            }

            Scanned::Summarized(parsed) => {
                let sum_offset = parsed.sum_offset;
                let mut watermark = 0u32;
                for entry in parsed.entries {
                    let (rel, totlen, info) = entry.split();
                    if rel > watermark {
                        registry.mark_wasted(id, rel - watermark)?;
                    }
                    watermark = rel + totlen;

                    match &info {
                        NodeInfo::Padding | NodeInfo::Unknown { .. } => {
                            registry.mark_dirty(id, totlen)?;
                            continue;
                        }
                        NodeInfo::EraseBlockHeader { erase_count } => {
                            registry.block_mut(id).erase_count = *erase_count;
                        }
                        NodeInfo::Inode { ino, version } => {
                            inodes.add_node(
                                *ino,
                                CachedNode {
                                    version: *version,
                                    offset: base + rel,
                                    len: totlen,
                                },
                            );
                        }
                        NodeInfo::Dirent { pino, version, .. } => {
                            inodes.add_node(
                                *pino,
                                CachedNode {
                                    version: *version,
                                    offset: base + rel,
                                    len: totlen,
                                },
                            );
                        }
                    }
                    registry.note_write(
                        id,
                        NodeRef {
                            offset: base + rel,
                            len: totlen,
                            obsolete: false,
                            seq: 0,
                            info,
                        },
                    )?;
                }

                if sum_offset > watermark {
                    registry.mark_wasted(id, sum_offset - watermark)?;
                }
                registry.mark_wasted(id, layout.block_size - sum_offset)?;
                let kind = registry.resting_list(id);
                registry.attach(id, kind);
            }

            Scanned::Data { watermark, ec } => {
                registry.block_mut(id).erase_count = ec.unwrap_or(mean_ec);
                match ec {
                    Some(erase_count) => {
                        // Header plus unindexed content: keep the content as
                        // unchecked so nothing overwrites it, and let the
                        // node index (outside this crate) claim it later.
                        let span = EBH_NODE_SIZE.max(opts.ebh_size);
                        registry.note_write(
                            id,
                            NodeRef {
                                offset: base,
                                len: span,
                                obsolete: false,
                                seq: 0,
                                info: NodeInfo::EraseBlockHeader { erase_count },
                            },
                        )?;
                        registry.mark_unchecked(id, watermark - span)?;
                    }
                    None => {
                        // No header, no summary: nothing here is ours
                        registry.mark_dirty(id, watermark)?;
                    }
                }
                registry.mark_wasted(id, layout.block_size - watermark)?;
                let kind = registry.resting_list(id);
                registry.attach(id, kind);
            }
        }
    }

    let mut total = 0u64;
    let mut max = 0u32;
    for id in 0..registry.nr_blocks() {
        let ec = registry.block(id).erase_count;
        total += u64::from(ec);
        max = max.max(ec);
    }
    registry.total_erase_count = total;
    registry.max_erase_count = max;

    registry.check_invariants()?;
    Ok((registry, inodes))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::flash::{SimFault, SimFlash};
    use crate::wear::WL_DELTA;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sim(blocks: u32) -> SimFlash {
        SimFlash::new(FlashLayout {
            blocks,
            block_size: 4096,
        })
    }

    fn foreground() -> MountOptions {
        MountOptions {
            background_gc: false,
            ..MountOptions::default()
        }
    }

    fn inode(ino: u32, version: u32) -> NodeInfo {
        NodeInfo::Inode { ino, version }
    }

    #[test]
    fn mount_fresh_device() {
        let fs = Filesystem::mount(sim(8), foreground()).unwrap();
        let stats = fs.stats();
        assert_eq!(stats.nr_free_blocks, 8);
        assert_eq!(stats.space.free, 8 * 4096);
        assert_eq!(stats.space.used, 0);
    }

    #[test]
    fn write_read_obsolete_cycle() {
        let fs = Filesystem::mount(sim(8), foreground()).unwrap();

        let payload = vec![0x5A; 600];
        let loc = fs.write_node(inode(1, 1), &payload).unwrap();
        assert_eq!(fs.read_node(loc).unwrap(), payload);
        assert_eq!(fs.stats().space.used, 600);
        assert_eq!(
            fs.latest_node(1),
            Some(CachedNode {
                version: 1,
                offset: loc.offset,
                len: 600
            })
        );

        fs.mark_obsolete(loc).unwrap();
        let stats = fs.stats();
        assert_eq!(stats.space.used, 0);
        assert_eq!(stats.space.dirty, 600);
        assert_eq!(fs.latest_node(1), None);
    }

    #[test]
    fn remount_replays_summary() {
        let mut opts = foreground();
        opts.ebh_size = 0;
        let fs = Filesystem::mount(sim(8), opts.clone()).unwrap();

        let a = fs.write_node(inode(1, 1), &[1u8; 300]).unwrap();
        let b = fs.write_node(inode(2, 1), &[2u8; 200]).unwrap();

        let flash = fs.unmount().unwrap();
        let fs = Filesystem::mount(flash, opts).unwrap();

        // The summary restored both nodes without scanning their bodies
        assert_eq!(fs.stats().space.used, 500);
        assert_eq!(
            fs.latest_node(1),
            Some(CachedNode {
                version: 1,
                offset: a.offset,
                len: 300
            })
        );
        assert_eq!(fs.read_node(b).unwrap(), vec![2u8; 200]);

        // Obsoletion works against replayed references too
        fs.mark_obsolete(a).unwrap();
        let stats = fs.stats();
        assert_eq!(stats.space.used, 200);
        assert_eq!(stats.space.dirty, 300);
    }

    #[test]
    fn scan_keeps_headered_data_as_unchecked() {
        // A block holding an erase-block header plus content we have no
        // summary for: the content must be preserved, not treated as dirt.
        let mut flash = sim(4);
        let mut header = [0u8; EBH_NODE_SIZE as usize];
        EbhNode::new(5).encode(&mut header).unwrap();
        flash.write(0, &header).unwrap();
        flash.write(64, &[0xAA; 100]).unwrap();

        let fs = Filesystem::mount(flash, foreground()).unwrap();
        let stats = fs.stats();
        assert_eq!(stats.space.unchecked, 164 - u64::from(EBH_NODE_SIZE));
        assert_eq!(stats.space.used, u64::from(EBH_NODE_SIZE));

        let core = lock(&fs.shared.core);
        assert_eq!(core.block(0).erase_count, 5);
        assert_eq!(core.block(0).list, Some(ListKind::Clean));
    }

    #[test]
    fn scan_treats_headerless_data_as_dirt() {
        let mut flash = sim(4);
        flash.write(4096, &[0xBE; 200]).unwrap();

        let fs = Filesystem::mount(flash, foreground()).unwrap();
        assert_eq!(fs.stats().space.dirty, 200);
        let core = lock(&fs.shared.core);
        assert_eq!(core.block(1).list, Some(ListKind::Erasable));
    }

    #[test]
    fn out_of_space_is_recoverable_by_gc() {
        // Small device, large nodes: exhaust it, delete, and watch the
        // allocator reclaim synchronously instead of failing.
        let mut opts = foreground();
        opts.summaries = false;
        opts.ebh_size = 0;
        let fs = Filesystem::mount(sim(16), opts).unwrap();

        let mut locs = Vec::new();
        for i in 0..13 {
            locs.push(fs.write_node(inode(i + 1, 1), &[i as u8; 4000]).unwrap());
        }
        // The device is now down to its reserve; a plain write must fail...
        let err = fs.write_node(inode(99, 1), &[0xEE; 4000]).unwrap_err();
        assert!(matches!(err, Error::OutOfSpace));

        // ...until something is deleted, after which the allocator reclaims
        // the erasable blocks through its synchronous GC path.
        for loc in locs.drain(..6) {
            fs.mark_obsolete(loc).unwrap();
        }
        for i in 0..5 {
            let loc = fs.write_node(inode(100 + i, 1), &[0xEE; 4000]).unwrap();
            assert_eq!(fs.read_node(loc).unwrap(), vec![0xEE; 4000]);
        }
        assert!(fs.stats().total_erase_count >= 1);
        lock(&fs.shared.core).check_invariants().unwrap();
    }

    #[test]
    fn full_block_lifecycle_returns_to_free() {
        let mut opts = foreground();
        opts.ebh_size = 0;
        opts.summaries = false;
        let fs = Filesystem::mount(sim(4), opts).unwrap();

        let loc = fs.write_node(inode(1, 1), &[7u8; 4096]).unwrap();
        let id = loc.offset / 4096;
        fs.mark_obsolete(loc).unwrap();
        // A second write closes the fully dirty block, making it erasable
        fs.write_node(inode(2, 1), &[8u8; 100]).unwrap();
        while fs.run_gc().unwrap() {}

        let core = lock(&fs.shared.core);
        let block = core.block(id);
        assert_eq!(block.free_size, 4096);
        assert_eq!(block.erase_count, 1);
        assert_eq!(block.list, Some(ListKind::Free));
        core.check_invariants().unwrap();
    }

    #[test]
    fn write_fault_retires_block_and_retries() {
        let mut flash = sim(8);
        flash.inject_fault(0, SimFault::NextWrite);
        let fs = Filesystem::mount(flash, foreground()).unwrap();

        // The first write hits the injected fault, retires block 0, and
        // lands on another block transparently.
        let loc = fs.write_node(inode(1, 1), &[9u8; 100]).unwrap();
        assert_eq!(fs.read_node(loc).unwrap(), vec![9u8; 100]);
        assert_eq!(fs.stats().nr_bad_blocks, 1);
    }

    #[test]
    fn read_only_mount_rejects_writes() {
        let mut opts = foreground();
        opts.read_only = true;
        let fs = Filesystem::mount(sim(4), opts).unwrap();
        assert!(matches!(
            fs.write_node(inode(1, 1), &[0u8; 10]),
            Err(Error::ReadOnly)
        ));
        assert!(!fs.run_gc().unwrap());
    }

    #[test]
    fn churn_preserves_invariants_and_wear_bound() {
        let mut opts = foreground();
        opts.summaries = false;
        opts.ebh_size = 0;
        let fs = Filesystem::mount(sim(8), opts).unwrap();

        let mut rng = StdRng::seed_from_u64(0xC15D);
        let mut live: Vec<NodeLoc> = Vec::new();
        for round in 0..400u32 {
            let len = rng.gen_range(64..1500);
            let payload = vec![(round % 251) as u8; len];
            match fs.write_node(inode(round + 1, 1), &payload) {
                Ok(loc) => live.push(loc),
                Err(Error::OutOfSpace) => {}
                Err(e) => panic!("unexpected write failure: {e}"),
            }

            // Obsolete a random survivor about half the time
            if !live.is_empty() && rng.gen_bool(0.5) {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                fs.mark_obsolete(victim).unwrap();
            }
            if round % 16 == 0 {
                let _ = fs.run_gc().unwrap();
            }
        }
        while fs.run_gc().unwrap() {}

        let core = lock(&fs.shared.core);
        core.check_invariants().unwrap();
        let min_ec = (0..core.nr_blocks())
            .filter(|&id| core.block(id).list != Some(ListKind::Bad))
            .map(|id| core.block(id).erase_count)
            .min()
            .unwrap();
        assert!(core.max_erase_count - min_ec <= WL_DELTA);
    }

    #[test]
    fn bad_blocks_survive_remount() {
        let mut flash = sim(8);
        flash.mark_bad(3 * 4096).unwrap();
        let fs = Filesystem::mount(flash, foreground()).unwrap();
        assert_eq!(fs.stats().nr_bad_blocks, 1);
        assert_eq!(fs.stats().nr_free_blocks, 7);
    }

    #[test]
    fn oversized_node_is_rejected_up_front() {
        let fs = Filesystem::mount(sim(4), foreground()).unwrap();
        let err = fs.write_node(inode(1, 1), &vec![0u8; 5000]).unwrap_err();
        assert!(!matches!(err, Error::OutOfSpace));
    }
}
