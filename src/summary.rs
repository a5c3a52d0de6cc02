//! Per-block summaries: an on-flash index of a block's contents, written once
//! near the end of the block, that lets mount skip scanning that block
//! node-by-node.
//!
//! Layout, back to front: the last 8 bytes of a summarized block hold a
//! [`SumMarker`] pointing at the summary node; the node itself is a
//! [`SumHeader`] followed by `entry_count` serialized [`SumEntry`] records,
//! CRC-protected. Anything that fails to decode falls back to a full scan of
//! that one block; a bad summary is never fatal.
//!
//! This module also owns the erase-block header ([`EbhNode`]), the only other
//! on-flash structure defined by this crate. It is written at the start of a
//! freshly erased block so erase counts survive remounts.

use crc::{Crc, CRC_32_JAMCRC};
use deku::prelude::*;

use crate::flash::{FlashDevice, MemUtil};

pub const SUM_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

const SUM_MAGIC: u32 = 0xC15D_E55A;
const EBH_MAGIC: u32 = 0xC15D_EB01;

pub const SUM_HEADER_SIZE: u32 = 16;
pub const SUM_MARKER_SIZE: u32 = 8;
pub const EBH_NODE_SIZE: u32 = 12;

/// In-memory metadata for one node, carried by node references and summary
/// entries alike: enough to rebuild the node index without re-reading the
/// node body from flash
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeInfo {
    Inode {
        ino: u32,
        version: u32,
    },
    Dirent {
        pino: u32,
        ino: u32,
        version: u32,
        name: Vec<u8>,
    },
    EraseBlockHeader {
        erase_count: u32,
    },
    Padding,
    Unknown {
        node_type: u16,
    },
}

/// One serialized summary record. `offset` is relative to the block start.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little", type = "u16")]
pub enum SumEntry {
    #[deku(id = "0x0001")]
    Inode {
        offset: u32,
        totlen: u32,
        ino: u32,
        version: u32,
    },

    #[deku(id = "0x0002")]
    Dirent {
        offset: u32,
        totlen: u32,
        pino: u32,
        ino: u32,
        version: u32,
        nsize: u8,
        #[deku(count = "nsize")]
        name: Vec<u8>,
    },

    #[deku(id = "0x0003")]
    EraseBlockHeader {
        offset: u32,
        totlen: u32,
        erase_count: u32,
    },

    #[deku(id = "0x0004")]
    Padding { offset: u32, totlen: u32 },

    #[deku(id = "0x0005")]
    Unknown {
        offset: u32,
        totlen: u32,
        node_type: u16,
    },
}

impl SumEntry {
    /// Build the on-flash record for a node at `offset` (block-relative)
    pub fn build(offset: u32, totlen: u32, info: &NodeInfo) -> anyhow::Result<Self> {
        Ok(match info {
            NodeInfo::Inode { ino, version } => SumEntry::Inode {
                offset,
                totlen,
                ino: *ino,
                version: *version,
            },
            NodeInfo::Dirent {
                pino,
                ino,
                version,
                name,
            } => SumEntry::Dirent {
                offset,
                totlen,
                pino: *pino,
                ino: *ino,
                version: *version,
                nsize: name
                    .len()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("dirent name too long to summarize"))?,
                name: name.clone(),
            },
            NodeInfo::EraseBlockHeader { erase_count } => SumEntry::EraseBlockHeader {
                offset,
                totlen,
                erase_count: *erase_count,
            },
            NodeInfo::Padding => SumEntry::Padding { offset, totlen },
            NodeInfo::Unknown { node_type } => SumEntry::Unknown {
                offset,
                totlen,
                node_type: *node_type,
            },
        })
    }

    /// Serialized size of the entry that would describe `info`, or `None` if
    /// it cannot be summarized at all. Used when sizing a reservation so the
    /// block always retains room for its own summary.
    pub fn size_for(info: &NodeInfo) -> Option<u32> {
        let bytes = Self::build(0, 0, info).ok()?.to_bytes().ok()?;
        Some(bytes.len() as u32)
    }

    /// Split into (block-relative offset, length, node metadata)
    pub fn split(self) -> (u32, u32, NodeInfo) {
        match self {
            SumEntry::Inode {
                offset,
                totlen,
                ino,
                version,
            } => (offset, totlen, NodeInfo::Inode { ino, version }),
            SumEntry::Dirent {
                offset,
                totlen,
                pino,
                ino,
                version,
                name,
                ..
            } => (
                offset,
                totlen,
                NodeInfo::Dirent {
                    pino,
                    ino,
                    version,
                    name,
                },
            ),
            SumEntry::EraseBlockHeader {
                offset,
                totlen,
                erase_count,
            } => (offset, totlen, NodeInfo::EraseBlockHeader { erase_count }),
            SumEntry::Padding { offset, totlen } => (offset, totlen, NodeInfo::Padding),
            SumEntry::Unknown {
                offset,
                totlen,
                node_type,
            } => (offset, totlen, NodeInfo::Unknown { node_type }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct SumHeader {
    magic: u32,
    entry_count: u32,
    payload_len: u32,
    payload_crc: u32,
}

/// Stored in the last 8 bytes of every summarized erase block
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct SumMarker {
    /// Block-relative offset of the summary node
    offset: u32,
    magic: u32,
}

/// The erase-block header written at the start of a freshly erased block,
/// carrying its erase count
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct EbhNode {
    magic: u32,
    pub erase_count: u32,
    hdr_crc: u32,
}

impl EbhNode {
    pub fn new(erase_count: u32) -> Self {
        let mut node = Self {
            magic: EBH_MAGIC,
            erase_count,
            hdr_crc: 0,
        };
        node.hdr_crc = node.compute_crc();
        node
    }

    fn compute_crc(&self) -> u32 {
        let bytes = self.to_bytes().unwrap();
        SUM_CRC.checksum(&bytes[..bytes.len() - std::mem::size_of::<u32>()])
    }

    /// Convert from a byte slice, with magic and CRC verification
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, node) = Self::from_bytes((bytes, 0)).ok()?;
        if node.magic != EBH_MAGIC || node.hdr_crc != node.compute_crc() {
            return None;
        }
        Some(node)
    }

    /// Write into a byte slice
    pub fn encode(&self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = self.to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

/// A parsed summary, as recovered at mount time
#[derive(Debug)]
pub struct ParsedSummary {
    pub entries: Vec<SumEntry>,
    /// Block-relative offset of the summary node itself, so the caller can
    /// account the `sum_offset..block_size` tail
    pub sum_offset: u32,
}

/// Read and verify the summary of the block at `block_offset`, if one exists.
///
/// `Ok(None)` means "no usable summary, fall back to scanning"; only driver
/// I/O failures are errors.
pub fn read_summary<F: FlashDevice>(
    flash: &mut F,
    block_offset: u32,
    block_size: u32,
) -> anyhow::Result<Option<ParsedSummary>> {
    let mut marker_bytes = [0u8; SUM_MARKER_SIZE as usize];
    flash.read(block_offset + block_size - SUM_MARKER_SIZE, &mut marker_bytes)?;
    if marker_bytes.is_erased() {
        return Ok(None);
    }

    let marker = match SumMarker::from_bytes((&marker_bytes, 0)) {
        Ok((_, m)) if m.magic == SUM_MAGIC => m,
        _ => return Ok(None),
    };
    if marker.offset >= block_size - SUM_MARKER_SIZE - SUM_HEADER_SIZE {
        return Ok(None);
    }

    let mut header_bytes = [0u8; SUM_HEADER_SIZE as usize];
    flash.read(block_offset + marker.offset, &mut header_bytes)?;
    let header = match SumHeader::from_bytes((&header_bytes, 0)) {
        Ok((_, h)) if h.magic == SUM_MAGIC => h,
        _ => return Ok(None),
    };

    let payload_end = (marker.offset + SUM_HEADER_SIZE)
        .checked_add(header.payload_len)
        .filter(|&end| end <= block_size - SUM_MARKER_SIZE);
    if payload_end.is_none() {
        return Ok(None);
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    flash.read(block_offset + marker.offset + SUM_HEADER_SIZE, &mut payload)?;
    if SUM_CRC.checksum(&payload) != header.payload_crc {
        return Ok(None);
    }

    let mut entries = Vec::with_capacity(header.entry_count as usize);
    let mut rest: (&[u8], usize) = (&payload, 0);
    for _ in 0..header.entry_count {
        match SumEntry::from_bytes(rest) {
            Ok((remaining, entry)) => {
                entries.push(entry);
                rest = remaining;
            }
            Err(_) => return Ok(None),
        }
    }

    Ok(Some(ParsedSummary {
        entries,
        sum_offset: marker.offset,
    }))
}

/// Accumulates summary entries for the block currently being written, and
/// flushes them as a single trailing node when the block is closed
#[derive(Debug, Default)]
pub struct SummaryCollector {
    payload: Vec<u8>,
    count: u32,
    /// Collection abandoned for the current block only (entry would not
    /// serialize, or the summary would no longer fit)
    abandoned: bool,
    /// Summary collection switched off filesystem-wide
    disabled: bool,
}

impl SummaryCollector {
    /// Permanently stop collecting (e.g. read-only remount)
    pub fn disable(&mut self) {
        self.disabled = true;
        self.reset();
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Abandon the summary for the current block; scanning will cover it
    pub fn abandon(&mut self) {
        self.abandoned = true;
        self.payload.clear();
        self.count = 0;
    }

    pub fn is_collecting(&self) -> bool {
        !self.disabled && !self.abandoned
    }

    /// Forget everything collected; called when moving to a fresh block
    pub fn reset(&mut self) {
        self.payload.clear();
        self.count = 0;
        self.abandoned = false;
    }

    /// Bytes of block tail the summary needs if flushed right now
    pub fn required_space(&self) -> u32 {
        if !self.is_collecting() {
            0
        } else {
            SUM_HEADER_SIZE + self.payload.len() as u32 + SUM_MARKER_SIZE
        }
    }

    /// Record one completed node write at block-relative `offset`
    pub fn add(&mut self, offset: u32, totlen: u32, info: &NodeInfo) {
        if !self.is_collecting() {
            return;
        }

        let serialized = SumEntry::build(offset, totlen, info).and_then(|e| Ok(e.to_bytes()?));
        match serialized {
            Ok(bytes) => {
                self.payload.extend_from_slice(&bytes);
                self.count += 1;
            }
            // A node we cannot describe poisons the whole block's summary
            Err(_) => self.abandon(),
        }
    }

    /// Serialize the collected summary into the tail of the block at
    /// `block_offset`, writing the node at block-relative `sum_offset` and
    /// the marker in the block's last 8 bytes. The collector is reset
    /// afterwards regardless of outcome.
    pub fn flush<F: FlashDevice>(
        &mut self,
        flash: &mut F,
        block_offset: u32,
        block_size: u32,
        sum_offset: u32,
    ) -> anyhow::Result<()> {
        debug_assert!(self.is_collecting());

        let header = SumHeader {
            magic: SUM_MAGIC,
            entry_count: self.count,
            payload_len: self.payload.len() as u32,
            payload_crc: SUM_CRC.checksum(&self.payload),
        };
        let mut node = header.to_bytes()?;
        node.extend_from_slice(&self.payload);

        let marker = SumMarker {
            offset: sum_offset,
            magic: SUM_MAGIC,
        };

        let result = flash
            .write(block_offset + sum_offset, &node)
            .and_then(|()| {
                flash.write(
                    block_offset + block_size - SUM_MARKER_SIZE,
                    &marker.to_bytes()?,
                )
            });

        self.reset();
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::flash::{FlashLayout, SimFlash};

    const TEST_LAYOUT: FlashLayout = FlashLayout {
        blocks: 2,
        block_size: 4096,
    };

    fn sample_infos() -> Vec<(u32, u32, NodeInfo)> {
        vec![
            (0, EBH_NODE_SIZE, NodeInfo::EraseBlockHeader { erase_count: 7 }),
            (12, 200, NodeInfo::Inode { ino: 5, version: 1 }),
            (
                212,
                60,
                NodeInfo::Dirent {
                    pino: 1,
                    ino: 5,
                    version: 1,
                    name: b"notes.txt".to_vec(),
                },
            ),
            (272, 16, NodeInfo::Padding),
            (288, 44, NodeInfo::Unknown { node_type: 0x2021 }),
        ]
    }

    #[test]
    fn entry_roundtrip() {
        for (offset, totlen, info) in sample_infos() {
            let entry = SumEntry::build(offset, totlen, &info).unwrap();
            let bytes = entry.to_bytes().unwrap();
            let (_, parsed) = SumEntry::from_bytes((&bytes, 0)).unwrap();
            assert_eq!(parsed.split(), (offset, totlen, info));
        }
    }

    #[test]
    fn collector_flush_and_read_back() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_LAYOUT);
        let mut collector = SummaryCollector::default();

        let infos = sample_infos();
        for (offset, totlen, info) in &infos {
            collector.add(*offset, *totlen, info);
        }

        let sum_offset = 4096 - collector.required_space();
        collector.flush(&mut flash, 0, 4096, sum_offset)?;

        let parsed = read_summary(&mut flash, 0, 4096)?.expect("summary should parse");
        assert_eq!(parsed.sum_offset, sum_offset);
        let recovered: Vec<_> = parsed.entries.into_iter().map(SumEntry::split).collect();
        assert_eq!(recovered, infos);

        // The collector is ready for the next block
        assert_eq!(collector.required_space(), SUM_HEADER_SIZE + SUM_MARKER_SIZE);
        Ok(())
    }

    #[test]
    fn unsummarized_block_reads_as_none() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_LAYOUT);
        assert!(read_summary(&mut flash, 4096, 4096)?.is_none());

        // Garbage in the marker position must not parse either
        flash.write(2 * 4096 - SUM_MARKER_SIZE, &[0xAB; 8])?;
        assert!(read_summary(&mut flash, 4096, 4096)?.is_none());
        Ok(())
    }

    #[test]
    fn corrupt_payload_is_rejected() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_LAYOUT);
        let mut collector = SummaryCollector::default();
        collector.add(0, 100, &NodeInfo::Inode { ino: 1, version: 1 });

        let sum_offset = 4096 - collector.required_space();
        collector.flush(&mut flash, 0, 4096, sum_offset)?;

        // Flip bits in the payload area by reloading a damaged image
        let mut image = Vec::new();
        flash.save(&mut image)?;
        image[(sum_offset + SUM_HEADER_SIZE) as usize] ^= 0xFF;
        let mut damaged = SimFlash::new(TEST_LAYOUT);
        damaged.load(&mut image.as_slice())?;

        assert!(read_summary(&mut damaged, 0, 4096)?.is_none());
        Ok(())
    }

    #[test]
    fn oversized_dirent_name_abandons_collection() {
        let mut collector = SummaryCollector::default();
        collector.add(
            0,
            400,
            &NodeInfo::Dirent {
                pino: 1,
                ino: 2,
                version: 1,
                name: vec![b'x'; 300],
            },
        );
        assert!(!collector.is_collecting());
        assert_eq!(collector.required_space(), 0);

        collector.reset();
        assert!(collector.is_collecting());
    }

    #[test]
    fn global_disable_sticks() {
        let mut collector = SummaryCollector::default();
        collector.disable();
        collector.add(0, 100, &NodeInfo::Padding);
        collector.reset();
        assert!(collector.is_disabled());
        assert_eq!(collector.required_space(), 0);
    }

    #[test]
    fn ebh_roundtrip() {
        let node = EbhNode::new(42);
        let mut buf = [0u8; EBH_NODE_SIZE as usize];
        node.encode(&mut buf).unwrap();
        assert_eq!(EbhNode::decode(&buf), Some(node));

        let mut corrupt = buf;
        corrupt[4] ^= 1;
        assert_eq!(EbhNode::decode(&corrupt), None);
    }
}
