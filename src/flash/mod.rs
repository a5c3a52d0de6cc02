//! Abstractions and code to access raw flash devices.
//!
//! The storage core never touches a device directly; everything goes through
//! [`FlashDevice`], which is the narrow contract of an MTD-style driver:
//! read, forward-only write, whole-block erase, and bad-block bookkeeping.
//! Node encodings, CRC checking of payloads, and page-alignment buffering all
//! live on the driver side of this boundary.

use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::ensure;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for `[u8]`s that represent flash contents
pub trait MemUtil {
    /// Does this region contain the all-1s (erased) bit pattern?
    fn is_erased(&self) -> bool;
}

impl MemUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the erase geometry of a flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FlashLayout {
    pub blocks: u32,
    pub block_size: u32,
}

impl FlashLayout {
    /// Total device size in bytes
    pub fn device_size(&self) -> u32 {
        self.blocks * self.block_size
    }

    /// The offset of the first byte of block `index`
    pub fn block_offset(&self, index: u32) -> u32 {
        index * self.block_size
    }

    /// The block containing byte `offset`
    pub fn block_of(&self, offset: u32) -> u32 {
        offset / self.block_size
    }
}

/// Parse strings like "BLOCKSxBYTES"
impl FromStr for FlashLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, block_size]: [&str; 2] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#"))?;
        let blocks = blocks.parse()?;
        let block_size = block_size.parse()?;

        Ok(FlashLayout { blocks, block_size })
    }
}

/// Represents a raw flash device (or a partition of one)
///
/// All offsets are device-absolute byte offsets. Writes within one erase
/// block must land at strictly increasing offsets until the block is erased
/// again; drivers may reject anything else.
pub trait FlashDevice {
    /// Get the erase geometry of the device
    fn layout(&self) -> FlashLayout;

    /// Read `buf.len()` bytes starting at `offset`
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> anyhow::Result<()>;

    /// Write `bytes` starting at `offset`
    fn write(&mut self, offset: u32, bytes: &[u8]) -> anyhow::Result<()>;

    /// Erase the whole block beginning at `block_offset`
    fn erase(&mut self, block_offset: u32) -> anyhow::Result<()>;

    /// Is the block beginning at `block_offset` marked bad?
    fn is_bad(&mut self, block_offset: u32) -> anyhow::Result<bool>;

    /// Mark the block beginning at `block_offset` bad.
    ///
    /// This should be called if an erase results in error, or if a write
    /// results in error and erase-and-rewrite has already been tried.
    fn mark_bad(&mut self, block_offset: u32) -> anyhow::Result<()>;
}

/// Failure injection modes for [`SimFlash`], used to exercise the bad-block
/// paths in tests
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SimFault {
    NextWrite,
    NextErase,
}

/// A simulated in-memory flash device, for testing purposes
#[derive(Debug, Clone, Default)]
pub struct SimFlash {
    blocks: Vec<SimBlock>,
    layout: FlashLayout,
}

/// A block of SimFlash
#[derive(Debug, Clone)]
struct SimBlock {
    /// All bytes written so far (legally, can only append to this; bytes
    /// beyond read back as 0xFF)
    data: Vec<u8>,

    /// Is this block marked bad?
    marked_bad: bool,

    /// Pending injected fault, if any
    fault: Option<SimFault>,
}

impl Default for FlashLayout {
    fn default() -> Self {
        FlashLayout {
            blocks: 0,
            block_size: 1,
        }
    }
}

impl SimFlash {
    /// Create an empty (fully erased) SimFlash with the specified layout
    pub fn new(layout: FlashLayout) -> Self {
        let blocks = vec![
            SimBlock {
                data: Vec::new(),
                marked_bad: false,
                fault: None,
            };
            layout.blocks as usize
        ];

        Self { blocks, layout }
    }

    /// Initialize the flash contents from a type implementing `Read`
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size as usize];

        for block in &mut self.blocks {
            read.read_exact(&mut buf)?;
            block.marked_bad = false;
            block.data.clear();
            // Store only the written prefix; an erased tail stays implicit.
            let end = buf
                .iter()
                .rposition(|&x| x != 0xFF)
                .map_or(0, |pos| pos + 1);
            block.data.extend_from_slice(&buf[..end]);
        }

        Ok(())
    }

    /// Write the contents of this simulated flash out to a writable stream
    /// (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let size = self.layout.block_size as usize;
        let mut buf = vec![0u8; size];

        for block in &self.blocks {
            if block.marked_bad {
                buf.fill(0xBD);
            } else {
                buf.fill(0xFF);
                buf[..block.data.len()].copy_from_slice(&block.data);
            }
            write.write_all(&buf)?;
        }

        Ok(())
    }

    /// Inject a one-shot fault into the block at `index`
    pub fn inject_fault(&mut self, index: u32, fault: SimFault) {
        self.blocks[index as usize].fault = Some(fault);
    }

    fn block_at(&mut self, offset: u32) -> anyhow::Result<(&mut SimBlock, usize)> {
        let index = self.layout.block_of(offset);
        let within = (offset - self.layout.block_offset(index)) as usize;
        let block = self
            .blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))?;
        Ok((block, within))
    }
}

impl FlashDevice for SimFlash {
    fn layout(&self) -> FlashLayout {
        self.layout
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> anyhow::Result<()> {
        let block_size = self.layout.block_size as usize;
        let (block, within) = self.block_at(offset)?;
        ensure!(
            within + buf.len() <= block_size,
            "read crosses a block boundary"
        );
        ensure!(!block.marked_bad, "read from bad block");

        for (i, out) in buf.iter_mut().enumerate() {
            *out = block.data.get(within + i).copied().unwrap_or(0xFF);
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> anyhow::Result<()> {
        let block_size = self.layout.block_size as usize;
        let (block, within) = self.block_at(offset)?;
        ensure!(
            within + bytes.len() <= block_size,
            "write crosses a block boundary"
        );
        ensure!(!block.marked_bad, "write to bad block");
        if block.fault == Some(SimFault::NextWrite) {
            block.fault = None;
            anyhow::bail!("simulated write failure");
        }
        ensure!(within >= block.data.len(), "write in already-written area");

        // Writing fully-erased content is a no-op.
        if !bytes.is_erased() {
            block.data.resize(within, 0xFF);
            block.data.extend_from_slice(bytes);
        }
        Ok(())
    }

    fn erase(&mut self, block_offset: u32) -> anyhow::Result<()> {
        let (block, within) = self.block_at(block_offset)?;
        ensure!(within == 0, "erase offset not block-aligned");
        ensure!(!block.marked_bad, "erase of bad block");
        if block.fault == Some(SimFault::NextErase) {
            block.fault = None;
            anyhow::bail!("simulated erase failure");
        }

        block.data.clear();
        Ok(())
    }

    fn is_bad(&mut self, block_offset: u32) -> anyhow::Result<bool> {
        let (block, within) = self.block_at(block_offset)?;
        ensure!(within == 0, "is_bad offset not block-aligned");
        Ok(block.marked_bad)
    }

    fn mark_bad(&mut self, block_offset: u32) -> anyhow::Result<()> {
        let (block, within) = self.block_at(block_offset)?;
        ensure!(within == 0, "mark_bad offset not block-aligned");
        block.data.clear();
        block.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: FlashLayout = FlashLayout {
    blocks: 8,
    block_size: 4096,
};

#[test]
fn test_sim_read_write() {
    let mut flash = SimFlash::new(TEST_LAYOUT);

    let data_in = [0xA5u8; 64];
    let mut data_out = [0u8; 64];

    flash.write(128, &data_in).unwrap();
    // Rewriting below the high-water mark must be rejected
    assert!(flash.write(64, &data_in).is_err());

    flash.read(0, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    flash.read(128, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    flash.read(192, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_erase() {
    let mut flash = SimFlash::new(TEST_LAYOUT);

    flash.write(4096, &[1, 2, 3]).unwrap();
    flash.erase(4096).unwrap();

    let mut buf = [0u8; 3];
    flash.read(4096, &mut buf).unwrap();
    assert!(buf.is_erased());

    // Erase offsets must be block-aligned
    assert!(flash.erase(4100).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut flash = SimFlash::new(TEST_LAYOUT);
    assert!(!flash.is_bad(0).unwrap());
    flash.mark_bad(0).unwrap();
    assert!(flash.is_bad(0).unwrap());
    assert!(flash.write(0, &[0u8]).is_err());
}

#[test]
fn test_sim_fault_injection() {
    let mut flash = SimFlash::new(TEST_LAYOUT);
    flash.inject_fault(2, SimFault::NextErase);
    assert!(flash.erase(2 * 4096).is_err());
    // One-shot: the next attempt succeeds
    assert!(flash.erase(2 * 4096).is_ok());
}

#[test]
fn test_sim_load_save() -> anyhow::Result<()> {
    let mut flash = SimFlash::new(TEST_LAYOUT);
    flash.write(10, &[0xAB; 4])?;

    let mut image = Vec::new();
    flash.save(&mut image)?;
    assert_eq!(image.len(), TEST_LAYOUT.device_size() as usize);

    let mut reloaded = SimFlash::new(TEST_LAYOUT);
    reloaded.load(&mut image.as_slice())?;

    let mut buf = [0u8; 4];
    reloaded.read(10, &mut buf)?;
    assert_eq!(buf, [0xAB; 4]);
    Ok(())
}
