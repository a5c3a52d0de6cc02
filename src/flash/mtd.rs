//! Flash device implementation over the Linux MTD subsystem

use super::{FlashDevice, FlashLayout};

use anyhow::{bail, ensure};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// Flash device that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdFlash {
    file: File,
    layout: FlashLayout,
}

impl MtdFlash {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, layout })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                let mtd_dev = line.split(':').next().unwrap();
                return Self::open(Path::new("/dev").join(mtd_dev));
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Ensure `offset..offset + len` stays inside one erase block, which is
    /// what the [`FlashDevice`] contract requires of callers
    fn check_span(&self, offset: u32, len: usize) -> anyhow::Result<()> {
        let block = self.layout.block_of(offset);
        ensure!(block < self.layout.blocks, "offset {offset} out of range");

        let end = offset as u64 + len as u64;
        ensure!(
            end <= (self.layout.block_offset(block) + self.layout.block_size) as u64,
            "access at {offset}+{len} crosses a block boundary"
        );
        Ok(())
    }
}

impl FlashDevice for MtdFlash {
    fn layout(&self) -> FlashLayout {
        self.layout
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> anyhow::Result<()> {
        self.check_span(offset, buf.len())?;
        Ok(self.file.read_exact_at(buf, offset.into())?)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> anyhow::Result<()> {
        self.check_span(offset, bytes.len())?;
        Ok(self.file.write_all_at(bytes, offset.into())?)
    }

    fn erase(&mut self, block_offset: u32) -> anyhow::Result<()> {
        ensure!(
            block_offset % self.layout.block_size == 0,
            "erase offset not block-aligned"
        );
        let erase_info = ioctl::erase_info_user {
            start: block_offset,
            length: self.layout.block_size,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }

    fn is_bad(&mut self, block_offset: u32) -> anyhow::Result<bool> {
        let block_base: u64 = block_offset.into();
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base)? };
        Ok(bad != 0)
    }

    fn mark_bad(&mut self, block_offset: u32) -> anyhow::Result<()> {
        let block_base: u64 = block_offset.into();
        unsafe {
            ioctl::memsetbadblock(self.file.as_raw_fd(), &block_base)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::FlashLayout;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<FlashLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(self) -> anyhow::Result<FlashLayout> {
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );

            Ok(FlashLayout {
                blocks: self.size / self.erasesize,
                block_size: self.erasesize,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);
}
