//! Log-structured storage core for raw NAND/NOR flash.
//!
//! This crate owns the erase-block lifecycle of a log-structured filesystem:
//! the wear-leveling allocator that decides where the next node is written,
//! the space accounting that tracks every byte of every block as free, used,
//! dirty, wasted, or unchecked, the garbage collector that relocates live
//! nodes and erases reclaimed blocks, and the per-block summaries that let a
//! mount skip scanning. Node payload formats and the directory/index layer
//! above them are out of scope; callers hand in opaque payloads tagged with
//! [`summary::NodeInfo`] metadata.
//!
//! The main entry point is [`fs::Filesystem::mount`], over any
//! [`flash::FlashDevice`]: a memory-backed [`flash::SimFlash`] for tests and
//! tools, or a real MTD character device on Linux.

pub mod block;
pub mod error;
pub mod flash;
pub mod fs;
mod gc;
pub mod inode;
pub mod lists;
pub mod registry;
pub mod summary;
pub mod wear;

pub use error::{Error, Result};
pub use flash::{FlashDevice, FlashLayout, SimFlash};
pub use fs::{Filesystem, FsStats, MountOptions, NodeLoc};
pub use summary::NodeInfo;
