#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]
#![allow(clippy::new_without_default)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::unreachable,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation
)]

extern crate alloc;

mod error;
#[cfg(any(feature = "std", test))]
mod file_disk;
mod ram_disk;

use alloc::sync::Arc;
use core::fmt::Display;

pub use error::{BlockIoError, Result};
#[cfg(any(feature = "std", test))]
pub use file_disk::FileDisk;
pub use ram_disk::{DeviceStats, RamDisk};

pub const BLOCK_SIZE: usize = 4 * 1024;

pub type Block = [u8; BLOCK_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIndex(pub u32);

impl BlockIndex {
    /// Byte offset of the start of this block on the device.
    pub fn to_file_pos(self) -> u64 {
        self.0 as u64 * BLOCK_SIZE as u64
    }
}

impl Display for BlockIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-size block storage.
///
/// A single `write` is atomic with respect to crashes, a sequence of writes is
/// not. Implementations synchronise internally so that a device can be shared
/// by reference.
pub trait BlockDevice {
    /// Reads the whole block `block_idx` into `block`.
    fn read(&self, block_idx: BlockIndex, block: &mut Block) -> Result<()>;

    /// Replaces the whole block `block_idx` with `block`.
    fn write(&self, block_idx: BlockIndex, block: &Block) -> Result<()>;

    /// Number of blocks on the device.
    fn block_count(&self) -> u32;

    fn mounted(&self) -> bool;

    fn mount(&self);

    fn unmount(&self);
}

impl<T: BlockDevice + ?Sized> BlockDevice for &T {
    fn read(&self, block_idx: BlockIndex, block: &mut Block) -> Result<()> {
        (**self).read(block_idx, block)
    }

    fn write(&self, block_idx: BlockIndex, block: &Block) -> Result<()> {
        (**self).write(block_idx, block)
    }

    fn block_count(&self) -> u32 {
        (**self).block_count()
    }

    fn mounted(&self) -> bool {
        (**self).mounted()
    }

    fn mount(&self) {
        (**self).mount()
    }

    fn unmount(&self) {
        (**self).unmount()
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn read(&self, block_idx: BlockIndex, block: &mut Block) -> Result<()> {
        (**self).read(block_idx, block)
    }

    fn write(&self, block_idx: BlockIndex, block: &Block) -> Result<()> {
        (**self).write(block_idx, block)
    }

    fn block_count(&self) -> u32 {
        (**self).block_count()
    }

    fn mounted(&self) -> bool {
        (**self).mounted()
    }

    fn mount(&self) {
        (**self).mount()
    }

    fn unmount(&self) {
        (**self).unmount()
    }
}

pub(crate) fn check_range(block_idx: BlockIndex, block_count: u32) -> Result<()> {
    if block_idx.0 >= block_count {
        return Err(BlockIoError::OutOfRange {
            block_idx: block_idx.0,
            block_count,
        });
    }
    Ok(())
}
