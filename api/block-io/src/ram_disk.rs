use alloc::{vec, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{BLOCK_SIZE, Block, BlockDevice, BlockIndex, BlockIoError, Result, check_range};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStats {
    pub reads: usize,
    pub writes: usize,
}

/// A block device held entirely in memory.
pub struct RamDisk {
    data: spin::Mutex<Vec<u8>>,
    block_count: u32,
    mounted: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(block_count: u32) -> Self {
        Self {
            data: spin::Mutex::new(vec![0; block_count as usize * BLOCK_SIZE]),
            block_count,
            mounted: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Creates a device from a raw image. Trailing bytes that do not fill a
    /// whole block are dropped.
    pub fn from_image(mut image: Vec<u8>) -> Result<Self> {
        let block_count: u32 = (image.len() / BLOCK_SIZE)
            .try_into()
            .map_err(|_| BlockIoError::Other("image has too many blocks"))?;
        image.truncate(block_count as usize * BLOCK_SIZE);
        Ok(Self {
            data: spin::Mutex::new(image),
            block_count,
            mounted: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    /// Returns a copy of the current device contents.
    pub fn image(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
        }
    }

    fn byte_range(block_idx: BlockIndex) -> core::ops::Range<usize> {
        let start = block_idx.0 as usize * BLOCK_SIZE;
        start..start + BLOCK_SIZE
    }
}

impl BlockDevice for RamDisk {
    fn read(&self, block_idx: BlockIndex, block: &mut Block) -> Result<()> {
        check_range(block_idx, self.block_count)?;
        let data = self.data.lock();
        let src = data
            .get(Self::byte_range(block_idx))
            .ok_or(BlockIoError::PartialTransfer {
                block_idx: block_idx.0,
                transferred: 0,
            })?;
        block.copy_from_slice(src);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write(&self, block_idx: BlockIndex, block: &Block) -> Result<()> {
        check_range(block_idx, self.block_count)?;
        let mut data = self.data.lock();
        let dst = data
            .get_mut(Self::byte_range(block_idx))
            .ok_or(BlockIoError::PartialTransfer {
                block_idx: block_idx.0,
                transferred: 0,
            })?;
        dst.copy_from_slice(block);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    fn mount(&self) {
        self.mounted.store(true, Ordering::SeqCst);
    }

    fn unmount(&self) {
        self.mounted.store(false, Ordering::SeqCst);
    }
}
