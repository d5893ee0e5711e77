use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{BLOCK_SIZE, Block, BlockDevice, BlockIndex, BlockIoError, Result, check_range};

/// A block device backed by a regular file (a disk image). Needs the `std`
/// feature.
pub struct FileDisk {
    file: spin::Mutex<File>,
    block_count: u32,
    mounted: AtomicBool,
}

impl FileDisk {
    /// Creates (or truncates) the image at `path` and sizes it to hold
    /// `block_count` blocks.
    pub fn create<P: AsRef<Path>>(path: P, block_count: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_count as u64 * BLOCK_SIZE as u64)?;
        Ok(Self::new(file, block_count))
    }

    /// Opens an existing image, the block count is derived from its length.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let block_count: u32 = (file.metadata()?.len() / BLOCK_SIZE as u64)
            .try_into()
            .map_err(|_| BlockIoError::Other("image has too many blocks"))?;
        Ok(Self::new(file, block_count))
    }

    fn new(file: File, block_count: u32) -> Self {
        Self {
            file: spin::Mutex::new(file),
            block_count,
            mounted: AtomicBool::new(false),
        }
    }
}

impl BlockDevice for FileDisk {
    fn read(&self, block_idx: BlockIndex, block: &mut Block) -> Result<()> {
        check_range(block_idx, self.block_count)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block_idx.to_file_pos()))?;
        let mut transferred = 0;
        while transferred < BLOCK_SIZE {
            let buf = block
                .get_mut(transferred..)
                .ok_or(BlockIoError::Other("read past block end"))?;
            let read = file.read(buf)?;
            if read == 0 {
                return Err(BlockIoError::PartialTransfer {
                    block_idx: block_idx.0,
                    transferred,
                });
            }
            transferred += read;
        }
        Ok(())
    }

    fn write(&self, block_idx: BlockIndex, block: &Block) -> Result<()> {
        check_range(block_idx, self.block_count)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block_idx.to_file_pos()))?;
        file.write_all(block)?;
        file.flush()?;
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
