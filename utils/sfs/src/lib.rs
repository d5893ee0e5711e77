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

mod bitmap;
mod error;
mod format;
mod inode;
mod journal;
mod layout;
mod physical;

use alloc::vec::Vec;
use core::fmt::Display;

pub use block_io::{BLOCK_SIZE, BlockDevice, BlockIndex};
pub use error::{Error, Result};
pub use format::{FormatVolumeOptions, format_volume};
pub use layout::{DEFAULT_MIN_JOURNAL_BLOCKS, JOURNAL_PERCENT, MIN_JOURNAL_BLOCKS};
pub use physical::{
    INODES_PER_BLOCK, INODES_PERCENT, MAGIC, POINTERS_PER_BLOCK, POINTERS_PER_INODE, SuperBlock,
};
use spin::RwLock;

use crate::{
    bitmap::FreeSpace,
    inode::InodeTable,
    journal::{Journal, Transaction},
    layout::Layout,
};

/// Largest number of blocks a file can address.
pub const MAX_FILE_BLOCKS: usize = POINTERS_PER_INODE + POINTERS_PER_BLOCK;
pub const MAX_FILE_SIZE: usize = MAX_FILE_BLOCKS * BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct INodeIndex(pub u32);

impl Display for INodeIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a mounted volume.
struct Volume {
    super_block: SuperBlock,
    layout: Layout,
    inodes: InodeTable,
    free_space: FreeSpace,
    journal: Journal,
}

impl Volume {
    fn load<D: BlockDevice>(device: &D) -> Result<Self> {
        let mut block = [0; BLOCK_SIZE];
        device.read(BlockIndex(0), &mut block)?;
        let super_block = SuperBlock::read_from_block(&block)?;
        if super_block.block_count > device.block_count() {
            return Err(Error::CorruptFormat("volume is larger than the device"));
        }
        let layout = Layout::from_super_block(&super_block)?;

        let mut inodes = InodeTable::load(device, layout)?;
        let mut journal = Journal::open(device, &layout)?;
        let report = journal.recover(device, &mut inodes)?;
        let free_space = FreeSpace::rebuild(&layout, &inodes, device)?;

        log::info!(
            "mounted volume: {} blocks, {} inodes, {} free data blocks, {} transactions replayed, {} discarded",
            super_block.block_count,
            super_block.inode_count,
            free_space.free_count(),
            report.replayed,
            report.discarded
        );
        Ok(Self {
            super_block,
            layout,
            inodes,
            free_space,
            journal,
        })
    }
}

/// A journaled file system on a block device, one volume per value.
///
/// Files are identified by their inode index, there are no directories.
/// Every mutating call is one journal transaction; after a crash the next
/// mount either completes or drops the transaction that was in flight.
pub struct FileSystem<D: BlockDevice> {
    device: D,
    volume: RwLock<Option<Volume>>,
}

impl<D: BlockDevice> FileSystem<D> {
    /// Wraps `device` without mounting it.
    pub fn new(device: D) -> Self {
        Self {
            device,
            volume: RwLock::new(None),
        }
    }

    /// Wraps and mounts `device`.
    pub fn open(device: D) -> Result<Self> {
        let fs = Self::new(device);
        fs.mount()?;
        Ok(fs)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn is_mounted(&self) -> bool {
        self.volume.read().is_some()
    }

    /// Writes an empty file system to the device, see [`format_volume`].
    pub fn format(&self, options: &FormatVolumeOptions) -> Result<SuperBlock> {
        let volume = self.volume.write();
        if volume.is_some() || self.device.mounted() {
            return Err(Error::AlreadyMounted);
        }
        format_volume(&self.device, options)
    }

    /// Loads the volume, replaying any committed transaction left in the
    /// journal. On failure the device is left unmounted.
    pub fn mount(&self) -> Result<()> {
        let mut volume = self.volume.write();
        if volume.is_some() || self.device.mounted() {
            return Err(Error::AlreadyMounted);
        }

        self.device.mount();
        match Volume::load(&self.device) {
            Ok(loaded) => {
                *volume = Some(loaded);
                Ok(())
            }
            Err(err) => {
                self.device.unmount();
                Err(err)
            }
        }
    }

    pub fn unmount(&self) -> Result<()> {
        let mut volume = self.volume.write();
        if volume.take().is_none() {
            return Err(Error::NotMounted);
        }
        self.device.unmount();
        log::info!("unmounted volume");
        Ok(())
    }

    /// Allocates the lowest unused inode, the new file is empty.
    pub fn create(&self) -> Result<INodeIndex> {
        let mut volume = self.volume.write();
        let (inode, txn) = volume
            .as_ref()
            .ok_or(Error::NotMounted)?
            .inodes
            .plan_create()?;
        self.commit(&mut volume, txn)?;
        log::debug!("created inode {inode}");
        Ok(inode)
    }

    /// Frees the inode and every block it owns.
    pub fn remove(&self, inode: INodeIndex) -> Result<()> {
        let mut volume = self.volume.write();
        let txn = volume
            .as_ref()
            .ok_or(Error::NotMounted)?
            .inodes
            .plan_remove(&self.device, inode)?;
        let released = txn.intents.len() - 1;
        self.commit(&mut volume, txn)?;
        log::debug!("removed inode {inode}, released {released} blocks");
        Ok(())
    }

    /// Returns the size of the file in bytes.
    pub fn stat(&self, inode: INodeIndex) -> Result<usize> {
        let volume = self.volume.read();
        let volume = volume.as_ref().ok_or(Error::NotMounted)?;
        Ok(volume.inodes.get(inode)?.size as usize)
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`, returns the
    /// number of bytes read. Reading stops at the end of the file, holes
    /// read as zeros.
    pub fn read(&self, inode: INodeIndex, buf: &mut [u8], offset: usize) -> Result<usize> {
        let volume = self.volume.read();
        let volume = volume.as_ref().ok_or(Error::NotMounted)?;
        let size = volume.inodes.get(inode)?.size as usize;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }

        let end = size.min(offset.saturating_add(buf.len()));
        let mut blocks = volume.inodes.block_map(&self.device, inode)?;
        let mut block = [0; BLOCK_SIZE];
        for logical in offset / BLOCK_SIZE..end.div_ceil(BLOCK_SIZE) {
            let block_start = logical * BLOCK_SIZE;
            let lo = offset.max(block_start) - block_start;
            let hi = end.min(block_start + BLOCK_SIZE) - block_start;
            let dst = buf
                .get_mut(block_start + lo - offset..block_start + hi - offset)
                .ok_or(Error::OffsetOutOfRange)?;
            match blocks.resolve(logical)? {
                Some(block_idx) => {
                    self.device.read(block_idx, &mut block)?;
                    dst.copy_from_slice(block.get(lo..hi).ok_or(Error::OffsetOutOfRange)?);
                }
                None => dst.fill(0),
            }
        }
        Ok(end - offset)
    }

    /// Writes `buf` at byte `offset`, growing the file as needed. Returns
    /// the number of bytes written, which is always `buf.len()`.
    pub fn write(&self, inode: INodeIndex, buf: &[u8], offset: usize) -> Result<usize> {
        let mut volume = self.volume.write();
        let mounted = volume.as_mut().ok_or(Error::NotMounted)?;
        let txn = mounted.inodes.plan_write(
            &self.device,
            &mut mounted.free_space,
            inode,
            buf,
            offset,
            mounted.journal.payload_capacity(),
        )?;
        if txn.intents.is_empty() {
            return Ok(0);
        }
        log::debug!(
            "writing {} bytes at {offset} to inode {inode}: {} intents, {} new blocks",
            buf.len(),
            txn.intents.len(),
            txn.fresh_blocks.len()
        );
        self.commit(&mut volume, txn)?;
        Ok(buf.len())
    }

    /// Runs a planned transaction through the journal. Failures before the
    /// begin record is complete undo the planned allocations, failures after
    /// it leave the outcome to the next mount and unmount the volume.
    fn commit(&self, volume: &mut Option<Volume>, txn: Transaction) -> Result<()> {
        let mounted = volume.as_mut().ok_or(Error::NotMounted)?;

        let logged = txn
            .fresh_blocks
            .iter()
            .try_for_each(|(block_idx, block)| self.device.write(*block_idx, block))
            .map_err(Error::from)
            .and_then(|_| mounted.journal.begin(&self.device, &txn.intents));
        let pending = match logged {
            Ok(pending) => pending,
            Err(err) => {
                mounted.free_space.roll_back(&txn.intents);
                return Err(err);
            }
        };

        let id = pending.id();
        let result = mounted
            .journal
            .commit(&self.device, pending)
            .and_then(|_| mounted.inodes.install(&self.device, &txn.intents))
            .and_then(|_| {
                mounted.free_space.apply(&txn.intents);
                mounted.journal.checkpoint(&self.device)
            });
        if let Err(err) = result {
            log::error!("transaction {id} failed after it was logged, unmounting: {err}");
            *volume = None;
            self.device.unmount();
            return Err(err);
        }
        Ok(())
    }

    pub fn super_block(&self) -> Result<SuperBlock> {
        let volume = self.volume.read();
        Ok(volume.as_ref().ok_or(Error::NotMounted)?.super_block)
    }

    pub fn free_block_count(&self) -> Result<u32> {
        let volume = self.volume.read();
        Ok(volume
            .as_ref()
            .ok_or(Error::NotMounted)?
            .free_space
            .free_count())
    }

    pub fn is_block_free(&self, block: BlockIndex) -> Result<bool> {
        let volume = self.volume.read();
        Ok(!volume
            .as_ref()
            .ok_or(Error::NotMounted)?
            .free_space
            .is_occupied(block))
    }

    /// Every block owned by the inode: direct blocks, the indirect block and
    /// the entries of the indirect block.
    pub fn owned_blocks(&self, inode: INodeIndex) -> Result<Vec<BlockIndex>> {
        let volume = self.volume.read();
        volume
            .as_ref()
            .ok_or(Error::NotMounted)?
            .inodes
            .owned_blocks(&self.device, inode)
    }

    /// The block holding logical block `logical` of the file, `None` for a
    /// hole.
    pub fn resolve_block(&self, inode: INodeIndex, logical: usize) -> Result<Option<BlockIndex>> {
        let volume = self.volume.read();
        volume
            .as_ref()
            .ok_or(Error::NotMounted)?
            .inodes
            .resolve_block(&self.device, inode, logical)
    }

    /// Rebuilds the free space map from the inode table and compares it with
    /// the live one.
    pub fn check(&self) -> Result<()> {
        let volume = self.volume.read();
        let volume = volume.as_ref().ok_or(Error::NotMounted)?;
        let rebuilt = FreeSpace::rebuild(&volume.layout, &volume.inodes, &self.device)?;
        if rebuilt != volume.free_space {
            return Err(Error::CorruptFormat(
                "free space map does not match the inode table",
            ));
        }
        Ok(())
    }
}

impl<D: BlockDevice> Drop for FileSystem<D> {
    fn drop(&mut self) {
        if self.volume.get_mut().take().is_some() {
            self.device.unmount();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, BTreeSet},
        sync::atomic::{AtomicUsize, Ordering},
    };

    use block_io::{Block, BlockIoError, RamDisk};
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;

    fn formatted(block_count: u32) -> FileSystem<RamDisk> {
        let fs = FileSystem::new(RamDisk::new(block_count));
        fs.format(&FormatVolumeOptions::new()).unwrap();
        fs.mount().unwrap();
        fs
    }

    fn read_all<D: BlockDevice>(fs: &FileSystem<D>, inode: INodeIndex) -> Vec<u8> {
        let mut buf = vec![0; fs.stat(inode).unwrap()];
        assert_eq!(buf.len(), fs.read(inode, &mut buf, 0).unwrap());
        buf
    }

    /// Fails every write once its budget of successful writes is used up.
    struct CrashingDisk {
        inner: RamDisk,
        budget: AtomicUsize,
    }

    impl CrashingDisk {
        fn new(inner: RamDisk) -> Self {
            Self {
                inner,
                budget: AtomicUsize::new(usize::MAX),
            }
        }

        fn crash_after(&self, writes: usize) {
            self.budget.store(writes, Ordering::SeqCst);
        }

        /// The device contents as seen after a reboot.
        fn reboot(&self) -> RamDisk {
            RamDisk::from_image(self.inner.image()).unwrap()
        }
    }

    impl BlockDevice for CrashingDisk {
        fn read(&self, block_idx: BlockIndex, block: &mut Block) -> block_io::Result<()> {
            self.inner.read(block_idx, block)
        }

        fn write(&self, block_idx: BlockIndex, block: &Block) -> block_io::Result<()> {
            let allowed = self
                .budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| {
                    budget.checked_sub(1)
                })
                .is_ok();
            if !allowed {
                return Err(BlockIoError::Other("device crashed"));
            }
            self.inner.write(block_idx, block)
        }

        fn block_count(&self) -> u32 {
            self.inner.block_count()
        }

        fn mounted(&self) -> bool {
            self.inner.mounted()
        }

        fn mount(&self) {
            self.inner.mount()
        }

        fn unmount(&self) {
            self.inner.unmount()
        }
    }

    #[test]
    fn test_hello() {
        let fs = formatted(20);
        let super_block = fs.super_block().unwrap();
        assert_eq!(2, super_block.inode_blocks);
        assert_eq!(256, super_block.inode_count);

        let inode = fs.create().unwrap();
        assert_eq!(INodeIndex(0), inode);
        assert_eq!(5, fs.write(inode, b"hello", 0).unwrap());
        assert_eq!(5, fs.stat(inode).unwrap());

        let mut buf = [0; 16];
        assert_eq!(5, fs.read(inode, &mut buf, 0).unwrap());
        assert_eq!(b"hello", &buf[..5]);
        fs.check().unwrap();
    }

    #[test]
    fn test_write_allocates_indirect_block() {
        let fs = formatted(40);
        let inode = fs.create().unwrap();
        let data: Vec<u8> = (0..2 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        assert_eq!(data.len(), fs.write(inode, &data, 4 * BLOCK_SIZE).unwrap());
        assert_eq!(6 * BLOCK_SIZE, fs.stat(inode).unwrap());
        assert_eq!(3, fs.owned_blocks(inode).unwrap().len());

        let contents = read_all(&fs, inode);
        assert!(contents[..4 * BLOCK_SIZE].iter().all(|b| *b == 0));
        assert_eq!(data, contents[4 * BLOCK_SIZE..]);
        fs.check().unwrap();
    }

    #[test]
    fn test_remove_frees_blocks() {
        let fs = formatted(40);
        let free = fs.free_block_count().unwrap();
        let inode = fs.create().unwrap();
        fs.write(inode, &vec![9; 8 * BLOCK_SIZE], 0).unwrap();
        let owned = fs.owned_blocks(inode).unwrap();
        assert_eq!(9, owned.len());
        assert_eq!(free - 9, fs.free_block_count().unwrap());

        fs.remove(inode).unwrap();
        assert!(matches!(fs.stat(inode), Err(Error::InvalidInode(_))));
        assert_eq!(free, fs.free_block_count().unwrap());
        for block in owned {
            assert!(fs.is_block_free(block).unwrap());
        }
        fs.check().unwrap();

        // the slot is reused and starts out empty
        assert_eq!(inode, fs.create().unwrap());
        assert_eq!(0, fs.stat(inode).unwrap());
    }

    #[test]
    fn test_invalid_inodes() {
        let fs = formatted(20);
        let mut buf = [0; 4];
        for inode in [INodeIndex(3), INodeIndex(256), INodeIndex(u32::MAX)] {
            assert!(matches!(fs.stat(inode), Err(Error::InvalidInode(i)) if i == inode));
            assert!(matches!(
                fs.read(inode, &mut buf, 0),
                Err(Error::InvalidInode(_))
            ));
            assert!(matches!(
                fs.write(inode, b"data", 0),
                Err(Error::InvalidInode(_))
            ));
            assert!(matches!(fs.write(inode, b"", 0), Err(Error::InvalidInode(_))));
            assert!(matches!(fs.remove(inode), Err(Error::InvalidInode(_))));
        }

        let inode = fs.create().unwrap();
        fs.remove(inode).unwrap();
        assert!(matches!(fs.remove(inode), Err(Error::InvalidInode(_))));
    }

    #[test]
    fn test_no_free_inode() {
        let fs = formatted(10);
        for expected in 0..128 {
            assert_eq!(INodeIndex(expected), fs.create().unwrap());
        }
        assert!(matches!(fs.create(), Err(Error::NoFreeInode)));
    }

    #[test]
    fn test_read_is_clamped_to_size() {
        let fs = formatted(20);
        let inode = fs.create().unwrap();
        fs.write(inode, b"0123456789", 0).unwrap();

        let mut buf = [0xff; 8];
        assert_eq!(4, fs.read(inode, &mut buf, 6).unwrap());
        assert_eq!(b"6789", &buf[..4]);
        assert_eq!([0xff; 4], buf[4..]);
        assert_eq!(0, fs.read(inode, &mut buf, 10).unwrap());
        assert_eq!(0, fs.read(inode, &mut buf, 1000).unwrap());
        assert_eq!(0, fs.read(inode, &mut [], 0).unwrap());
    }

    #[test]
    fn test_partial_overwrite_preserves_neighbours() {
        let fs = formatted(20);
        let inode = fs.create().unwrap();
        fs.write(inode, &vec![b'a'; BLOCK_SIZE + 100], 0).unwrap();
        fs.write(inode, b"XYZ", BLOCK_SIZE - 1).unwrap();

        let contents = read_all(&fs, inode);
        assert_eq!(BLOCK_SIZE + 100, contents.len());
        assert_eq!(b"aXYZa", &contents[BLOCK_SIZE - 2..BLOCK_SIZE + 3]);
        assert_eq!(BLOCK_SIZE + 100 - 3, contents.iter().filter(|b| **b == b'a').count());
    }

    #[test]
    fn test_sparse_file() {
        let fs = formatted(40);
        let inode = fs.create().unwrap();
        let offset = 10 * BLOCK_SIZE + 7;
        fs.write(inode, b"tail", offset).unwrap();
        assert_eq!(offset + 4, fs.stat(inode).unwrap());
        // one entry and the indirect block
        assert_eq!(2, fs.owned_blocks(inode).unwrap().len());
        assert_eq!(None, fs.resolve_block(inode, 0).unwrap());
        let tail = fs.resolve_block(inode, 10).unwrap().unwrap();
        assert!(!fs.is_block_free(tail).unwrap());

        let contents = read_all(&fs, inode);
        assert!(contents[..offset].iter().all(|b| *b == 0));
        assert_eq!(b"tail", &contents[offset..]);
    }

    #[test]
    fn test_zero_length_write() {
        let fs = formatted(20);
        let inode = fs.create().unwrap();
        let writes = fs.device().stats().writes;
        assert_eq!(0, fs.write(inode, b"", 5000).unwrap());
        assert_eq!(0, fs.write(inode, b"", MAX_FILE_SIZE).unwrap());
        assert_eq!(0, fs.stat(inode).unwrap());
        assert_eq!(writes, fs.device().stats().writes);

        // the same bounds as for a non-empty write
        assert!(matches!(
            fs.write(inode, b"", MAX_FILE_SIZE + 1),
            Err(Error::OffsetOutOfRange)
        ));
        assert!(matches!(
            fs.write(INodeIndex(7), b"", 0),
            Err(Error::InvalidInode(INodeIndex(7)))
        ));
    }

    #[test]
    fn test_overwrite_larger_than_journal() {
        let fs = formatted(20);
        let inode = fs.create().unwrap();
        fs.write(inode, &[1; 2 * BLOCK_SIZE], 0).unwrap();
        let free = fs.free_block_count().unwrap();

        // two patched blocks do not fit the three block ring
        assert_eq!(2 * BLOCK_SIZE, fs.write(inode, &[2; 2 * BLOCK_SIZE], 0).unwrap());
        assert_eq!(vec![2; 2 * BLOCK_SIZE], read_all(&fs, inode));
        assert_eq!(free, fs.free_block_count().unwrap());
        fs.check().unwrap();

        fs.unmount().unwrap();
        fs.mount().unwrap();
        assert_eq!(vec![2; 2 * BLOCK_SIZE], read_all(&fs, inode));
        assert_eq!(2, fs.owned_blocks(inode).unwrap().len());
    }

    #[test]
    fn test_remove_large_file_on_smallest_journal() {
        let fs = FileSystem::new(RamDisk::new(1000));
        let super_block = fs
            .format(&FormatVolumeOptions::new().journal_blocks(MIN_JOURNAL_BLOCKS))
            .unwrap();
        assert_eq!(8, super_block.journal_blocks);
        fs.mount().unwrap();
        let free = fs.free_block_count().unwrap();

        // more releases than fit into one journal block
        let inode = fs.create().unwrap();
        for block in 0..400 {
            fs.write(inode, &[(block % 251) as u8; BLOCK_SIZE], block * BLOCK_SIZE)
                .unwrap();
        }
        assert_eq!(401, fs.owned_blocks(inode).unwrap().len());
        fs.remove(inode).unwrap();
        assert!(matches!(fs.stat(inode), Err(Error::InvalidInode(_))));
        assert_eq!(free, fs.free_block_count().unwrap());
        fs.check().unwrap();

        // rewriting all of it at once goes through the same journal
        let inode = fs.create().unwrap();
        fs.write(inode, &vec![3; 400 * BLOCK_SIZE], 0).unwrap();
        fs.write(inode, &vec![4; 400 * BLOCK_SIZE], 0).unwrap();
        assert_eq!(vec![4; 400 * BLOCK_SIZE], read_all(&fs, inode));
        fs.check().unwrap();
        fs.remove(inode).unwrap();
        assert_eq!(free, fs.free_block_count().unwrap());
    }

    #[test]
    fn test_no_space_leaves_file_unchanged() {
        let fs = formatted(20);
        let inode = fs.create().unwrap();
        fs.write(inode, b"keep", 0).unwrap();
        let free = fs.free_block_count().unwrap();
        let writes = fs.device().stats().writes;

        assert!(matches!(
            fs.write(inode, &vec![1; 20 * BLOCK_SIZE], 0),
            Err(Error::NoSpace)
        ));
        assert_eq!(writes, fs.device().stats().writes);
        assert_eq!(free, fs.free_block_count().unwrap());
        assert_eq!(b"keep", &read_all(&fs, inode)[..]);
        fs.check().unwrap();
    }

    #[test]
    fn test_max_file_size() {
        let fs = formatted(2400);
        let inode = fs.create().unwrap();
        assert!(matches!(
            fs.write(inode, b"x", MAX_FILE_SIZE),
            Err(Error::OffsetOutOfRange)
        ));
        assert!(matches!(
            fs.write(inode, b"xy", MAX_FILE_SIZE - 1),
            Err(Error::OffsetOutOfRange)
        ));

        let mut rng = StdRng::seed_from_u64(7);
        let mut data = vec![0; MAX_FILE_SIZE];
        rng.fill(&mut data[..]);
        fs.write(inode, &data, 0).unwrap();
        assert_eq!(MAX_FILE_SIZE, fs.stat(inode).unwrap());
        assert_eq!(MAX_FILE_BLOCKS + 1, fs.owned_blocks(inode).unwrap().len());
        assert!(data == read_all(&fs, inode));

        // most blocks move, the rest are patched through the journal
        let free = fs.free_block_count().unwrap();
        let mut other = vec![0; MAX_FILE_SIZE];
        rng.fill(&mut other[..]);
        assert_eq!(MAX_FILE_SIZE, fs.write(inode, &other, 0).unwrap());
        assert_eq!(free, fs.free_block_count().unwrap());
        assert!(other == read_all(&fs, inode));
        fs.check().unwrap();

        fs.unmount().unwrap();
        fs.mount().unwrap();
        assert!(other == read_all(&fs, inode));
    }

    #[test]
    fn test_overwrite_without_room_to_move_blocks() {
        // 1039 data blocks, the full size file leaves 9
        let fs = formatted(1300);
        let inode = fs.create().unwrap();
        let data = vec![5; MAX_FILE_SIZE];
        fs.write(inode, &data, 0).unwrap();
        let free = fs.free_block_count().unwrap();
        let writes = fs.device().stats().writes;

        assert!(matches!(
            fs.write(inode, &vec![6; MAX_FILE_SIZE], 0),
            Err(Error::NoSpace)
        ));
        assert_eq!(writes, fs.device().stats().writes);
        assert_eq!(free, fs.free_block_count().unwrap());
        assert!(data == read_all(&fs, inode));
        fs.check().unwrap();
    }

    #[test]
    fn test_mount_states() {
        let device = RamDisk::new(20);
        let fs = FileSystem::new(&device);
        assert!(matches!(fs.mount(), Err(Error::BadMagic)));
        assert!(!device.mounted());
        assert!(matches!(fs.create(), Err(Error::NotMounted)));
        assert!(matches!(fs.unmount(), Err(Error::NotMounted)));

        fs.format(&FormatVolumeOptions::new()).unwrap();
        fs.mount().unwrap();
        assert!(device.mounted());
        assert!(matches!(fs.mount(), Err(Error::AlreadyMounted)));
        assert!(matches!(
            fs.format(&FormatVolumeOptions::new()),
            Err(Error::AlreadyMounted)
        ));

        let other = FileSystem::new(&device);
        assert!(matches!(other.mount(), Err(Error::AlreadyMounted)));
        drop(other);
        assert!(device.mounted());

        fs.unmount().unwrap();
        assert!(!device.mounted());
        let mut buf = [0; 1];
        assert!(matches!(fs.stat(INodeIndex(0)), Err(Error::NotMounted)));
        assert!(matches!(
            fs.read(INodeIndex(0), &mut buf, 0),
            Err(Error::NotMounted)
        ));
        assert!(matches!(
            fs.write(INodeIndex(0), b"x", 0),
            Err(Error::NotMounted)
        ));
        assert!(matches!(fs.remove(INodeIndex(0)), Err(Error::NotMounted)));
        assert!(matches!(fs.unmount(), Err(Error::NotMounted)));
    }

    #[test]
    fn test_mount_rejects_bad_geometry() {
        let device = RamDisk::new(20);
        format_volume(&device, &FormatVolumeOptions::new()).unwrap();
        let mut block = [0; BLOCK_SIZE];
        device.read(BlockIndex(0), &mut block).unwrap();
        let mut super_block = SuperBlock::read_from_block(&block).unwrap();
        super_block.block_count = 40;
        device
            .write(BlockIndex(0), &super_block.to_block().unwrap())
            .unwrap();

        let fs = FileSystem::new(&device);
        assert!(matches!(fs.mount(), Err(Error::CorruptFormat(_))));
        assert!(!device.mounted());
    }

    #[test]
    fn test_mount_rejects_bad_pointer() {
        let device = RamDisk::new(20);
        {
            let fs = FileSystem::new(&device);
            fs.format(&FormatVolumeOptions::new()).unwrap();
            fs.mount().unwrap();
            let inode = fs.create().unwrap();
            fs.write(inode, b"abc", 0).unwrap();
        }
        // point the first direct slot of inode 0 into the inode table
        let mut block = [0; BLOCK_SIZE];
        device.read(BlockIndex(1), &mut block).unwrap();
        block[8..12].copy_from_slice(&1u32.to_le_bytes());
        device.write(BlockIndex(1), &block).unwrap();

        assert!(matches!(
            FileSystem::open(&device).err(),
            Some(Error::CorruptFormat(_))
        ));
        assert!(!device.mounted());
    }

    #[test]
    fn test_data_survives_remount() {
        let device = RamDisk::new(64);
        let (first, second) = {
            let fs = FileSystem::new(&device);
            fs.format(&FormatVolumeOptions::new()).unwrap();
            fs.mount().unwrap();
            let first = fs.create().unwrap();
            let second = fs.create().unwrap();
            fs.write(first, b"first file", 0).unwrap();
            fs.write(second, &vec![2; 7 * BLOCK_SIZE], 3).unwrap();
            fs.unmount().unwrap();
            (first, second)
        };

        let fs = FileSystem::open(&device).unwrap();
        assert_eq!(b"first file", &read_all(&fs, first)[..]);
        let contents = read_all(&fs, second);
        assert_eq!([0, 0, 0], contents[..3]);
        assert!(contents[3..].iter().all(|b| *b == 2));
        fs.check().unwrap();
    }

    #[test]
    fn test_drop_unmounts() {
        let device = RamDisk::new(20);
        {
            let fs = FileSystem::new(&device);
            fs.format(&FormatVolumeOptions::new()).unwrap();
            fs.mount().unwrap();
            assert!(device.mounted());
        }
        assert!(!device.mounted());
        assert!(FileSystem::open(&device).unwrap().is_mounted());
    }

    /// Contents of every valid inode.
    fn snapshot<D: BlockDevice>(fs: &FileSystem<D>) -> BTreeMap<u32, Vec<u8>> {
        let inode_count = fs.super_block().unwrap().inode_count;
        (0..inode_count)
            .filter(|idx| fs.stat(INodeIndex(*idx)).is_ok())
            .map(|idx| (idx, read_all(fs, INodeIndex(idx))))
            .collect()
    }

    /// Runs `op` against a copy of `base` for every possible crash point and
    /// checks that the remounted volume shows either the state before or the
    /// state after the operation.
    fn crash_sweep<F>(base: &[u8], op: F)
    where
        F: Fn(&FileSystem<&CrashingDisk>) -> Result<()>,
    {
        let before = {
            let fs = FileSystem::open(RamDisk::from_image(base.to_vec()).unwrap()).unwrap();
            snapshot(&fs)
        };
        let after = {
            let device = CrashingDisk::new(RamDisk::from_image(base.to_vec()).unwrap());
            let fs = FileSystem::open(&device).unwrap();
            op(&fs).unwrap();
            snapshot(&fs)
        };
        assert_ne!(before, after);

        let mut seen_before = false;
        let mut seen_after = false;
        for budget in 0.. {
            let device = CrashingDisk::new(RamDisk::from_image(base.to_vec()).unwrap());
            let fs = FileSystem::open(&device).unwrap();
            device.crash_after(budget);
            let completed = op(&fs).is_ok();
            drop(fs);

            let rebooted = FileSystem::open(device.reboot()).unwrap();
            rebooted.check().unwrap();
            let state = snapshot(&rebooted);
            if state == before {
                seen_before = true;
            } else if state == after {
                seen_after = true;
            } else {
                panic!("crash after {budget} writes left a mixed state");
            }
            if completed {
                assert_eq!(after, state);
                break;
            }
        }
        assert!(seen_before);
        assert!(seen_after);
    }

    fn crash_base() -> Vec<u8> {
        let fs = formatted(64);
        let first = fs.create().unwrap();
        let second = fs.create().unwrap();
        fs.write(first, &vec![b'a'; 2 * BLOCK_SIZE + 50], 0).unwrap();
        fs.write(second, &vec![b'b'; 6 * BLOCK_SIZE], 0).unwrap();
        fs.unmount().unwrap();
        fs.device().image()
    }

    #[test]
    fn test_crash_during_write() {
        crash_sweep(&crash_base(), |fs| {
            // patches two existing blocks, then grows into the indirect range
            fs.write(INodeIndex(0), &vec![b'c'; 5 * BLOCK_SIZE], BLOCK_SIZE + 10)
                .map(|_| ())
        });
    }

    #[test]
    fn test_crash_during_overwrite_that_moves_blocks() {
        crash_sweep(&crash_base(), |fs| {
            // six patched blocks overflow the five block ring
            fs.write(INodeIndex(1), &vec![b'd'; 6 * BLOCK_SIZE], 0)
                .map(|_| ())
        });
    }

    #[test]
    fn test_crash_during_remove() {
        crash_sweep(&crash_base(), |fs| fs.remove(INodeIndex(1)));
    }

    #[test]
    fn test_crash_during_create() {
        crash_sweep(&crash_base(), |fs| fs.create().map(|_| ()));
    }

    #[test]
    fn test_device_failure_after_commit_unmounts() {
        let device = CrashingDisk::new(RamDisk::from_image(crash_base()).unwrap());
        let fs = FileSystem::open(&device).unwrap();
        // one begin block and the commit record make it to the log
        device.crash_after(2);
        assert!(matches!(fs.remove(INodeIndex(1)), Err(Error::Device(_))));
        assert!(!fs.is_mounted());
        assert!(!device.mounted());
        assert!(matches!(fs.stat(INodeIndex(0)), Err(Error::NotMounted)));

        device.crash_after(usize::MAX);
        fs.mount().unwrap();
        assert!(matches!(
            fs.stat(INodeIndex(1)),
            Err(Error::InvalidInode(_))
        ));
        fs.check().unwrap();
    }

    #[test]
    fn test_random_operations() {
        let mut rng = StdRng::seed_from_u64(0x5f5);
        let device = RamDisk::new(200);
        let fs = FileSystem::new(&device);
        fs.format(&FormatVolumeOptions::new()).unwrap();
        fs.mount().unwrap();
        let mut model: BTreeMap<u32, Vec<u8>> = BTreeMap::new();

        for _ in 0..300 {
            match rng.gen_range(0..10) {
                0..=1 => {
                    let inode = fs.create().unwrap();
                    assert!(model.insert(inode.0, Vec::new()).is_none());
                }
                2 if !model.is_empty() => {
                    let idx = *model.keys().nth(rng.gen_range(0..model.len())).unwrap();
                    fs.remove(INodeIndex(idx)).unwrap();
                    model.remove(&idx);
                }
                _ if !model.is_empty() => {
                    let idx = *model.keys().nth(rng.gen_range(0..model.len())).unwrap();
                    let offset = rng.gen_range(0..12 * BLOCK_SIZE);
                    let mut data = vec![0; rng.gen_range(1..3 * BLOCK_SIZE)];
                    rng.fill(&mut data[..]);
                    match fs.write(INodeIndex(idx), &data, offset) {
                        Ok(written) => {
                            assert_eq!(data.len(), written);
                            let contents = model.get_mut(&idx).unwrap();
                            if contents.len() < offset + data.len() {
                                contents.resize(offset + data.len(), 0);
                            }
                            contents[offset..offset + data.len()].copy_from_slice(&data);
                        }
                        Err(Error::NoSpace) => {}
                        Err(err) => panic!("unexpected error {err:?}"),
                    }
                }
                _ => {}
            }
            fs.check().unwrap();
        }

        // no block is owned twice
        let mut owned = BTreeSet::new();
        for idx in model.keys() {
            for block in fs.owned_blocks(INodeIndex(*idx)).unwrap() {
                assert!(owned.insert(block));
                assert!(!fs.is_block_free(block).unwrap());
            }
        }
        assert_eq!(model, snapshot(&fs));

        fs.unmount().unwrap();
        fs.mount().unwrap();
        assert_eq!(model, snapshot(&fs));
        fs.check().unwrap();
    }

    #[test]
    fn test_concurrent_readers() {
        let fs = formatted(64);
        let stable = fs.create().unwrap();
        let busy = fs.create().unwrap();
        let data: Vec<u8> = (0..3 * BLOCK_SIZE).map(|i| (i % 199) as u8).collect();
        fs.write(stable, &data, 0).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        assert!(data == read_all(&fs, stable));
                    }
                });
            }
            scope.spawn(|| {
                for round in 0..50u8 {
                    fs.write(busy, &[round; 100], usize::from(round) * 100)
                        .unwrap();
                }
            });
        });

        assert_eq!(5000, fs.stat(busy).unwrap());
        fs.check().unwrap();
    }
}
