use bitvec::vec::BitVec;
use block_io::{BlockDevice, BlockIndex};

use crate::{
    Error, Result,
    inode::InodeTable,
    journal::{Intent, Pointer},
    layout::Layout,
};

/// In-memory occupancy map of every block on the volume, one bit per block,
/// set when the block is in use. Never persisted, it is rebuilt from the
/// inode table on mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FreeSpace {
    occupied: BitVec,
    data_start: u32,
}

impl FreeSpace {
    /// An empty map, only the reserved regions are occupied.
    pub(crate) fn new(layout: &Layout) -> Self {
        let mut occupied = BitVec::repeat(false, layout.block_count as usize);
        if let Some(reserved) = occupied.get_mut(..layout.data_start.0 as usize) {
            reserved.fill(true);
        }
        Self {
            occupied,
            data_start: layout.data_start.0,
        }
    }

    /// Recomputes the map from the inode table. Each valid inode claims its
    /// direct blocks, its indirect block and every entry of the indirect
    /// block.
    pub(crate) fn rebuild<D: BlockDevice>(
        layout: &Layout,
        inodes: &InodeTable,
        device: &D,
    ) -> Result<Self> {
        let mut free_space = Self::new(layout);
        for (inode_idx, _) in inodes.iter_valid() {
            inodes.visit_blocks(device, inode_idx, |_, block| {
                free_space.claim(layout, block)
            })?;
        }
        log::debug!(
            "rebuilt free space map: {} of {} data blocks free",
            free_space.free_count(),
            layout.data_block_count()
        );
        Ok(free_space)
    }

    fn claim(&mut self, layout: &Layout, block: BlockIndex) -> Result<()> {
        if !layout.is_data_block(block) {
            return Err(Error::CorruptFormat("block pointer outside the data region"));
        }
        match self.occupied.get_mut(block.0 as usize) {
            Some(bit) if *bit => Err(Error::CorruptFormat("block referenced twice")),
            Some(mut bit) => {
                *bit = true;
                Ok(())
            }
            None => Err(Error::CorruptFormat("block pointer outside the volume")),
        }
    }

    /// Hands out the lowest free block.
    pub(crate) fn allocate(&mut self) -> Result<BlockIndex> {
        let idx = self.occupied.first_zero().ok_or(Error::NoSpace)?;
        let block = BlockIndex(u32::try_from(idx).map_err(|_| Error::NoSpace)?);
        self.occupied.set(idx, true);
        log::trace!("allocated block {block}");
        Ok(block)
    }

    /// Marks `block` free again. Releasing a free, reserved or out of range
    /// block does nothing.
    pub(crate) fn release(&mut self, block: BlockIndex) {
        if block.0 < self.data_start {
            return;
        }
        if let Some(mut bit) = self.occupied.get_mut(block.0 as usize) {
            *bit = false;
            log::trace!("released block {block}");
        }
    }

    fn mark_occupied(&mut self, block: BlockIndex) {
        if let Some(mut bit) = self.occupied.get_mut(block.0 as usize) {
            *bit = true;
        }
    }

    /// Mirrors the allocations and releases of an installed transaction.
    pub(crate) fn apply(&mut self, intents: &[Intent]) {
        for intent in intents {
            match intent {
                Intent::Allocate { block, .. } => self.mark_occupied(*block),
                Intent::Release { block, .. } => self.release(*block),
                _ => {}
            }
        }
    }

    /// Returns the blocks a planned transaction allocated, used when the
    /// transaction is abandoned before it reaches the log.
    pub(crate) fn roll_back(&mut self, intents: &[Intent]) {
        for intent in intents {
            if let Intent::Allocate { block, pointer, .. } = intent {
                log::trace!("rolling back {pointer:?} allocation of block {block}");
                self.release(*block);
            }
        }
    }

    pub(crate) fn free_count(&self) -> u32 {
        u32::try_from(self.occupied.count_zeros()).unwrap_or(u32::MAX)
    }

    /// Out of range blocks count as occupied.
    pub(crate) fn is_occupied(&self, block: BlockIndex) -> bool {
        self.occupied
            .get(block.0 as usize)
            .is_none_or(|bit| *bit)
    }
}
