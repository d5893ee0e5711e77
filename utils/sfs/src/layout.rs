use block_io::BlockIndex;

use crate::{
    Error, INodeIndex, Result,
    journal::min_journal_blocks,
    physical::{INODES_PER_BLOCK, INODES_PERCENT, PHYSICAL_INODE_SIZE, SuperBlock},
};

/// Percentage of the volume used for the journal when no size is requested.
pub const JOURNAL_PERCENT: u32 = 10;
pub const DEFAULT_MIN_JOURNAL_BLOCKS: u32 = 4;
/// Journal header plus room for one begin and one commit record. Larger
/// volumes need more, see [`Layout::new`].
pub const MIN_JOURNAL_BLOCKS: u32 = 3;

/// Region boundaries of a volume:
///
/// `| super block | inode table | journal | data ... |`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layout {
    pub block_count: u32,
    pub inode_blocks: u32,
    pub inode_count: u32,
    pub journal_start: BlockIndex,
    pub journal_blocks: u32,
    pub data_start: BlockIndex,
}

impl Layout {
    /// Computes the layout of a fresh volume. The journal is never smaller
    /// than the largest transaction the volume can produce.
    pub(crate) fn new(block_count: u32, journal_blocks: Option<u32>) -> Result<Self> {
        let too_small = Error::VolumeTooSmall { block_count };
        let inode_blocks = block_count / INODES_PERCENT;
        if inode_blocks == 0 {
            return Err(too_small);
        }

        let required = min_journal_blocks(block_count);
        let journal_blocks = match journal_blocks {
            Some(requested) if requested < required => {
                log::warn!("journal of {requested} blocks requested, using {required} blocks");
                required
            }
            Some(requested) => requested,
            None => (block_count / JOURNAL_PERCENT)
                .max(DEFAULT_MIN_JOURNAL_BLOCKS)
                .max(required),
        };

        let data_start = inode_blocks
            .checked_add(journal_blocks)
            .and_then(|reserved| reserved.checked_add(1))
            .ok_or(too_small)?;
        if data_start >= block_count {
            return Err(Error::VolumeTooSmall { block_count });
        }

        Ok(Self {
            block_count,
            inode_blocks,
            inode_count: inode_blocks * INODES_PER_BLOCK,
            journal_start: BlockIndex(1 + inode_blocks),
            journal_blocks,
            data_start: BlockIndex(data_start),
        })
    }

    /// Validates the geometry recorded in a super block.
    pub(crate) fn from_super_block(super_block: &SuperBlock) -> Result<Self> {
        if super_block.inode_blocks == 0 {
            return Err(Error::CorruptFormat("empty inode table"));
        }
        if super_block.inode_blocks.checked_mul(INODES_PER_BLOCK) != Some(super_block.inode_count)
        {
            return Err(Error::CorruptFormat("inode count does not match inode table"));
        }
        if super_block.journal_blocks < min_journal_blocks(super_block.block_count) {
            return Err(Error::CorruptFormat("journal region too small"));
        }
        let data_start = super_block
            .inode_blocks
            .checked_add(super_block.journal_blocks)
            .and_then(|reserved| reserved.checked_add(1))
            .ok_or(Error::CorruptFormat("reserved regions overflow"))?;
        if data_start >= super_block.block_count {
            return Err(Error::CorruptFormat("reserved regions exceed the volume"));
        }

        Ok(Self {
            block_count: super_block.block_count,
            inode_blocks: super_block.inode_blocks,
            inode_count: super_block.inode_count,
            journal_start: BlockIndex(1 + super_block.inode_blocks),
            journal_blocks: super_block.journal_blocks,
            data_start: BlockIndex(data_start),
        })
    }

    pub(crate) fn super_block(&self) -> SuperBlock {
        SuperBlock {
            block_count: self.block_count,
            inode_blocks: self.inode_blocks,
            inode_count: self.inode_count,
            journal_blocks: self.journal_blocks,
        }
    }

    /// returns the block containing the inode along with the offset within
    /// the block where the inode record starts
    pub(crate) fn calc_inode_block_addr(&self, inode_idx: INodeIndex) -> Result<(BlockIndex, usize)> {
        if inode_idx.0 >= self.inode_count {
            return Err(Error::InvalidInode(inode_idx));
        }
        let block = BlockIndex(1 + inode_idx.0 / INODES_PER_BLOCK);
        let offset = (inode_idx.0 % INODES_PER_BLOCK) as usize * PHYSICAL_INODE_SIZE;
        Ok((block, offset))
    }

    pub(crate) fn inode_table_blocks(&self) -> impl Iterator<Item = BlockIndex> + use<> {
        (1..1 + self.inode_blocks).map(BlockIndex)
    }

    /// Whether `block` lies in the data region, only data blocks may be
    /// referenced by inodes.
    pub(crate) fn is_data_block(&self, block: BlockIndex) -> bool {
        block >= self.data_start && block.0 < self.block_count
    }

    pub(crate) fn data_block_count(&self) -> u32 {
        self.block_count - self.data_start.0
    }
}
