use block_io::{BLOCK_SIZE, Block, BlockIndex};
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, little_endian::U32,
};

use crate::{Error, Result};

pub const MAGIC: u32 = 0xf0f03410;
pub const INODES_PER_BLOCK: u32 = 128;
/// Percentage of the volume reserved for the inode table.
pub const INODES_PERCENT: u32 = 10;
/// Number of block pointers stored in the inode itself, if a file needs more
/// blocks the rest are stored in the indirect block
pub const POINTERS_PER_INODE: usize = 5;
pub const POINTERS_PER_BLOCK: usize = BLOCK_SIZE / core::mem::size_of::<u32>();
pub(crate) const BLOCK_UNSET: u32 = 0;
pub(crate) const PHYSICAL_INODE_SIZE: usize = core::mem::size_of::<PhysicalINode>();

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub(crate) struct PhysicalSuperBlock {
    pub magic: U32,
    /// total number of blocks in the volume
    pub blocks: U32,
    /// number of blocks reserved for the inode table
    pub inode_blocks: U32,
    /// inode capacity, always inode_blocks * INODES_PER_BLOCK
    pub inodes: U32,
    /// number of blocks in the journal region following the inode table
    pub journal_blocks: U32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub(crate) struct PhysicalINode {
    pub valid: U32,
    /// size of the file in bytes
    pub size: U32,
    /// block indices of the first blocks of the file, BLOCK_UNSET marks an unused slot
    pub direct: [U32; POINTERS_PER_INODE],
    /// if set, a block holding POINTERS_PER_BLOCK further block indices
    pub indirect: U32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub(crate) struct PhysicalINodeBlock {
    pub inodes: [PhysicalINode; INODES_PER_BLOCK as usize],
}

const _: () = assert!(core::mem::size_of::<PhysicalINodeBlock>() == BLOCK_SIZE);

/// Volume geometry as recorded in block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub block_count: u32,
    pub inode_blocks: u32,
    pub inode_count: u32,
    pub journal_blocks: u32,
}

impl SuperBlock {
    pub(crate) fn read_from_block(block: &Block) -> Result<Self> {
        let (super_block, _) = PhysicalSuperBlock::read_from_prefix(block)
            .map_err(|_| Error::CorruptFormat("super block does not fit in a block"))?;
        if super_block.magic.get() != MAGIC {
            return Err(Error::BadMagic);
        }
        Ok(super_block.into())
    }

    pub(crate) fn to_block(self) -> Result<Block> {
        let mut block = [0; BLOCK_SIZE];
        PhysicalSuperBlock::from(self)
            .write_to_prefix(&mut block)
            .map_err(|_| Error::CorruptFormat("super block does not fit in a block"))?;
        Ok(block)
    }
}

impl From<PhysicalSuperBlock> for SuperBlock {
    fn from(value: PhysicalSuperBlock) -> Self {
        Self {
            block_count: value.blocks.get(),
            inode_blocks: value.inode_blocks.get(),
            inode_count: value.inodes.get(),
            journal_blocks: value.journal_blocks.get(),
        }
    }
}

impl From<SuperBlock> for PhysicalSuperBlock {
    fn from(value: SuperBlock) -> Self {
        Self {
            magic: U32::new(MAGIC),
            blocks: U32::new(value.block_count),
            inode_blocks: U32::new(value.inode_blocks),
            inodes: U32::new(value.inode_count),
            journal_blocks: U32::new(value.journal_blocks),
        }
    }
}

impl PhysicalINodeBlock {
    pub(crate) fn read_from_block(block: &Block) -> Result<Self> {
        Self::read_from_bytes(block).map_err(|_| Error::CorruptFormat("bad inode block size"))
    }

    pub(crate) fn to_block(&self) -> Block {
        let mut block = [0; BLOCK_SIZE];
        block.copy_from_slice(self.as_bytes());
        block
    }
}

/// A data block reinterpreted as an array of block indices.
#[repr(C, packed)]
#[derive(Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub(crate) struct PointerBlock {
    pointers: [U32; POINTERS_PER_BLOCK],
}

impl PointerBlock {
    pub(crate) fn empty() -> Self {
        Self::new_zeroed()
    }

    pub(crate) fn read_from_block(block: &Block) -> Result<Self> {
        Self::read_from_bytes(block).map_err(|_| Error::CorruptFormat("bad pointer block size"))
    }

    pub(crate) fn to_block(&self) -> Block {
        let mut block = [0; BLOCK_SIZE];
        block.copy_from_slice(self.as_bytes());
        block
    }

    pub(crate) fn get(&self, idx: usize) -> Result<Option<BlockIndex>> {
        self.pointers
            .get(idx)
            .map(|ptr| block_pointer(ptr.get()))
            .ok_or(Error::OffsetOutOfRange)
    }

    pub(crate) fn set(&mut self, idx: usize, ptr: Option<BlockIndex>) -> Result<()> {
        let slot = self.pointers.get_mut(idx).ok_or(Error::OffsetOutOfRange)?;
        *slot = U32::new(raw_pointer(ptr));
        Ok(())
    }

    /// Iterates over the set entries as `(entry index, block)`.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, BlockIndex)> + '_ {
        self.pointers
            .iter()
            .enumerate()
            .filter_map(|(idx, ptr)| block_pointer(ptr.get()).map(|block| (idx, block)))
    }
}

pub(crate) fn block_pointer(raw: u32) -> Option<BlockIndex> {
    if raw == BLOCK_UNSET {
        None
    } else {
        Some(BlockIndex(raw))
    }
}

pub(crate) fn raw_pointer(ptr: Option<BlockIndex>) -> u32 {
    ptr.map_or(BLOCK_UNSET, |block| block.0)
}
