use alloc::{
    boxed::Box,
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};

use block_io::{BLOCK_SIZE, Block, BlockDevice, BlockIndex};
use zerocopy::{FromZeros, little_endian::U32};

use crate::{
    Error, INodeIndex, MAX_FILE_BLOCKS, MAX_FILE_SIZE, Result,
    bitmap::FreeSpace,
    journal::{Intent, POINTER_INTENT_LEN, Pointer, Transaction},
    layout::Layout,
    physical::{
        INODES_PER_BLOCK, POINTERS_PER_INODE, PhysicalINode, PhysicalINodeBlock, PointerBlock,
        block_pointer, raw_pointer,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct INode {
    pub valid: bool,
    /// size of the file in bytes
    pub size: u32,
    pub direct: [Option<BlockIndex>; POINTERS_PER_INODE],
    pub indirect: Option<BlockIndex>,
}

impl From<PhysicalINode> for INode {
    fn from(value: PhysicalINode) -> Self {
        let mut direct = [None; POINTERS_PER_INODE];
        for (slot, ptr) in direct.iter_mut().zip(value.direct) {
            *slot = block_pointer(ptr.get());
        }

        Self {
            valid: value.valid.get() != 0,
            size: value.size.get(),
            direct,
            indirect: block_pointer(value.indirect.get()),
        }
    }
}

impl From<&INode> for PhysicalINode {
    fn from(value: &INode) -> Self {
        Self {
            valid: U32::new(u32::from(value.valid)),
            size: U32::new(value.size),
            direct: value.direct.map(|ptr| U32::new(raw_pointer(ptr))),
            indirect: U32::new(raw_pointer(value.indirect)),
        }
    }
}

/// Logical block `logical` of a file, either one of the inode's direct
/// pointers or an entry of its indirect block.
pub(crate) fn pointer_for(logical: usize) -> Result<Pointer> {
    if logical >= MAX_FILE_BLOCKS {
        Err(Error::OffsetOutOfRange)
    } else if logical < POINTERS_PER_INODE {
        Ok(Pointer::Direct(logical))
    } else {
        Ok(Pointer::IndirectEntry(logical - POINTERS_PER_INODE))
    }
}

/// The inode table of a mounted volume, kept in memory in full.
#[derive(Debug)]
pub(crate) struct InodeTable {
    inodes: Vec<INode>,
    layout: Layout,
}

impl InodeTable {
    pub(crate) fn load<D: BlockDevice>(device: &D, layout: Layout) -> Result<Self> {
        let mut inodes = Vec::with_capacity(layout.inode_count as usize);
        let mut block = [0; BLOCK_SIZE];
        for block_idx in layout.inode_table_blocks() {
            device.read(block_idx, &mut block)?;
            let physical = PhysicalINodeBlock::read_from_block(&block)?;
            for inode in physical.inodes {
                let inode = INode::from(inode);
                // stale pointers of unused slots are never looked at
                inodes.push(if inode.valid { inode } else { INode::default() });
            }
        }
        Ok(Self { inodes, layout })
    }

    /// Bounds checked access to a slot, in use or not.
    fn slot(&self, inode_idx: INodeIndex) -> Result<&INode> {
        self.inodes
            .get(inode_idx.0 as usize)
            .ok_or(Error::InvalidInode(inode_idx))
    }

    fn slot_mut(&mut self, inode_idx: INodeIndex) -> Result<&mut INode> {
        self.inodes
            .get_mut(inode_idx.0 as usize)
            .ok_or(Error::InvalidInode(inode_idx))
    }

    /// Returns the inode if it is in use.
    pub(crate) fn get(&self, inode_idx: INodeIndex) -> Result<&INode> {
        let inode = self.slot(inode_idx)?;
        if !inode.valid {
            return Err(Error::InvalidInode(inode_idx));
        }
        Ok(inode)
    }

    pub(crate) fn first_free(&self) -> Result<INodeIndex> {
        let idx = self
            .inodes
            .iter()
            .position(|inode| !inode.valid)
            .ok_or(Error::NoFreeInode)?;
        Ok(INodeIndex(
            u32::try_from(idx).map_err(|_| Error::NoFreeInode)?,
        ))
    }

    pub(crate) fn iter_valid(&self) -> impl Iterator<Item = (INodeIndex, &INode)> {
        (0..)
            .zip(self.inodes.iter())
            .filter(|(_, inode)| inode.valid)
            .map(|(idx, inode)| (INodeIndex(idx), inode))
    }

    /// Maps a logical block of the file to the block holding it, `None` for
    /// a hole.
    pub(crate) fn resolve_block<D: BlockDevice>(
        &self,
        device: &D,
        inode_idx: INodeIndex,
        logical: usize,
    ) -> Result<Option<BlockIndex>> {
        self.block_map(device, inode_idx)?.resolve(logical)
    }

    pub(crate) fn block_map<'a, D: BlockDevice>(
        &self,
        device: &'a D,
        inode_idx: INodeIndex,
    ) -> Result<BlockMap<'a, D>> {
        Ok(BlockMap {
            device,
            inode: *self.get(inode_idx)?,
            pointers: None,
        })
    }

    /// Calls `f` for every block owned by the inode: direct blocks first,
    /// then the indirect block before its entries are read.
    pub(crate) fn visit_blocks<D, F>(&self, device: &D, inode_idx: INodeIndex, mut f: F) -> Result<()>
    where
        D: BlockDevice,
        F: FnMut(Pointer, BlockIndex) -> Result<()>,
    {
        let inode = self.get(inode_idx)?;
        for (idx, block) in inode.direct.iter().enumerate() {
            if let Some(block) = block {
                f(Pointer::Direct(idx), *block)?;
            }
        }
        if let Some(indirect) = inode.indirect {
            f(Pointer::Indirect, indirect)?;
            for (entry, block) in read_pointer_block(device, indirect)?.iter() {
                f(Pointer::IndirectEntry(entry), block)?;
            }
        }
        Ok(())
    }

    pub(crate) fn owned_blocks<D: BlockDevice>(
        &self,
        device: &D,
        inode_idx: INodeIndex,
    ) -> Result<Vec<BlockIndex>> {
        let mut blocks = Vec::new();
        self.visit_blocks(device, inode_idx, |_, block| {
            blocks.push(block);
            Ok(())
        })?;
        Ok(blocks)
    }

    pub(crate) fn plan_create(&self) -> Result<(INodeIndex, Transaction)> {
        let inode = self.first_free()?;
        let mut txn = Transaction::new();
        txn.push(Intent::CreateInode { inode });
        Ok((inode, txn))
    }

    /// Releases every owned block, entries of the indirect block before the
    /// indirect block itself, then frees the slot.
    pub(crate) fn plan_remove<D: BlockDevice>(
        &self,
        device: &D,
        inode: INodeIndex,
    ) -> Result<Transaction> {
        let mut txn = Transaction::new();
        let mut indirect = None;
        self.visit_blocks(device, inode, |pointer, block| {
            if pointer == Pointer::Indirect {
                indirect = Some(block);
            } else {
                txn.push(Intent::Release {
                    inode,
                    pointer,
                    block,
                });
            }
            Ok(())
        })?;
        if let Some(block) = indirect {
            txn.push(Intent::Release {
                inode,
                pointer: Pointer::Indirect,
                block,
            });
        }
        txn.push(Intent::RemoveInode { inode });
        Ok(txn)
    }

    /// Plans writing `buf` at byte `offset`. Blocks that already exist are
    /// patched through `WriteBytes` intents, missing blocks are allocated
    /// from `free_space` and get their initial image in the transaction's
    /// fresh blocks. When the patches do not fit into `payload_capacity`
    /// journal bytes the largest ones are moved to fresh blocks instead. On
    /// failure every allocation made here is rolled back.
    pub(crate) fn plan_write<D: BlockDevice>(
        &self,
        device: &D,
        free_space: &mut FreeSpace,
        inode_idx: INodeIndex,
        buf: &[u8],
        offset: usize,
        payload_capacity: usize,
    ) -> Result<Transaction> {
        let inode = *self.get(inode_idx)?;
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(Error::OffsetOutOfRange)?;
        if buf.is_empty() {
            return Ok(Transaction::new());
        }

        let mut relocate = BTreeSet::new();
        let mut txn = self.plan_write_pass(
            device, free_space, &inode, inode_idx, buf, offset, &relocate,
        )?;
        let excess = txn.encoded_len().saturating_sub(payload_capacity);
        if excess > 0 {
            relocate = relocations_for(&txn.intents, excess);
            log::debug!(
                "write to inode {inode_idx} exceeds the journal by {excess} bytes, moving {} blocks",
                relocate.len()
            );
            free_space.roll_back(&txn.intents);
            txn = self.plan_write_pass(
                device, free_space, &inode, inode_idx, buf, offset, &relocate,
            )?;
        }

        let size = u32::try_from(end).map_err(|_| Error::OffsetOutOfRange)?;
        if size > inode.size {
            txn.push(Intent::SetSize {
                inode: inode_idx,
                size,
            });
        }
        Ok(txn)
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_write_pass<D: BlockDevice>(
        &self,
        device: &D,
        free_space: &mut FreeSpace,
        inode: &INode,
        inode_idx: INodeIndex,
        buf: &[u8],
        offset: usize,
        relocate: &BTreeSet<BlockIndex>,
    ) -> Result<Transaction> {
        let mut txn = Transaction::new();
        if let Err(err) = self.plan_write_blocks(
            device, free_space, inode, inode_idx, buf, offset, relocate, &mut txn,
        ) {
            free_space.roll_back(&txn.intents);
            return Err(err);
        }
        Ok(txn)
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_write_blocks<D: BlockDevice>(
        &self,
        device: &D,
        free_space: &mut FreeSpace,
        inode: &INode,
        inode_idx: INodeIndex,
        buf: &[u8],
        offset: usize,
        relocate: &BTreeSet<BlockIndex>,
        txn: &mut Transaction,
    ) -> Result<()> {
        let end = offset + buf.len();
        let mut indirect = inode.indirect;
        let mut pointers: Option<PointerBlock> = None;

        for logical in offset / BLOCK_SIZE..end.div_ceil(BLOCK_SIZE) {
            let block_start = logical * BLOCK_SIZE;
            let lo = offset.max(block_start) - block_start;
            let hi = end.min(block_start + BLOCK_SIZE) - block_start;
            let src = buf
                .get(block_start + lo - offset..block_start + hi - offset)
                .ok_or(Error::OffsetOutOfRange)?;

            let pointer = pointer_for(logical)?;
            let existing = match pointer {
                Pointer::Direct(idx) => inode.direct.get(idx).copied().flatten(),
                Pointer::IndirectEntry(entry) => match indirect {
                    None => None,
                    Some(indirect) => {
                        if pointers.is_none() {
                            pointers = Some(read_pointer_block(device, indirect)?);
                        }
                        pointers.as_ref().map(|p| p.get(entry)).transpose()?.flatten()
                    }
                },
                Pointer::Indirect => None,
            };

            if let Some(block) = existing.filter(|block| !relocate.contains(block)) {
                txn.push(Intent::WriteBytes {
                    block,
                    offset: u16::try_from(lo).map_err(|_| Error::OffsetOutOfRange)?,
                    bytes: src.to_vec(),
                });
                continue;
            }

            let mut image: Box<Block> = Box::new([0; BLOCK_SIZE]);
            if let Some(block) = existing {
                // copy on write, the old block is freed once installed
                device.read(block, &mut image)?;
                txn.push(Intent::Release {
                    inode: inode_idx,
                    pointer,
                    block,
                });
            } else if matches!(pointer, Pointer::IndirectEntry(_)) && indirect.is_none() {
                let block = free_space.allocate()?;
                txn.push(Intent::Allocate {
                    inode: inode_idx,
                    pointer: Pointer::Indirect,
                    block,
                });
                indirect = Some(block);
                pointers = Some(PointerBlock::empty());
            }

            let block = free_space.allocate()?;
            txn.push(Intent::Allocate {
                inode: inode_idx,
                pointer,
                block,
            });
            image
                .get_mut(lo..hi)
                .ok_or(Error::OffsetOutOfRange)?
                .copy_from_slice(src);
            txn.fresh_blocks.push((block, image));
        }
        Ok(())
    }

    /// Applies committed intents to the table and their target blocks. Every
    /// touched block is staged and written once, dirty inode table blocks
    /// last. Installing the same intents twice gives the same result, which
    /// makes this usable for journal replay.
    pub(crate) fn install<D: BlockDevice>(&mut self, device: &D, intents: &[Intent]) -> Result<()> {
        let mut staged: BTreeMap<BlockIndex, Box<Block>> = BTreeMap::new();
        let mut dirty: BTreeSet<BlockIndex> = BTreeSet::new();

        for intent in intents {
            match intent {
                Intent::CreateInode { inode } => {
                    *self.slot_mut(*inode)? = INode {
                        valid: true,
                        ..INode::default()
                    };
                    dirty.insert(self.layout.calc_inode_block_addr(*inode)?.0);
                }
                Intent::RemoveInode { inode } => {
                    *self.slot_mut(*inode)? = INode::default();
                    dirty.insert(self.layout.calc_inode_block_addr(*inode)?.0);
                }
                Intent::SetSize { inode, size } => {
                    self.slot_mut(*inode)?.size = *size;
                    dirty.insert(self.layout.calc_inode_block_addr(*inode)?.0);
                }
                Intent::Allocate {
                    inode,
                    pointer,
                    block,
                } => {
                    self.check_data_block(*block)?;
                    self.set_pointer(device, &mut staged, *inode, *pointer, Some(*block))?;
                    if *pointer == Pointer::Indirect {
                        staged.insert(*block, Box::new([0; BLOCK_SIZE]));
                    }
                    dirty.insert(self.layout.calc_inode_block_addr(*inode)?.0);
                }
                Intent::Release {
                    inode,
                    pointer,
                    block,
                } => {
                    self.check_data_block(*block)?;
                    self.set_pointer(device, &mut staged, *inode, *pointer, None)?;
                    if *pointer == Pointer::Indirect {
                        staged.insert(*block, Box::new([0; BLOCK_SIZE]));
                    }
                    dirty.insert(self.layout.calc_inode_block_addr(*inode)?.0);
                }
                Intent::WriteBytes {
                    block,
                    offset,
                    bytes,
                } => {
                    self.check_data_block(*block)?;
                    let offset = *offset as usize;
                    stage(device, &mut staged, *block)?
                        .get_mut(offset..offset + bytes.len())
                        .ok_or(Error::CorruptFormat("write past the end of a block"))?
                        .copy_from_slice(bytes);
                }
            }
        }

        for (block_idx, block) in &staged {
            device.write(*block_idx, block)?;
        }
        for block_idx in dirty {
            device.write(block_idx, &self.encode_block(block_idx)?)?;
        }
        Ok(())
    }

    fn check_data_block(&self, block: BlockIndex) -> Result<()> {
        if !self.layout.is_data_block(block) {
            return Err(Error::CorruptFormat("block pointer outside the data region"));
        }
        Ok(())
    }

    fn set_pointer<D: BlockDevice>(
        &mut self,
        device: &D,
        staged: &mut BTreeMap<BlockIndex, Box<Block>>,
        inode_idx: INodeIndex,
        pointer: Pointer,
        block: Option<BlockIndex>,
    ) -> Result<()> {
        let inode = self.slot_mut(inode_idx)?;
        match pointer {
            Pointer::Direct(idx) => {
                *inode
                    .direct
                    .get_mut(idx)
                    .ok_or(Error::CorruptFormat("direct pointer out of range"))? = block;
            }
            Pointer::Indirect => inode.indirect = block,
            Pointer::IndirectEntry(entry) => {
                // already released together with the indirect block
                let Some(indirect) = inode.indirect else {
                    if block.is_none() {
                        return Ok(());
                    }
                    return Err(Error::CorruptFormat("indirect entry without indirect block"));
                };
                let staged_block = stage(device, staged, indirect)?;
                let mut pointers = PointerBlock::read_from_block(staged_block)?;
                pointers.set(entry, block)?;
                **staged_block = pointers.to_block();
            }
        }
        Ok(())
    }

    /// Encodes the inode table block `block_idx` from the in-memory table.
    pub(crate) fn encode_block(&self, block_idx: BlockIndex) -> Result<Block> {
        let table_block = block_idx
            .0
            .checked_sub(1)
            .filter(|idx| *idx < self.layout.inode_blocks)
            .ok_or(Error::CorruptFormat("not an inode table block"))?;
        let first = table_block as usize * INODES_PER_BLOCK as usize;
        let inodes = self
            .inodes
            .get(first..first + INODES_PER_BLOCK as usize)
            .ok_or(Error::CorruptFormat("inode table shorter than its region"))?;

        let mut physical = PhysicalINodeBlock::new_zeroed();
        for (slot, inode) in physical.inodes.iter_mut().zip(inodes) {
            *slot = PhysicalINode::from(inode);
        }
        Ok(physical.to_block())
    }
}

/// Picks the patched blocks to move to fresh blocks so that the intents
/// shrink by at least `excess` bytes, largest patches first. A moved block
/// logs a release and an allocation instead of its bytes.
fn relocations_for(intents: &[Intent], excess: usize) -> BTreeSet<BlockIndex> {
    let mut patches: Vec<(usize, BlockIndex)> = intents
        .iter()
        .filter_map(|intent| match intent {
            Intent::WriteBytes { block, .. } => intent
                .encoded_len()
                .checked_sub(2 * POINTER_INTENT_LEN)
                .filter(|saved| *saved > 0)
                .map(|saved| (saved, *block)),
            _ => None,
        })
        .collect();
    patches.sort_unstable_by(|a, b| b.0.cmp(&a.0));

    let mut saved = 0;
    patches
        .into_iter()
        .take_while(|(patch_saved, _)| {
            let needed = saved < excess;
            saved += patch_saved;
            needed
        })
        .map(|(_, block)| block)
        .collect()
}

/// Resolves the logical blocks of one file, reading its indirect block at
/// most once.
pub(crate) struct BlockMap<'a, D> {
    device: &'a D,
    inode: INode,
    pointers: Option<PointerBlock>,
}

impl<D: BlockDevice> BlockMap<'_, D> {
    pub(crate) fn resolve(&mut self, logical: usize) -> Result<Option<BlockIndex>> {
        match pointer_for(logical)? {
            Pointer::Direct(idx) => Ok(self.inode.direct.get(idx).copied().flatten()),
            Pointer::IndirectEntry(entry) => {
                let Some(indirect) = self.inode.indirect else {
                    return Ok(None);
                };
                if self.pointers.is_none() {
                    self.pointers = Some(read_pointer_block(self.device, indirect)?);
                }
                self.pointers
                    .as_ref()
                    .map(|pointers| pointers.get(entry))
                    .transpose()
                    .map(Option::flatten)
            }
            Pointer::Indirect => Err(Error::OffsetOutOfRange),
        }
    }
}

pub(crate) fn read_pointer_block<D: BlockDevice>(
    device: &D,
    block_idx: BlockIndex,
) -> Result<PointerBlock> {
    let mut block = [0; BLOCK_SIZE];
    device.read(block_idx, &mut block)?;
    PointerBlock::read_from_block(&block)
}

/// Returns the staged copy of `block_idx`, reading it from the device on
/// first use.
fn stage<'a, D: BlockDevice>(
    device: &D,
    staged: &'a mut BTreeMap<BlockIndex, Box<Block>>,
    block_idx: BlockIndex,
) -> Result<&'a mut Box<Block>> {
    if !staged.contains_key(&block_idx) {
        let mut block = Box::new([0; BLOCK_SIZE]);
        device.read(block_idx, &mut block)?;
        staged.insert(block_idx, block);
    }
    staged
        .get_mut(&block_idx)
        .ok_or(Error::CorruptFormat("staged block missing"))
}
