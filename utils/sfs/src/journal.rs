use alloc::{boxed::Box, vec, vec::Vec};

use block_io::{BLOCK_SIZE, Block, BlockDevice, BlockIndex};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    little_endian::{U16, U32, U64},
};

use crate::{
    Error, INodeIndex, MAX_FILE_BLOCKS, Result,
    inode::InodeTable,
    layout::{Layout, MIN_JOURNAL_BLOCKS},
};

pub const JOURNAL_MAGIC: u32 = 0x4a524e4c;
const RECORD_MAGIC: u32 = 0x5245434f;

const RECORD_BEGIN: u8 = 1;
const RECORD_COMMIT: u8 = 2;

const TAG_CREATE_INODE: u8 = 1;
const TAG_REMOVE_INODE: u8 = 2;
const TAG_ALLOCATE: u8 = 3;
const TAG_RELEASE: u8 = 4;
const TAG_WRITE_BYTES: u8 = 5;
const TAG_SET_SIZE: u8 = 6;

const POINTER_DIRECT: u8 = 0;
const POINTER_INDIRECT: u8 = 1;
const POINTER_INDIRECT_ENTRY: u8 = 2;

/// A block pointer slot of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pointer {
    Direct(usize),
    Indirect,
    /// entry of the inode's indirect block
    IndirectEntry(usize),
}

impl Pointer {
    fn encode(self) -> Result<(u8, U16)> {
        let (kind, index) = match self {
            Pointer::Direct(idx) => (POINTER_DIRECT, idx),
            Pointer::Indirect => (POINTER_INDIRECT, 0),
            Pointer::IndirectEntry(idx) => (POINTER_INDIRECT_ENTRY, idx),
        };
        let index = u16::try_from(index).map_err(|_| Error::OffsetOutOfRange)?;
        Ok((kind, U16::new(index)))
    }

    fn decode(kind: u8, index: U16) -> Result<Self> {
        let index = index.get() as usize;
        match kind {
            POINTER_DIRECT => Ok(Pointer::Direct(index)),
            POINTER_INDIRECT => Ok(Pointer::Indirect),
            POINTER_INDIRECT_ENTRY => Ok(Pointer::IndirectEntry(index)),
            _ => Err(Error::CorruptFormat("unknown pointer kind in journal")),
        }
    }
}

/// One typed mutation of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Intent {
    CreateInode {
        inode: INodeIndex,
    },
    RemoveInode {
        inode: INodeIndex,
    },
    Allocate {
        inode: INodeIndex,
        pointer: Pointer,
        block: BlockIndex,
    },
    Release {
        inode: INodeIndex,
        pointer: Pointer,
        block: BlockIndex,
    },
    WriteBytes {
        block: BlockIndex,
        offset: u16,
        bytes: Vec<u8>,
    },
    SetSize {
        inode: INodeIndex,
        size: u32,
    },
}

#[repr(C, packed)]
#[derive(Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct PhysicalInodeIntent {
    inode: U32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct PhysicalPointerIntent {
    inode: U32,
    kind: u8,
    index: U16,
    block: U32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct PhysicalWriteBytesIntent {
    block: U32,
    offset: U16,
    len: U16,
}

#[repr(C, packed)]
#[derive(Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct PhysicalSetSizeIntent {
    inode: U32,
    size: U32,
}

fn truncated() -> Error {
    Error::CorruptFormat("truncated journal intent")
}

impl Intent {
    /// Number of payload bytes the intent takes in a begin record.
    pub(crate) fn encoded_len(&self) -> usize {
        1 + match self {
            Intent::CreateInode { .. } | Intent::RemoveInode { .. } => {
                size_of::<PhysicalInodeIntent>()
            }
            Intent::Allocate { .. } | Intent::Release { .. } => size_of::<PhysicalPointerIntent>(),
            Intent::WriteBytes { bytes, .. } => size_of::<PhysicalWriteBytesIntent>() + bytes.len(),
            Intent::SetSize { .. } => size_of::<PhysicalSetSizeIntent>(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Intent::CreateInode { inode } => {
                out.push(TAG_CREATE_INODE);
                out.extend_from_slice(PhysicalInodeIntent { inode: U32::new(inode.0) }.as_bytes());
            }
            Intent::RemoveInode { inode } => {
                out.push(TAG_REMOVE_INODE);
                out.extend_from_slice(PhysicalInodeIntent { inode: U32::new(inode.0) }.as_bytes());
            }
            Intent::Allocate {
                inode,
                pointer,
                block,
            }
            | Intent::Release {
                inode,
                pointer,
                block,
            } => {
                out.push(if matches!(self, Intent::Allocate { .. }) {
                    TAG_ALLOCATE
                } else {
                    TAG_RELEASE
                });
                let (kind, index) = pointer.encode()?;
                let body = PhysicalPointerIntent {
                    inode: U32::new(inode.0),
                    kind,
                    index,
                    block: U32::new(block.0),
                };
                out.extend_from_slice(body.as_bytes());
            }
            Intent::WriteBytes {
                block,
                offset,
                bytes,
            } => {
                out.push(TAG_WRITE_BYTES);
                let len = u16::try_from(bytes.len()).map_err(|_| Error::OffsetOutOfRange)?;
                let body = PhysicalWriteBytesIntent {
                    block: U32::new(block.0),
                    offset: U16::new(*offset),
                    len: U16::new(len),
                };
                out.extend_from_slice(body.as_bytes());
                out.extend_from_slice(bytes);
            }
            Intent::SetSize { inode, size } => {
                out.push(TAG_SET_SIZE);
                let body = PhysicalSetSizeIntent {
                    inode: U32::new(inode.0),
                    size: U32::new(*size),
                };
                out.extend_from_slice(body.as_bytes());
            }
        }
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8])> {
        let (tag, rest) = buf.split_first().ok_or_else(truncated)?;
        match *tag {
            TAG_CREATE_INODE | TAG_REMOVE_INODE => {
                let (body, rest) =
                    PhysicalInodeIntent::read_from_prefix(rest).map_err(|_| truncated())?;
                let inode = INodeIndex(body.inode.get());
                let intent = if *tag == TAG_CREATE_INODE {
                    Intent::CreateInode { inode }
                } else {
                    Intent::RemoveInode { inode }
                };
                Ok((intent, rest))
            }
            TAG_ALLOCATE | TAG_RELEASE => {
                let (body, rest) =
                    PhysicalPointerIntent::read_from_prefix(rest).map_err(|_| truncated())?;
                let inode = INodeIndex(body.inode.get());
                let pointer = Pointer::decode(body.kind, body.index)?;
                let block = BlockIndex(body.block.get());
                let intent = if *tag == TAG_ALLOCATE {
                    Intent::Allocate {
                        inode,
                        pointer,
                        block,
                    }
                } else {
                    Intent::Release {
                        inode,
                        pointer,
                        block,
                    }
                };
                Ok((intent, rest))
            }
            TAG_WRITE_BYTES => {
                let (body, rest) =
                    PhysicalWriteBytesIntent::read_from_prefix(rest).map_err(|_| truncated())?;
                let (bytes, rest) = rest
                    .split_at_checked(body.len.get() as usize)
                    .ok_or_else(truncated)?;
                let intent = Intent::WriteBytes {
                    block: BlockIndex(body.block.get()),
                    offset: body.offset.get(),
                    bytes: bytes.to_vec(),
                };
                Ok((intent, rest))
            }
            TAG_SET_SIZE => {
                let (body, rest) =
                    PhysicalSetSizeIntent::read_from_prefix(rest).map_err(|_| truncated())?;
                let intent = Intent::SetSize {
                    inode: INodeIndex(body.inode.get()),
                    size: body.size.get(),
                };
                Ok((intent, rest))
            }
            _ => Err(Error::CorruptFormat("unknown journal intent")),
        }
    }
}

fn encode_intents(intents: &[Intent]) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    for intent in intents {
        intent.encode(&mut payload)?;
    }
    Ok(payload)
}

fn decode_intents(mut payload: &[u8], count: u32) -> Result<Vec<Intent>> {
    let mut intents = Vec::new();
    for _ in 0..count {
        let (intent, rest) = Intent::decode(payload)?;
        intents.push(intent);
        payload = rest;
    }
    if !payload.is_empty() {
        return Err(Error::CorruptFormat("trailing bytes after journal intents"));
    }
    Ok(intents)
}

/// The planned changes of one mutating call.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub intents: Vec<Intent>,
    /// Newly allocated blocks with their complete initial contents. They are
    /// written in place before the begin record, nothing references them
    /// until the transaction is installed.
    pub fresh_blocks: Vec<(BlockIndex, Box<Block>)>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, intent: Intent) {
        self.intents.push(intent);
    }

    /// Size of the begin record payload of this transaction.
    pub(crate) fn encoded_len(&self) -> usize {
        self.intents.iter().map(Intent::encoded_len).sum()
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct PhysicalJournalHeader {
    magic: U32,
    /// number of blocks in the ring following the header
    ring_len: U32,
    /// every record before this position is installed
    checkpoint: U64,
    next_txn: U64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct PhysicalRecordHeader {
    magic: U32,
    kind: u8,
    reserved: [u8; 3],
    txn_id: U64,
    /// absolute log position of the block holding this header
    position: U64,
    intent_count: U32,
    payload_len: U32,
}

const RECORD_HEADER_SIZE: usize = size_of::<PhysicalRecordHeader>();

/// Encoded size of an `Allocate` or `Release` intent.
pub(crate) const POINTER_INTENT_LEN: usize = 1 + size_of::<PhysicalPointerIntent>();
const SET_SIZE_INTENT_LEN: usize = 1 + size_of::<PhysicalSetSizeIntent>();

/// Smallest journal region, header included, whose ring holds the largest
/// transaction a volume of `block_count` blocks can log: a write that moves
/// every block of a full size file, allocates the indirect block and grows
/// the file. Removing a file logs fewer intents than that.
pub(crate) fn min_journal_blocks(block_count: u32) -> u32 {
    let file_blocks = MAX_FILE_BLOCKS.min(block_count as usize);
    let payload = (2 * file_blocks + 1) * POINTER_INTENT_LEN + SET_SIZE_INTENT_LEN;
    let record_blocks = (RECORD_HEADER_SIZE + payload).div_ceil(BLOCK_SIZE);
    // header, begin record, commit record
    u32::try_from(record_blocks + 2)
        .unwrap_or(u32::MAX)
        .max(MIN_JOURNAL_BLOCKS)
}

/// A transaction whose begin record is in the log.
#[derive(Debug)]
pub(crate) struct PendingTxn {
    id: u64,
}

impl PendingTxn {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecoveryReport {
    pub replayed: usize,
    pub discarded: usize,
}

/// Write-ahead log kept in the journal region.
///
/// The first block of the region is the header, the others form a ring
/// addressed by an ever increasing position. Records start on a block
/// boundary, a begin record holds the encoded intents of a transaction and
/// is followed by a one block commit record.
#[derive(Debug)]
pub(crate) struct Journal {
    header_block: BlockIndex,
    ring_start: u32,
    ring_len: u32,
    checkpoint: u64,
    head: u64,
    next_txn: u64,
}

impl Journal {
    fn new(layout: &Layout, checkpoint: u64, next_txn: u64) -> Self {
        Self {
            header_block: layout.journal_start,
            ring_start: layout.journal_start.0 + 1,
            ring_len: layout.journal_blocks - 1,
            checkpoint,
            head: checkpoint,
            next_txn,
        }
    }

    /// Writes an empty log header.
    pub(crate) fn format<D: BlockDevice>(device: &D, layout: &Layout) -> Result<Self> {
        let journal = Self::new(layout, 0, 1);
        journal.write_header(device)?;
        Ok(journal)
    }

    pub(crate) fn open<D: BlockDevice>(device: &D, layout: &Layout) -> Result<Self> {
        let mut block = [0; BLOCK_SIZE];
        device.read(layout.journal_start, &mut block)?;
        let (header, _) = PhysicalJournalHeader::read_from_prefix(&block)
            .map_err(|_| Error::CorruptFormat("journal header does not fit in a block"))?;
        if header.magic.get() != JOURNAL_MAGIC {
            return Err(Error::CorruptFormat("journal header magic mismatch"));
        }
        if header.ring_len.get() != layout.journal_blocks - 1 {
            return Err(Error::CorruptFormat("journal size does not match super block"));
        }
        Ok(Self::new(
            layout,
            header.checkpoint.get(),
            header.next_txn.get(),
        ))
    }

    fn write_header<D: BlockDevice>(&self, device: &D) -> Result<()> {
        let header = PhysicalJournalHeader {
            magic: U32::new(JOURNAL_MAGIC),
            ring_len: U32::new(self.ring_len),
            checkpoint: U64::new(self.checkpoint),
            next_txn: U64::new(self.next_txn),
        };
        let mut block = [0; BLOCK_SIZE];
        header
            .write_to_prefix(&mut block)
            .map_err(|_| Error::CorruptFormat("journal header does not fit in a block"))?;
        device.write(self.header_block, &block)?;
        Ok(())
    }

    fn ring_block(&self, position: u64) -> Result<BlockIndex> {
        let slot = u32::try_from(position % u64::from(self.ring_len))
            .map_err(|_| Error::CorruptFormat("journal position"))?;
        Ok(BlockIndex(self.ring_start + slot))
    }

    fn free_blocks(&self) -> u64 {
        u64::from(self.ring_len).saturating_sub(self.head - self.checkpoint)
    }

    /// Largest intent payload a begin record can carry, leaving room for
    /// its commit record.
    pub(crate) fn payload_capacity(&self) -> usize {
        let record_blocks =
            usize::try_from(self.free_blocks().saturating_sub(1)).unwrap_or(usize::MAX);
        record_blocks
            .saturating_mul(BLOCK_SIZE)
            .saturating_sub(RECORD_HEADER_SIZE)
    }

    fn record_header(block: &Block, position: u64) -> Option<PhysicalRecordHeader> {
        let (header, _) = PhysicalRecordHeader::read_from_prefix(block).ok()?;
        if header.magic.get() != RECORD_MAGIC || header.position.get() != position {
            return None;
        }
        Some(header)
    }

    /// Appends the begin record of a transaction. Fails with `JournalFull`
    /// before writing anything when the record and its commit do not fit.
    pub(crate) fn begin<D: BlockDevice>(
        &mut self,
        device: &D,
        intents: &[Intent],
    ) -> Result<PendingTxn> {
        let payload = encode_intents(intents)?;
        let record_len = RECORD_HEADER_SIZE + payload.len();
        let block_count = record_len.div_ceil(BLOCK_SIZE);
        if block_count as u64 + 1 > self.free_blocks() {
            return Err(Error::JournalFull);
        }

        let id = self.next_txn;
        let header = PhysicalRecordHeader {
            magic: U32::new(RECORD_MAGIC),
            kind: RECORD_BEGIN,
            reserved: [0; 3],
            txn_id: U64::new(id),
            position: U64::new(self.head),
            intent_count: U32::new(u32::try_from(intents.len()).map_err(|_| Error::JournalFull)?),
            payload_len: U32::new(u32::try_from(payload.len()).map_err(|_| Error::JournalFull)?),
        };
        let mut record = vec![0; block_count * BLOCK_SIZE];
        header
            .write_to_prefix(&mut record)
            .map_err(|_| Error::JournalFull)?;
        record
            .get_mut(RECORD_HEADER_SIZE..record_len)
            .ok_or(Error::JournalFull)?
            .copy_from_slice(&payload);

        for (position, chunk) in (self.head..).zip(record.chunks_exact(BLOCK_SIZE)) {
            let block: &Block = chunk
                .try_into()
                .map_err(|_| Error::CorruptFormat("journal record chunk"))?;
            device.write(self.ring_block(position)?, block)?;
        }

        self.head += block_count as u64;
        self.next_txn += 1;
        log::trace!(
            "transaction {id}: begin record of {block_count} blocks, {} intents",
            intents.len()
        );
        Ok(PendingTxn { id })
    }

    /// Appends the commit record, once written the transaction survives a
    /// crash.
    pub(crate) fn commit<D: BlockDevice>(&mut self, device: &D, txn: PendingTxn) -> Result<()> {
        let header = PhysicalRecordHeader {
            magic: U32::new(RECORD_MAGIC),
            kind: RECORD_COMMIT,
            reserved: [0; 3],
            txn_id: U64::new(txn.id),
            position: U64::new(self.head),
            intent_count: U32::new(0),
            payload_len: U32::new(0),
        };
        let mut block = [0; BLOCK_SIZE];
        header
            .write_to_prefix(&mut block)
            .map_err(|_| Error::CorruptFormat("journal record header does not fit in a block"))?;
        device.write(self.ring_block(self.head)?, &block)?;
        self.head += 1;
        Ok(())
    }

    /// Marks every record appended so far as installed.
    pub(crate) fn checkpoint<D: BlockDevice>(&mut self, device: &D) -> Result<()> {
        self.checkpoint = self.head;
        self.write_header(device)
    }

    /// Replays every committed transaction after the checkpoint into
    /// `inodes`, then moves the checkpoint past them.
    pub(crate) fn recover<D: BlockDevice>(
        &mut self,
        device: &D,
        inodes: &mut InodeTable,
    ) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let end = self.checkpoint + u64::from(self.ring_len);
        let mut last_txn = self.next_txn.saturating_sub(1);
        let mut position = self.checkpoint;
        let mut block = [0; BLOCK_SIZE];

        while position < end {
            device.read(self.ring_block(position)?, &mut block)?;
            let Some(header) = Self::record_header(&block, position) else {
                break;
            };
            if header.kind != RECORD_BEGIN {
                break;
            }
            let txn_id = header.txn_id.get();
            last_txn = last_txn.max(txn_id);

            let payload_len = header.payload_len.get() as usize;
            let block_count = (RECORD_HEADER_SIZE + payload_len).div_ceil(BLOCK_SIZE);
            let commit_position = position + block_count as u64;
            if commit_position >= end {
                log::warn!("discarding transaction {txn_id}, record overruns the journal");
                report.discarded += 1;
                break;
            }

            let mut record = Vec::with_capacity(block_count * BLOCK_SIZE);
            record.extend_from_slice(&block);
            for record_position in position + 1..commit_position {
                device.read(self.ring_block(record_position)?, &mut block)?;
                record.extend_from_slice(&block);
            }

            device.read(self.ring_block(commit_position)?, &mut block)?;
            let committed = Self::record_header(&block, commit_position)
                .is_some_and(|commit| commit.kind == RECORD_COMMIT && commit.txn_id.get() == txn_id);
            if !committed {
                log::warn!("discarding uncommitted transaction {txn_id}");
                report.discarded += 1;
                position = commit_position;
                break;
            }

            let payload = record
                .get(RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload_len)
                .ok_or_else(truncated)?;
            let intents = decode_intents(payload, header.intent_count.get())?;
            inodes.install(device, &intents)?;
            log::debug!("replayed transaction {txn_id}, {} intents", intents.len());
            report.replayed += 1;
            position = commit_position + 1;
        }

        self.head = position;
        self.checkpoint = position;
        self.next_txn = self.next_txn.max(last_txn + 1);
        self.write_header(device)?;
        Ok(report)
    }
}
