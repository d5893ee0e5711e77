use block_io::BlockIoError;
use thiserror::Error;

use crate::INodeIndex;

#[derive(Debug, Error)]
pub enum Error {
    #[error("block device error: {0}")]
    Device(#[from] BlockIoError),
    #[error("super block magic number mismatch")]
    BadMagic,
    #[error("corrupt file system: {0}")]
    CorruptFormat(&'static str),
    #[error("device is already mounted")]
    AlreadyMounted,
    #[error("file system is not mounted")]
    NotMounted,
    #[error("a volume of {block_count} blocks is too small")]
    VolumeTooSmall { block_count: u32 },
    /// the inode index is out of range, or the slot is not in use
    #[error("invalid inode {0}")]
    InvalidInode(INodeIndex),
    #[error("no free inode")]
    NoFreeInode,
    #[error("no free data block")]
    NoSpace,
    #[error("offset out of range")]
    OffsetOutOfRange,
    /// the transaction record does not fit into the free part of the journal
    #[error("journal full")]
    JournalFull,
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(feature = "std")]
impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Device(BlockIoError::StdIoError(err)) => err,
            other => std::io::Error::other(other),
        }
    }
}
