use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockIoError {
    #[cfg(any(feature = "std", test))]
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),
    #[error("block {block_idx} is outside of a device with {block_count} blocks")]
    OutOfRange { block_idx: u32, block_count: u32 },
    /// the device moved fewer bytes than a whole block
    #[error("short transfer on block {block_idx}: {transferred} bytes")]
    PartialTransfer { block_idx: u32, transferred: usize },
    #[error("{0}")]
    Other(&'static str),
}

pub type Result<T> = core::result::Result<T, BlockIoError>;
