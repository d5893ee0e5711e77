use block_io::{BLOCK_SIZE, BlockDevice, BlockIndex};

use crate::{Result, SuperBlock, journal::Journal, layout::Layout};

pub struct FormatVolumeOptions {
    /// Size of the journal region in blocks, `None` uses
    /// `max(block_count / JOURNAL_PERCENT, DEFAULT_MIN_JOURNAL_BLOCKS)`.
    /// Sizes too small for the largest transaction of the volume, at least
    /// `MIN_JOURNAL_BLOCKS`, are raised.
    pub journal_blocks: Option<u32>,
}

impl FormatVolumeOptions {
    pub fn new() -> Self {
        Self {
            journal_blocks: None,
        }
    }

    pub fn journal_blocks(mut self, journal_blocks: u32) -> Self {
        self.journal_blocks = Some(journal_blocks);
        self
    }
}

/// Writes an empty file system to `device`, destroying its contents. The
/// device must not be mounted.
pub fn format_volume<D: BlockDevice>(
    device: &D,
    options: &FormatVolumeOptions,
) -> Result<SuperBlock> {
    let block_count = device.block_count();
    let layout = Layout::new(block_count, options.journal_blocks)?;
    let super_block = layout.super_block();

    // write super block
    device.write(BlockIndex(0), &super_block.to_block()?)?;

    // the inode table, the journal ring and the data blocks all start zeroed
    let zero = [0; BLOCK_SIZE];
    for block_idx in (1..block_count).map(BlockIndex) {
        if block_idx != layout.journal_start {
            device.write(block_idx, &zero)?;
        }
    }

    Journal::format(device, &layout)?;

    log::info!(
        "formatted volume: {} blocks, {} inodes, {} journal blocks, {} data blocks",
        super_block.block_count,
        super_block.inode_count,
        super_block.journal_blocks,
        layout.data_block_count()
    );
    Ok(super_block)
}

#[cfg(test)]
mod tests {
    use block_io::RamDisk;

    use super::*;
    use crate::{Error, physical::MAGIC};

    #[test]
    fn test_minimums() {
        let device = RamDisk::new(20);
        let super_block = format_volume(&device, &FormatVolumeOptions::new()).unwrap();
        assert_eq!(
            SuperBlock {
                block_count: 20,
                inode_blocks: 2,
                inode_count: 256,
                journal_blocks: 4,
            },
            super_block
        );

        let image = device.image();
        assert_eq!(MAGIC.to_le_bytes(), image[0..4]);
        // inode table
        assert!(image[BLOCK_SIZE..3 * BLOCK_SIZE].iter().all(|b| *b == 0));
        // journal header
        assert_eq!(
            crate::journal::JOURNAL_MAGIC.to_le_bytes(),
            image[3 * BLOCK_SIZE..3 * BLOCK_SIZE + 4]
        );
        // journal ring and data
        assert!(image[4 * BLOCK_SIZE..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_format_is_idempotent() {
        let device = RamDisk::new(64);
        format_volume(&device, &FormatVolumeOptions::new().journal_blocks(8)).unwrap();
        let first = device.image();

        device.write(BlockIndex(40), &[0xee; BLOCK_SIZE]).unwrap();
        device.write(BlockIndex(2), &[0xee; BLOCK_SIZE]).unwrap();
        format_volume(&device, &FormatVolumeOptions::new().journal_blocks(8)).unwrap();
        assert_eq!(first, device.image());
    }

    #[test]
    fn test_too_small() {
        let device = RamDisk::new(5);
        assert!(matches!(
            format_volume(&device, &FormatVolumeOptions::new()),
            Err(Error::VolumeTooSmall { block_count: 5 })
        ));
        // nothing was written
        assert_eq!(0, device.stats().writes);
    }
}
