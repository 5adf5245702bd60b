//! The block-addressed storage seam every mounted image sits on

use std::io;
use thiserror::Error;

/// Bytes per block; images are always formatted with 1 KiB blocks
pub const BLOCK_SIZE: usize = 1024;

/// One block as it sits on the image
pub type Block = [u8; BLOCK_SIZE];

#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("image I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("block {block} is past the end of a {blocks}-block image")]
    OutOfRange { block: u64, blocks: u64 },
    #[error("buffer of {0} bytes is not a whole block")]
    PartialBlock(usize),
    #[error("image was opened read-only")]
    ReadOnly,
    #[error("image is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Whole-block reads and writes against an image.
///
/// Block `n` lives at byte offset `n * BLOCK_SIZE`. Implementations reject
/// block numbers at or past [`BlockDevice::block_count`].
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    async fn read_block(&self, block: u64) -> Result<Block>;

    async fn write_block(&self, block: u64, data: &Block) -> Result<()>;

    /// Number of whole blocks on the image
    fn block_count(&self) -> u64;

    /// Push written blocks to stable storage
    async fn sync(&self) -> Result<()>;

    /// Sync and release the image; every later call fails with `Closed`
    async fn close(&self) -> Result<()>;
}
