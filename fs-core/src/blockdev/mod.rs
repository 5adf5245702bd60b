//! Image files (or block device nodes) addressed by block number

mod blockdev_trait;

use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

pub use self::blockdev_trait::{Block, BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

/// An ext2 image opened for block I/O.
///
/// Trailing bytes past the last whole block are never touched.
#[derive(Debug)]
pub struct ImageDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    blocks: u64,
    writable: bool,
}

impl ImageDevice {
    /// Create a zero-filled image of `blocks` blocks, replacing any existing file
    pub async fn create(path: impl AsRef<Path>, blocks: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(blocks * BLOCK_SIZE as u64).await?;
        debug!("Created {} with {} blocks", path.display(), blocks);

        Ok(Self { file: Mutex::new(Some(file)), path, blocks, writable: true })
    }

    /// Open an existing image
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(!read_only).open(&path).await?;
        let blocks = byte_len(&path)? / BLOCK_SIZE as u64;
        debug!(
            "Opened {} ({} blocks{})",
            path.display(),
            blocks,
            if read_only { ", read-only" } else { "" }
        );

        Ok(Self { file: Mutex::new(Some(file)), path, blocks, writable: !read_only })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn seek_to(&self, block: u64) -> Result<MappedMutexGuard<'_, File>> {
        if block >= self.blocks {
            return Err(BlockDeviceError::OutOfRange { block, blocks: self.blocks });
        }
        let mut file = self.locked().await?;
        file.seek(SeekFrom::Start(block * BLOCK_SIZE as u64)).await?;
        Ok(file)
    }

    async fn locked(&self) -> Result<MappedMutexGuard<'_, File>> {
        MutexGuard::try_map(self.file.lock().await, Option::as_mut).map_err(|_| BlockDeviceError::Closed)
    }
}

/// Length of a regular file, or of a block device node via `BLKGETSIZE64`
#[cfg(unix)]
fn byte_len(path: &Path) -> Result<u64> {
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::io::AsRawFd;

    const BLKGETSIZE64: libc::c_ulong = 0x80081272;

    let metadata = std::fs::metadata(path)?;
    if !metadata.file_type().is_block_device() {
        return Ok(metadata.len());
    }

    let node = std::fs::File::open(path)?;
    let mut len: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
    if unsafe { libc::ioctl(node.as_raw_fd(), BLKGETSIZE64, &mut len as *mut u64) } == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(len)
}

#[cfg(not(unix))]
fn byte_len(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

#[async_trait]
impl BlockDevice for ImageDevice {
    async fn read_block(&self, block: u64) -> Result<Block> {
        let mut data = [0u8; BLOCK_SIZE];
        self.seek_to(block).await?.read_exact(&mut data).await?;
        Ok(data)
    }

    async fn write_block(&self, block: u64, data: &Block) -> Result<()> {
        if !self.writable {
            return Err(BlockDeviceError::ReadOnly);
        }
        let mut file = self.seek_to(block).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.blocks
    }

    async fn sync(&self) -> Result<()> {
        self.locked().await?.sync_all().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let file = self.file.lock().await.take().ok_or(BlockDeviceError::Closed)?;
        file.sync_all().await?;
        debug!("Closed {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_blocks_land_at_their_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let device = ImageDevice::create(&path, 8).await.unwrap();
        assert_eq!(device.block_count(), 8);
        assert_eq!(device.read_block(7).await.unwrap(), [0u8; BLOCK_SIZE]);

        device.write_block(2, &[0xEF; BLOCK_SIZE]).await.unwrap();
        device.write_block(3, &[0x53; BLOCK_SIZE]).await.unwrap();
        device.close().await.unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 8 * BLOCK_SIZE);
        assert!(raw[2 * BLOCK_SIZE..3 * BLOCK_SIZE].iter().all(|&b| b == 0xEF));
        assert!(raw[3 * BLOCK_SIZE..4 * BLOCK_SIZE].iter().all(|&b| b == 0x53));
        assert!(raw[..2 * BLOCK_SIZE].iter().all(|&b| b == 0));

        assert!(matches!(
            device.read_block(0).await,
            Err(BlockDeviceError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_trailing_partial_block_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("odd.img");
        std::fs::write(&path, vec![0x11u8; 3 * BLOCK_SIZE + 100]).unwrap();

        let device = ImageDevice::open(&path, false).await.unwrap();
        assert_eq!(device.block_count(), 3);
        assert_eq!(device.read_block(2).await.unwrap(), [0x11; BLOCK_SIZE]);
        assert!(matches!(
            device.read_block(3).await,
            Err(BlockDeviceError::OutOfRange { block: 3, blocks: 3 })
        ));
    }

    #[tokio::test]
    async fn test_read_only_image_refuses_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.img");
        ImageDevice::create(&path, 2).await.unwrap().close().await.unwrap();

        let device = ImageDevice::open(&path, true).await.unwrap();
        assert!(matches!(
            device.write_block(1, &[1; BLOCK_SIZE]).await,
            Err(BlockDeviceError::ReadOnly)
        ));
        assert_eq!(device.path(), path.as_path());
        device.close().await.unwrap();
        assert!(matches!(device.close().await, Err(BlockDeviceError::Closed)));
    }
}
