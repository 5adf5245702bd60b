//! Write-through block cache sitting between a mounted device and its accessor

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrayref::array_ref;
use lru::LruCache;
use parking_lot::Mutex;

use crate::blockdev::{Block, BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

/// Hit/miss counters, useful when tuning `block_cache_blocks`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from memory
    pub hits: u64,
    /// Reads that went to the device
    pub misses: u64,
}

/// A fixed-capacity LRU of recently used blocks.
///
/// Every write goes to the device before the cache is updated, so the image
/// on disk is always current and dropping the cache never loses data.
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    cache: Mutex<LruCache<u64, Box<Block>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    /// Create a cache holding at most `capacity` blocks (minimum one)
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            device,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The device behind this cache
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Read a block from the cache or device
    pub async fn read_block(&self, block_num: u64) -> Result<Block> {
        let blocks = self.device.block_count();
        if block_num >= blocks {
            return Err(BlockDeviceError::OutOfRange { block: block_num, blocks });
        }

        if let Some(block) = self.cache.lock().get(&block_num) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(**block);
        }

        let block = self.device.read_block(block_num).await?;
        self.misses.fetch_add(1, Ordering::Relaxed);

        self.cache.lock().put(block_num, Box::new(block));
        Ok(block)
    }

    /// Write a block through to the device, then refresh the cached copy
    pub async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::PartialBlock(data.len()));
        }
        let block = *array_ref!(data, 0, BLOCK_SIZE);

        self.device.write_block(block_num, &block).await?;
        self.cache.lock().put(block_num, Box::new(block));
        Ok(())
    }

    /// Sync the underlying device
    pub async fn sync(&self) -> Result<()> {
        self.device.sync().await
    }

    /// Drop every cached block
    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    /// Snapshot of the hit/miss counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("cached", &self.cache.lock().len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::ImageDevice;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_cache_is_write_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.img");
        let device = Arc::new(
            ImageDevice::create(&path, 4).await.unwrap(),
        );
        let cache = BlockCache::new(device.clone(), 2);

        cache.write_block(1, &[0xAA; BLOCK_SIZE]).await.unwrap();

        // Visible on the device without any flush.
        assert_eq!(device.read_block(1).await.unwrap(), [0xAA; BLOCK_SIZE]);

        assert_eq!(cache.read_block(1).await.unwrap(), [0xAA; BLOCK_SIZE]);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 0 });
    }

    #[tokio::test]
    async fn test_cache_eviction_rereads_device() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evict.img");
        let device = Arc::new(
            ImageDevice::create(&path, 4).await.unwrap(),
        );
        let cache = BlockCache::new(device, 2);

        for i in 0..3u64 {
            cache.write_block(i, &[i as u8 + 1; BLOCK_SIZE]).await.unwrap();
        }

        // Block 0 was evicted but must still read back from the device.
        assert_eq!(cache.read_block(0).await.unwrap(), [1u8; BLOCK_SIZE]);
        assert_eq!(cache.stats().misses, 1);
        assert!(matches!(
            cache.read_block(4).await,
            Err(BlockDeviceError::OutOfRange { block: 4, blocks: 4 })
        ));
        assert!(matches!(
            cache.write_block(1, &[0u8; 512]).await,
            Err(BlockDeviceError::PartialBlock(512))
        ));
    }
}
