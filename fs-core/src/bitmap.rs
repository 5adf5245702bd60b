//! Bitmap allocator for inodes and blocks
//!
//! Both bitmaps occupy a single block (single-group images only). Allocation
//! is first-fit in ascending bit order. Each allocate or free rewrites the
//! bitmap block and then both redundant free counters: the superblock copy
//! and the group descriptor copy.

use crate::blockdev::BLOCK_SIZE;
use crate::error::{FsError, Result};
use crate::format::{GroupDesc, Superblock, BITS_PER_BLOCK, GROUP_DESC_BLOCK, RESERVED_INODES, SUPERBLOCK_BLOCK};
use crate::mount::Device;

/// Test bit `bit` of a bitmap buffer
pub fn test_bit(buf: &[u8], bit: usize) -> bool {
    buf[bit / 8] & (1 << (bit % 8)) != 0
}

/// Set bit `bit` of a bitmap buffer
pub fn set_bit(buf: &mut [u8], bit: usize) {
    buf[bit / 8] |= 1 << (bit % 8);
}

/// Clear bit `bit` of a bitmap buffer
pub fn clear_bit(buf: &mut [u8], bit: usize) {
    buf[bit / 8] &= !(1 << (bit % 8));
}

fn first_clear(buf: &[u8], range: std::ops::Range<usize>) -> Option<usize> {
    range.into_iter().find(|&bit| !test_bit(buf, bit))
}

impl Device {
    /// Highest inode bit this device can hand out (exclusive)
    fn inode_bits(&self) -> usize {
        self.geometry().ninodes.min(BITS_PER_BLOCK) as usize
    }

    /// Highest block bit this device can hand out (exclusive)
    fn block_bits(&self) -> usize {
        let geo = self.geometry();
        geo.nblocks.saturating_sub(geo.first_data_block).min(BITS_PER_BLOCK) as usize
    }

    /// Allocate the lowest free inode past the reserved range
    pub async fn allocate_inode(&self) -> Result<u32> {
        let imap_block = self.geometry().inode_bitmap;
        let mut buf = self.read_block(imap_block).await?;

        let bit = first_clear(&buf, RESERVED_INODES as usize..self.inode_bits()).ok_or(FsError::NoFreeInodes)?;
        set_bit(&mut buf, bit);
        self.write_block(imap_block, &buf).await?;
        self.adjust_free_counts(-1, 0).await?;

        let ino = bit as u32 + 1;
        log::debug!("BITMAP: {} allocated inode {}", self.id(), ino);
        Ok(ino)
    }

    /// Return an inode to the free pool
    pub async fn free_inode(&self, ino: u32) -> Result<()> {
        if ino == 0 || ino as usize > self.inode_bits() {
            log::warn!("BITMAP: {} free of inode {} out of range ignored", self.id(), ino);
            return Ok(());
        }

        let imap_block = self.geometry().inode_bitmap;
        let mut buf = self.read_block(imap_block).await?;
        let bit = (ino - 1) as usize;
        if !test_bit(&buf, bit) {
            log::warn!("BITMAP: {} inode {} is already free", self.id(), ino);
            return Ok(());
        }

        clear_bit(&mut buf, bit);
        self.write_block(imap_block, &buf).await?;
        self.adjust_free_counts(1, 0).await?;
        log::debug!("BITMAP: {} freed inode {}", self.id(), ino);
        Ok(())
    }

    /// Allocate the lowest free block; its contents are zeroed
    pub async fn allocate_block(&self) -> Result<u32> {
        let bmap_block = self.geometry().block_bitmap;
        let mut buf = self.read_block(bmap_block).await?;

        let bit = first_clear(&buf, 0..self.block_bits()).ok_or(FsError::NoFreeBlocks)?;
        set_bit(&mut buf, bit);
        self.write_block(bmap_block, &buf).await?;
        self.adjust_free_counts(0, -1).await?;

        let block = bit as u32 + self.geometry().first_data_block;
        self.write_block(block, &[0u8; BLOCK_SIZE]).await?;
        log::debug!("BITMAP: {} allocated block {}", self.id(), block);
        Ok(block)
    }

    /// Return a block to the free pool
    pub async fn free_block(&self, block: u32) -> Result<()> {
        let first = self.geometry().first_data_block;
        if block < first || (block - first) as usize >= self.block_bits() {
            log::warn!("BITMAP: {} free of block {} out of range ignored", self.id(), block);
            return Ok(());
        }

        let bmap_block = self.geometry().block_bitmap;
        let mut buf = self.read_block(bmap_block).await?;
        let bit = (block - first) as usize;
        if !test_bit(&buf, bit) {
            log::warn!("BITMAP: {} block {} is already free", self.id(), block);
            return Ok(());
        }

        clear_bit(&mut buf, bit);
        self.write_block(bmap_block, &buf).await?;
        self.adjust_free_counts(0, 1).await?;
        log::debug!("BITMAP: {} freed block {}", self.id(), block);
        Ok(())
    }

    /// Apply the same delta to the superblock and group descriptor counters
    async fn adjust_free_counts(&self, inodes: i32, blocks: i32) -> Result<()> {
        let mut raw = self.read_block(SUPERBLOCK_BLOCK as u32).await?;
        let mut sb = Superblock::decode(&raw);
        sb.free_inodes_count = sb.free_inodes_count.saturating_add_signed(inodes);
        sb.free_blocks_count = sb.free_blocks_count.saturating_add_signed(blocks);
        sb.encode_into(&mut raw);
        self.write_block(SUPERBLOCK_BLOCK as u32, &raw).await?;

        let mut raw = self.read_block(GROUP_DESC_BLOCK as u32).await?;
        let mut gd = GroupDesc::decode(&raw);
        gd.free_inodes_count = gd.free_inodes_count.saturating_add_signed(inodes as i16);
        gd.free_blocks_count = gd.free_blocks_count.saturating_add_signed(blocks as i16);
        gd.encode_into(&mut raw);
        self.write_block(GROUP_DESC_BLOCK as u32, &raw).await?;
        Ok(())
    }

    /// Track directory creation and removal in the group descriptor
    pub async fn adjust_used_dirs(&self, delta: i16) -> Result<()> {
        let mut raw = self.read_block(GROUP_DESC_BLOCK as u32).await?;
        let mut gd = GroupDesc::decode(&raw);
        gd.used_dirs_count = gd.used_dirs_count.saturating_add_signed(delta);
        gd.encode_into(&mut raw);
        self.write_block(GROUP_DESC_BLOCK as u32, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::format_image;
    use crate::mount::DeviceId;
    use std::collections::HashSet;
    use tempfile::{tempdir, TempDir};

    async fn fresh_device(blocks: u32, inodes: u32) -> (TempDir, Device) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bitmap.img");
        format_image(&path, blocks, inodes).await.unwrap();
        let device = Device::open(DeviceId(0), &path, "/", 32).await.unwrap();
        (dir, device)
    }

    async fn counters(device: &Device) -> (u32, u32, u16, u16) {
        let sb = device.read_superblock().await.unwrap();
        let gd = device.read_group_desc().await.unwrap();
        (sb.free_inodes_count, sb.free_blocks_count, gd.free_inodes_count, gd.free_blocks_count)
    }

    #[test]
    fn test_bit_primitives() {
        let mut buf = [0u8; 4];
        set_bit(&mut buf, 0);
        set_bit(&mut buf, 9);
        assert_eq!(buf, [0b0000_0001, 0b0000_0010, 0, 0]);
        assert!(test_bit(&buf, 9));
        clear_bit(&mut buf, 9);
        assert!(!test_bit(&buf, 9));
        assert_eq!(first_clear(&buf, 0..32), Some(1));
    }

    #[tokio::test]
    async fn test_inode_allocate_free_round_trip() {
        let (_dir, device) = fresh_device(256, 32).await;
        let before = counters(&device).await;

        let ino = device.allocate_inode().await.unwrap();
        assert_eq!(ino, RESERVED_INODES + 1);
        let during = counters(&device).await;
        assert_eq!(during.0, before.0 - 1);
        assert_eq!(during.2, before.2 - 1);

        device.free_inode(ino).await.unwrap();
        assert_eq!(counters(&device).await, before);
        assert_eq!(device.allocate_inode().await.unwrap(), ino);
    }

    #[tokio::test]
    async fn test_block_allocation_is_unique_and_zeroed() {
        let (_dir, device) = fresh_device(256, 32).await;
        let before = counters(&device).await;

        let mut seen = HashSet::new();
        for _ in 0..20 {
            let block = device.allocate_block().await.unwrap();
            assert!(seen.insert(block), "block {} handed out twice", block);
            assert_eq!(device.read_block(block).await.unwrap(), [0u8; BLOCK_SIZE]);
        }
        let after = counters(&device).await;
        assert_eq!(after.1, before.1 - 20);
        assert_eq!(after.3, before.3 - 20);

        let lowest = *seen.iter().min().unwrap();
        device.free_block(lowest).await.unwrap();
        assert_eq!(device.allocate_block().await.unwrap(), lowest);
    }

    #[tokio::test]
    async fn test_double_free_leaves_counters() {
        let (_dir, device) = fresh_device(256, 32).await;
        let block = device.allocate_block().await.unwrap();
        device.free_block(block).await.unwrap();
        let before = counters(&device).await;

        device.free_block(block).await.unwrap();
        device.free_inode(30).await.unwrap();
        device.free_inode(500).await.unwrap();
        assert_eq!(counters(&device).await, before);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_no_space() {
        let (_dir, device) = fresh_device(256, 16).await;
        for _ in RESERVED_INODES..16 {
            device.allocate_inode().await.unwrap();
        }
        assert!(matches!(device.allocate_inode().await, Err(FsError::NoFreeInodes)));

        let free = device.read_superblock().await.unwrap().free_blocks_count;
        for _ in 0..free {
            device.allocate_block().await.unwrap();
        }
        assert!(matches!(device.allocate_block().await, Err(FsError::NoFreeBlocks)));
    }
}
