//! Block address translation and truncation
//!
//! Logical block `lbk` of a file maps as follows:
//!
//! | lbk            | path                                              |
//! |----------------|---------------------------------------------------|
//! | 0..12          | `block[lbk]`                                      |
//! | 12..268        | `block[12]` -> slot `lbk - 12`                    |
//! | 268..65804     | `block[13]` -> slot `(lbk-268)/256` -> `(lbk-268)%256` |
//!
//! Every non-zero pointer refers to an allocated block. Pointer blocks are
//! allocated zeroed, so an unused slot always reads as 0.

use crate::blockdev::BLOCK_SIZE;
use crate::error::{FsError, Result};
use crate::format::{decode_pointers, encode_pointers, now, DiskInode, DIRECT_BLOCKS, DOUBLE_INDIRECT, POINTERS_PER_BLOCK, SINGLE_INDIRECT};
use crate::mount::Device;

/// 512-byte sectors per filesystem block, the unit of `i_blocks`
const SECTORS_PER_BLOCK: u32 = (BLOCK_SIZE / 512) as u32;

const SINGLE_START: u32 = DIRECT_BLOCKS as u32;
const DOUBLE_START: u32 = SINGLE_START + POINTERS_PER_BLOCK as u32;
/// First logical block past the double-indirect range
pub const MAX_FILE_BLOCKS: u32 = DOUBLE_START + (POINTERS_PER_BLOCK * POINTERS_PER_BLOCK) as u32;

/// Translate logical block `lbk` of `inode` to a physical block number.
///
/// Returns 0 for a hole when `allocate` is false. With `allocate` set, any
/// missing pointer block or data block is allocated and linked in; a block
/// that is already mapped is returned as is.
pub async fn bmap(device: &Device, inode: &mut DiskInode, lbk: u32, allocate: bool) -> Result<u32> {
    if lbk >= MAX_FILE_BLOCKS {
        return Err(FsError::FileTooLarge);
    }

    if lbk < SINGLE_START {
        let slot = lbk as usize;
        if inode.block[slot] == 0 && allocate {
            inode.block[slot] = device.allocate_block().await?;
            inode.blocks += SECTORS_PER_BLOCK;
        }
        return Ok(inode.block[slot]);
    }

    if lbk < DOUBLE_START {
        let Some(single) = pointer_root(device, inode, SINGLE_INDIRECT, allocate).await? else {
            return Ok(0);
        };
        return map_slot(device, inode, single, (lbk - SINGLE_START) as usize, allocate).await;
    }

    let Some(double) = pointer_root(device, inode, DOUBLE_INDIRECT, allocate).await? else {
        return Ok(0);
    };
    let index = (lbk - DOUBLE_START) as usize;
    let single = map_slot(device, inode, double, index / POINTERS_PER_BLOCK, allocate).await?;
    if single == 0 {
        return Ok(0);
    }
    map_slot(device, inode, single, index % POINTERS_PER_BLOCK, allocate).await
}

/// Read-only translation; 0 means the block is a hole
pub async fn lookup(device: &Device, inode: &DiskInode, lbk: u32) -> Result<u32> {
    let mut copy = inode.clone();
    bmap(device, &mut copy, lbk, false).await
}

/// The pointer block in inode slot `slot`, allocating it if asked
async fn pointer_root(device: &Device, inode: &mut DiskInode, slot: usize, allocate: bool) -> Result<Option<u32>> {
    if inode.block[slot] == 0 {
        if !allocate {
            return Ok(None);
        }
        inode.block[slot] = device.allocate_block().await?;
        inode.blocks += SECTORS_PER_BLOCK;
        log::debug!("LAYOUT: {} pointer block {} in slot {}", device.id(), inode.block[slot], slot);
    }
    Ok(Some(inode.block[slot]))
}

/// Entry `index` of pointer block `ptr_block`, allocating and linking a block if asked
async fn map_slot(device: &Device, inode: &mut DiskInode, ptr_block: u32, index: usize, allocate: bool) -> Result<u32> {
    let mut ptrs = decode_pointers(&device.read_block(ptr_block).await?);
    if ptrs[index] == 0 && allocate {
        ptrs[index] = device.allocate_block().await?;
        inode.blocks += SECTORS_PER_BLOCK;
        device.write_block(ptr_block, &encode_pointers(&ptrs)).await?;
    }
    Ok(ptrs[index])
}

/// Free every data and pointer block of `inode` and reset it to empty.
///
/// Each tier is walked only up to its first zero pointer. A fast symlink
/// keeps its target in the pointer slots, so those are cleared, not freed.
pub async fn truncate(device: &Device, inode: &mut DiskInode) -> Result<()> {
    if !inode.is_fast_symlink() {
        let mut freed = 0usize;

        for &block in inode.block[..DIRECT_BLOCKS].iter().take_while(|&&b| b != 0) {
            device.free_block(block).await?;
            freed += 1;
        }

        let single = inode.block[SINGLE_INDIRECT];
        if single != 0 {
            freed += free_pointer_block(device, single).await?;
        }

        let double = inode.block[DOUBLE_INDIRECT];
        if double != 0 {
            let tops = decode_pointers(&device.read_block(double).await?);
            for &sub in tops.iter().take_while(|&&b| b != 0) {
                freed += free_pointer_block(device, sub).await?;
            }
            device.free_block(double).await?;
            freed += 1;
        }

        log::debug!("LAYOUT: {} truncated {} blocks", device.id(), freed);
    }

    inode.block = Default::default();
    inode.blocks = 0;
    inode.size = 0;
    inode.mtime = now();
    Ok(())
}

/// Free the data blocks listed in `ptr_block`, then the pointer block itself
async fn free_pointer_block(device: &Device, ptr_block: u32) -> Result<usize> {
    let ptrs = decode_pointers(&device.read_block(ptr_block).await?);
    let mut freed = 0;
    for &block in ptrs.iter().take_while(|&&b| b != 0) {
        device.free_block(block).await?;
        freed += 1;
    }
    device.free_block(ptr_block).await?;
    Ok(freed + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{format_image, mode};
    use crate::mount::DeviceId;
    use std::collections::HashSet;
    use tempfile::{tempdir, TempDir};

    async fn device() -> (TempDir, Device) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("layout.img");
        format_image(&path, 2048, 64).await.unwrap();
        let device = Device::open(DeviceId(0), &path, "/", 64).await.unwrap();
        (dir, device)
    }

    #[tokio::test]
    async fn test_translation_is_stable_and_unique() {
        let (_dir, device) = device().await;
        let mut inode = DiskInode::new(mode::S_IFREG | 0o644, 0, 0, 1);

        let mut seen = HashSet::new();
        let mut mapped = Vec::new();
        for lbk in 0..270 {
            let block = bmap(&device, &mut inode, lbk, true).await.unwrap();
            assert_ne!(block, 0);
            assert!(seen.insert(block), "lbk {} reused block {}", lbk, block);
            mapped.push(block);
        }
        for (lbk, &block) in mapped.iter().enumerate() {
            assert_eq!(lookup(&device, &inode, lbk as u32).await.unwrap(), block);
            assert_eq!(bmap(&device, &mut inode, lbk as u32, true).await.unwrap(), block);
        }

        // 270 data blocks, the single-indirect block, the double-indirect
        // block and one second-level block.
        assert!(!seen.contains(&inode.block[SINGLE_INDIRECT]));
        assert!(!seen.contains(&inode.block[DOUBLE_INDIRECT]));
        assert_eq!(inode.blocks, (270 + 3) * SECTORS_PER_BLOCK);
    }

    #[tokio::test]
    async fn test_holes_read_as_zero() {
        let (_dir, device) = device().await;
        let inode = DiskInode::new(mode::S_IFREG | 0o644, 0, 0, 1);
        assert_eq!(lookup(&device, &inode, 0).await.unwrap(), 0);
        assert_eq!(lookup(&device, &inode, 100).await.unwrap(), 0);
        assert_eq!(lookup(&device, &inode, 5000).await.unwrap(), 0);
        assert!(matches!(lookup(&device, &inode, MAX_FILE_BLOCKS).await, Err(FsError::FileTooLarge)));
    }

    #[tokio::test]
    async fn test_truncate_returns_every_block() {
        let (_dir, device) = device().await;
        let free_before = device.read_superblock().await.unwrap().free_blocks_count;

        let mut inode = DiskInode::new(mode::S_IFREG | 0o644, 0, 0, 1);
        for lbk in 0..300 {
            bmap(&device, &mut inode, lbk, true).await.unwrap();
        }
        inode.size = 300 * BLOCK_SIZE as u32;
        assert!(device.read_superblock().await.unwrap().free_blocks_count < free_before);

        truncate(&device, &mut inode).await.unwrap();
        assert_eq!(device.read_superblock().await.unwrap().free_blocks_count, free_before);
        assert_eq!(device.read_group_desc().await.unwrap().free_blocks_count as u32, free_before);
        assert_eq!(inode.block, [0u32; 15]);
        assert_eq!((inode.size, inode.blocks), (0, 0));
    }

    #[tokio::test]
    async fn test_truncate_skips_fast_symlink_slots() {
        let (_dir, device) = device().await;
        let free_before = device.read_superblock().await.unwrap().free_blocks_count;

        let mut link = DiskInode::new(mode::S_IFLNK | 0o777, 0, 0, 1);
        link.set_block_bytes(b"/a/fairly/long/target/path");
        link.size = 26;
        truncate(&device, &mut link).await.unwrap();

        assert_eq!(device.read_superblock().await.unwrap().free_blocks_count, free_before);
        assert_eq!(link.block, [0u32; 15]);
    }
}
