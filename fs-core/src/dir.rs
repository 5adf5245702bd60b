//! Directory manager: variable-length records in directory data blocks
//!
//! Lookup and removal only scan the first data block of a directory; new
//! records are appended to the last data block, which may be a later one.
//! Listing walks every direct block.

use crate::blockdev::{Block, BLOCK_SIZE};
use crate::error::{FsError, Result};
use crate::format::{DirEntry, DiskInode, FileType, DIRECT_BLOCKS, MAX_NAME_LEN};
use crate::mount::Device;

/// Decoded records of one directory block, with their byte offsets
fn records(block: &Block) -> Result<Vec<(usize, DirEntry)>> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < BLOCK_SIZE {
        let entry = DirEntry::decode_at(block, offset)?;
        let next = offset + entry.rec_len as usize;
        out.push((offset, entry));
        offset = next;
    }
    Ok(out)
}

fn require_dir(dir: &DiskInode) -> Result<()> {
    if !dir.is_dir() {
        return Err(FsError::NotADirectory);
    }
    Ok(())
}

/// Reject names that cannot be stored as a directory record
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(FsError::InvalidName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// Inode number of `name` in the first block of `dir`, or 0 when absent
pub async fn search(device: &Device, dir: &DiskInode, name: &str) -> Result<u32> {
    require_dir(dir)?;
    if dir.block[0] == 0 {
        return Ok(0);
    }

    let block = device.read_block(dir.block[0]).await?;
    Ok(records(&block)?
        .into_iter()
        .find(|(_, e)| e.inode != 0 && e.name == name.as_bytes())
        .map_or(0, |(_, e)| e.inode))
}

/// Append a record for `ino` under `name`.
///
/// The record goes after the final record of the last data block if the
/// slack there is large enough; otherwise the next direct slot receives a
/// fresh block holding only the new record. `parent` is modified in that case
/// and the caller must mark it dirty.
pub async fn insert(device: &Device, parent: &mut DiskInode, ino: u32, name: &str, file_type: FileType) -> Result<()> {
    require_dir(parent)?;
    validate_name(name)?;

    let mut entry = DirEntry::new(ino, name.as_bytes(), file_type);
    let needed = entry.rec_len as usize;

    let last = parent.block[..DIRECT_BLOCKS].iter().rposition(|&b| b != 0);
    if let Some(slot) = last {
        let blk = parent.block[slot];
        let mut block = device.read_block(blk).await?;
        if let Some((offset, tail)) = records(&block)?.pop() {
            let tail_len = if tail.inode == 0 && offset == 0 { 0 } else { DirEntry::ideal_len(tail.name.len()) as usize };
            let slack = tail.rec_len as usize - tail_len;
            if slack >= needed {
                if tail_len > 0 {
                    DirEntry::set_rec_len_at(&mut block, offset, tail_len as u16);
                }
                entry.rec_len = slack as u16;
                entry.encode_at(&mut block, offset + tail_len);
                device.write_block(blk, &block).await?;
                log::debug!("DIR: {} inserted '{}' -> {} in block {}", device.id(), name, ino, blk);
                return Ok(());
            }
        }
    }

    let slot = last.map_or(0, |s| s + 1);
    if slot >= DIRECT_BLOCKS {
        return Err(FsError::DirectoryFull);
    }
    let blk = device.allocate_block().await?;
    let mut block = [0u8; BLOCK_SIZE];
    entry.rec_len = BLOCK_SIZE as u16;
    entry.encode_at(&mut block, 0);
    device.write_block(blk, &block).await?;

    parent.block[slot] = blk;
    parent.size = parent.size.max((slot + 1) as u32 * BLOCK_SIZE as u32);
    parent.blocks += (BLOCK_SIZE / 512) as u32;
    log::debug!("DIR: {} inserted '{}' -> {} in new block {} (slot {})", device.id(), name, ino, blk, slot);
    Ok(())
}

/// Remove the record for `name` from the first block of `parent`.
///
/// The record's length is merged into the record before it. The first
/// record of a block has no predecessor, so it is only marked unused.
pub async fn remove(device: &Device, parent: &DiskInode, name: &str) -> Result<()> {
    require_dir(parent)?;
    if parent.block[0] == 0 {
        return Err(FsError::NotFound);
    }

    let blk = parent.block[0];
    let mut block = device.read_block(blk).await?;
    let recs = records(&block)?;
    let index = recs
        .iter()
        .position(|(_, e)| e.inode != 0 && e.name == name.as_bytes())
        .ok_or(FsError::NotFound)?;

    let (offset, entry) = &recs[index];
    if index == 0 {
        let mut unused = entry.clone();
        unused.inode = 0;
        unused.encode_at(&mut block, *offset);
    } else {
        let (prev_offset, prev) = &recs[index - 1];
        DirEntry::set_rec_len_at(&mut block, *prev_offset, prev.rec_len + entry.rec_len);
    }
    device.write_block(blk, &block).await?;
    log::debug!("DIR: {} removed '{}' from block {}", device.id(), name, blk);
    Ok(())
}

/// True when the first block holds nothing but `.` and `..`
pub async fn is_empty(device: &Device, dir: &DiskInode) -> Result<bool> {
    require_dir(dir)?;
    if dir.block[0] == 0 {
        return Ok(true);
    }
    let block = device.read_block(dir.block[0]).await?;
    Ok(records(&block)?.iter().filter(|(_, e)| e.inode != 0).count() <= 2)
}

/// Every live record in every direct block, in on-disk order
pub async fn entries(device: &Device, dir: &DiskInode) -> Result<Vec<DirEntry>> {
    require_dir(dir)?;
    let mut out = Vec::new();
    for &blk in dir.block[..DIRECT_BLOCKS].iter().filter(|&&b| b != 0) {
        let block = device.read_block(blk).await?;
        out.extend(records(&block)?.into_iter().map(|(_, e)| e).filter(|e| e.inode != 0));
    }
    Ok(out)
}

/// Inode number of the `..` record (the second record of block 0)
pub async fn parent_of(device: &Device, dir: &DiskInode) -> Result<u32> {
    require_dir(dir)?;
    let block = device.read_block(dir.block[0]).await?;
    records(&block)?
        .into_iter()
        .find(|(_, e)| e.name == b"..")
        .map(|(_, e)| e.inode)
        .ok_or_else(|| FsError::Corrupt(format!("directory block {} has no '..' record", dir.block[0])))
}

/// Name under which `dir` records inode `ino`, skipping `.` and `..`
pub async fn name_of(device: &Device, dir: &DiskInode, ino: u32) -> Result<Option<String>> {
    Ok(entries(device, dir)
        .await?
        .into_iter()
        .find(|e| e.inode == ino && e.name != b"." && e.name != b"..")
        .map(|e| e.name_str()))
}
