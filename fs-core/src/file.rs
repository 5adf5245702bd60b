//! Open-file table, descriptor I/O and whole-file utilities

use std::fmt;
use std::str::FromStr;

use crate::blockdev::BLOCK_SIZE;
use crate::error::{FsError, Result};
use crate::format::now;
use crate::inode_cache::MinodeId;
use crate::layout;
use crate::mount::DeviceId;
use crate::path::split_parent;
use crate::process::{Fd, Pid};
use crate::vfs::FileSystem;

/// Access mode of an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpenMode {
    Read = 0,
    Write = 1,
    ReadWrite = 2,
    /// Write starting at the end of the file
    Append = 3,
}

impl OpenMode {
    pub fn can_read(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

impl FromStr for OpenMode {
    type Err = FsError;

    /// Accepts the numeric codes 0-3 or `r`, `w`, `rw`, `a`
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "0" | "r" | "R" => Ok(OpenMode::Read),
            "1" | "w" | "W" => Ok(OpenMode::Write),
            "2" | "rw" | "RW" => Ok(OpenMode::ReadWrite),
            "3" | "a" | "APPEND" => Ok(OpenMode::Append),
            _ => Err(FsError::BadAccessMode),
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpenMode::Read => "READ",
            OpenMode::Write => "WRITE",
            OpenMode::ReadWrite => "RW",
            OpenMode::Append => "APPEND",
        };
        f.write_str(name)
    }
}

/// Index of a shared open-file entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenFileId(pub(crate) usize);

/// Shared state of an open file, referenced by one or more descriptors
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub minode: MinodeId,
    pub mode: OpenMode,
    /// Byte cursor
    pub offset: u32,
    pub(crate) ref_count: u32,
}

/// Pool of open-file entries shared by all processes
#[derive(Debug)]
pub struct OpenFileTable {
    slots: Vec<Option<OpenFile>>,
}

impl OpenFileTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn free_slot(&self) -> Option<OpenFileId> {
        self.slots.iter().position(Option::is_none).map(OpenFileId)
    }

    pub(crate) fn insert(&mut self, id: OpenFileId, file: OpenFile) {
        self.slots[id.0] = Some(file);
    }

    pub fn get(&self, id: OpenFileId) -> Result<&OpenFile> {
        self.slots.get(id.0).and_then(Option::as_ref).ok_or(FsError::InvalidDescriptor)
    }

    pub fn get_mut(&mut self, id: OpenFileId) -> Result<&mut OpenFile> {
        self.slots.get_mut(id.0).and_then(Option::as_mut).ok_or(FsError::InvalidDescriptor)
    }

    pub(crate) fn take(&mut self, id: OpenFileId) -> Option<OpenFile> {
        self.slots.get_mut(id.0).and_then(Option::take)
    }

    /// Number of entries in use
    pub fn in_use(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// One row of [`FileSystem::list_descriptors`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub fd: Fd,
    pub mode: OpenMode,
    pub offset: u32,
    pub dev: DeviceId,
    pub ino: u32,
    pub size: u32,
}

impl FileSystem {
    /// Open `path` and return a new descriptor in process `pid`
    pub async fn open(&mut self, pid: Pid, path: &str, mode: OpenMode) -> Result<Fd> {
        let (dev, ino) = self.resolve_follow(pid, path).await?;
        let fd = self.procs.get(pid)?.free_fd().ok_or(FsError::TooManyOpenFiles)?;
        let slot = self.files.free_slot().ok_or(FsError::TooManyOpenFiles)?;

        let id = self.inodes.get(&self.mounts, dev, ino)?;
        let (is_dir, size) = {
            let inode = &self.inodes.minode(id)?.inode;
            (inode.is_dir(), inode.size)
        };
        if is_dir {
            self.inodes.release(&mut self.mounts, id)?;
            return Err(FsError::IsADirectory);
        }
        let offset = if mode == OpenMode::Append { size } else { 0 };

        self.files.insert(slot, OpenFile { minode: id, mode, offset, ref_count: 1 });
        self.procs.get_mut(pid)?.fds[fd] = Some(slot);
        log::debug!("FILE: pid {} opened {} ino {} as fd {} ({})", pid, dev, ino, fd, mode);
        Ok(fd)
    }

    /// Close descriptor `fd`; the file is released when its last descriptor goes
    pub fn close(&mut self, pid: Pid, fd: Fd) -> Result<()> {
        let file_id = self.procs.get(pid)?.file(fd)?;
        self.procs.get_mut(pid)?.fds[fd] = None;
        self.drop_file_ref(file_id)
    }

    fn drop_file_ref(&mut self, file_id: OpenFileId) -> Result<()> {
        let file = self.files.get_mut(file_id)?;
        file.ref_count = file.ref_count.saturating_sub(1);
        if file.ref_count == 0 {
            if let Some(file) = self.files.take(file_id) {
                self.inodes.release(&mut self.mounts, file.minode)?;
            }
        }
        Ok(())
    }

    /// Read up to `count` bytes at the cursor; an empty result means end of file
    pub async fn read(&mut self, pid: Pid, fd: Fd, count: usize) -> Result<Vec<u8>> {
        let file_id = self.procs.get(pid)?.file(fd)?;
        let file = self.files.get_mut(file_id)?;
        if !file.mode.can_read() {
            return Err(FsError::BadAccessMode);
        }

        let minode = self.inodes.minode(file.minode)?;
        let device = self.mounts.device(minode.dev)?;
        let count = count.min(minode.inode.size.saturating_sub(file.offset) as usize);

        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let offset = file.offset as usize;
            let start = offset % BLOCK_SIZE;
            let n = (BLOCK_SIZE - start).min(count - out.len());

            let blk = layout::lookup(device, &minode.inode, (offset / BLOCK_SIZE) as u32).await?;
            if blk == 0 {
                out.resize(out.len() + n, 0);
            } else {
                let block = device.read_block(blk).await?;
                out.extend_from_slice(&block[start..start + n]);
            }
            file.offset += n as u32;
        }
        Ok(out)
    }

    /// Write all of `data` at the cursor, growing the file as needed
    pub async fn write(&mut self, pid: Pid, fd: Fd, data: &[u8]) -> Result<usize> {
        let file_id = self.procs.get(pid)?.file(fd)?;
        let file = self.files.get(file_id)?;
        if !file.mode.can_write() {
            return Err(FsError::BadAccessMode);
        }

        let id = file.minode;
        self.inodes.acquire(id)?;
        let result = self.write_at(file_id, id, data).await;
        self.inodes.release(&mut self.mounts, id)?;
        result
    }

    async fn write_at(&mut self, file_id: OpenFileId, id: MinodeId, data: &[u8]) -> Result<usize> {
        let minode = self.inodes.minode_mut(id)?;
        let device = self.mounts.device(minode.dev)?;
        let file = self.files.get_mut(file_id)?;

        let mut written = 0;
        while written < data.len() {
            let offset = file.offset as usize;
            let start = offset % BLOCK_SIZE;
            let n = (BLOCK_SIZE - start).min(data.len() - written);

            minode.dirty = true;
            let blk = layout::bmap(device, &mut minode.inode, (offset / BLOCK_SIZE) as u32, true).await?;
            let mut block = if n == BLOCK_SIZE { [0u8; BLOCK_SIZE] } else { device.read_block(blk).await? };
            block[start..start + n].copy_from_slice(&data[written..written + n]);
            device.write_block(blk, &block).await?;

            written += n;
            file.offset += n as u32;
            if file.offset > minode.inode.size {
                minode.inode.size = file.offset;
            }
        }

        if written > 0 {
            minode.inode.mtime = now();
        }
        Ok(written)
    }

    /// Move the cursor to `offset`, which may not pass the end of the file
    pub fn lseek(&mut self, pid: Pid, fd: Fd, offset: u32) -> Result<u32> {
        let file_id = self.procs.get(pid)?.file(fd)?;
        let file = self.files.get_mut(file_id)?;
        if offset > self.inodes.minode(file.minode)?.inode.size {
            return Err(FsError::InvalidSeek(offset));
        }
        let previous = file.offset;
        file.offset = offset;
        Ok(previous)
    }

    /// New descriptor in the same process sharing the open file of `fd`
    pub fn dup(&mut self, pid: Pid, fd: Fd) -> Result<Fd> {
        self.dup_to(pid, fd, pid)
    }

    /// New descriptor in process `target` sharing the open file of `pid`'s `fd`
    pub fn dup_to(&mut self, pid: Pid, fd: Fd, target: Pid) -> Result<Fd> {
        let file_id = self.procs.get(pid)?.file(fd)?;
        let new_fd = self.procs.get(target)?.free_fd().ok_or(FsError::TooManyOpenFiles)?;
        self.files.get_mut(file_id)?.ref_count += 1;
        self.procs.get_mut(target)?.fds[new_fd] = Some(file_id);
        Ok(new_fd)
    }

    /// Open descriptors of process `pid`
    pub fn list_descriptors(&self, pid: Pid) -> Result<Vec<DescriptorInfo>> {
        let process = self.procs.get(pid)?;
        let mut out = Vec::new();
        for (fd, slot) in process.fds.iter().enumerate() {
            let Some(file_id) = slot else { continue };
            let file = self.files.get(*file_id)?;
            let minode = self.inodes.minode(file.minode)?;
            out.push(DescriptorInfo {
                fd,
                mode: file.mode,
                offset: file.offset,
                dev: minode.dev,
                ino: minode.ino,
                size: minode.inode.size,
            });
        }
        Ok(out)
    }

    /// Physical block behind logical block `lbk` of the file open on `fd`
    pub async fn logical_to_physical(&mut self, pid: Pid, fd: Fd, lbk: u32, allocate: bool) -> Result<u32> {
        let file_id = self.procs.get(pid)?.file(fd)?;
        let id = self.files.get(file_id)?.minode;
        let minode = self.inodes.minode_mut(id)?;
        let device = self.mounts.device(minode.dev)?;
        if allocate {
            minode.dirty = true;
        }
        layout::bmap(device, &mut minode.inode, lbk, allocate).await
    }

    /// Whole contents of the file at `path`
    pub async fn cat(&mut self, pid: Pid, path: &str) -> Result<Vec<u8>> {
        let fd = self.open(pid, path, OpenMode::Read).await?;
        let mut out = Vec::new();
        let result = loop {
            match self.read(pid, fd, BLOCK_SIZE).await {
                Ok(chunk) if chunk.is_empty() => break Ok(()),
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(e) => break Err(e),
            }
        };
        self.close(pid, fd)?;
        result.map(|_| out)
    }

    /// Copy `src` to `dst`, creating `dst` or truncating an existing one
    pub async fn copy(&mut self, pid: Pid, src: &str, dst: &str) -> Result<()> {
        let src_fd = self.open(pid, src, OpenMode::Read).await?;
        let result = self.copy_from(pid, src_fd, dst).await;
        self.close(pid, src_fd)?;
        result
    }

    async fn copy_from(&mut self, pid: Pid, src_fd: Fd, dst: &str) -> Result<()> {
        match self.resolve_follow(pid, dst).await {
            Ok((dev, ino)) => self.truncate_existing(dev, ino).await?,
            Err(FsError::NotFound) => {
                self.creat(pid, dst).await?;
            }
            Err(e) => return Err(e),
        }

        let dst_fd = self.open(pid, dst, OpenMode::Write).await?;
        let result = self.pump(pid, src_fd, dst_fd).await;
        self.close(pid, dst_fd)?;
        result
    }

    /// Block-sized read/write loop between two descriptors of one process
    async fn pump(&mut self, pid: Pid, src_fd: Fd, dst_fd: Fd) -> Result<()> {
        loop {
            let chunk = self.read(pid, src_fd, BLOCK_SIZE).await?;
            if chunk.is_empty() {
                return Ok(());
            }
            self.write(pid, dst_fd, &chunk).await?;
        }
    }

    /// Drop the contents of an existing regular file nobody holds open
    async fn truncate_existing(&mut self, dev: DeviceId, ino: u32) -> Result<()> {
        if self.inodes.is_referenced(dev, ino) {
            return Err(FsError::Busy);
        }
        let id = self.inodes.get(&self.mounts, dev, ino)?;
        let minode = self.inodes.minode_mut(id)?;
        let result = if minode.inode.is_dir() {
            Err(FsError::IsADirectory)
        } else {
            let device = self.mounts.device(dev)?;
            minode.dirty = true;
            layout::truncate(device, &mut minode.inode).await
        };
        self.inodes.release(&mut self.mounts, id)?;
        result
    }

    /// Move `src` to `dst`: a link and unlink on one device, a copy and unlink across devices
    pub async fn rename(&mut self, pid: Pid, src: &str, dst: &str) -> Result<()> {
        let (src_dev, src_ino) = self.resolve(pid, src).await?;
        if self.inode_snapshot(src_dev, src_ino)?.is_dir() {
            return Err(FsError::IsADirectory);
        }
        // The source must be unlinkable before a second name is made.
        if self.inodes.is_referenced(src_dev, src_ino) {
            return Err(FsError::Busy);
        }
        match self.resolve(pid, dst).await {
            Ok(_) => return Err(FsError::AlreadyExists),
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        let (parent, _) = split_parent(dst)?;
        let (dst_dev, _) = self.resolve(pid, parent).await?;

        if src_dev == dst_dev {
            self.link(pid, src, dst).await?;
        } else {
            self.copy(pid, src, dst).await?;
        }
        self.unlink(pid, src).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_mode_parsing() {
        assert_eq!("0".parse::<OpenMode>().unwrap(), OpenMode::Read);
        assert_eq!("rw".parse::<OpenMode>().unwrap(), OpenMode::ReadWrite);
        assert_eq!("3".parse::<OpenMode>().unwrap(), OpenMode::Append);
        assert!(matches!("x".parse::<OpenMode>(), Err(FsError::BadAccessMode)));
        assert!(OpenMode::Append.can_write() && !OpenMode::Append.can_read());
        assert!(OpenMode::ReadWrite.can_read() && OpenMode::ReadWrite.can_write());
    }

    #[test]
    fn test_open_file_table() {
        let mut table = OpenFileTable::new(2);
        let id = table.free_slot().unwrap();
        table.insert(id, OpenFile { minode: MinodeId(0), mode: OpenMode::Read, offset: 0, ref_count: 1 });
        assert_eq!(table.in_use(), 1);
        assert_eq!(table.free_slot(), Some(OpenFileId(1)));
        assert!(table.take(id).is_some());
        assert!(matches!(table.get(id), Err(FsError::InvalidDescriptor)));
    }
}
