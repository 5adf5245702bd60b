//! Namespace operations: directories, links, symlinks, attributes
//!
//! Every mutation goes through the inode cache (get, modify, mark dirty,
//! release) so cached copies and the device tables never disagree.

use crate::blockdev::BLOCK_SIZE;
use crate::dir;
use crate::error::{FsError, Result};
use crate::format::{empty_dir_block, mode, now, DiskInode, FileType, FAST_SYMLINK_MAX, ROOT_INO};
use crate::layout;
use crate::mount::DeviceId;
use crate::path::split_parent;
use crate::process::Pid;
use crate::vfs::FileSystem;

/// Symlinks followed before giving up on a path
const MAX_SYMLINK_HOPS: usize = 8;

/// Attributes of one inode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub dev: DeviceId,
    pub ino: u32,
    pub mode: u16,
    pub file_type: FileType,
    pub links: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    /// 512-byte sectors
    pub blocks: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl FileStat {
    fn new(dev: DeviceId, ino: u32, inode: &DiskInode) -> Self {
        Self {
            dev,
            ino,
            mode: inode.mode,
            file_type: inode.file_type(),
            links: inode.links_count,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            blocks: inode.blocks,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
        }
    }

    /// `ls -l` style mode string, e.g. `drwxr-xr-x`
    pub fn permissions(&self) -> String {
        let kind = match self.file_type {
            FileType::Directory => 'd',
            FileType::Symlink => 'l',
            FileType::CharDevice => 'c',
            FileType::BlockDevice => 'b',
            FileType::Fifo => 'p',
            FileType::Socket => 's',
            _ => '-',
        };
        let mut out = String::with_capacity(10);
        out.push(kind);
        for shift in [6, 3, 0] {
            let bits = (self.mode >> shift) & 0o7;
            out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        out
    }
}

/// One row of [`FileSystem::list_dir`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListing {
    pub name: String,
    pub stat: FileStat,
    pub link_target: Option<String>,
}

impl FileSystem {
    /// Like [`FileSystem::resolve`], but a final symlink is replaced by its target.
    ///
    /// Relative targets are taken relative to the directory holding the link.
    pub async fn resolve_follow(&self, pid: Pid, path: &str) -> Result<(DeviceId, u32)> {
        let mut path = path.to_string();
        for _ in 0..=MAX_SYMLINK_HOPS {
            let (dev, ino) = self.resolve(pid, &path).await?;
            let inode = self.inode_snapshot(dev, ino)?;
            if !inode.is_symlink() {
                return Ok((dev, ino));
            }

            let target = self.link_target(dev, &inode).await?;
            path = if target.starts_with('/') {
                target
            } else {
                match split_parent(&path)?.0 {
                    "" => target,
                    "/" => format!("/{}", target),
                    parent => format!("{}/{}", parent, target),
                }
            };
        }
        Err(FsError::PathTooDeep)
    }

    /// Target stored in a symlink inode
    async fn link_target(&self, dev: DeviceId, inode: &DiskInode) -> Result<String> {
        let bytes = if inode.is_fast_symlink() {
            inode.block_bytes().to_vec()
        } else if inode.block[0] != 0 {
            self.mounts.device(dev)?.read_block(inode.block[0]).await?.to_vec()
        } else {
            return Err(FsError::Corrupt("symlink without a data block".to_string()));
        };
        let len = (inode.size as usize).min(bytes.len());
        let end = bytes[..len].iter().position(|&b| b == 0).unwrap_or(len);
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Make `path` the working directory of `pid`
    pub async fn chdir(&mut self, pid: Pid, path: &str) -> Result<()> {
        self.procs.get(pid)?;
        let (dev, ino) = self.resolve_follow(pid, path).await?;
        if !self.inode_snapshot(dev, ino)?.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let new = self.inodes.get(&self.mounts, dev, ino)?;
        let process = self.procs.get_mut(pid)?;
        let old = std::mem::replace(&mut process.cwd, new);
        self.inodes.release(&mut self.mounts, old)?;
        log::debug!("OPS: pid {} cwd -> {} ino {}", pid, dev, ino);
        Ok(())
    }

    /// Entries of the directory at `path`, or the single entry a file path names
    pub async fn list_dir(&self, pid: Pid, path: &str) -> Result<Vec<DirListing>> {
        let (dev, ino) = self.resolve(pid, path).await?;
        let inode = self.inode_snapshot(dev, ino)?;
        if !inode.is_dir() {
            let name = split_parent(path)?.1.to_string();
            return Ok(vec![self.listing(dev, ino, name).await?]);
        }

        let entries = dir::entries(self.mounts.device(dev)?, &inode).await?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(self.listing(dev, entry.inode, entry.name_str()).await?);
        }
        Ok(out)
    }

    async fn listing(&self, dev: DeviceId, ino: u32, name: String) -> Result<DirListing> {
        let inode = self.inode_snapshot(dev, ino)?;
        let link_target = if inode.is_symlink() { Some(self.link_target(dev, &inode).await?) } else { None };
        Ok(DirListing { name, stat: FileStat::new(dev, ino, &inode), link_target })
    }

    /// Attributes of `path` itself (a final symlink is not followed)
    pub async fn stat(&self, pid: Pid, path: &str) -> Result<FileStat> {
        let (dev, ino) = self.resolve(pid, path).await?;
        Ok(FileStat::new(dev, ino, &self.inode_snapshot(dev, ino)?))
    }

    pub async fn mkdir(&mut self, pid: Pid, path: &str) -> Result<u32> {
        let (dev, parent, name) = self.prepare_create(pid, path).await?;
        let (uid, gid) = self.credentials(pid)?;

        let device = self.mounts.device(dev)?;
        let ino = device.allocate_inode().await?;
        let blk = match device.allocate_block().await {
            Ok(blk) => blk,
            Err(e) => {
                device.free_inode(ino).await?;
                return Err(e);
            }
        };
        device.write_block(blk, &empty_dir_block(ino, parent)).await?;

        let mut inode = DiskInode::new(mode::S_IFDIR | 0o755, uid, gid, 2);
        inode.size = BLOCK_SIZE as u32;
        inode.blocks = (BLOCK_SIZE / 512) as u32;
        inode.block[0] = blk;
        self.install_new(dev, ino, inode).await?;

        if let Err(e) = self.add_entry(dev, parent, ino, name, FileType::Directory, 1).await {
            self.discard_inode(dev, ino).await?;
            return Err(e);
        }
        self.mounts.device(dev)?.adjust_used_dirs(1).await?;
        log::info!("OPS: mkdir {} -> {} ino {}", path, dev, ino);
        Ok(ino)
    }

    /// Remove an empty directory owned by the caller
    pub async fn rmdir(&mut self, pid: Pid, path: &str) -> Result<()> {
        let (parent_path, name) = split_parent(path)?;
        if name == "." || name == ".." {
            return Err(FsError::InvalidName);
        }

        let (dev, ino) = self.resolve(pid, path).await?;
        let inode = self.inode_snapshot(dev, ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if ino == ROOT_INO {
            return Err(FsError::Busy);
        }
        self.check_owner(pid, &inode)?;
        if !dir::is_empty(self.mounts.device(dev)?, &inode).await? {
            return Err(FsError::NotEmpty);
        }
        if self.inodes.is_referenced(dev, ino) {
            return Err(FsError::Busy);
        }

        let parent = self.parent_of_path(pid, parent_path, dev).await?;
        dir::remove(self.mounts.device(dev)?, &self.inode_snapshot(dev, parent)?, name).await?;
        self.discard_inode(dev, ino).await?;
        self.update_inode(dev, parent, |p| {
            p.links_count = p.links_count.saturating_sub(1);
            p.mtime = now();
        })?;
        self.mounts.device(dev)?.adjust_used_dirs(-1).await?;
        log::info!("OPS: rmdir {} ({} ino {})", path, dev, ino);
        Ok(())
    }

    /// Create an empty regular file
    pub async fn creat(&mut self, pid: Pid, path: &str) -> Result<u32> {
        let (dev, parent, name) = self.prepare_create(pid, path).await?;
        let (uid, gid) = self.credentials(pid)?;

        let ino = self.mounts.device(dev)?.allocate_inode().await?;
        self.install_new(dev, ino, DiskInode::new(mode::S_IFREG | 0o644, uid, gid, 1)).await?;
        if let Err(e) = self.add_entry(dev, parent, ino, name, FileType::Regular, 0).await {
            self.discard_inode(dev, ino).await?;
            return Err(e);
        }
        log::debug!("OPS: creat {} -> {} ino {}", path, dev, ino);
        Ok(ino)
    }

    /// Unlink a file owned by the caller
    pub async fn rm(&mut self, pid: Pid, path: &str) -> Result<()> {
        let (dev, ino) = self.resolve(pid, path).await?;
        let inode = self.inode_snapshot(dev, ino)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        self.check_owner(pid, &inode)?;
        self.unlink(pid, path).await
    }

    /// Add `new` as another name for the non-directory at `old`
    pub async fn link(&mut self, pid: Pid, old: &str, new: &str) -> Result<()> {
        let (old_dev, ino) = self.resolve(pid, old).await?;
        let inode = self.inode_snapshot(old_dev, ino)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }

        let (dev, parent, name) = self.prepare_create(pid, new).await?;
        if dev != old_dev {
            return Err(FsError::CrossDevice);
        }
        self.add_entry(dev, parent, ino, name, inode.file_type(), 0).await?;
        self.update_inode(dev, ino, |i| {
            i.links_count += 1;
            i.ctime = now();
        })?;
        log::debug!("OPS: link {} -> {}", new, old);
        Ok(())
    }

    /// Remove the name `path`; the inode and its blocks go with the last link
    pub async fn unlink(&mut self, pid: Pid, path: &str) -> Result<()> {
        let (parent_path, name) = split_parent(path)?;
        let (dev, ino) = self.resolve(pid, path).await?;
        if self.inode_snapshot(dev, ino)?.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if self.inodes.is_referenced(dev, ino) {
            return Err(FsError::Busy);
        }

        let parent = self.parent_of_path(pid, parent_path, dev).await?;
        dir::remove(self.mounts.device(dev)?, &self.inode_snapshot(dev, parent)?, name).await?;
        self.update_inode(dev, parent, |p| p.mtime = now())?;

        let id = self.inodes.get(&self.mounts, dev, ino)?;
        let minode = self.inodes.minode_mut(id)?;
        minode.inode.links_count = minode.inode.links_count.saturating_sub(1);
        minode.inode.ctime = now();
        minode.dirty = true;
        let last = minode.inode.links_count == 0;
        self.inodes.release(&mut self.mounts, id)?;

        if last {
            self.discard_inode(dev, ino).await?;
        }
        log::debug!("OPS: unlink {} ({} ino {}{})", path, dev, ino, if last { ", freed" } else { "" });
        Ok(())
    }

    /// Create `link_path` pointing at `target`, which must exist.
    ///
    /// The target text is kept in the inode's pointer slots.
    pub async fn symlink(&mut self, pid: Pid, target: &str, link_path: &str) -> Result<u32> {
        if target.is_empty() {
            return Err(FsError::InvalidName);
        }
        if target.len() > FAST_SYMLINK_MAX {
            return Err(FsError::NameTooLong);
        }
        self.resolve(pid, target).await?;

        let (dev, parent, name) = self.prepare_create(pid, link_path).await?;
        let (uid, gid) = self.credentials(pid)?;

        let ino = self.mounts.device(dev)?.allocate_inode().await?;
        let mut inode = DiskInode::new(mode::S_IFLNK | 0o777, uid, gid, 1);
        inode.set_block_bytes(target.as_bytes());
        inode.size = target.len() as u32;
        self.install_new(dev, ino, inode).await?;

        if let Err(e) = self.add_entry(dev, parent, ino, name, FileType::Symlink, 0).await {
            self.discard_inode(dev, ino).await?;
            return Err(e);
        }
        log::debug!("OPS: symlink {} -> {}", link_path, target);
        Ok(ino)
    }

    pub async fn readlink(&self, pid: Pid, path: &str) -> Result<String> {
        let (dev, ino) = self.resolve(pid, path).await?;
        let inode = self.inode_snapshot(dev, ino)?;
        if !inode.is_symlink() {
            return Err(FsError::NotASymlink);
        }
        self.link_target(dev, &inode).await
    }

    /// Replace the permission bits; the type bits are kept
    pub async fn chmod(&mut self, pid: Pid, path: &str, perm: u16) -> Result<()> {
        let (dev, ino) = self.resolve(pid, path).await?;
        self.update_inode(dev, ino, |i| {
            i.mode = (i.mode & mode::S_IFMT) | (perm & mode::S_IPERM);
            i.ctime = now();
        })
    }

    /// Set access and modification times of an existing file to now
    pub async fn touch(&mut self, pid: Pid, path: &str) -> Result<()> {
        let (dev, ino) = self.resolve(pid, path).await?;
        self.update_inode(dev, ino, |i| {
            let t = now();
            i.atime = t;
            i.mtime = t;
        })
    }

    fn credentials(&self, pid: Pid) -> Result<(u16, u16)> {
        let process = self.procs.get(pid)?;
        Ok((process.uid, process.gid))
    }

    /// Owners and uid 0 may remove
    fn check_owner(&self, pid: Pid, inode: &DiskInode) -> Result<()> {
        let uid = self.procs.get(pid)?.uid;
        if uid != 0 && uid != inode.uid {
            return Err(FsError::PermissionDenied);
        }
        Ok(())
    }

    /// Parent directory and checked final name for a path about to be created
    async fn prepare_create<'p>(&self, pid: Pid, path: &'p str) -> Result<(DeviceId, u32, &'p str)> {
        let (parent_path, name) = split_parent(path)?;
        dir::validate_name(name)?;

        let (dev, parent) = self.resolve(pid, parent_path).await?;
        let parent_inode = self.inode_snapshot(dev, parent)?;
        if !parent_inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if dir::search(self.mounts.device(dev)?, &parent_inode, name).await? != 0 {
            return Err(FsError::AlreadyExists);
        }
        Ok((dev, parent, name))
    }

    /// Directory holding a name already resolved onto `dev`
    async fn parent_of_path(&self, pid: Pid, parent_path: &str, dev: DeviceId) -> Result<u32> {
        let (parent_dev, parent) = self.resolve(pid, parent_path).await?;
        if parent_dev != dev {
            return Err(FsError::Busy);
        }
        Ok(parent)
    }

    /// Store a freshly allocated inode through the cache
    async fn install_new(&mut self, dev: DeviceId, ino: u32, inode: DiskInode) -> Result<()> {
        let id = match self.inodes.get(&self.mounts, dev, ino) {
            Ok(id) => id,
            Err(e) => {
                let device = self.mounts.device(dev)?;
                let mut orphan = inode;
                layout::truncate(device, &mut orphan).await?;
                device.free_inode(ino).await?;
                return Err(e);
            }
        };
        let minode = self.inodes.minode_mut(id)?;
        minode.inode = inode;
        minode.dirty = true;
        self.inodes.release(&mut self.mounts, id)
    }

    /// Record `ino` under `name` in `parent`, adding `extra_links` to the parent
    async fn add_entry(
        &mut self,
        dev: DeviceId,
        parent: u32,
        ino: u32,
        name: &str,
        file_type: FileType,
        extra_links: u16,
    ) -> Result<()> {
        let id = self.inodes.get(&self.mounts, dev, parent)?;
        let minode = self.inodes.minode_mut(id)?;
        let device = self.mounts.device(dev)?;

        let result = dir::insert(device, &mut minode.inode, ino, name, file_type).await;
        if result.is_ok() {
            minode.inode.links_count += extra_links;
            minode.inode.mtime = now();
        }
        minode.dirty = true;
        self.inodes.release(&mut self.mounts, id)?;
        result
    }

    /// Free an inode's blocks and return it to the bitmap
    async fn discard_inode(&mut self, dev: DeviceId, ino: u32) -> Result<()> {
        let id = self.inodes.get(&self.mounts, dev, ino)?;
        let minode = self.inodes.minode_mut(id)?;
        let device = self.mounts.device(dev)?;

        let result = layout::truncate(device, &mut minode.inode).await;
        minode.inode.links_count = 0;
        minode.inode.dtime = now();
        minode.dirty = true;
        self.inodes.release(&mut self.mounts, id)?;
        result?;
        self.mounts.device(dev)?.free_inode(ino).await
    }

    /// Apply `f` to a cached inode and mark it dirty
    fn update_inode(&mut self, dev: DeviceId, ino: u32, f: impl FnOnce(&mut DiskInode)) -> Result<()> {
        let id = self.inodes.get(&self.mounts, dev, ino)?;
        let minode = self.inodes.minode_mut(id)?;
        f(&mut minode.inode);
        minode.dirty = true;
        self.inodes.release(&mut self.mounts, id)
    }
}
