//! Mount table: one entry per open device, plus mount and unmount
//!
//! A [`Device`] owns the decoded inode table of its image. Inode records are
//! edited in memory (through the inode cache) and patched back into the image
//! when the table is flushed; bitmaps and directory blocks are written through
//! the block cache immediately.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::blockdev::{Block, BlockDevice, ImageDevice, BLOCK_SIZE};
use crate::cache::{BlockCache, CacheStats};
use crate::error::{FsError, Result};
use crate::format::{inode_location, DiskInode, GroupDesc, Superblock, GROUP_DESC_BLOCK, INODE_RECORD_SIZE, ROOT_INO, SUPERBLOCK_BLOCK};
use crate::inode_cache::MinodeId;
use crate::process::Pid;
use crate::vfs::FileSystem;

/// Index of a mount-table slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub(crate) usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Allocation geometry of a single-group image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub ninodes: u32,
    pub nblocks: u32,
    pub first_data_block: u32,
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    /// Bytes per on-disk inode slot
    pub inode_stride: usize,
}

impl Geometry {
    /// Blocks occupied by the inode table
    pub fn inode_table_blocks(&self) -> u32 {
        ((self.ninodes as usize * self.inode_stride + BLOCK_SIZE - 1) / BLOCK_SIZE) as u32
    }
}

/// One mounted image
pub struct Device {
    id: DeviceId,
    image: PathBuf,
    mount_point: String,
    cache: BlockCache,
    geometry: Geometry,
    inode_table: Vec<DiskInode>,
    dirty_inodes: BTreeSet<u32>,
    /// Cached inode this device is mounted on (`None` for the root device)
    pub(crate) mounted_on: Option<MinodeId>,
    busy: bool,
}

impl Device {
    /// Open an image file and decode its metadata
    pub async fn open(
        id: DeviceId,
        image: impl AsRef<Path>,
        mount_point: &str,
        cache_blocks: usize,
    ) -> Result<Self> {
        let image = image.as_ref();
        let device = ImageDevice::open(image, false).await?;
        Self::from_block_device(id, image, mount_point, Arc::new(device), cache_blocks).await
    }

    /// Decode the superblock, group descriptor and inode table of `device`
    pub async fn from_block_device(
        id: DeviceId,
        image: impl AsRef<Path>,
        mount_point: &str,
        device: Arc<dyn BlockDevice>,
        cache_blocks: usize,
    ) -> Result<Self> {
        if device.block_count() <= GROUP_DESC_BLOCK {
            return Err(FsError::InvalidFilesystem("image too small".to_string()));
        }
        let cache = BlockCache::new(device, cache_blocks);

        let sb = Superblock::decode(&cache.read_block(SUPERBLOCK_BLOCK).await?);
        sb.validate().map_err(|e| FsError::InvalidFilesystem(e.to_string()))?;
        let gd = GroupDesc::decode(&cache.read_block(GROUP_DESC_BLOCK).await?);

        let geometry = Geometry {
            ninodes: sb.inodes_count,
            nblocks: sb.blocks_count,
            first_data_block: sb.first_data_block,
            block_bitmap: gd.block_bitmap,
            inode_bitmap: gd.inode_bitmap,
            inode_table: gd.inode_table,
            inode_stride: sb.inode_stride(),
        };
        let table_end = geometry.inode_table as u64 + geometry.inode_table_blocks() as u64;
        if geometry.inode_stride < INODE_RECORD_SIZE
            || table_end > cache.device().block_count()
            || geometry.nblocks as u64 > cache.device().block_count()
        {
            return Err(FsError::InvalidFilesystem(format!(
                "geometry does not fit the device ({} blocks)",
                cache.device().block_count()
            )));
        }

        let mut inode_table = Vec::with_capacity(geometry.ninodes as usize);
        let mut current: Option<(u64, Block)> = None;
        for ino in 1..=geometry.ninodes {
            let (blk, offset) = inode_location(geometry.inode_table, geometry.inode_stride, ino);
            let block = match current {
                Some((n, block)) if n == blk => block,
                _ => {
                    let block = cache.read_block(blk).await?;
                    current = Some((blk, block));
                    block
                }
            };
            inode_table.push(DiskInode::decode(&block[offset..offset + INODE_RECORD_SIZE])?);
        }

        log::info!(
            "MOUNT: {} ({} inodes, {} blocks, {} free) at {}",
            image.as_ref().display(),
            geometry.ninodes,
            geometry.nblocks,
            sb.free_blocks_count,
            mount_point
        );

        Ok(Self {
            id,
            image: image.as_ref().to_path_buf(),
            mount_point: mount_point.to_string(),
            cache,
            geometry,
            inode_table,
            dirty_inodes: BTreeSet::new(),
            mounted_on: None,
            busy: false,
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Image path the device was opened from
    pub fn image(&self) -> &Path {
        &self.image
    }

    /// Absolute path this device is mounted at
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// The root device is permanently busy and can never be unmounted
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub(crate) fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn check_ino(&self, ino: u32) -> Result<usize> {
        if ino == 0 || ino > self.geometry.ninodes {
            return Err(FsError::InvalidInode(ino));
        }
        Ok((ino - 1) as usize)
    }

    /// In-memory copy of an inode record
    pub fn inode(&self, ino: u32) -> Result<&DiskInode> {
        let index = self.check_ino(ino)?;
        Ok(&self.inode_table[index])
    }

    /// Replace an inode record in the in-memory table; out of range is ignored
    pub fn store_inode(&mut self, ino: u32, inode: &DiskInode) {
        match self.check_ino(ino) {
            Ok(index) => {
                self.inode_table[index] = inode.clone();
                self.dirty_inodes.insert(ino);
            }
            Err(_) => log::warn!("MOUNT: {} ignoring write-back of inode {} (out of range)", self.id, ino),
        }
    }

    pub async fn read_block(&self, block: u32) -> Result<Block> {
        Ok(self.cache.read_block(block as u64).await?)
    }

    pub async fn write_block(&self, block: u32, data: &Block) -> Result<()> {
        Ok(self.cache.write_block(block as u64, data).await?)
    }

    pub async fn read_superblock(&self) -> Result<Superblock> {
        Ok(Superblock::decode(&self.cache.read_block(SUPERBLOCK_BLOCK).await?))
    }

    pub async fn read_group_desc(&self) -> Result<GroupDesc> {
        Ok(GroupDesc::decode(&self.cache.read_block(GROUP_DESC_BLOCK).await?))
    }

    /// Patch every modified inode record back into the image
    pub async fn flush_inode_table(&mut self) -> Result<()> {
        if self.dirty_inodes.is_empty() {
            return Ok(());
        }

        let dirty = std::mem::take(&mut self.dirty_inodes);
        let mut current: Option<(u64, Block)> = None;
        for &ino in &dirty {
            let (blk, offset) = inode_location(self.geometry.inode_table, self.geometry.inode_stride, ino);
            if let Some((n, block)) = current {
                if n != blk {
                    self.cache.write_block(n, &block).await?;
                    current = None;
                }
            }
            let (n, mut block) = match current {
                Some(entry) => entry,
                None => (blk, self.cache.read_block(blk).await?),
            };
            self.inode_table[(ino - 1) as usize].encode(&mut block[offset..offset + INODE_RECORD_SIZE])?;
            current = Some((n, block));
        }
        if let Some((n, block)) = current {
            self.cache.write_block(n, &block).await?;
        }

        log::debug!("MOUNT: {} flushed {} inode records", self.id, dirty.len());
        Ok(())
    }

    /// Flush the inode table and sync the underlying device
    pub async fn sync(&mut self) -> Result<()> {
        self.flush_inode_table().await?;
        self.cache.sync().await?;
        Ok(())
    }

    /// Flush everything and close the underlying device
    pub async fn close(&mut self) -> Result<()> {
        self.flush_inode_table().await?;
        self.cache.device().close().await?;
        self.cache.clear();
        log::info!("MOUNT: closed {} ({})", self.image.display(), self.mount_point);
        Ok(())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("image", &self.image)
            .field("mount_point", &self.mount_point)
            .field("geometry", &self.geometry)
            .field("busy", &self.busy)
            .finish()
    }
}

/// Fixed-capacity table of open devices
#[derive(Debug)]
pub struct MountTable {
    entries: Vec<Option<Device>>,
}

impl MountTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn device(&self, id: DeviceId) -> Result<&Device> {
        self.entries.get(id.0).and_then(Option::as_ref).ok_or(FsError::NoSuchDevice)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Result<&mut Device> {
        self.entries.get_mut(id.0).and_then(Option::as_mut).ok_or(FsError::NoSuchDevice)
    }

    /// First unused slot
    pub fn free_slot(&self) -> Option<DeviceId> {
        self.entries.iter().position(Option::is_none).map(DeviceId)
    }

    pub(crate) fn insert(&mut self, device: Device) -> Result<()> {
        match self.entries.get_mut(device.id.0) {
            Some(slot @ None) => {
                *slot = Some(device);
                Ok(())
            }
            Some(Some(_)) => Err(FsError::MountBusy),
            None => Err(FsError::MountTableFull),
        }
    }

    pub(crate) fn take(&mut self, id: DeviceId) -> Option<Device> {
        self.entries.get_mut(id.0).and_then(Option::take)
    }

    /// Device opened from `image`, comparing canonical paths
    pub fn find_image(&self, image: &Path) -> Option<DeviceId> {
        let wanted = canonical(image);
        self.iter().find(|d| canonical(&d.image) == wanted).map(|d| d.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.entries.iter().flatten()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.entries.iter_mut().flatten()
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// One row of [`FileSystem::list_mounts`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub device: DeviceId,
    pub image: PathBuf,
    pub mount_point: String,
}

impl FileSystem {
    /// Mount the image at `image` on the directory `mount_point`
    pub async fn mount(&mut self, pid: Pid, image: impl AsRef<Path>, mount_point: &str) -> Result<DeviceId> {
        let image = image.as_ref();
        if self.mounts.find_image(image).is_some() {
            return Err(FsError::AlreadyMounted);
        }

        let (dev, ino) = self.resolve(pid, mount_point).await?;
        if !self.inode_snapshot(dev, ino)?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        // Resolution crosses into mounted devices, so a root inode here is
        // either `/` or a directory that already has something mounted on it.
        if ino == ROOT_INO {
            return Err(if dev == self.root_dev { FsError::MountBusy } else { FsError::AlreadyMounted });
        }

        let slot = self.mounts.free_slot().ok_or(FsError::MountTableFull)?;
        let path = self.path_of(dev, ino).await?;
        let mut device = Device::open(slot, image, &path, self.config.block_cache_blocks).await?;

        let mp = match self.inodes.get(&self.mounts, dev, ino) {
            Ok(mp) => mp,
            Err(e) => {
                device.close().await?;
                return Err(e);
            }
        };
        self.inodes.minode_mut(mp)?.mounted = Some(slot);
        device.mounted_on = Some(mp);
        self.mounts.insert(device)?;

        log::info!("MOUNT: {} mounted on {} as {}", image.display(), path, slot);
        Ok(slot)
    }

    /// Unmount the device whose root `mount_point` resolves to
    pub async fn unmount(&mut self, pid: Pid, mount_point: &str) -> Result<()> {
        let (dev, ino) = self.resolve(pid, mount_point).await?;
        let device = self.mounts.device(dev)?;
        if device.is_busy() {
            return Err(FsError::MountBusy);
        }
        if ino != ROOT_INO || device.mounted_on.is_none() {
            return Err(FsError::NoSuchDevice);
        }
        if self.inodes.holders_on(dev) > 0 {
            return Err(FsError::MountBusy);
        }

        self.inodes.evict_device(&mut self.mounts, dev)?;
        let mut device = self.mounts.take(dev).ok_or(FsError::NoSuchDevice)?;
        device.close().await?;

        if let Some(mp) = device.mounted_on.take() {
            self.inodes.minode_mut(mp)?.mounted = None;
            self.inodes.release(&mut self.mounts, mp)?;
        }
        log::info!("MOUNT: unmounted {}", device.mount_point());
        Ok(())
    }

    /// (image, mount point) of every mounted device, root first
    pub fn list_mounts(&self) -> Vec<MountInfo> {
        self.mounts
            .iter()
            .map(|d| MountInfo {
                device: d.id(),
                image: d.image().to_path_buf(),
                mount_point: d.mount_point().to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{format_image, mode};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_device_open_decodes_geometry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.img");
        format_image(&path, 512, 64).await.unwrap();

        let device = Device::open(DeviceId(0), &path, "/", 16).await.unwrap();
        let geo = device.geometry();
        assert_eq!(geo.ninodes, 64);
        assert_eq!(geo.nblocks, 512);
        assert_eq!(geo.inode_table_blocks(), 8);
        assert!(device.inode(ROOT_INO).unwrap().is_dir());
        assert!(matches!(device.inode(0), Err(FsError::InvalidInode(0))));
        assert!(matches!(device.inode(65), Err(FsError::InvalidInode(65))));
    }

    #[tokio::test]
    async fn test_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("zero.img");
        ImageDevice::create(&path, 64).await.unwrap();

        let result = Device::open(DeviceId(0), &path, "/", 16).await;
        assert!(matches!(result, Err(FsError::InvalidFilesystem(_))));
    }

    #[tokio::test]
    async fn test_rejects_oversized_inode_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rev1.img");
        format_image(&path, 256, 32).await.unwrap();

        let image = ImageDevice::open(&path, false).await.unwrap();
        let mut raw = image.read_block(SUPERBLOCK_BLOCK).await.unwrap();
        let mut sb = Superblock::decode(&raw);
        sb.rev_level = 1;
        sb.first_ino = 11;
        sb.inode_size = 200;
        sb.encode_into(&mut raw);
        image.write_block(SUPERBLOCK_BLOCK, &raw).await.unwrap();
        image.close().await.unwrap();

        let result = Device::open(DeviceId(0), &path, "/", 16).await;
        assert!(matches!(result, Err(FsError::InvalidFilesystem(_))));
    }

    #[tokio::test]
    async fn test_inode_table_flush_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flush.img");
        format_image(&path, 256, 32).await.unwrap();

        let mut device = Device::open(DeviceId(0), &path, "/", 16).await.unwrap();
        let mut inode = DiskInode::new(mode::S_IFREG | 0o600, 3, 4, 1);
        inode.size = 42;
        device.store_inode(20, &inode);
        device.store_inode(99, &inode);
        device.close().await.unwrap();

        let device = Device::open(DeviceId(0), &path, "/", 16).await.unwrap();
        assert_eq!(device.inode(20).unwrap(), &inode);
        assert!(device.inode(ROOT_INO).unwrap().is_dir());
    }

    #[test]
    fn test_mount_table_slots() {
        let table = MountTable::new(2);
        assert_eq!(table.free_slot(), Some(DeviceId(0)));
        assert!(matches!(table.device(DeviceId(1)), Err(FsError::NoSuchDevice)));
        assert_eq!(table.iter().count(), 0);
    }
}
