//! The filesystem context: every in-memory table, passed explicitly
//!
//! All operations take the calling process id. Nothing here is global; a
//! caller that wants a "current process" keeps the pid itself.

use std::path::Path;

use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::file::OpenFileTable;
use crate::format::ROOT_INO;
use crate::inode_cache::{InodeCache, MinodeId};
use crate::mount::{Device, DeviceId, MountTable};
use crate::process::ProcessTable;

/// A mounted namespace rooted at one image, plus its simulated processes
#[derive(Debug)]
pub struct FileSystem {
    pub(crate) config: FsConfig,
    pub(crate) mounts: MountTable,
    pub(crate) inodes: InodeCache,
    pub(crate) files: OpenFileTable,
    pub(crate) procs: ProcessTable,
    pub(crate) root_dev: DeviceId,
    pub(crate) root: MinodeId,
}

impl FileSystem {
    /// Mount `image` as `/` and create the process table.
    ///
    /// Every process starts with `/` as its working directory.
    pub async fn open_root(image: impl AsRef<Path>, config: FsConfig) -> Result<Self> {
        config.validate()?;

        let root_dev = DeviceId(0);
        let mut device = Device::open(root_dev, image.as_ref(), "/", config.block_cache_blocks).await?;
        device.set_busy(true);
        let mut mounts = MountTable::new(config.mount_table_slots);
        mounts.insert(device)?;

        let mut inodes = InodeCache::new(config.inode_cache_slots);
        let root = inodes.get(&mounts, root_dev, ROOT_INO)?;
        if !inodes.minode(root)?.inode.is_dir() {
            return Err(FsError::InvalidFilesystem("root inode is not a directory".to_string()));
        }
        for _ in 0..config.processes {
            inodes.acquire(root)?;
        }
        let procs = ProcessTable::new(config.processes, config.descriptors_per_process, root);

        log::info!(
            "VFS: root {} mounted, {} processes, {} inode slots",
            image.as_ref().display(),
            config.processes,
            config.inode_cache_slots
        );

        Ok(Self {
            files: OpenFileTable::new(config.open_file_slots),
            config,
            mounts,
            inodes,
            procs,
            root_dev,
            root,
        })
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Device mounted at `/`
    pub fn root_device(&self) -> DeviceId {
        self.root_dev
    }

    pub fn mount_table(&self) -> &MountTable {
        &self.mounts
    }

    pub fn inode_cache(&self) -> &InodeCache {
        &self.inodes
    }

    pub fn open_files(&self) -> &OpenFileTable {
        &self.files
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.procs
    }

    /// Write back dirty cached inodes and flush every device's inode table
    pub async fn sync(&mut self) -> Result<()> {
        self.inodes.flush_all(&mut self.mounts)?;
        for device in self.mounts.iter_mut() {
            device.sync().await?;
        }
        log::debug!("VFS: synced {} devices", self.mounts.iter().count());
        Ok(())
    }

    /// Flush everything and close every device, mounted ones before the root
    pub async fn shutdown(mut self) -> Result<()> {
        self.inodes.flush_all(&mut self.mounts)?;

        let mut ids: Vec<DeviceId> = self.mounts.iter().map(Device::id).collect();
        ids.sort_by_key(|&id| (id == self.root_dev, id));
        for id in ids {
            if let Some(mut device) = self.mounts.take(id) {
                device.close().await?;
            }
        }

        log::info!("VFS: shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::format_image;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_root_pins_working_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("root.img");
        format_image(&path, 512, 64).await.unwrap();

        let fs = FileSystem::open_root(&path, FsConfig::default()).await.unwrap();
        let root = fs.inode_cache().minode(fs.root).unwrap();
        assert_eq!(root.ref_count(), 1 + FsConfig::default().processes as u32);
        assert!(fs.mount_table().device(fs.root_device()).unwrap().is_busy());
        fs.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_root_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("root.img");
        format_image(&path, 512, 64).await.unwrap();

        let config = FsConfig { mount_table_slots: 0, ..Default::default() };
        assert!(matches!(FileSystem::open_root(&path, config).await, Err(FsError::Config(_))));
    }
}
