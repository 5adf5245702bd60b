//! Reference-counted cache of in-memory inodes ("minodes")
//!
//! At most one slot is live per (device, inode) key. A slot whose reference
//! count has dropped to zero keeps its key, so a later lookup can revive it,
//! but it is also a candidate for reuse by a different key once no empty slot
//! is left.

use crate::error::{FsError, Result};
use crate::format::DiskInode;
use crate::mount::{DeviceId, MountTable};

/// Index of an inode-cache slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MinodeId(pub(crate) usize);

/// A cached inode
#[derive(Debug, Clone)]
pub struct Minode {
    pub dev: DeviceId,
    pub ino: u32,
    /// Working copy of the on-disk record
    pub inode: DiskInode,
    pub(crate) ref_count: u32,
    /// Set by whoever modifies `inode`; cleared on write-back
    pub dirty: bool,
    /// Device mounted on this directory, if any
    pub mounted: Option<DeviceId>,
}

impl Minode {
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

/// Fixed-capacity arena of cached inodes
#[derive(Debug)]
pub struct InodeCache {
    slots: Vec<Option<Minode>>,
}

impl InodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Take a reference on (dev, ino), loading it from the device's inode table if needed
    pub fn get(&mut self, mounts: &MountTable, dev: DeviceId, ino: u32) -> Result<MinodeId> {
        if let Some(id) = self.find(dev, ino) {
            let minode = self.minode_mut(id)?;
            if minode.ref_count == 0 {
                // Idle slots were written back on release; refresh in case the
                // table changed underneath.
                minode.inode = mounts.device(dev)?.inode(ino)?.clone();
            }
            minode.ref_count += 1;
            return Ok(id);
        }

        let inode = mounts.device(dev)?.inode(ino)?.clone();
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .or_else(|| {
                self.slots
                    .iter()
                    .position(|slot| matches!(slot, Some(m) if m.ref_count == 0 && !m.dirty && m.mounted.is_none()))
            })
            .ok_or(FsError::InodeCacheFull)?;

        if let Some(old) = &self.slots[index] {
            log::debug!("ICACHE: reusing slot {} ({} ino {})", index, old.dev, old.ino);
        }
        self.slots[index] = Some(Minode {
            dev,
            ino,
            inode,
            ref_count: 1,
            dirty: false,
            mounted: None,
        });
        Ok(MinodeId(index))
    }

    /// Take an extra reference on a slot that is already held
    pub fn acquire(&mut self, id: MinodeId) -> Result<()> {
        self.minode_mut(id)?.ref_count += 1;
        Ok(())
    }

    /// Drop one reference; a dirty inode is written back to its device's table
    pub fn release(&mut self, mounts: &mut MountTable, id: MinodeId) -> Result<()> {
        let Some(Some(minode)) = self.slots.get_mut(id.0) else {
            log::warn!("ICACHE: release of unknown slot {}", id.0);
            return Ok(());
        };

        if minode.ref_count == 0 {
            log::warn!("ICACHE: release of idle slot {} ({} ino {})", id.0, minode.dev, minode.ino);
        } else {
            minode.ref_count -= 1;
        }

        if minode.dirty {
            mounts.device_mut(minode.dev)?.store_inode(minode.ino, &minode.inode);
            minode.dirty = false;
        }
        Ok(())
    }

    pub fn minode(&self, id: MinodeId) -> Result<&Minode> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| FsError::Corrupt(format!("stale inode cache slot {}", id.0)))
    }

    pub fn minode_mut(&mut self, id: MinodeId) -> Result<&mut Minode> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| FsError::Corrupt(format!("stale inode cache slot {}", id.0)))
    }

    /// Slot currently keyed by (dev, ino), referenced or not
    pub fn find(&self, dev: DeviceId, ino: u32) -> Option<MinodeId> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(m) if m.dev == dev && m.ino == ino))
            .map(MinodeId)
    }

    /// Whether anyone holds a reference on (dev, ino)
    pub fn is_referenced(&self, dev: DeviceId, ino: u32) -> bool {
        self.find(dev, ino)
            .and_then(|id| self.minode(id).ok())
            .map_or(false, |m| m.ref_count > 0)
    }

    /// Device mounted on (dev, ino), if that inode is a mount point
    pub fn mounted_on(&self, dev: DeviceId, ino: u32) -> Option<DeviceId> {
        self.find(dev, ino).and_then(|id| self.minode(id).ok()).and_then(|m| m.mounted)
    }

    /// Number of referenced slots belonging to `dev`
    pub fn holders_on(&self, dev: DeviceId) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|m| m.dev == dev && m.ref_count > 0)
            .count()
    }

    /// Number of referenced slots
    pub fn in_use(&self) -> usize {
        self.slots.iter().flatten().filter(|m| m.ref_count > 0).count()
    }

    /// Write back and drop every idle slot of `dev`
    pub fn evict_device(&mut self, mounts: &mut MountTable, dev: DeviceId) -> Result<()> {
        for slot in self.slots.iter_mut() {
            let evict = match slot {
                Some(minode) if minode.dev == dev && minode.ref_count == 0 => {
                    if minode.dirty {
                        mounts.device_mut(dev)?.store_inode(minode.ino, &minode.inode);
                    }
                    true
                }
                _ => false,
            };
            if evict {
                *slot = None;
            }
        }
        Ok(())
    }

    /// Write back every dirty slot without touching reference counts
    pub fn flush_all(&mut self, mounts: &mut MountTable) -> Result<()> {
        for minode in self.slots.iter_mut().flatten() {
            if minode.dirty {
                mounts.device_mut(minode.dev)?.store_inode(minode.ino, &minode.inode);
                minode.dirty = false;
            }
        }
        Ok(())
    }
}
