//! Path components and resolution across mount points

use crate::dir;
use crate::error::{FsError, Result};
use crate::format::{DiskInode, ROOT_INO};
use crate::mount::DeviceId;
use crate::process::Pid;
use crate::vfs::FileSystem;

/// Upper bound on `..` steps when rebuilding a path
const MAX_WALK: usize = 4096;

/// Lazily split components of a `/`-separated path.
///
/// Empty components (from `//` or a trailing `/`) are skipped. Yields
/// `Err(PathTooDeep)` once more than `max_depth` components have been seen.
/// Clone it to restart from the beginning.
#[derive(Debug, Clone)]
pub struct Components<'a> {
    parts: std::str::Split<'a, char>,
    absolute: bool,
    seen: usize,
    max_depth: usize,
}

impl<'a> Components<'a> {
    pub fn new(path: &'a str, max_depth: usize) -> Self {
        Self {
            parts: path.split('/'),
            absolute: path.starts_with('/'),
            seen: 0,
            max_depth,
        }
    }

    /// Whether resolution starts at the global root
    pub fn is_absolute(&self) -> bool {
        self.absolute
    }
}

impl<'a> Iterator for Components<'a> {
    type Item = Result<&'a str>;

    fn next(&mut self) -> Option<Self::Item> {
        let part = self.parts.by_ref().find(|p| !p.is_empty())?;
        self.seen += 1;
        if self.seen > self.max_depth {
            return Some(Err(FsError::PathTooDeep));
        }
        Some(Ok(part))
    }
}

/// Split `path` into its parent path and final name.
///
/// The parent of a bare name is `""`, which resolves to the working
/// directory.
pub fn split_parent(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::InvalidName);
    }
    Ok(match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => ("", trimmed),
    })
}

impl FileSystem {
    /// Resolve `path` for process `pid` to a (device, inode) pair.
    ///
    /// Relative paths start at the process's working directory. After each
    /// step, a `..` that stays put on a non-root device climbs out through
    /// the mount point, and an inode with a device mounted on it is replaced
    /// by that device's root.
    pub async fn resolve(&self, pid: Pid, path: &str) -> Result<(DeviceId, u32)> {
        let components = Components::new(path, self.config.max_path_depth);
        let (mut dev, mut ino) = if components.is_absolute() {
            (self.root_dev, ROOT_INO)
        } else {
            let cwd = self.inodes.minode(self.procs.get(pid)?.cwd)?;
            (cwd.dev, cwd.ino)
        };

        for name in components {
            let name = name?;
            let prev = ino;
            let dir = self.inode_snapshot(dev, ino)?;
            ino = dir::search(self.mounts.device(dev)?, &dir, name).await?;
            if ino == 0 {
                return Err(FsError::NotFound);
            }

            if name == ".." && ino == prev && dev != self.root_dev {
                (dev, ino) = self.mount_parent(dev).await?;
            } else if let Some(child) = self.inodes.mounted_on(dev, ino) {
                dev = child;
                ino = ROOT_INO;
            }
        }

        log::trace!("PATH: '{}' -> {} ino {}", path, dev, ino);
        Ok((dev, ino))
    }

    /// Current contents of an inode: the cached copy if one is live, else the device table
    pub fn inode_snapshot(&self, dev: DeviceId, ino: u32) -> Result<DiskInode> {
        match self.inodes.find(dev, ino) {
            Some(id) => Ok(self.inodes.minode(id)?.inode.clone()),
            None => Ok(self.mounts.device(dev)?.inode(ino)?.clone()),
        }
    }

    /// (device, inode) of the directory a mounted device's mount point lives in
    async fn mount_parent(&self, dev: DeviceId) -> Result<(DeviceId, u32)> {
        let (parent_dev, mp_ino) = self.covered_inode(dev)?;
        let covered = self.inode_snapshot(parent_dev, mp_ino)?;
        let parent = dir::parent_of(self.mounts.device(parent_dev)?, &covered).await?;
        Ok((parent_dev, parent))
    }

    /// (device, inode) of the directory `dev` is mounted on
    fn covered_inode(&self, dev: DeviceId) -> Result<(DeviceId, u32)> {
        let mp = self
            .mounts
            .device(dev)?
            .mounted_on
            .ok_or_else(|| FsError::Corrupt(format!("{} has no mount point", dev)))?;
        let minode = self.inodes.minode(mp)?;
        Ok((minode.dev, minode.ino))
    }

    /// Absolute path of directory (dev, ino), climbing through mount points
    pub(crate) async fn path_of(&self, dev: DeviceId, ino: u32) -> Result<String> {
        let mut names = Vec::new();
        let (mut dev, mut ino) = (dev, ino);

        for _ in 0..MAX_WALK {
            if dev == self.root_dev && ino == ROOT_INO {
                names.reverse();
                return Ok(format!("/{}", names.join("/")));
            }
            if ino == ROOT_INO {
                (dev, ino) = self.covered_inode(dev)?;
                continue;
            }

            let device = self.mounts.device(dev)?;
            let parent = dir::parent_of(device, &self.inode_snapshot(dev, ino)?).await?;
            let name = dir::name_of(device, &self.inode_snapshot(dev, parent)?, ino)
                .await?
                .ok_or_else(|| FsError::Corrupt(format!("inode {} missing from its parent {}", ino, parent)))?;
            names.push(name);
            ino = parent;
        }

        Err(FsError::Corrupt("directory tree loops".to_string()))
    }

    /// Working directory of `pid` as an absolute path
    pub async fn pwd(&self, pid: Pid) -> Result<String> {
        let cwd = self.inodes.minode(self.procs.get(pid)?.cwd)?;
        self.path_of(cwd.dev, cwd.ino).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components_skip_empty_parts() {
        let parts: Vec<_> = Components::new("/a//b/c/", 20).map(|p| p.unwrap()).collect();
        assert_eq!(parts, ["a", "b", "c"]);
        assert!(Components::new("/a", 20).is_absolute());
        assert!(!Components::new("a/b", 20).is_absolute());
        assert_eq!(Components::new("/", 20).count(), 0);
    }

    #[test]
    fn test_components_depth_limit() {
        let deep = "x/".repeat(5);
        let mut components = Components::new(&deep, 4);
        let restart = components.clone();
        for _ in 0..4 {
            assert!(components.next().unwrap().is_ok());
        }
        assert!(matches!(components.next(), Some(Err(FsError::PathTooDeep))));
        assert_eq!(restart.take(4).filter(|p| p.is_ok()).count(), 4);
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("/a").unwrap(), ("/", "a"));
        assert_eq!(split_parent("/a/b/").unwrap(), ("/a", "b"));
        assert_eq!(split_parent("a/b").unwrap(), ("a", "b"));
        assert_eq!(split_parent("b").unwrap(), ("", "b"));
        assert!(matches!(split_parent("/"), Err(FsError::InvalidName)));
    }
}
