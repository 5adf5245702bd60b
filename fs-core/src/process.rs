//! Simulated processes: credentials, working directory, descriptor table

use crate::error::{FsError, Result};
use crate::file::OpenFileId;
use crate::inode_cache::MinodeId;
use crate::mount::DeviceId;
use crate::vfs::FileSystem;

/// Process id (index into the process table)
pub type Pid = usize;
/// Descriptor number within one process
pub type Fd = usize;

#[derive(Debug, Clone)]
pub struct Process {
    pub pid: Pid,
    pub uid: u16,
    pub gid: u16,
    /// Held reference on the working directory
    pub(crate) cwd: MinodeId,
    pub(crate) fds: Vec<Option<OpenFileId>>,
}

impl Process {
    /// Open-file entry behind `fd`
    pub(crate) fn file(&self, fd: Fd) -> Result<OpenFileId> {
        self.fds.get(fd).copied().flatten().ok_or(FsError::InvalidDescriptor)
    }

    /// Lowest unused descriptor
    pub(crate) fn free_fd(&self) -> Option<Fd> {
        self.fds.iter().position(Option::is_none)
    }
}

/// Fixed set of processes created at start-up
#[derive(Debug)]
pub struct ProcessTable {
    procs: Vec<Process>,
}

impl ProcessTable {
    /// Process `i` gets uid = gid = i, except that process 1 shares process 0's group
    pub fn new(count: usize, descriptors: usize, root: MinodeId) -> Self {
        let mut procs: Vec<Process> = (0..count)
            .map(|pid| Process {
                pid,
                uid: pid as u16,
                gid: pid as u16,
                cwd: root,
                fds: vec![None; descriptors],
            })
            .collect();
        if count > 1 {
            procs[1].gid = procs[0].gid;
        }
        Self { procs }
    }

    pub fn get(&self, pid: Pid) -> Result<&Process> {
        self.procs.get(pid).ok_or(FsError::NoSuchProcess(pid))
    }

    pub fn get_mut(&mut self, pid: Pid) -> Result<&mut Process> {
        self.procs.get_mut(pid).ok_or(FsError::NoSuchProcess(pid))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.procs.iter()
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}

/// One row of [`FileSystem::list_processes`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub uid: u16,
    pub gid: u16,
    pub cwd: (DeviceId, u32),
    pub open_descriptors: usize,
}

impl FileSystem {
    pub fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        self.procs
            .iter()
            .map(|p| {
                let cwd = self.inodes.minode(p.cwd)?;
                Ok(ProcessInfo {
                    pid: p.pid,
                    uid: p.uid,
                    gid: p.gid,
                    cwd: (cwd.dev, cwd.ino),
                    open_descriptors: p.fds.iter().flatten().count(),
                })
            })
            .collect()
    }

    /// Check that `pid` exists; the caller makes it the current process
    pub fn switch_process(&self, pid: Pid) -> Result<Pid> {
        self.procs.get(pid)?;
        log::debug!("PROC: switched to {}", pid);
        Ok(pid)
    }
}
