//! Error taxonomy for filesystem operations

use std::io;

use thiserror::Error;

use crate::blockdev::BlockDeviceError;
use crate::config::ConfigError;
use crate::format::FormatError;

/// Every failure a filesystem operation reports to its caller
#[derive(Error, Debug)]
pub enum FsError {
    #[error("No such file or directory")]
    NotFound,
    #[error("File exists")]
    AlreadyExists,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Is a directory")]
    IsADirectory,
    #[error("Not a symbolic link")]
    NotASymlink,
    #[error("Directory not empty")]
    NotEmpty,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("No free inodes")]
    NoFreeInodes,
    #[error("No free blocks")]
    NoFreeBlocks,
    #[error("Bad file descriptor")]
    InvalidDescriptor,
    #[error("Too many open files")]
    TooManyOpenFiles,
    #[error("Not a valid ext2 filesystem: {0}")]
    InvalidFilesystem(String),
    #[error("Path too deep")]
    PathTooDeep,
    #[error("Mount point is busy")]
    MountBusy,
    #[error("Filesystem already mounted")]
    AlreadyMounted,
    #[error("Mount table is full")]
    MountTableFull,
    #[error("Invalid inode number {0}")]
    InvalidInode(u32),
    #[error("Inode cache is full")]
    InodeCacheFull,
    #[error("Invalid file name")]
    InvalidName,
    #[error("File name too long")]
    NameTooLong,
    #[error("File too large")]
    FileTooLarge,
    #[error("Seek offset {0} past end of file")]
    InvalidSeek(u32),
    #[error("Descriptor not opened for this access")]
    BadAccessMode,
    #[error("Resource busy")]
    Busy,
    #[error("Cross-device link")]
    CrossDevice,
    #[error("No such process {0}")]
    NoSuchProcess(usize),
    #[error("No such device")]
    NoSuchDevice,
    #[error("Directory has no room for another block")]
    DirectoryFull,
    #[error("Filesystem is corrupt: {0}")]
    Corrupt(String),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
    #[error("I/O error: {0}")]
    Io(#[from] BlockDeviceError),
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        FsError::Io(BlockDeviceError::Io(err))
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
