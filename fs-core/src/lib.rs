//! extfs core - a user-space ext2 engine
//!
//! This crate reads and writes single-group ext2 images with 1 KiB blocks:
//! bitmap allocation, a fixed inode cache, direct/indirect block mapping,
//! variable-length directory records, and a namespace of several images
//! mounted on each other's directories. A handful of simulated processes
//! each carry credentials, a working directory and a descriptor table.
//!
//! ```no_run
//! use extfs::{format_image, FileSystem, FsConfig, OpenMode};
//!
//! # async fn demo() -> extfs::Result<()> {
//! format_image("disk.img", 1440, 184).await?;
//! let mut fs = FileSystem::open_root("disk.img", FsConfig::default()).await?;
//! fs.creat(0, "/hello").await?;
//! let fd = fs.open(0, "/hello", OpenMode::Write).await?;
//! fs.write(0, fd, b"hello world").await?;
//! fs.close(0, fd)?;
//! fs.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod blockdev;
pub mod cache;
pub mod config;
pub mod error;
pub mod format;

pub mod bitmap;
pub mod dir;
pub mod inode_cache;
pub mod layout;
pub mod mount;
pub mod path;

pub mod file;
pub mod ops;
pub mod process;
pub mod vfs;

pub use config::{ConfigError, FsConfig};
pub use error::{FsError, Result};
pub use file::{DescriptorInfo, OpenMode};
pub use format::{format_image, FileType};
pub use mount::{DeviceId, MountInfo};
pub use ops::{DirListing, FileStat};
pub use process::{Fd, Pid, ProcessInfo};
pub use vfs::FileSystem;

/// Re-export common types and traits
pub mod prelude {
    pub use crate::error::{FsError, Result};
    pub use crate::file::OpenMode;
    pub use crate::process::{Fd, Pid};
    pub use crate::vfs::FileSystem;
}
