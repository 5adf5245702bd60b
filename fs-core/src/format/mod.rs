//! ext2 on-disk format: record codecs and image formatting
//!
//! Every structure is decoded from and encoded into plain byte buffers at
//! fixed little-endian offsets. Encoders patch only the fields they own, so
//! bytes this engine does not model (reserved areas, rev-1 extensions) are
//! left exactly as found on disk.

use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::blockdev::{Block, BlockDevice, BlockDeviceError, ImageDevice, BLOCK_SIZE};
use crate::bitmap::set_bit;

/// ext2 superblock magic
pub const EXT2_MAGIC: u16 = 0xEF53;
/// Block holding the superblock (1KB blocks)
pub const SUPERBLOCK_BLOCK: u64 = 1;
/// Block holding the group descriptor table
pub const GROUP_DESC_BLOCK: u64 = 2;
/// Root directory inode number
pub const ROOT_INO: u32 = 2;
/// Number of low inode numbers reserved by the format (1..=11)
pub const RESERVED_INODES: u32 = 11;
/// Inode of `lost+found` on images produced by [`format_image`]
pub const LOST_AND_FOUND_INO: u32 = 11;
/// Size of the inode record this engine decodes
pub const INODE_RECORD_SIZE: usize = 128;
/// Bits available in a one-block bitmap
pub const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

/// Block pointer slots in an inode
pub const N_BLOCKS: usize = 15;
/// Direct pointers (slots 0..12)
pub const DIRECT_BLOCKS: usize = 12;
/// Slot of the single-indirect pointer
pub const SINGLE_INDIRECT: usize = 12;
/// Slot of the double-indirect pointer
pub const DOUBLE_INDIRECT: usize = 13;
/// Block numbers per indirect block
pub const POINTERS_PER_BLOCK: usize = BLOCK_SIZE / 4;

/// Directory record header: inode(4) rec_len(2) name_len(1) file_type(1)
pub const DIR_REC_HEADER: usize = 8;
/// Directory record lengths are multiples of this
pub const DIR_REC_ALIGN: usize = 4;
/// Longest name a directory record can hold
pub const MAX_NAME_LEN: usize = 255;
/// Longest target stored inline in a fast symlink (leaves room for a NUL)
pub const FAST_SYMLINK_MAX: usize = N_BLOCKS * 4 - 1;

/// Inode mode bits
pub mod mode {
    pub const S_IFMT: u16 = 0xF000;
    pub const S_IFSOCK: u16 = 0xC000;
    pub const S_IFLNK: u16 = 0xA000;
    pub const S_IFREG: u16 = 0x8000;
    pub const S_IFBLK: u16 = 0x6000;
    pub const S_IFDIR: u16 = 0x4000;
    pub const S_IFCHR: u16 = 0x2000;
    pub const S_IFIFO: u16 = 0x1000;
    /// Permission and set-id bits
    pub const S_IPERM: u16 = 0x0FFF;
}

/// Error type for on-disk format operations
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Invalid magic number {0:#06x}")]
    InvalidMagic(u16),
    #[error("Unsupported block size {0} (only 1024-byte blocks are supported)")]
    UnsupportedBlockSize(u32),
    #[error("Unsupported inode size {0}")]
    UnsupportedInodeSize(u16),
    #[error("Image spans {0} block groups; only single-group images are supported")]
    MultipleGroups(u32),
    #[error("Invalid filesystem size: {0}")]
    InvalidSize(String),
    #[error("Corrupt directory record at offset {0}")]
    CorruptDirEntry(usize),
}

/// Seconds since the epoch, as stored in ext2 timestamps
pub fn now() -> u32 {
    chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
}

/// File type tag stored in directory records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    Regular = 1,
    Directory = 2,
    CharDevice = 3,
    BlockDevice = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

impl FileType {
    /// Tag for an inode mode
    pub fn from_mode(m: u16) -> Self {
        match m & mode::S_IFMT {
            mode::S_IFREG => FileType::Regular,
            mode::S_IFDIR => FileType::Directory,
            mode::S_IFCHR => FileType::CharDevice,
            mode::S_IFBLK => FileType::BlockDevice,
            mode::S_IFIFO => FileType::Fifo,
            mode::S_IFSOCK => FileType::Socket,
            mode::S_IFLNK => FileType::Symlink,
            _ => FileType::Unknown,
        }
    }

    /// Tag from its on-disk byte
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            1 => FileType::Regular,
            2 => FileType::Directory,
            3 => FileType::CharDevice,
            4 => FileType::BlockDevice,
            5 => FileType::Fifo,
            6 => FileType::Socket,
            7 => FileType::Symlink,
            _ => FileType::Unknown,
        }
    }
}

/// The superblock fields this engine reads or maintains
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub errors: u16,
    pub lastcheck: u32,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
}

impl Superblock {
    /// Decode from the raw superblock block
    pub fn decode(buf: &[u8]) -> Self {
        let rev_level = LittleEndian::read_u32(&buf[76..]);
        Self {
            inodes_count: LittleEndian::read_u32(&buf[0..]),
            blocks_count: LittleEndian::read_u32(&buf[4..]),
            r_blocks_count: LittleEndian::read_u32(&buf[8..]),
            free_blocks_count: LittleEndian::read_u32(&buf[12..]),
            free_inodes_count: LittleEndian::read_u32(&buf[16..]),
            first_data_block: LittleEndian::read_u32(&buf[20..]),
            log_block_size: LittleEndian::read_u32(&buf[24..]),
            log_frag_size: LittleEndian::read_u32(&buf[28..]),
            blocks_per_group: LittleEndian::read_u32(&buf[32..]),
            frags_per_group: LittleEndian::read_u32(&buf[36..]),
            inodes_per_group: LittleEndian::read_u32(&buf[40..]),
            mtime: LittleEndian::read_u32(&buf[44..]),
            wtime: LittleEndian::read_u32(&buf[48..]),
            mnt_count: LittleEndian::read_u16(&buf[52..]),
            max_mnt_count: LittleEndian::read_u16(&buf[54..]),
            magic: LittleEndian::read_u16(&buf[56..]),
            state: LittleEndian::read_u16(&buf[58..]),
            errors: LittleEndian::read_u16(&buf[60..]),
            lastcheck: LittleEndian::read_u32(&buf[64..]),
            rev_level,
            // Revision 0 images have fixed values and leave these bytes zero.
            first_ino: if rev_level == 0 { RESERVED_INODES + 1 } else { LittleEndian::read_u32(&buf[84..]) },
            inode_size: if rev_level == 0 { INODE_RECORD_SIZE as u16 } else { LittleEndian::read_u16(&buf[88..]) },
        }
    }

    /// Patch the modelled fields into a raw superblock block
    pub fn encode_into(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..], self.inodes_count);
        LittleEndian::write_u32(&mut buf[4..], self.blocks_count);
        LittleEndian::write_u32(&mut buf[8..], self.r_blocks_count);
        LittleEndian::write_u32(&mut buf[12..], self.free_blocks_count);
        LittleEndian::write_u32(&mut buf[16..], self.free_inodes_count);
        LittleEndian::write_u32(&mut buf[20..], self.first_data_block);
        LittleEndian::write_u32(&mut buf[24..], self.log_block_size);
        LittleEndian::write_u32(&mut buf[28..], self.log_frag_size);
        LittleEndian::write_u32(&mut buf[32..], self.blocks_per_group);
        LittleEndian::write_u32(&mut buf[36..], self.frags_per_group);
        LittleEndian::write_u32(&mut buf[40..], self.inodes_per_group);
        LittleEndian::write_u32(&mut buf[44..], self.mtime);
        LittleEndian::write_u32(&mut buf[48..], self.wtime);
        LittleEndian::write_u16(&mut buf[52..], self.mnt_count);
        LittleEndian::write_u16(&mut buf[54..], self.max_mnt_count);
        LittleEndian::write_u16(&mut buf[56..], self.magic);
        LittleEndian::write_u16(&mut buf[58..], self.state);
        LittleEndian::write_u16(&mut buf[60..], self.errors);
        LittleEndian::write_u32(&mut buf[64..], self.lastcheck);
        LittleEndian::write_u32(&mut buf[76..], self.rev_level);
        if self.rev_level > 0 {
            LittleEndian::write_u32(&mut buf[84..], self.first_ino);
            LittleEndian::write_u16(&mut buf[88..], self.inode_size);
        }
    }

    /// Check the magic and the geometry this engine supports
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.magic != EXT2_MAGIC {
            return Err(FormatError::InvalidMagic(self.magic));
        }
        if self.log_block_size != 0 {
            return Err(FormatError::UnsupportedBlockSize(1024 << self.log_block_size.min(16)));
        }
        if self.rev_level != 0
            && self.inode_size != 0
            && (!self.inode_size.is_power_of_two()
                || (self.inode_size as usize) < INODE_RECORD_SIZE
                || self.inode_size as usize > BLOCK_SIZE)
        {
            return Err(FormatError::UnsupportedInodeSize(self.inode_size));
        }
        let per_group = self.blocks_per_group.max(1);
        let data_blocks = self.blocks_count.saturating_sub(self.first_data_block);
        let groups = data_blocks.div_ceil(per_group);
        if groups > 1 {
            return Err(FormatError::MultipleGroups(groups));
        }
        // One bitmap block each must cover every block and inode.
        if self.blocks_count > BITS_PER_BLOCK || self.inodes_count > BITS_PER_BLOCK {
            return Err(FormatError::InvalidSize(format!(
                "{} blocks and {} inodes do not fit one group",
                self.blocks_count, self.inodes_count
            )));
        }
        Ok(())
    }

    /// Bytes per on-disk inode slot
    pub fn inode_stride(&self) -> usize {
        if self.rev_level == 0 || self.inode_size == 0 {
            INODE_RECORD_SIZE
        } else {
            self.inode_size as usize
        }
    }
}

/// First (and only) block group descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDesc {
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            block_bitmap: LittleEndian::read_u32(&buf[0..]),
            inode_bitmap: LittleEndian::read_u32(&buf[4..]),
            inode_table: LittleEndian::read_u32(&buf[8..]),
            free_blocks_count: LittleEndian::read_u16(&buf[12..]),
            free_inodes_count: LittleEndian::read_u16(&buf[14..]),
            used_dirs_count: LittleEndian::read_u16(&buf[16..]),
        }
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..], self.block_bitmap);
        LittleEndian::write_u32(&mut buf[4..], self.inode_bitmap);
        LittleEndian::write_u32(&mut buf[8..], self.inode_table);
        LittleEndian::write_u16(&mut buf[12..], self.free_blocks_count);
        LittleEndian::write_u16(&mut buf[14..], self.free_inodes_count);
        LittleEndian::write_u16(&mut buf[16..], self.used_dirs_count);
    }
}

/// On-disk inode record (the 128-byte rev-0 layout)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskInode {
    /// File mode and type
    pub mode: u16,
    /// Owner user id
    pub uid: u16,
    /// Size in bytes
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    /// Owner group id
    pub gid: u16,
    /// Number of hard links
    pub links_count: u16,
    /// Number of 512-byte sectors allocated
    pub blocks: u32,
    pub flags: u32,
    pub osd1: u32,
    /// Block pointers: 12 direct, single-indirect, double-indirect, triple-indirect
    pub block: [u32; N_BLOCKS],
    pub generation: u32,
    pub file_acl: u32,
    pub dir_acl: u32,
    pub faddr: u32,
    pub osd2: [u8; 12],
}

impl DiskInode {
    /// Decode from the first 128 bytes of an inode slot
    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(buf);
        let mut inode = DiskInode {
            mode: cursor.read_u16::<LittleEndian>()?,
            uid: cursor.read_u16::<LittleEndian>()?,
            size: cursor.read_u32::<LittleEndian>()?,
            atime: cursor.read_u32::<LittleEndian>()?,
            ctime: cursor.read_u32::<LittleEndian>()?,
            mtime: cursor.read_u32::<LittleEndian>()?,
            dtime: cursor.read_u32::<LittleEndian>()?,
            gid: cursor.read_u16::<LittleEndian>()?,
            links_count: cursor.read_u16::<LittleEndian>()?,
            blocks: cursor.read_u32::<LittleEndian>()?,
            flags: cursor.read_u32::<LittleEndian>()?,
            osd1: cursor.read_u32::<LittleEndian>()?,
            ..Default::default()
        };
        cursor.read_u32_into::<LittleEndian>(&mut inode.block)?;
        inode.generation = cursor.read_u32::<LittleEndian>()?;
        inode.file_acl = cursor.read_u32::<LittleEndian>()?;
        inode.dir_acl = cursor.read_u32::<LittleEndian>()?;
        inode.faddr = cursor.read_u32::<LittleEndian>()?;
        cursor.read_exact(&mut inode.osd2)?;
        Ok(inode)
    }

    /// Encode into the first 128 bytes of an inode slot
    pub fn encode(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut cursor = Cursor::new(buf);
        cursor.write_u16::<LittleEndian>(self.mode)?;
        cursor.write_u16::<LittleEndian>(self.uid)?;
        cursor.write_u32::<LittleEndian>(self.size)?;
        cursor.write_u32::<LittleEndian>(self.atime)?;
        cursor.write_u32::<LittleEndian>(self.ctime)?;
        cursor.write_u32::<LittleEndian>(self.mtime)?;
        cursor.write_u32::<LittleEndian>(self.dtime)?;
        cursor.write_u16::<LittleEndian>(self.gid)?;
        cursor.write_u16::<LittleEndian>(self.links_count)?;
        cursor.write_u32::<LittleEndian>(self.blocks)?;
        cursor.write_u32::<LittleEndian>(self.flags)?;
        cursor.write_u32::<LittleEndian>(self.osd1)?;
        for &ptr in &self.block {
            cursor.write_u32::<LittleEndian>(ptr)?;
        }
        cursor.write_u32::<LittleEndian>(self.generation)?;
        cursor.write_u32::<LittleEndian>(self.file_acl)?;
        cursor.write_u32::<LittleEndian>(self.dir_acl)?;
        cursor.write_u32::<LittleEndian>(self.faddr)?;
        cursor.write_all(&self.osd2)?;
        Ok(())
    }

    /// A fresh inode of the given mode, owner and link count, stamped now
    pub fn new(mode: u16, uid: u16, gid: u16, links_count: u16) -> Self {
        let now = now();
        Self {
            mode,
            uid,
            gid,
            links_count,
            atime: now,
            ctime: now,
            mtime: now,
            ..Default::default()
        }
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & mode::S_IFMT == mode::S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & mode::S_IFMT == mode::S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & mode::S_IFMT == mode::S_IFLNK
    }

    /// A symlink whose target is stored in the pointer slots
    pub fn is_fast_symlink(&self) -> bool {
        self.is_symlink() && self.blocks == 0
    }

    /// Raw bytes of the pointer slots (fast symlink storage)
    pub fn block_bytes(&self) -> [u8; N_BLOCKS * 4] {
        let mut bytes = [0u8; N_BLOCKS * 4];
        LittleEndian::write_u32_into(&self.block, &mut bytes);
        bytes
    }

    /// Overwrite the pointer slots with raw bytes (zero padded)
    pub fn set_block_bytes(&mut self, data: &[u8]) {
        let mut bytes = [0u8; N_BLOCKS * 4];
        let len = data.len().min(bytes.len());
        bytes[..len].copy_from_slice(&data[..len]);
        LittleEndian::read_u32_into(&bytes, &mut self.block);
    }
}

/// One variable-length directory record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Referenced inode (0 marks an unused record)
    pub inode: u32,
    /// Bytes from this record to the next
    pub rec_len: u16,
    /// File type tag
    pub file_type: u8,
    /// Name bytes (`name_len` on disk is `name.len()`)
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Create a record sized tightly for its name
    pub fn new(inode: u32, name: &[u8], file_type: FileType) -> Self {
        Self {
            inode,
            rec_len: Self::ideal_len(name.len()),
            file_type: file_type as u8,
            name: name.to_vec(),
        }
    }

    /// Smallest aligned record length for a name of `name_len` bytes
    pub fn ideal_len(name_len: usize) -> u16 {
        ((DIR_REC_HEADER + name_len + DIR_REC_ALIGN - 1) & !(DIR_REC_ALIGN - 1)) as u16
    }

    /// Decode the record starting at `offset`, validating its bounds
    pub fn decode_at(block: &Block, offset: usize) -> Result<Self, FormatError> {
        if offset + DIR_REC_HEADER > BLOCK_SIZE {
            return Err(FormatError::CorruptDirEntry(offset));
        }
        let inode = LittleEndian::read_u32(&block[offset..]);
        let rec_len = LittleEndian::read_u16(&block[offset + 4..]);
        let name_len = block[offset + 6] as usize;
        let file_type = block[offset + 7];

        let rec = rec_len as usize;
        if rec < DIR_REC_HEADER || offset + rec > BLOCK_SIZE || DIR_REC_HEADER + name_len > rec {
            return Err(FormatError::CorruptDirEntry(offset));
        }

        let name = block[offset + DIR_REC_HEADER..offset + DIR_REC_HEADER + name_len].to_vec();
        Ok(Self { inode, rec_len, file_type, name })
    }

    /// Encode the record at `offset`
    pub fn encode_at(&self, block: &mut Block, offset: usize) {
        LittleEndian::write_u32(&mut block[offset..], self.inode);
        LittleEndian::write_u16(&mut block[offset + 4..], self.rec_len);
        block[offset + 6] = self.name.len() as u8;
        block[offset + 7] = self.file_type;
        block[offset + DIR_REC_HEADER..offset + DIR_REC_HEADER + self.name.len()].copy_from_slice(&self.name);
    }

    /// Rewrite only the record-length field of the record at `offset`
    pub fn set_rec_len_at(block: &mut Block, offset: usize, rec_len: u16) {
        LittleEndian::write_u16(&mut block[offset + 4..], rec_len);
    }

    /// Name as text (lossy for non UTF-8 bytes)
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Decode an indirect block into its 256 block-number slots
pub fn decode_pointers(block: &Block) -> [u32; POINTERS_PER_BLOCK] {
    let mut ptrs = [0u32; POINTERS_PER_BLOCK];
    LittleEndian::read_u32_into(block, &mut ptrs);
    ptrs
}

/// Encode 256 block-number slots into an indirect block
pub fn encode_pointers(ptrs: &[u32; POINTERS_PER_BLOCK]) -> Block {
    let mut block = [0u8; BLOCK_SIZE];
    LittleEndian::write_u32_into(ptrs, &mut block);
    block
}

/// Block number of the inode-table block holding `ino`, and the byte offset inside it
pub fn inode_location(inode_table: u32, stride: usize, ino: u32) -> (u64, usize) {
    let index = (ino - 1) as usize * stride;
    (inode_table as u64 + (index / BLOCK_SIZE) as u64, index % BLOCK_SIZE)
}

/// Format an image file as a single-group ext2 (revision 0) filesystem.
///
/// Layout: boot block, superblock, group descriptor, block bitmap, inode
/// bitmap, inode table, then the data blocks of `/` and `/lost+found`.
pub async fn format_image(path: impl AsRef<Path>, blocks: u32, inodes: u32) -> Result<(), FormatError> {
    if blocks > BITS_PER_BLOCK || inodes > BITS_PER_BLOCK {
        return Err(FormatError::InvalidSize(format!(
            "at most {} blocks and {} inodes fit one group",
            BITS_PER_BLOCK, BITS_PER_BLOCK
        )));
    }
    let inodes = inodes.div_ceil(8) * 8;
    if inodes <= RESERVED_INODES {
        return Err(FormatError::InvalidSize(format!("need more than {} inodes", RESERVED_INODES)));
    }

    let block_bitmap = 3u32;
    let inode_bitmap = 4u32;
    let inode_table = 5u32;
    let inode_table_blocks = (inodes as usize * INODE_RECORD_SIZE + BLOCK_SIZE - 1) / BLOCK_SIZE;
    let root_block = inode_table + inode_table_blocks as u32;
    let lost_found_block = root_block + 1;
    if lost_found_block + 1 > blocks {
        return Err(FormatError::InvalidSize(format!(
            "{} blocks cannot hold metadata for {} inodes",
            blocks, inodes
        )));
    }

    let device = ImageDevice::create(path.as_ref(), blocks as u64).await?;
    let now = now();

    // Block bitmap: bit i tracks block i + 1; everything up to the
    // lost+found block is in use, and bits past the end are padding.
    let used_blocks = lost_found_block;
    let mut bmap = [0u8; BLOCK_SIZE];
    for bit in 0..used_blocks {
        set_bit(&mut bmap, bit as usize);
    }
    for bit in (blocks - 1)..BITS_PER_BLOCK {
        set_bit(&mut bmap, bit as usize);
    }

    let mut imap = [0u8; BLOCK_SIZE];
    for bit in 0..RESERVED_INODES {
        set_bit(&mut imap, bit as usize);
    }
    for bit in inodes..BITS_PER_BLOCK {
        set_bit(&mut imap, bit as usize);
    }

    let free_blocks = blocks - 1 - used_blocks;
    let free_inodes = inodes - RESERVED_INODES;

    let sb = Superblock {
        inodes_count: inodes,
        blocks_count: blocks,
        r_blocks_count: 0,
        free_blocks_count: free_blocks,
        free_inodes_count: free_inodes,
        first_data_block: 1,
        log_block_size: 0,
        log_frag_size: 0,
        blocks_per_group: BITS_PER_BLOCK,
        frags_per_group: BITS_PER_BLOCK,
        inodes_per_group: inodes,
        mtime: 0,
        wtime: now,
        mnt_count: 0,
        max_mnt_count: u16::MAX,
        magic: EXT2_MAGIC,
        state: 1,
        errors: 1,
        lastcheck: now,
        rev_level: 0,
        first_ino: RESERVED_INODES + 1,
        inode_size: INODE_RECORD_SIZE as u16,
    };
    let mut sb_block = [0u8; BLOCK_SIZE];
    sb.encode_into(&mut sb_block);

    let gd = GroupDesc {
        block_bitmap,
        inode_bitmap,
        inode_table,
        free_blocks_count: free_blocks as u16,
        free_inodes_count: free_inodes as u16,
        used_dirs_count: 2,
    };
    let mut gd_block = [0u8; BLOCK_SIZE];
    gd.encode_into(&mut gd_block);

    device.write_block(SUPERBLOCK_BLOCK, &sb_block).await?;
    device.write_block(GROUP_DESC_BLOCK, &gd_block).await?;
    device.write_block(block_bitmap as u64, &bmap).await?;
    device.write_block(inode_bitmap as u64, &imap).await?;

    let mut root = DiskInode::new(mode::S_IFDIR | 0o755, 0, 0, 3);
    root.size = BLOCK_SIZE as u32;
    root.blocks = (BLOCK_SIZE / 512) as u32;
    root.block[0] = root_block;

    let mut lost_found = DiskInode::new(mode::S_IFDIR | 0o700, 0, 0, 2);
    lost_found.size = BLOCK_SIZE as u32;
    lost_found.blocks = (BLOCK_SIZE / 512) as u32;
    lost_found.block[0] = lost_found_block;

    for (ino, inode) in [(ROOT_INO, &root), (LOST_AND_FOUND_INO, &lost_found)] {
        let (blk, offset) = inode_location(inode_table, INODE_RECORD_SIZE, ino);
        let mut table_block = device.read_block(blk).await?;
        inode.encode(&mut table_block[offset..offset + INODE_RECORD_SIZE])?;
        device.write_block(blk, &table_block).await?;
    }

    let mut root_dir = [0u8; BLOCK_SIZE];
    let dot = DirEntry::new(ROOT_INO, b".", FileType::Directory);
    let dotdot = DirEntry::new(ROOT_INO, b"..", FileType::Directory);
    let mut lf = DirEntry::new(LOST_AND_FOUND_INO, b"lost+found", FileType::Directory);
    lf.rec_len = (BLOCK_SIZE - dot.rec_len as usize - dotdot.rec_len as usize) as u16;
    dot.encode_at(&mut root_dir, 0);
    dotdot.encode_at(&mut root_dir, dot.rec_len as usize);
    lf.encode_at(&mut root_dir, (dot.rec_len + dotdot.rec_len) as usize);
    device.write_block(root_block as u64, &root_dir).await?;

    device
        .write_block(lost_found_block as u64, &empty_dir_block(LOST_AND_FOUND_INO, ROOT_INO))
        .await?;

    device.sync().await?;
    device.close().await?;

    log::info!(
        "FORMAT: {} blocks, {} inodes, inode table at {}..{}, {} free blocks",
        blocks,
        inodes,
        inode_table,
        root_block,
        free_blocks
    );
    Ok(())
}

/// A directory block holding only `.` and `..`
pub fn empty_dir_block(self_ino: u32, parent_ino: u32) -> Block {
    let mut block = [0u8; BLOCK_SIZE];
    let dot = DirEntry::new(self_ino, b".", FileType::Directory);
    let mut dotdot = DirEntry::new(parent_ino, b"..", FileType::Directory);
    dotdot.rec_len = (BLOCK_SIZE - dot.rec_len as usize) as u16;
    dot.encode_at(&mut block, 0);
    dotdot.encode_at(&mut block, dot.rec_len as usize);
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dir_entry_lengths() {
        assert_eq!(DirEntry::ideal_len(1), 12);
        assert_eq!(DirEntry::ideal_len(2), 12);
        assert_eq!(DirEntry::ideal_len(4), 12);
        assert_eq!(DirEntry::ideal_len(5), 16);
        assert_eq!(DirEntry::ideal_len(10), 20);
    }

    #[test]
    fn test_dir_entry_rejects_bad_rec_len() {
        let mut block = [0u8; BLOCK_SIZE];
        DirEntry { inode: 5, rec_len: 4, file_type: 1, name: vec![] }.encode_at(&mut block, 0);
        assert!(matches!(DirEntry::decode_at(&block, 0), Err(FormatError::CorruptDirEntry(0))));

        let entry = DirEntry { inode: 5, rec_len: 2000, file_type: 1, name: b"x".to_vec() };
        entry.encode_at(&mut block, 0);
        assert!(DirEntry::decode_at(&block, 0).is_err());
    }

    #[test]
    fn test_inode_record_layout() {
        let mut inode = DiskInode::new(mode::S_IFREG | 0o644, 7, 8, 1);
        inode.size = 0x1234;
        inode.block[0] = 99;
        inode.block[13] = 77;

        let mut raw = [0u8; INODE_RECORD_SIZE];
        inode.encode(&mut raw).unwrap();

        // Fixed ext2 offsets: i_size at 4, i_links_count at 26, i_block at 40.
        assert_eq!(LittleEndian::read_u32(&raw[4..]), 0x1234);
        assert_eq!(LittleEndian::read_u16(&raw[26..]), 1);
        assert_eq!(LittleEndian::read_u32(&raw[40..]), 99);
        assert_eq!(LittleEndian::read_u32(&raw[40 + 13 * 4..]), 77);
        assert_eq!(DiskInode::decode(&raw).unwrap(), inode);
    }

    #[test]
    fn test_fast_symlink_bytes() {
        let mut inode = DiskInode::new(mode::S_IFLNK | 0o777, 0, 0, 1);
        inode.set_block_bytes(b"/some/target");
        assert_eq!(&inode.block_bytes()[..12], b"/some/target");
        assert_eq!(inode.block_bytes()[12], 0);
        assert!(inode.is_fast_symlink());
    }

    #[tokio::test]
    async fn test_format_image_geometry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fmt.img");
        format_image(&path, 1024, 128).await.unwrap();

        let device = ImageDevice::open(&path, true).await.unwrap();
        let buf = device.read_block(SUPERBLOCK_BLOCK).await.unwrap();
        let sb = Superblock::decode(&buf);
        sb.validate().unwrap();
        assert_eq!(sb.blocks_count, 1024);
        assert_eq!(sb.inodes_count, 128);
        assert_eq!(sb.free_inodes_count, 128 - RESERVED_INODES);

        let buf = device.read_block(GROUP_DESC_BLOCK).await.unwrap();
        let gd = GroupDesc::decode(&buf);
        assert_eq!(gd.free_blocks_count as u32, sb.free_blocks_count);
        assert_eq!(gd.used_dirs_count, 2);

        // 128 inodes * 128 bytes = 16 table blocks, then `/` and lost+found.
        let (blk, off) = inode_location(gd.inode_table, sb.inode_stride(), ROOT_INO);
        let buf = device.read_block(blk).await.unwrap();
        let root = DiskInode::decode(&buf[off..off + INODE_RECORD_SIZE]).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.block[0], 5 + 16);
        assert_eq!(sb.free_blocks_count, 1024 - 1 - (5 + 16 + 1));

        let buf = device.read_block(root.block[0] as u64).await.unwrap();
        let dot = DirEntry::decode_at(&buf, 0).unwrap();
        let dotdot = DirEntry::decode_at(&buf, dot.rec_len as usize).unwrap();
        assert_eq!(dot.name, b".");
        assert_eq!(dotdot.name, b"..");
        assert_eq!(dotdot.inode, ROOT_INO);
    }

    #[tokio::test]
    async fn test_format_rejects_oversized_group() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.img");
        assert!(matches!(
            format_image(&path, BITS_PER_BLOCK + 1, 64).await,
            Err(FormatError::InvalidSize(_))
        ));
        assert!(matches!(
            format_image(&path, 1024, u32::MAX).await,
            Err(FormatError::InvalidSize(_))
        ));
    }

    #[test]
    fn test_superblock_validation_rejects_odd_geometry() {
        let good = Superblock {
            inodes_count: 128,
            blocks_count: 1024,
            first_data_block: 1,
            blocks_per_group: BITS_PER_BLOCK,
            magic: EXT2_MAGIC,
            rev_level: 1,
            first_ino: 11,
            inode_size: 256,
            ..Default::default()
        };
        good.validate().unwrap();
        assert_eq!(good.inode_stride(), 256);

        for inode_size in [200, 64, 2048] {
            let sb = Superblock { inode_size, ..good.clone() };
            assert!(matches!(sb.validate(), Err(FormatError::UnsupportedInodeSize(n)) if n == inode_size));
        }

        let huge_groups = Superblock { blocks_per_group: u32::MAX, ..good.clone() };
        huge_groups.validate().unwrap();

        let too_many_inodes = Superblock { inodes_count: BITS_PER_BLOCK + 8, ..good };
        assert!(matches!(too_many_inodes.validate(), Err(FormatError::InvalidSize(_))));
    }
}
