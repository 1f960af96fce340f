//! Kernel ABI layouts for the btrfs ioctl surface.
//!
//! Request/response structures are `#[repr(C)]` mirrors of `linux/btrfs.h`
//! and are handed to the kernel by pointer. Tree item payloads are never
//! reinterpreted in place: their field offsets live in the per-item modules
//! below and the decoders in [`crate::items`] read them through
//! bounds-checked accessors.
//!
//! All integers are host-native byte order, matching what the running
//! kernel writes.

use std::mem::size_of;

/// `BTRFS_IOCTL_MAGIC`
pub const BTRFS_IOCTL_MAGIC: u8 = 0x94;

pub const FSID_SIZE: usize = 16;
pub const UUID_SIZE: usize = 16;

/// Bytes left for results in a tree search request.
pub const SEARCH_ARGS_BUFSIZE: usize = 4096 - size_of::<SearchKey>();
pub const INO_LOOKUP_PATH_MAX: usize = 4080;
pub const PATH_NAME_MAX: usize = 4087;

/// Tree id that makes TREE_SEARCH look in the subvolume the fd belongs to.
pub const SEARCH_FD_TREE: u64 = 0;
/// The tree of tree roots.
pub const ROOT_TREE_OBJECTID: u64 = 1;
/// First objectid available to inodes; the subvolume's root directory.
pub const FIRST_FREE_OBJECTID: u64 = 256;

/// Item type codes (`BTRFS_*_KEY`).
pub mod key_type {
    pub const INODE_ITEM: u32 = 1;
    pub const INODE_REF: u32 = 12;
    pub const INODE_EXTREF: u32 = 13;
    pub const XATTR_ITEM: u32 = 24;
    pub const ORPHAN_ITEM: u32 = 48;
    pub const DIR_LOG_ITEM: u32 = 60;
    pub const DIR_LOG_INDEX: u32 = 72;
    pub const DIR_ITEM: u32 = 84;
    pub const DIR_INDEX: u32 = 96;
    pub const EXTENT_DATA: u32 = 108;
    pub const EXTENT_CSUM: u32 = 128;
    pub const ROOT_ITEM: u32 = 132;
    pub const ROOT_BACKREF: u32 = 144;
    pub const ROOT_REF: u32 = 156;

    /// On-disk keys store the type in a single byte.
    pub const MAX: u32 = u8::MAX as u32;

    pub fn name(item_type: u32) -> Option<&'static str> {
        Some(match item_type {
            INODE_ITEM => "INODE_ITEM",
            INODE_REF => "INODE_REF",
            INODE_EXTREF => "INODE_EXTREF",
            XATTR_ITEM => "XATTR_ITEM",
            ORPHAN_ITEM => "ORPHAN_ITEM",
            DIR_LOG_ITEM => "DIR_LOG_ITEM",
            DIR_LOG_INDEX => "DIR_LOG_INDEX",
            DIR_ITEM => "DIR_ITEM",
            DIR_INDEX => "DIR_INDEX",
            EXTENT_DATA => "EXTENT_DATA",
            EXTENT_CSUM => "EXTENT_CSUM",
            ROOT_ITEM => "ROOT_ITEM",
            ROOT_BACKREF => "ROOT_BACKREF",
            ROOT_REF => "ROOT_REF",
            _ => return None,
        })
    }
}

/// `struct btrfs_ioctl_search_key`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct SearchKey {
    /// Tree to search, or [`SEARCH_FD_TREE`].
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    /// Items requested; the kernel overwrites it with the number returned.
    pub nr_items: u32,
    unused: u32,
    unused1: u64,
    unused2: u64,
    unused3: u64,
    unused4: u64,
}

impl SearchKey {
    /// A key covering every item of `tree_id`.
    pub const fn new(tree_id: u64) -> Self {
        Self {
            tree_id,
            min_objectid: 0,
            max_objectid: u64::MAX,
            min_offset: 0,
            max_offset: u64::MAX,
            min_transid: 0,
            max_transid: u64::MAX,
            min_type: 0,
            max_type: u32::MAX,
            nr_items: 0,
            unused: 0,
            unused1: 0,
            unused2: 0,
            unused3: 0,
            unused4: 0,
        }
    }
}

/// `struct btrfs_ioctl_search_args`
#[derive(Debug, Clone)]
#[repr(C)]
pub struct SearchArgs {
    pub key: SearchKey,
    pub buf: [u8; SEARCH_ARGS_BUFSIZE],
}

impl SearchArgs {
    pub fn new(key: SearchKey) -> Self {
        Self {
            key,
            buf: [0; SEARCH_ARGS_BUFSIZE],
        }
    }
}

/// `struct btrfs_ioctl_search_header`, which precedes every item in
/// [`SearchArgs::buf`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchHeader {
    pub transid: u64,
    pub objectid: u64,
    pub offset: u64,
    pub item_type: u32,
    pub len: u32,
}

impl SearchHeader {
    pub const SIZE: usize = 32;

    /// Read a header at `at`; `None` if it does not fit in `buf`.
    pub fn read(buf: &[u8], at: usize) -> Option<Self> {
        let raw = buf.get(at..at.checked_add(Self::SIZE)?)?;
        Some(Self {
            transid: ne_u64(raw, 0)?,
            objectid: ne_u64(raw, 8)?,
            offset: ne_u64(raw, 16)?,
            item_type: ne_u32(raw, 24)?,
            len: ne_u32(raw, 28)?,
        })
    }

    pub(crate) fn write(&self, buf: &mut [u8], at: usize) {
        buf[at..at + 8].copy_from_slice(&self.transid.to_ne_bytes());
        buf[at + 8..at + 16].copy_from_slice(&self.objectid.to_ne_bytes());
        buf[at + 16..at + 24].copy_from_slice(&self.offset.to_ne_bytes());
        buf[at + 24..at + 28].copy_from_slice(&self.item_type.to_ne_bytes());
        buf[at + 28..at + 32].copy_from_slice(&self.len.to_ne_bytes());
    }
}

/// `struct btrfs_ioctl_ino_lookup_args`
#[derive(Debug, Clone)]
#[repr(C)]
pub struct InoLookupArgs {
    pub treeid: u64,
    pub objectid: u64,
    pub name: [u8; INO_LOOKUP_PATH_MAX],
}

impl InoLookupArgs {
    pub fn new(treeid: u64, objectid: u64) -> Self {
        Self {
            treeid,
            objectid,
            name: [0; INO_LOOKUP_PATH_MAX],
        }
    }
}

/// `struct btrfs_ioctl_ino_path_args`
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct InoPathArgs {
    pub inum: u64,
    /// Size of the buffer `fspath` points at.
    pub size: u64,
    pub reserved: [u64; 4],
    /// User pointer to a `struct btrfs_data_container`.
    pub fspath: u64,
}

/// Fixed head of `struct btrfs_data_container`; the `u64 val[]` array
/// follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataContainerHeader {
    pub bytes_left: u32,
    pub bytes_missing: u32,
    pub elem_cnt: u32,
    pub elem_missed: u32,
}

impl DataContainerHeader {
    pub const SIZE: usize = 16;

    pub fn read(buf: &[u8]) -> Option<Self> {
        Some(Self {
            bytes_left: ne_u32(buf, 0)?,
            bytes_missing: ne_u32(buf, 4)?,
            elem_cnt: ne_u32(buf, 8)?,
            elem_missed: ne_u32(buf, 12)?,
        })
    }

    pub(crate) fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.bytes_left.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.bytes_missing.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.elem_cnt.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.elem_missed.to_ne_bytes());
    }

    /// Everything the kernel had fit in the buffer.
    pub fn is_complete(&self) -> bool {
        self.bytes_missing == 0 && self.elem_missed == 0
    }
}

/// `struct btrfs_ioctl_fs_info_args`
#[derive(Debug, Clone)]
#[repr(C)]
pub struct FsInfoArgs {
    pub max_id: u64,
    pub num_devices: u64,
    pub fsid: [u8; FSID_SIZE],
    pub nodesize: u32,
    pub sectorsize: u32,
    pub clone_alignment: u32,
    pub csum_type: u16,
    pub csum_size: u16,
    pub flags: u64,
    pub generation: u64,
    pub metadata_uuid: [u8; FSID_SIZE],
    pub reserved: [u8; 944],
}

impl Default for FsInfoArgs {
    fn default() -> Self {
        Self {
            max_id: 0,
            num_devices: 0,
            fsid: [0; FSID_SIZE],
            nodesize: 0,
            sectorsize: 0,
            clone_alignment: 0,
            csum_type: 0,
            csum_size: 0,
            flags: 0,
            generation: 0,
            metadata_uuid: [0; FSID_SIZE],
            reserved: [0; 944],
        }
    }
}

/// `struct btrfs_ioctl_vol_args`; only its size matters, DEFRAG on a
/// regular file ignores the argument.
#[derive(Debug)]
#[repr(C)]
pub struct VolArgs {
    pub fd: i64,
    pub name: [u8; PATH_NAME_MAX + 1],
}

/// `struct btrfs_disk_key` (packed)
pub mod disk_key {
    pub const OBJECTID: usize = 0;
    pub const TYPE: usize = 8;
    pub const OFFSET: usize = 9;
    pub const SIZE: usize = 17;
}

/// `struct btrfs_timespec` (packed)
pub mod timespec {
    pub const SEC: usize = 0;
    pub const NSEC: usize = 8;
    pub const SIZE: usize = 12;
}

/// `struct btrfs_file_extent_item` (packed)
pub mod file_extent {
    pub const GENERATION: usize = 0;
    pub const RAM_BYTES: usize = 8;
    pub const COMPRESSION: usize = 16;
    pub const ENCRYPTION: usize = 17;
    pub const OTHER_ENCODING: usize = 18;
    pub const TYPE: usize = 20;
    /// Inline extents end here; their data follows.
    pub const INLINE_DATA: usize = 21;
    pub const DISK_BYTENR: usize = 21;
    pub const DISK_NUM_BYTES: usize = 29;
    pub const OFFSET: usize = 37;
    pub const NUM_BYTES: usize = 45;
    pub const SIZE: usize = 53;

    pub const KIND_INLINE: u8 = 0;
    pub const KIND_REG: u8 = 1;
    pub const KIND_PREALLOC: u8 = 2;
}

/// `struct btrfs_inode_item` (packed)
pub mod inode_item {
    pub const GENERATION: usize = 0;
    pub const TRANSID: usize = 8;
    pub const SIZE_FIELD: usize = 16;
    pub const NBYTES: usize = 24;
    pub const BLOCK_GROUP: usize = 32;
    pub const NLINK: usize = 40;
    pub const UID: usize = 44;
    pub const GID: usize = 48;
    pub const MODE: usize = 52;
    pub const RDEV: usize = 56;
    pub const FLAGS: usize = 64;
    pub const SEQUENCE: usize = 72;
    // reserved[4] u64 at 80
    pub const ATIME: usize = 112;
    pub const CTIME: usize = 124;
    pub const MTIME: usize = 136;
    pub const OTIME: usize = 148;
    pub const SIZE: usize = 160;
}

/// `struct btrfs_inode_ref` (packed); the name follows.
pub mod inode_ref {
    pub const INDEX: usize = 0;
    pub const NAME_LEN: usize = 8;
    pub const SIZE: usize = 10;
}

/// `struct btrfs_dir_item` (packed); the name, then `data_len` bytes, follow.
pub mod dir_item {
    pub const LOCATION: usize = 0;
    pub const TRANSID: usize = 17;
    pub const DATA_LEN: usize = 25;
    pub const NAME_LEN: usize = 27;
    pub const TYPE: usize = 29;
    pub const SIZE: usize = 30;
}

/// `struct btrfs_root_item` (packed)
pub mod root_item {
    pub const INODE: usize = 0;
    pub const GENERATION: usize = 160;
    pub const ROOT_DIRID: usize = 168;
    pub const BYTENR: usize = 176;
    pub const BYTE_LIMIT: usize = 184;
    pub const BYTES_USED: usize = 192;
    pub const LAST_SNAPSHOT: usize = 200;
    pub const FLAGS: usize = 208;
    pub const REFS: usize = 216;
    pub const DROP_PROGRESS: usize = 220;
    pub const DROP_LEVEL: usize = 237;
    pub const LEVEL: usize = 238;
    /// Size written by kernels that predate `generation_v2`.
    pub const LEGACY_SIZE: usize = 239;
    pub const GENERATION_V2: usize = 239;
    pub const UUID: usize = 247;
    pub const PARENT_UUID: usize = 263;
    pub const RECEIVED_UUID: usize = 279;
    pub const CTRANSID: usize = 295;
    pub const OTRANSID: usize = 303;
    pub const STRANSID: usize = 311;
    pub const RTRANSID: usize = 319;
    pub const CTIME: usize = 327;
    pub const OTIME: usize = 339;
    pub const STIME: usize = 351;
    pub const RTIME: usize = 363;
    /// End of the fields guarded by `generation_v2`.
    pub const EXTENDED_END: usize = 375;
    pub const SIZE: usize = 439;
}

pub(crate) fn ne_u64(buf: &[u8], at: usize) -> Option<u64> {
    let raw = buf.get(at..at.checked_add(8)?)?;
    Some(u64::from_ne_bytes(raw.try_into().ok()?))
}

pub(crate) fn ne_u32(buf: &[u8], at: usize) -> Option<u32> {
    let raw = buf.get(at..at.checked_add(4)?)?;
    Some(u32::from_ne_bytes(raw.try_into().ok()?))
}

pub(crate) fn ne_u16(buf: &[u8], at: usize) -> Option<u16> {
    let raw = buf.get(at..at.checked_add(2)?)?;
    Some(u16::from_ne_bytes(raw.try_into().ok()?))
}

const _: () = assert!(size_of::<SearchKey>() == 104);
const _: () = assert!(size_of::<SearchArgs>() == 4096);
const _: () = assert!(size_of::<InoLookupArgs>() == 4096);
const _: () = assert!(size_of::<InoPathArgs>() == 56);
const _: () = assert!(size_of::<FsInfoArgs>() == 1024);
const _: () = assert!(size_of::<VolArgs>() == 4096);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_buffer_fills_one_page() {
        assert_eq!(SEARCH_ARGS_BUFSIZE, 3992);
    }

    #[test]
    fn test_header_read_write() {
        let header = SearchHeader {
            transid: 11,
            objectid: 257,
            offset: 4096,
            item_type: key_type::EXTENT_DATA,
            len: 53,
        };
        let mut buf = [0u8; 40];
        header.write(&mut buf, 8);
        assert_eq!(SearchHeader::read(&buf, 8), Some(header));
    }

    #[test]
    fn test_header_read_rejects_short_buffer() {
        let buf = [0u8; 40];
        assert_eq!(SearchHeader::read(&buf, 9), None);
        assert_eq!(SearchHeader::read(&buf, usize::MAX), None);
    }

    #[test]
    fn test_data_container_completeness() {
        let mut header = DataContainerHeader::default();
        assert!(header.is_complete());
        header.elem_missed = 1;
        assert!(!header.is_complete());
    }

    #[test]
    fn test_root_item_offsets_are_contiguous() {
        assert_eq!(root_item::DROP_PROGRESS + disk_key::SIZE, root_item::DROP_LEVEL);
        assert_eq!(root_item::GENERATION_V2 + 8, root_item::UUID);
        assert_eq!(root_item::RTIME + timespec::SIZE, root_item::EXTENDED_END);
        assert_eq!(root_item::EXTENDED_END + 8 * 8, root_item::SIZE);
    }

    #[test]
    fn test_key_type_names() {
        assert_eq!(key_type::name(key_type::ROOT_ITEM), Some("ROOT_ITEM"));
        assert_eq!(key_type::name(7), None);
    }
}
