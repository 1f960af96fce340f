//! Typed decoding of tree item payloads.
//!
//! [`decode`] dispatches on the item type from the search header and
//! returns an owned [`Item`]. Every field read goes through a bounds-checked
//! accessor, and each decoder first checks the payload against the fixed
//! prefix its type requires, so a short payload becomes a
//! [`DecodeError::Truncated`] rather than a read past the buffer.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::abi::{
    dir_item, disk_key, file_extent, inode_item, inode_ref, key_type, ne_u16, ne_u32, ne_u64,
    root_item, timespec, SearchHeader, UUID_SIZE,
};

/// Errors raised while decoding kernel output
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("item type {item_type} payload is {actual} bytes, need at least {needed}")]
    Truncated {
        item_type: u32,
        needed: usize,
        actual: usize,
    },

    #[error("search result at offset {offset} needs {needed} bytes, buffer has {available}")]
    Overrun {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("path {index} starts at offset {offset}, outside {available}-byte buffer")]
    PathOffset {
        index: u32,
        offset: u64,
        available: usize,
    },

    #[error("path {index} is not NUL-terminated")]
    UnterminatedPath { index: u32 },
}

/// Bounds-checked reader over one item payload.
struct Fields<'a> {
    buf: &'a [u8],
    item_type: u32,
}

impl<'a> Fields<'a> {
    /// Fails unless at least `needed` bytes are present.
    fn new(buf: &'a [u8], item_type: u32, needed: usize) -> Result<Self, DecodeError> {
        let fields = Self { buf, item_type };
        if buf.len() < needed {
            return Err(fields.truncated(needed));
        }
        Ok(fields)
    }

    fn truncated(&self, needed: usize) -> DecodeError {
        DecodeError::Truncated {
            item_type: self.item_type,
            needed,
            actual: self.buf.len(),
        }
    }

    fn u8(&self, at: usize) -> Result<u8, DecodeError> {
        self.buf.get(at).copied().ok_or_else(|| self.truncated(at + 1))
    }

    fn u16(&self, at: usize) -> Result<u16, DecodeError> {
        ne_u16(self.buf, at).ok_or_else(|| self.truncated(at + 2))
    }

    fn u32(&self, at: usize) -> Result<u32, DecodeError> {
        ne_u32(self.buf, at).ok_or_else(|| self.truncated(at + 4))
    }

    fn u64(&self, at: usize) -> Result<u64, DecodeError> {
        ne_u64(self.buf, at).ok_or_else(|| self.truncated(at + 8))
    }

    fn bytes(&self, at: usize, len: usize) -> Result<&'a [u8], DecodeError> {
        self.buf
            .get(at..at + len)
            .ok_or_else(|| self.truncated(at + len))
    }

    fn uuid(&self, at: usize) -> Result<Uuid, DecodeError> {
        let raw = self.bytes(at, UUID_SIZE)?;
        Uuid::from_slice(raw).map_err(|_| self.truncated(at + UUID_SIZE))
    }

    fn timespec(&self, at: usize) -> Result<Timespec, DecodeError> {
        Ok(Timespec {
            sec: self.u64(at + timespec::SEC)?,
            nsec: self.u32(at + timespec::NSEC)?,
        })
    }

    fn disk_key(&self, at: usize) -> Result<DiskKey, DecodeError> {
        Ok(DiskKey {
            objectid: self.u64(at + disk_key::OBJECTID)?,
            item_type: self.u8(at + disk_key::TYPE)?,
            offset: self.u64(at + disk_key::OFFSET)?,
        })
    }
}

/// `struct btrfs_timespec`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

/// `struct btrfs_disk_key`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DiskKey {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

/// Where a file extent's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtentData {
    /// Data stored in the item itself.
    Inline { len: usize },
    /// Regular or preallocated extent on disk.
    OnDisk {
        disk_bytenr: u64,
        disk_num_bytes: u64,
        offset: u64,
        num_bytes: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtentKind {
    Inline,
    Regular,
    Prealloc,
    Unknown(u8),
}

impl From<u8> for ExtentKind {
    fn from(raw: u8) -> Self {
        match raw {
            file_extent::KIND_INLINE => ExtentKind::Inline,
            file_extent::KIND_REG => ExtentKind::Regular,
            file_extent::KIND_PREALLOC => ExtentKind::Prealloc,
            other => ExtentKind::Unknown(other),
        }
    }
}

/// `struct btrfs_file_extent_item`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileExtentItem {
    /// Transaction that created this extent.
    pub generation: u64,
    pub ram_bytes: u64,
    pub compression: u8,
    pub encryption: u8,
    pub other_encoding: u16,
    pub kind: ExtentKind,
    pub data: ExtentData,
}

impl FileExtentItem {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let f = Fields::new(buf, key_type::EXTENT_DATA, file_extent::INLINE_DATA)?;
        let kind = ExtentKind::from(f.u8(file_extent::TYPE)?);
        let data = if kind == ExtentKind::Inline {
            ExtentData::Inline {
                len: buf.len() - file_extent::INLINE_DATA,
            }
        } else {
            if buf.len() < file_extent::SIZE {
                return Err(f.truncated(file_extent::SIZE));
            }
            ExtentData::OnDisk {
                disk_bytenr: f.u64(file_extent::DISK_BYTENR)?,
                disk_num_bytes: f.u64(file_extent::DISK_NUM_BYTES)?,
                offset: f.u64(file_extent::OFFSET)?,
                num_bytes: f.u64(file_extent::NUM_BYTES)?,
            }
        };
        Ok(Self {
            generation: f.u64(file_extent::GENERATION)?,
            ram_bytes: f.u64(file_extent::RAM_BYTES)?,
            compression: f.u8(file_extent::COMPRESSION)?,
            encryption: f.u8(file_extent::ENCRYPTION)?,
            other_encoding: f.u16(file_extent::OTHER_ENCODING)?,
            kind,
            data,
        })
    }
}

/// `struct btrfs_inode_item`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InodeItem {
    /// NFS-style generation, the transaction that created the inode.
    pub generation: u64,
    /// Transaction that last touched the inode.
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub block_group: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub flags: u64,
    pub sequence: u64,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
    pub otime: Timespec,
}

impl InodeItem {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let f = Fields::new(buf, key_type::INODE_ITEM, inode_item::SIZE)?;
        Self::read(&f, 0)
    }

    fn read(f: &Fields<'_>, at: usize) -> Result<Self, DecodeError> {
        Ok(Self {
            generation: f.u64(at + inode_item::GENERATION)?,
            transid: f.u64(at + inode_item::TRANSID)?,
            size: f.u64(at + inode_item::SIZE_FIELD)?,
            nbytes: f.u64(at + inode_item::NBYTES)?,
            block_group: f.u64(at + inode_item::BLOCK_GROUP)?,
            nlink: f.u32(at + inode_item::NLINK)?,
            uid: f.u32(at + inode_item::UID)?,
            gid: f.u32(at + inode_item::GID)?,
            mode: f.u32(at + inode_item::MODE)?,
            rdev: f.u64(at + inode_item::RDEV)?,
            flags: f.u64(at + inode_item::FLAGS)?,
            sequence: f.u64(at + inode_item::SEQUENCE)?,
            atime: f.timespec(at + inode_item::ATIME)?,
            ctime: f.timespec(at + inode_item::CTIME)?,
            mtime: f.timespec(at + inode_item::MTIME)?,
            otime: f.timespec(at + inode_item::OTIME)?,
        })
    }
}

/// `struct btrfs_inode_ref` with its name. Only the first ref packed in
/// the item is decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InodeRef {
    /// Index of the entry in the parent directory.
    pub index: u64,
    pub name: Vec<u8>,
}

impl InodeRef {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let f = Fields::new(buf, key_type::INODE_REF, inode_ref::SIZE)?;
        let name_len = usize::from(f.u16(inode_ref::NAME_LEN)?);
        Ok(Self {
            index: f.u64(inode_ref::INDEX)?,
            name: f.bytes(inode_ref::SIZE, name_len)?.to_vec(),
        })
    }
}

/// `struct btrfs_dir_item` with its name, used for both DIR_ITEM and
/// DIR_INDEX. Only the first entry packed in the item is decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirItem {
    /// Key of the inode (or subvolume root) the entry points at.
    pub location: DiskKey,
    pub transid: u64,
    pub data_len: u16,
    /// `BTRFS_FT_*` file type.
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl DirItem {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_as(buf, key_type::DIR_ITEM)
    }

    fn decode_as(buf: &[u8], item_type: u32) -> Result<Self, DecodeError> {
        let f = Fields::new(buf, item_type, dir_item::SIZE)?;
        let name_len = usize::from(f.u16(dir_item::NAME_LEN)?);
        Ok(Self {
            location: f.disk_key(dir_item::LOCATION)?,
            transid: f.u64(dir_item::TRANSID)?,
            data_len: f.u16(dir_item::DATA_LEN)?,
            file_type: f.u8(dir_item::TYPE)?,
            name: f.bytes(dir_item::SIZE, name_len)?.to_vec(),
        })
    }
}

/// Root item fields guarded by `generation_v2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RootItemExtended {
    pub uuid: Uuid,
    pub parent_uuid: Uuid,
    pub received_uuid: Uuid,
    /// Updated when an inode in the subvolume changes.
    pub ctransid: u64,
    /// Transaction that created the subvolume.
    pub otransid: u64,
    pub stransid: u64,
    pub rtransid: u64,
    pub ctime: Timespec,
    pub otime: Timespec,
    pub stime: Timespec,
    pub rtime: Timespec,
}

/// `struct btrfs_root_item`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RootItem {
    pub inode: InodeItem,
    pub generation: u64,
    pub root_dirid: u64,
    pub bytenr: u64,
    pub byte_limit: u64,
    pub bytes_used: u64,
    pub last_snapshot: u64,
    pub flags: u64,
    pub refs: u32,
    pub drop_progress: DiskKey,
    pub drop_level: u8,
    pub level: u8,
    /// Absent on items written before the field existed.
    pub generation_v2: Option<u64>,
    extended: Option<RootItemExtended>,
}

impl RootItem {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let f = Fields::new(buf, key_type::ROOT_ITEM, root_item::LEGACY_SIZE)?;
        let generation = f.u64(root_item::GENERATION)?;

        let generation_v2 = if buf.len() >= root_item::GENERATION_V2 + 8 {
            Some(f.u64(root_item::GENERATION_V2)?)
        } else {
            None
        };

        // A kernel without generation_v2 support may have rewritten the
        // item; then the trailing fields are stale.
        let extended = match generation_v2 {
            Some(v2) if v2 == generation && buf.len() >= root_item::EXTENDED_END => {
                Some(RootItemExtended {
                    uuid: f.uuid(root_item::UUID)?,
                    parent_uuid: f.uuid(root_item::PARENT_UUID)?,
                    received_uuid: f.uuid(root_item::RECEIVED_UUID)?,
                    ctransid: f.u64(root_item::CTRANSID)?,
                    otransid: f.u64(root_item::OTRANSID)?,
                    stransid: f.u64(root_item::STRANSID)?,
                    rtransid: f.u64(root_item::RTRANSID)?,
                    ctime: f.timespec(root_item::CTIME)?,
                    otime: f.timespec(root_item::OTIME)?,
                    stime: f.timespec(root_item::STIME)?,
                    rtime: f.timespec(root_item::RTIME)?,
                })
            }
            _ => None,
        };

        Ok(Self {
            inode: InodeItem::read(&f, root_item::INODE)?,
            generation,
            root_dirid: f.u64(root_item::ROOT_DIRID)?,
            bytenr: f.u64(root_item::BYTENR)?,
            byte_limit: f.u64(root_item::BYTE_LIMIT)?,
            bytes_used: f.u64(root_item::BYTES_USED)?,
            last_snapshot: f.u64(root_item::LAST_SNAPSHOT)?,
            flags: f.u64(root_item::FLAGS)?,
            refs: f.u32(root_item::REFS)?,
            drop_progress: f.disk_key(root_item::DROP_PROGRESS)?,
            drop_level: f.u8(root_item::DROP_LEVEL)?,
            level: f.u8(root_item::LEVEL)?,
            generation_v2,
            extended,
        })
    }

    /// UUIDs and the extra transids, only when `generation_v2` vouches for them.
    pub fn extended(&self) -> Option<&RootItemExtended> {
        self.extended.as_ref()
    }
}

/// An item whose type has no decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RawItem {
    pub objectid: u64,
    pub item_type: u32,
    pub len: u32,
    pub transid: u64,
}

/// One decoded tree item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Item {
    FileExtent(FileExtentItem),
    Inode(InodeItem),
    InodeRef(InodeRef),
    DirItem(DirItem),
    DirIndex(DirItem),
    Root(RootItem),
    Other(RawItem),
}

/// Decode `data` according to `header.item_type`.
pub fn decode(header: &SearchHeader, data: &[u8]) -> Result<Item, DecodeError> {
    Ok(match header.item_type {
        key_type::EXTENT_DATA => Item::FileExtent(FileExtentItem::decode(data)?),
        key_type::INODE_ITEM => Item::Inode(InodeItem::decode(data)?),
        key_type::INODE_REF => Item::InodeRef(InodeRef::decode(data)?),
        key_type::DIR_ITEM => Item::DirItem(DirItem::decode_as(data, key_type::DIR_ITEM)?),
        key_type::DIR_INDEX => Item::DirIndex(DirItem::decode_as(data, key_type::DIR_INDEX)?),
        key_type::ROOT_ITEM => Item::Root(RootItem::decode(data)?),
        _ => Item::Other(RawItem {
            objectid: header.objectid,
            item_type: header.item_type,
            len: header.len,
            transid: header.transid,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::payload;

    fn header(item_type: u32, len: usize) -> SearchHeader {
        SearchHeader {
            transid: 9,
            objectid: 257,
            offset: 0,
            item_type,
            len: len as u32,
        }
    }

    #[test]
    fn test_regular_file_extent() {
        let data = payload::file_extent(12, 4096);
        let item = FileExtentItem::decode(&data).unwrap();
        assert_eq!(item.generation, 12);
        assert_eq!(item.kind, ExtentKind::Regular);
        assert!(matches!(
            item.data,
            ExtentData::OnDisk { num_bytes: 4096, .. }
        ));
    }

    #[test]
    fn test_inline_extent_needs_only_header() {
        let data = payload::inline_extent(3, b"hello");
        let item = FileExtentItem::decode(&data).unwrap();
        assert_eq!(item.kind, ExtentKind::Inline);
        assert_eq!(item.data, ExtentData::Inline { len: 5 });
    }

    #[test]
    fn test_regular_extent_cut_after_header_is_truncated() {
        let data = payload::file_extent(12, 4096);
        let err = FileExtentItem::decode(&data[..30]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                item_type: key_type::EXTENT_DATA,
                needed: file_extent::SIZE,
                actual: 30,
            }
        );
    }

    #[test]
    fn test_short_payloads_never_read_past_buffer() {
        let cases: [(u32, Vec<u8>); 5] = [
            (key_type::EXTENT_DATA, payload::file_extent(1, 1)),
            (key_type::INODE_ITEM, payload::inode_item(1, 0o100644, 10)),
            (key_type::INODE_REF, payload::inode_ref(2, b"a.txt")),
            (key_type::DIR_INDEX, payload::dir_item(258, 5, 1, b"a.txt")),
            (key_type::ROOT_ITEM, payload::root_item(7, Some(7))),
        ];
        for (item_type, data) in cases {
            for cut in 0..data.len() {
                let result = decode(&header(item_type, cut), &data[..cut]);
                if let Err(err) = result {
                    assert!(matches!(err, DecodeError::Truncated { .. }));
                }
            }
            assert!(decode(&header(item_type, data.len()), &data).is_ok());
        }
    }

    #[test]
    fn test_empty_inode_item_is_truncated() {
        let err = InodeItem::decode(&[]).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Truncated {
                needed: 160,
                actual: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_inode_ref_name_longer_than_payload() {
        let mut data = payload::inode_ref(2, b"a.txt");
        data.truncate(data.len() - 1);
        let err = InodeRef::decode(&data).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { needed: 15, .. }));
    }

    #[test]
    fn test_dir_item_fields() {
        let data = payload::dir_item(300, 44, 2, b"sub");
        let item = DirItem::decode(&data).unwrap();
        assert_eq!(item.location.objectid, 300);
        assert_eq!(item.location.item_type, key_type::INODE_ITEM as u8);
        assert_eq!(item.transid, 44);
        assert_eq!(item.file_type, 2);
        assert_eq!(item.name, b"sub");
    }

    #[test]
    fn test_root_item_with_matching_generation_v2_exposes_extended() {
        let data = payload::root_item(42, Some(42));
        let root = RootItem::decode(&data).unwrap();
        assert_eq!(root.generation, 42);
        let ext = root.extended().unwrap();
        assert_eq!(ext.ctransid, 42);
        assert!(!ext.uuid.is_nil());
    }

    #[test]
    fn test_root_item_with_stale_generation_v2_hides_extended() {
        let data = payload::root_item(42, Some(17));
        let root = RootItem::decode(&data).unwrap();
        assert_eq!(root.generation_v2, Some(17));
        assert!(root.extended().is_none());
    }

    #[test]
    fn test_legacy_root_item() {
        let data = payload::root_item(5, None);
        assert_eq!(data.len(), root_item::LEGACY_SIZE);
        let root = RootItem::decode(&data).unwrap();
        assert_eq!(root.generation, 5);
        assert_eq!(root.generation_v2, None);
        assert!(root.extended().is_none());
    }

    #[test]
    fn test_unknown_type_passes_through() {
        let hdr = header(key_type::XATTR_ITEM, 3);
        let item = decode(&hdr, &[1, 2, 3]).unwrap();
        assert_eq!(
            item,
            Item::Other(RawItem {
                objectid: 257,
                item_type: key_type::XATTR_ITEM,
                len: 3,
                transid: 9,
            })
        );
    }
}
