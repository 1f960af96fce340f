//! Incremental change scan ("find-new").
//!
//! Searches the descriptor's subvolume for items written at or after a
//! generation. The kernel filters by leaf, so a leaf touched recently also
//! yields its older items; for file extents and inodes the embedded
//! generation decides whether the item is reported.
//!
//! Only new file extents reliably mean new content. A file that became
//! empty, or changed only metadata carried by item types past
//! `EXTENT_DATA`, can go unreported.

use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::ops::ControlFlow;

use serde::{Serialize, Serializer};

use bdup_config::{log_scan_debug, log_scan_info};

use crate::abi::{key_type, SearchKey, SEARCH_FD_TREE};
use crate::items::{self, Item};
use crate::{BtrfsError, Ioctl, Result, Volume};

/// One reported item. `Display` renders the line written by
/// [`Volume::find_new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeRecord {
    FileExtent {
        item_type: u32,
        ino: u64,
        len: u32,
        transid: u64,
        generation: u64,
    },
    Inode {
        item_type: u32,
        ino: u64,
        len: u32,
        transid: u64,
        generation: u64,
    },
    InodeRef {
        item_type: u32,
        ino: u64,
        len: u32,
        transid: u64,
        #[serde(serialize_with = "lossy_name")]
        name: Vec<u8>,
    },
    DirEntry {
        item_type: u32,
        dir_ino: u64,
        len: u32,
        transid: u64,
        dir_transid: u64,
        file_type: u8,
        #[serde(serialize_with = "lossy_name")]
        name: Vec<u8>,
    },
    Other {
        item_type: u32,
        objectid: u64,
        len: u32,
        transid: u64,
    },
}

fn lossy_name<S: Serializer>(name: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(name))
}

/// A name rendered on one line: control characters, whitespace and
/// backslashes become escapes, so a record never spans more than one line.
struct EscapedName<'a>(&'a [u8]);

impl fmt::Display for EscapedName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in String::from_utf8_lossy(self.0).chars() {
            if c == '\\' {
                f.write_str("\\\\")?;
            } else if c.is_control() || c.is_whitespace() {
                write!(f, "{}", c.escape_unicode())?;
            } else {
                f.write_char(c)?;
            }
        }
        Ok(())
    }
}

impl ChangeRecord {
    pub fn item_type(&self) -> u32 {
        match self {
            ChangeRecord::FileExtent { item_type, .. }
            | ChangeRecord::Inode { item_type, .. }
            | ChangeRecord::InodeRef { item_type, .. }
            | ChangeRecord::DirEntry { item_type, .. }
            | ChangeRecord::Other { item_type, .. } => *item_type,
        }
    }

    /// Inode (or directory inode) owning the item.
    pub fn objectid(&self) -> u64 {
        match self {
            ChangeRecord::FileExtent { ino, .. }
            | ChangeRecord::Inode { ino, .. }
            | ChangeRecord::InodeRef { ino, .. } => *ino,
            ChangeRecord::DirEntry { dir_ino, .. } => *dir_ino,
            ChangeRecord::Other { objectid, .. } => *objectid,
        }
    }

    pub fn name(&self) -> Option<&[u8]> {
        match self {
            ChangeRecord::InodeRef { name, .. } | ChangeRecord::DirEntry { name, .. } => {
                Some(name)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeRecord::FileExtent {
                item_type,
                ino,
                len,
                transid,
                generation,
            }
            | ChangeRecord::Inode {
                item_type,
                ino,
                len,
                transid,
                generation,
            } => write!(
                f,
                "item type {item_type} ino {ino} len {len} gen0 {transid} gen1 {generation}"
            ),
            ChangeRecord::InodeRef {
                item_type,
                ino,
                len,
                transid,
                name,
            } => write!(
                f,
                "item type {item_type} ino {ino} len {len} gen0 {transid} name {}",
                EscapedName(name)
            ),
            ChangeRecord::DirEntry {
                item_type,
                dir_ino,
                len,
                transid,
                dir_transid,
                file_type,
                name,
            } => write!(
                f,
                "item type {item_type} dir ino {dir_ino} len {len} gen0 {transid} \
                 gen1 {dir_transid} type1 {file_type} name {}",
                EscapedName(name)
            ),
            ChangeRecord::Other {
                item_type,
                objectid,
                len,
                transid,
            } => write!(
                f,
                "item type {item_type} oid {objectid} len {len} gen0 {transid}"
            ),
        }
    }
}

/// Totals for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub pages: u64,
    pub items: u64,
    pub reported: u64,
    /// Extents and inodes older than the threshold, returned only because
    /// their leaf was rewritten.
    pub stale: u64,
    /// Highest header transid seen; a starting point for the next scan.
    pub max_transid: u64,
}

/// The search find-new runs: whole subvolume, items from `min_generation`,
/// types up to `EXTENT_DATA`.
pub fn find_new_key(min_generation: u64) -> SearchKey {
    let mut key = SearchKey::new(SEARCH_FD_TREE);
    key.min_transid = min_generation;
    key.max_type = key_type::EXTENT_DATA;
    key
}

impl<K: Ioctl> Volume<'_, K> {
    /// Report every item changed since `min_generation` to `on_record`, in
    /// key order. Returns only once the search is exhausted.
    pub fn scan_changes<F>(&self, min_generation: u64, mut on_record: F) -> Result<ScanSummary>
    where
        F: FnMut(&ChangeRecord) -> io::Result<()>,
    {
        log_scan_info!("change scan started", min_generation = min_generation);
        let mut summary = ScanSummary::default();

        let stats = self
            .search_each(find_new_key(min_generation), |item| {
                let header = item.header;
                summary.max_transid = summary.max_transid.max(header.transid);

                let record = match items::decode(&header, item.data)? {
                    Item::FileExtent(extent) => {
                        if extent.generation < min_generation {
                            summary.stale += 1;
                            return Ok(ControlFlow::Continue(()));
                        }
                        ChangeRecord::FileExtent {
                            item_type: header.item_type,
                            ino: header.objectid,
                            len: header.len,
                            transid: header.transid,
                            generation: extent.generation,
                        }
                    }
                    Item::Inode(inode) => {
                        if inode.generation < min_generation {
                            summary.stale += 1;
                            return Ok(ControlFlow::Continue(()));
                        }
                        ChangeRecord::Inode {
                            item_type: header.item_type,
                            ino: header.objectid,
                            len: header.len,
                            transid: header.transid,
                            generation: inode.generation,
                        }
                    }
                    Item::InodeRef(inode_ref) => ChangeRecord::InodeRef {
                        item_type: header.item_type,
                        ino: header.objectid,
                        len: header.len,
                        transid: header.transid,
                        name: inode_ref.name,
                    },
                    Item::DirItem(dir) | Item::DirIndex(dir) => ChangeRecord::DirEntry {
                        item_type: header.item_type,
                        dir_ino: header.objectid,
                        len: header.len,
                        transid: header.transid,
                        dir_transid: dir.transid,
                        file_type: dir.file_type,
                        name: dir.name,
                    },
                    Item::Root(_) | Item::Other(_) => ChangeRecord::Other {
                        item_type: header.item_type,
                        objectid: header.objectid,
                        len: header.len,
                        transid: header.transid,
                    },
                };

                on_record(&record).map_err(BtrfsError::Output)?;
                summary.reported += 1;
                Ok(ControlFlow::Continue(()))
            })
            .map_err(|err| match err {
                BtrfsError::Ioctl { fd, source, .. } => BtrfsError::ScanFailed {
                    fd,
                    min_generation,
                    source,
                },
                other => other,
            })?;

        summary.pages = stats.pages;
        summary.items = stats.items;
        log_scan_info!(
            "change scan finished",
            min_generation = min_generation,
            pages = summary.pages,
            reported = summary.reported,
            stale = summary.stale,
        );
        Ok(summary)
    }

    /// Write one line per changed item to `out`.
    pub fn find_new<W: Write>(&self, min_generation: u64, out: &mut W) -> Result<ScanSummary> {
        let summary = self.scan_changes(min_generation, |record| {
            log_scan_debug!("changed item", item_type = record.item_type());
            writeln!(out, "{record}")
        })?;
        out.flush().map_err(BtrfsError::Output)?;
        Ok(summary)
    }
}
