//! Paginated B-tree range search.
//!
//! One [`Volume::search_page`] call is one `TREE_SEARCH` round trip. The
//! returned [`SearchPage`] owns the kernel's result buffer and hands out
//! the cursor for the next page, so callers thread the key through their
//! loop by value:
//!
//! ```text
//! key -> search_page(key) -> page.items()
//!                         -> page.next_key() -> Some(key') | None
//! ```
//!
//! The next key is the successor of the last returned item in
//! `(objectid, type, offset)` order, with full rollover; a page with no
//! items, or a successor past the search's upper bound, ends the search.

use std::ops::ControlFlow;

use serde::Serialize;

use bdup_config::{log_search_debug, log_search_trace};

use crate::abi::{key_type, SearchArgs, SearchHeader, SearchKey, SEARCH_ARGS_BUFSIZE};
use crate::items::DecodeError;
use crate::{BtrfsError, Ioctl, Result, Volume};

/// A position in the B-tree's total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BtreeKey {
    pub objectid: u64,
    pub item_type: u32,
    pub offset: u64,
}

impl BtreeKey {
    pub const fn new(objectid: u64, item_type: u32, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// The smallest key strictly greater than this one, `None` at the very
    /// end of the key space.
    pub fn successor(&self) -> Option<Self> {
        if self.offset < u64::MAX {
            Some(Self::new(self.objectid, self.item_type, self.offset + 1))
        } else if self.item_type < key_type::MAX {
            Some(Self::new(self.objectid, self.item_type + 1, 0))
        } else if self.objectid < u64::MAX {
            Some(Self::new(self.objectid + 1, 0, 0))
        } else {
            None
        }
    }
}

impl From<&SearchHeader> for BtreeKey {
    fn from(header: &SearchHeader) -> Self {
        Self::new(header.objectid, header.item_type, header.offset)
    }
}

impl SearchKey {
    /// Search one tree for items of a single objectid and type, any offset.
    pub fn scoped(tree_id: u64, objectid: u64, item_type: u32) -> Self {
        let mut key = Self::new(tree_id);
        key.min_objectid = objectid;
        key.max_objectid = objectid;
        key.min_type = item_type;
        key.max_type = item_type;
        key
    }

    pub fn min_key(&self) -> BtreeKey {
        BtreeKey::new(self.min_objectid, self.min_type, self.min_offset)
    }

    pub fn max_key(&self) -> BtreeKey {
        BtreeKey::new(self.max_objectid, self.max_type, self.max_offset)
    }

    /// Move the lower bound just past `last`. `None` once nothing can
    /// follow it inside this search.
    pub fn advance_past(mut self, last: &SearchHeader) -> Option<Self> {
        let next = BtreeKey::from(last).successor()?;
        if next > self.max_key() {
            return None;
        }
        self.min_objectid = next.objectid;
        self.min_type = next.item_type;
        self.min_offset = next.offset;
        Some(self)
    }
}

/// One item in a result page: its header and raw payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchItem<'a> {
    pub header: SearchHeader,
    pub data: &'a [u8],
}

impl SearchItem<'_> {
    pub fn key(&self) -> BtreeKey {
        BtreeKey::from(&self.header)
    }
}

/// The result of one round trip.
#[derive(Debug)]
pub struct SearchPage {
    key: SearchKey,
    args: Box<SearchArgs>,
    /// `(header, payload start)` for each returned item.
    index: Vec<(SearchHeader, usize)>,
}

impl SearchPage {
    /// Split the kernel's buffer into items, rejecting any record that
    /// claims to extend past it.
    pub fn parse(key: SearchKey, args: Box<SearchArgs>) -> std::result::Result<Self, DecodeError> {
        let count = args.key.nr_items as usize;
        // The count comes from the kernel; no more headers than fit can follow.
        let mut index = Vec::with_capacity(count.min(SEARCH_ARGS_BUFSIZE / SearchHeader::SIZE));
        let mut at = 0usize;
        for _ in 0..count {
            let header =
                SearchHeader::read(&args.buf, at).ok_or_else(|| DecodeError::Overrun {
                    offset: at,
                    needed: SearchHeader::SIZE,
                    available: args.buf.len().saturating_sub(at),
                })?;
            let data_at = at + SearchHeader::SIZE;
            let len = header.len as usize;
            if args.buf.len() - data_at < len {
                return Err(DecodeError::Overrun {
                    offset: data_at,
                    needed: len,
                    available: args.buf.len() - data_at,
                });
            }
            index.push((header, data_at));
            at = data_at + len;
        }
        Ok(Self { key, args, index })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The key this page was requested with.
    pub fn key(&self) -> &SearchKey {
        &self.key
    }

    pub fn items(&self) -> impl Iterator<Item = SearchItem<'_>> + '_ {
        self.index.iter().map(move |(header, at)| SearchItem {
            header: *header,
            data: &self.args.buf[*at..*at + header.len as usize],
        })
    }

    pub fn last_header(&self) -> Option<&SearchHeader> {
        self.index.last().map(|(header, _)| header)
    }

    /// Cursor for the following page, `None` when the search is complete.
    pub fn next_key(&self) -> Option<SearchKey> {
        self.key.advance_past(self.last_header()?)
    }
}

/// Totals for a full paginated search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SearchStats {
    pub pages: u64,
    pub items: u64,
    /// The callback ended the search before the tree ran out.
    pub stopped_early: bool,
}

impl<K: Ioctl> Volume<'_, K> {
    /// One `TREE_SEARCH` round trip starting at `key`.
    ///
    /// `key.nr_items` is replaced by the configured page size.
    pub fn search_page(&self, mut key: SearchKey) -> Result<SearchPage> {
        key.nr_items = self.search.effective_items_per_page();
        let mut args = Box::new(SearchArgs::new(key));
        self.kernel
            .tree_search(self.fd, &mut args)
            .map_err(self.ioctl_error("TREE_SEARCH"))?;
        log_search_debug!(
            "tree search round trip",
            tree_id = key.tree_id,
            min_objectid = key.min_objectid,
            min_type = key.min_type,
            min_offset = key.min_offset,
            nr_items = args.key.nr_items,
        );
        Ok(SearchPage::parse(key, args)?)
    }

    /// Run `key` to exhaustion, handing every item to `visit` in key order.
    ///
    /// `visit` returns `ControlFlow::Break` to end the search early; the
    /// item it was given counts as seen. Keys must never go backwards,
    /// within a page or across pages.
    pub fn search_each<F>(&self, key: SearchKey, mut visit: F) -> Result<SearchStats>
    where
        F: FnMut(SearchItem<'_>) -> Result<ControlFlow<()>>,
    {
        let mut stats = SearchStats::default();
        let mut cursor = Some(key);
        let mut previous: Option<BtreeKey> = None;

        while let Some(key) = cursor {
            let page = self.search_page(key)?;
            stats.pages += 1;
            if page.is_empty() {
                break;
            }
            for item in page.items() {
                let current = item.key();
                if let Some(previous) = previous {
                    if current < previous {
                        return Err(BtrfsError::Unordered {
                            previous,
                            next: current,
                        });
                    }
                }
                previous = Some(current);
                stats.items += 1;
                log_search_trace!(
                    "search item",
                    objectid = current.objectid,
                    item_type = current.item_type,
                    offset = current.offset,
                    len = item.header.len,
                );
                if visit(item)?.is_break() {
                    stats.stopped_early = true;
                    return Ok(stats);
                }
            }
            cursor = page.next_key();
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeKernel;
    use bdup_config::{InoPathsConfig, SearchConfig};
    use std::os::fd::AsFd;

    fn header(objectid: u64, item_type: u32, offset: u64) -> SearchHeader {
        SearchHeader {
            transid: 1,
            objectid,
            offset,
            item_type,
            len: 0,
        }
    }

    #[test]
    fn test_successor_increments_offset() {
        let key = BtreeKey::new(5, 1, 10);
        assert_eq!(key.successor(), Some(BtreeKey::new(5, 1, 11)));
    }

    #[test]
    fn test_successor_rolls_offset_into_type() {
        let key = BtreeKey::new(5, 1, u64::MAX);
        assert_eq!(key.successor(), Some(BtreeKey::new(5, 2, 0)));
    }

    #[test]
    fn test_successor_rolls_type_into_objectid() {
        let key = BtreeKey::new(5, key_type::MAX, u64::MAX);
        assert_eq!(key.successor(), Some(BtreeKey::new(6, 0, 0)));
    }

    #[test]
    fn test_successor_at_end_of_key_space() {
        let key = BtreeKey::new(u64::MAX, key_type::MAX, u64::MAX);
        assert_eq!(key.successor(), None);
    }

    #[test]
    fn test_advance_past_is_strictly_greater() {
        let key = SearchKey::new(5);
        let last = header(300, key_type::EXTENT_DATA, 8192);
        let next = key.advance_past(&last).unwrap();
        assert!(next.min_key() > BtreeKey::from(&last));
        assert_eq!(next.min_key(), BtreeKey::new(300, key_type::EXTENT_DATA, 8193));
        assert_eq!(next.max_key(), key.max_key());
    }

    #[test]
    fn test_advance_past_upper_bound_ends_search() {
        let key = SearchKey::scoped(1, 7, key_type::ROOT_ITEM);
        let last = header(7, key_type::ROOT_ITEM, u64::MAX);
        assert_eq!(key.advance_past(&last), None);
    }

    #[test]
    fn test_parse_rejects_item_past_buffer() {
        let mut args = Box::new(SearchArgs::new(SearchKey::new(5)));
        let bogus = SearchHeader {
            len: 5000,
            ..header(256, key_type::INODE_ITEM, 0)
        };
        bogus.write(&mut args.buf, 0);
        args.key.nr_items = 1;
        let err = SearchPage::parse(SearchKey::new(5), args).unwrap_err();
        assert!(matches!(err, DecodeError::Overrun { offset: 32, .. }));
    }

    #[test]
    fn test_parse_rejects_count_larger_than_buffer() {
        let mut args = Box::new(SearchArgs::new(SearchKey::new(5)));
        args.key.nr_items = 1000;
        let err = SearchPage::parse(SearchKey::new(5), args).unwrap_err();
        assert!(matches!(err, DecodeError::Overrun { .. }));
    }

    #[test]
    fn test_parse_inflated_count_is_overrun() {
        let mut args = Box::new(SearchArgs::new(SearchKey::new(5)));
        args.key.nr_items = u32::MAX;
        let err = SearchPage::parse(SearchKey::new(5), args).unwrap_err();
        assert!(matches!(err, DecodeError::Overrun { .. }));
    }

    #[test]
    fn test_search_each_drains_across_small_pages() {
        let mut kernel = FakeKernel::new(5);
        for objectid in 256..300u64 {
            kernel.insert(5, objectid, key_type::INODE_ITEM, 0, 1, vec![0; 16]);
            kernel.insert(5, objectid, key_type::EXTENT_DATA, 0, 1, vec![0; 16]);
        }
        let file = tempfile::tempfile().unwrap();
        let volume = Volume::with_kernel(file.as_fd(), &kernel).with_config(
            SearchConfig { items_per_page: 7 },
            InoPathsConfig::default(),
        );

        let mut seen = Vec::new();
        let stats = volume
            .search_each(SearchKey::new(5), |item| {
                seen.push(item.key());
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();

        assert_eq!(seen.len(), 88);
        assert_eq!(stats.items, 88);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!(!stats.stopped_early);
    }

    #[test]
    fn test_search_each_stops_on_break() {
        let mut kernel = FakeKernel::new(5);
        for objectid in 256..266u64 {
            kernel.insert(5, objectid, key_type::INODE_ITEM, 0, 1, vec![]);
        }
        let file = tempfile::tempfile().unwrap();
        let volume = Volume::with_kernel(file.as_fd(), &kernel);

        let stats = volume
            .search_each(SearchKey::new(5), |item| {
                Ok(if item.header.objectid == 260 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            })
            .unwrap();

        assert_eq!(stats.items, 5);
        assert!(stats.stopped_early);
        assert_eq!(kernel.search_calls(), 1);
    }

    #[test]
    fn test_search_each_survives_max_offset_item() {
        let mut kernel = FakeKernel::new(5);
        kernel.insert(5, 256, key_type::INODE_ITEM, u64::MAX, 1, vec![]);
        kernel.insert(5, 256, key_type::INODE_REF, 0, 1, vec![]);
        kernel.insert(5, 257, key_type::INODE_ITEM, 0, 1, vec![]);
        let file = tempfile::tempfile().unwrap();
        let volume = Volume::with_kernel(file.as_fd(), &kernel).with_config(
            SearchConfig { items_per_page: 1 },
            InoPathsConfig::default(),
        );

        let stats = volume
            .search_each(SearchKey::new(5), |_| Ok(ControlFlow::Continue(())))
            .unwrap();
        assert_eq!(stats.items, 3);
    }

    #[test]
    fn test_search_error_carries_fd_and_op() {
        let kernel = FakeKernel::new(5).failing_search(libc::EPERM);
        let file = tempfile::tempfile().unwrap();
        let volume = Volume::with_kernel(file.as_fd(), &kernel);

        let err = volume.search_page(SearchKey::new(5)).unwrap_err();
        match err {
            BtrfsError::Ioctl { op, source, .. } => {
                assert_eq!(op, "TREE_SEARCH");
                assert_eq!(source.raw_os_error(), Some(libc::EPERM));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
