//! A synthetic btrfs kernel for tests and benchmarks.
//!
//! [`FakeKernel`] keeps an in-memory B-tree per tree id and answers the
//! [`Ioctl`] calls by writing the same bytes the kernel would: packed
//! search headers into the search buffer, a data container for INO_PATHS,
//! and so on. Decoding and pagination therefore run unmodified against it.
//!
//! [`payload`] builds item payloads in the on-disk layout.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use crate::abi::{
    DataContainerHeader, FsInfoArgs, InoLookupArgs, SearchArgs, SearchHeader,
    SEARCH_ARGS_BUFSIZE,
};
use crate::clone::ExtentOracle;
use crate::kernel::Ioctl;
use crate::search::BtreeKey;

/// Largest container the kernel fills for INO_PATHS.
pub const KERNEL_INO_PATHS_LIMIT: usize = 4096;

#[derive(Debug, Clone)]
struct StoredItem {
    transid: u64,
    data: Vec<u8>,
}

/// In-memory stand-in for a mounted btrfs subvolume.
#[derive(Debug)]
pub struct FakeKernel {
    root_id: u64,
    trees: HashMap<u64, BTreeMap<BtreeKey, StoredItem>>,
    paths: HashMap<u64, Vec<Vec<u8>>>,
    fsid: Uuid,
    search_errno: Option<i32>,
    clone_errno: Option<i32>,
    ignore_max_key: bool,
    ino_paths_limit: usize,
    shared: Mutex<HashSet<(RawFd, RawFd)>>,
    search_calls: AtomicUsize,
    ino_paths_calls: AtomicUsize,
    clone_calls: AtomicUsize,
    defrag_calls: AtomicUsize,
}

impl FakeKernel {
    /// An empty subvolume whose tree id is `root_id`.
    pub fn new(root_id: u64) -> Self {
        Self {
            root_id,
            trees: HashMap::new(),
            paths: HashMap::new(),
            fsid: Uuid::from_u128(0x6b2f_1d1e_93a4_4c5b_8f00_0000_0000_0001),
            search_errno: None,
            clone_errno: None,
            ignore_max_key: false,
            ino_paths_limit: KERNEL_INO_PATHS_LIMIT,
            shared: Mutex::new(HashSet::new()),
            search_calls: AtomicUsize::new(0),
            ino_paths_calls: AtomicUsize::new(0),
            clone_calls: AtomicUsize::new(0),
            defrag_calls: AtomicUsize::new(0),
        }
    }

    /// Every TREE_SEARCH fails with `errno`.
    pub fn failing_search(mut self, errno: i32) -> Self {
        self.search_errno = Some(errno);
        self
    }

    /// Every CLONE fails with `errno`.
    pub fn failing_clone(mut self, errno: i32) -> Self {
        self.clone_errno = Some(errno);
        self
    }

    pub fn with_fsid(mut self, fsid: Uuid) -> Self {
        self.fsid = fsid;
        self
    }

    /// Store an item. Tree id 0 means this subvolume's own tree.
    pub fn insert(
        &mut self,
        tree_id: u64,
        objectid: u64,
        item_type: u32,
        offset: u64,
        transid: u64,
        data: Vec<u8>,
    ) {
        let tree_id = self.resolve_tree(tree_id);
        self.trees.entry(tree_id).or_default().insert(
            BtreeKey::new(objectid, item_type, offset),
            StoredItem { transid, data },
        );
    }

    /// Hand out items past the search's upper bound, the way a careless
    /// kernel might.
    pub fn ignore_max_key(&mut self, ignore: bool) {
        self.ignore_max_key = ignore;
    }

    /// Paths returned by INO_PATHS for `inum`, in order.
    pub fn set_paths(&mut self, inum: u64, paths: &[&str]) {
        self.paths.insert(
            inum,
            paths.iter().map(|p| p.as_bytes().to_vec()).collect(),
        );
    }

    /// Fill at most `limit` bytes of an INO_PATHS container, whatever its
    /// size.
    pub fn clamp_ino_paths(&mut self, limit: usize) {
        self.ino_paths_limit = limit;
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::Relaxed)
    }

    pub fn ino_paths_calls(&self) -> usize {
        self.ino_paths_calls.load(Ordering::Relaxed)
    }

    pub fn clone_calls(&self) -> usize {
        self.clone_calls.load(Ordering::Relaxed)
    }

    pub fn defrag_calls(&self) -> usize {
        self.defrag_calls.load(Ordering::Relaxed)
    }

    /// Whether `a` and `b` currently share their extents.
    pub fn is_shared(&self, a: RawFd, b: RawFd) -> bool {
        let shared = self.shared();
        shared.contains(&(a, b)) || shared.contains(&(b, a))
    }

    fn shared(&self) -> MutexGuard<'_, HashSet<(RawFd, RawFd)>> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve_tree(&self, tree_id: u64) -> u64 {
        if tree_id == 0 {
            self.root_id
        } else {
            tree_id
        }
    }
}

impl Ioctl for FakeKernel {
    fn tree_search(&self, _fd: BorrowedFd<'_>, args: &mut SearchArgs) -> io::Result<()> {
        self.search_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(errno) = self.search_errno {
            return Err(io::Error::from_raw_os_error(errno));
        }

        let key = args.key;
        let min = key.min_key();
        let max = key.max_key();
        let wanted = key.nr_items as usize;
        let mut at = 0usize;
        let mut count = 0usize;

        let tree = self.trees.get(&self.resolve_tree(key.tree_id));
        let candidates = tree.into_iter().flat_map(|t| t.range(min..));
        for (item_key, item) in candidates {
            if count == wanted {
                break;
            }
            if !self.ignore_max_key && *item_key > max {
                break;
            }
            if item.transid < key.min_transid || item.transid > key.max_transid {
                continue;
            }
            let needed = SearchHeader::SIZE + item.data.len();
            if SEARCH_ARGS_BUFSIZE - at < needed {
                if count == 0 {
                    return Err(io::Error::from_raw_os_error(libc::EOVERFLOW));
                }
                break;
            }
            SearchHeader {
                transid: item.transid,
                objectid: item_key.objectid,
                offset: item_key.offset,
                item_type: item_key.item_type,
                len: item.data.len() as u32,
            }
            .write(&mut args.buf, at);
            let data_at = at + SearchHeader::SIZE;
            args.buf[data_at..data_at + item.data.len()].copy_from_slice(&item.data);
            at = data_at + item.data.len();
            count += 1;
        }

        args.key.nr_items = count as u32;
        Ok(())
    }

    fn ino_lookup(&self, _fd: BorrowedFd<'_>, args: &mut InoLookupArgs) -> io::Result<()> {
        if args.treeid == 0 {
            args.treeid = self.root_id;
        }
        Ok(())
    }

    /// Offsets go at the front of the value area and strings are packed
    /// from its end, as `inode_to_path` does. A path that does not fit is
    /// counted as missing along with everything after it.
    fn ino_paths(&self, _fd: BorrowedFd<'_>, inum: u64, container: &mut [u8]) -> io::Result<()> {
        self.ino_paths_calls.fetch_add(1, Ordering::Relaxed);
        if container.len() < DataContainerHeader::SIZE {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let usable = container.len().min(self.ino_paths_limit);
        let (head, values) = container.split_at_mut(DataContainerHeader::SIZE);
        let area = usable.saturating_sub(DataContainerHeader::SIZE);

        let mut header = DataContainerHeader {
            bytes_left: area as u32,
            bytes_missing: 0,
            elem_cnt: 0,
            elem_missed: 0,
        };
        let mut front = 0usize;
        let mut back = area;
        for path in self.paths.get(&inum).map(Vec::as_slice).unwrap_or_default() {
            let needed = 8 + path.len() + 1;
            if header.elem_missed == 0 && back - front >= needed {
                back -= path.len() + 1;
                values[back..back + path.len()].copy_from_slice(path);
                values[back + path.len()] = 0;
                values[front..front + 8].copy_from_slice(&(back as u64).to_ne_bytes());
                front += 8;
                header.elem_cnt += 1;
            } else {
                header.bytes_missing += needed as u32;
                header.elem_missed += 1;
            }
        }
        header.bytes_left = (back - front) as u32;
        header.write(head);
        Ok(())
    }

    fn fs_info(&self, _fd: BorrowedFd<'_>, args: &mut FsInfoArgs) -> io::Result<()> {
        args.max_id = 1;
        args.num_devices = 1;
        args.fsid = *self.fsid.as_bytes();
        args.nodesize = 16384;
        args.sectorsize = 4096;
        args.clone_alignment = 4096;
        Ok(())
    }

    fn clone_file(&self, dest: BorrowedFd<'_>, src: BorrowedFd<'_>) -> io::Result<()> {
        self.clone_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(errno) = self.clone_errno {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.shared().insert((dest.as_raw_fd(), src.as_raw_fd()));
        Ok(())
    }

    fn defrag(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.defrag_calls.fetch_add(1, Ordering::Relaxed);
        let fd = fd.as_raw_fd();
        self.shared().retain(|&(a, b)| a != fd && b != fd);
        Ok(())
    }
}

impl ExtentOracle for FakeKernel {
    fn same_extents(&self, dest: BorrowedFd<'_>, src: BorrowedFd<'_>) -> io::Result<bool> {
        Ok(self.is_shared(dest.as_raw_fd(), src.as_raw_fd()))
    }
}

/// Item payloads in the packed on-disk layout.
pub mod payload {
    use crate::abi::{dir_item, file_extent, inode_item, inode_ref, key_type, root_item};

    fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
        buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// A regular extent of `num_bytes`, written in `generation`.
    pub fn file_extent(generation: u64, num_bytes: u64) -> Vec<u8> {
        let mut buf = vec![0u8; file_extent::SIZE];
        put(&mut buf, file_extent::GENERATION, &generation.to_ne_bytes());
        put(&mut buf, file_extent::RAM_BYTES, &num_bytes.to_ne_bytes());
        buf[file_extent::TYPE] = file_extent::KIND_REG;
        put(&mut buf, file_extent::DISK_BYTENR, &(1u64 << 20).to_ne_bytes());
        put(&mut buf, file_extent::DISK_NUM_BYTES, &num_bytes.to_ne_bytes());
        put(&mut buf, file_extent::NUM_BYTES, &num_bytes.to_ne_bytes());
        buf
    }

    /// An inline extent holding `data`.
    pub fn inline_extent(generation: u64, data: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; file_extent::INLINE_DATA];
        put(&mut buf, file_extent::GENERATION, &generation.to_ne_bytes());
        put(&mut buf, file_extent::RAM_BYTES, &(data.len() as u64).to_ne_bytes());
        buf[file_extent::TYPE] = file_extent::KIND_INLINE;
        buf.extend_from_slice(data);
        buf
    }

    pub fn inode_item(generation: u64, mode: u32, size: u64) -> Vec<u8> {
        let mut buf = vec![0u8; inode_item::SIZE];
        put(&mut buf, inode_item::GENERATION, &generation.to_ne_bytes());
        put(&mut buf, inode_item::TRANSID, &generation.to_ne_bytes());
        put(&mut buf, inode_item::SIZE_FIELD, &size.to_ne_bytes());
        put(&mut buf, inode_item::NBYTES, &size.to_ne_bytes());
        put(&mut buf, inode_item::NLINK, &1u32.to_ne_bytes());
        put(&mut buf, inode_item::MODE, &mode.to_ne_bytes());
        buf
    }

    pub fn inode_ref(index: u64, name: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; inode_ref::SIZE];
        put(&mut buf, inode_ref::INDEX, &index.to_ne_bytes());
        put(&mut buf, inode_ref::NAME_LEN, &(name.len() as u16).to_ne_bytes());
        buf.extend_from_slice(name);
        buf
    }

    /// A directory entry pointing at inode `location`.
    pub fn dir_item(location: u64, transid: u64, file_type: u8, name: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; dir_item::SIZE];
        put(&mut buf, dir_item::LOCATION, &location.to_ne_bytes());
        buf[dir_item::LOCATION + 8] = key_type::INODE_ITEM as u8;
        put(&mut buf, dir_item::TRANSID, &transid.to_ne_bytes());
        put(&mut buf, dir_item::NAME_LEN, &(name.len() as u16).to_ne_bytes());
        buf[dir_item::TYPE] = file_type;
        buf.extend_from_slice(name);
        buf
    }

    /// A root item. Without `generation_v2` the legacy short layout is
    /// produced; with it, the full layout including uuid and ctransid.
    pub fn root_item(generation: u64, generation_v2: Option<u64>) -> Vec<u8> {
        let size = match generation_v2 {
            Some(_) => root_item::SIZE,
            None => root_item::LEGACY_SIZE,
        };
        let mut buf = vec![0u8; size];
        put(&mut buf, root_item::GENERATION, &generation.to_ne_bytes());
        put(&mut buf, root_item::ROOT_DIRID, &256u64.to_ne_bytes());
        put(&mut buf, root_item::REFS, &1u32.to_ne_bytes());
        if let Some(v2) = generation_v2 {
            put(&mut buf, root_item::GENERATION_V2, &v2.to_ne_bytes());
            let uuid = uuid::Uuid::from_u128(0x1f2e_3d4c_5b6a_4798_8776_6554_4332_2110);
            put(&mut buf, root_item::UUID, uuid.as_bytes());
            put(&mut buf, root_item::CTRANSID, &generation.to_ne_bytes());
            put(&mut buf, root_item::OTRANSID, &generation.to_ne_bytes());
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{key_type, SearchKey};
    use std::fs::File;
    use std::os::fd::AsFd;

    #[test]
    fn test_search_honours_page_size_and_sets_count() {
        let mut kernel = FakeKernel::new(5);
        for objectid in 256..266 {
            kernel.insert(0, objectid, key_type::INODE_ITEM, 0, 1, vec![1; 8]);
        }
        let file = File::open("/dev/null").unwrap();
        let mut key = SearchKey::new(0);
        key.nr_items = 4;
        let mut args = Box::new(SearchArgs::new(key));
        kernel.tree_search(file.as_fd(), &mut args).unwrap();
        assert_eq!(args.key.nr_items, 4);
        let first = SearchHeader::read(&args.buf, 0).unwrap();
        assert_eq!(first.objectid, 256);
        assert_eq!(first.len, 8);
    }

    #[test]
    fn test_search_fills_only_what_fits() {
        let mut kernel = FakeKernel::new(5);
        for objectid in 256..260 {
            kernel.insert(5, objectid, key_type::INODE_ITEM, 0, 1, vec![0; 1500]);
        }
        let file = File::open("/dev/null").unwrap();
        let mut key = SearchKey::new(5);
        key.nr_items = 100;
        let mut args = Box::new(SearchArgs::new(key));
        kernel.tree_search(file.as_fd(), &mut args).unwrap();
        assert_eq!(args.key.nr_items, 2);
    }

    #[test]
    fn test_oversized_first_item_overflows() {
        let mut kernel = FakeKernel::new(5);
        kernel.insert(5, 256, key_type::INODE_ITEM, 0, 1, vec![0; SEARCH_ARGS_BUFSIZE]);
        let file = File::open("/dev/null").unwrap();
        let mut key = SearchKey::new(5);
        key.nr_items = 1;
        let mut args = Box::new(SearchArgs::new(key));
        let err = kernel.tree_search(file.as_fd(), &mut args).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EOVERFLOW));
    }

    #[test]
    fn test_ino_paths_reports_what_did_not_fit() {
        let mut kernel = FakeKernel::new(5);
        kernel.set_paths(300, &["abc", "defgh"]);
        let file = File::open("/dev/null").unwrap();
        let mut buf = vec![0u8; DataContainerHeader::SIZE + 12 + 4];
        kernel.ino_paths(file.as_fd(), 300, &mut buf).unwrap();
        let header = DataContainerHeader::read(&buf).unwrap();
        assert_eq!(header.elem_cnt, 1);
        assert_eq!(header.elem_missed, 1);
        assert_eq!(header.bytes_missing, 14);
        assert!(!header.is_complete());
    }

    #[test]
    fn test_defrag_unshares() {
        let kernel = FakeKernel::new(5);
        let a = File::open("/dev/null").unwrap();
        let b = File::open("/dev/null").unwrap();
        kernel.clone_file(a.as_fd(), b.as_fd()).unwrap();
        assert!(kernel.same_extents(b.as_fd(), a.as_fd()).unwrap());
        kernel.defrag(a.as_fd()).unwrap();
        assert!(!kernel.same_extents(a.as_fd(), b.as_fd()).unwrap());
    }
}
