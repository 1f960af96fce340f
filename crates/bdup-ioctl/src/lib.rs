//! # bdup-ioctl
//!
//! Client for the btrfs ioctl interface used by an offline deduplicator.
//!
//! A [`Volume`] wraps an open descriptor on a mounted btrfs subvolume and
//! drives the paginated tree search that backs:
//!
//! - [`Volume::root_generation`]: newest committed generation of the subvolume
//! - [`Volume::find_new`]: every item changed since a given generation
//! - [`Volume::ino_paths`]: reverse lookup of the paths owning an inode
//! - [`Volume::fsid`]: filesystem identity
//!
//! Extent sharing and defragmentation act on individual files through
//! [`ExtentCloner`].
//!
//! ## Layers
//!
//! ```text
//! abi      kernel structs and field offsets
//! kernel   Ioctl trait, SysIoctl (nix request codes)
//! search   one round trip per page, cursor advance
//! items    typed decoding of item payloads
//! roots / find_new / ino_paths / fs_info / clone
//! ```
//!
//! All calls block the calling thread. Each scan owns its own cursor, so
//! independent scans may run on different threads against the same
//! descriptor.

pub mod abi;
pub mod clone;
pub mod fiemap;
pub mod find_new;
pub mod fs_info;
pub mod ino_paths;
pub mod items;
pub mod kernel;
pub mod openat;
pub mod roots;
pub mod search;
pub mod testing;

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::PathBuf;

use bdup_config::{InoPathsConfig, SearchConfig};
use thiserror::Error;

pub use abi::{SearchHeader, SearchKey};
pub use clone::{CloneOutcome, ExtentCloner, ExtentOracle};
pub use fiemap::FiemapOracle;
pub use find_new::{ChangeRecord, ScanSummary};
pub use fs_info::FsInfo;
pub use ino_paths::InodePaths;
pub use items::{DecodeError, Item};
pub use kernel::{Ioctl, SysIoctl};
pub use openat::{fopenat, fopenat_rw};
pub use search::{BtreeKey, SearchItem, SearchPage, SearchStats};

/// Errors that can occur while talking to btrfs
#[derive(Error, Debug)]
pub enum BtrfsError {
    #[error("ioctl {op} failed on fd {fd}: {source}")]
    Ioctl {
        op: &'static str,
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("INO_PATHS failed for inode {inum} on fd {fd}: {source}")]
    InoPaths {
        inum: u64,
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("openat {path:?} relative to fd {dirfd} failed: {source}")]
    Open {
        dirfd: RawFd,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("scan for changes since generation {min_generation} failed on fd {fd}: {source}")]
    ScanFailed {
        fd: RawFd,
        min_generation: u64,
        #[source]
        source: io::Error,
    },

    #[error(
        "paths of inode {inum} do not fit in {size} bytes \
         ({bytes_missing} bytes, {elem_missed} paths missing)"
    )]
    BufferTooSmall {
        inum: u64,
        size: usize,
        bytes_missing: u32,
        elem_missed: u32,
    },

    #[error("extent comparison of fd {dest} and fd {src} failed: {source}")]
    ExtentCheck {
        dest: RawFd,
        src: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("no root item found for tree {tree_id}")]
    NoRootItem { tree_id: u64 },

    #[error("tree search went backwards: {next:?} after {previous:?}")]
    Unordered { previous: BtreeKey, next: BtreeKey },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("failed to write scan output: {0}")]
    Output(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, BtrfsError>;

/// An open descriptor on a mounted btrfs volume.
///
/// The descriptor is borrowed; opening and closing it is the caller's
/// business.
#[derive(Debug, Clone)]
pub struct Volume<'fd, K = SysIoctl> {
    fd: BorrowedFd<'fd>,
    kernel: K,
    search: SearchConfig,
    ino_paths: InoPathsConfig,
}

impl<'fd> Volume<'fd, SysIoctl> {
    pub fn new(fd: BorrowedFd<'fd>) -> Self {
        Self::with_kernel(fd, SysIoctl)
    }
}

impl<'fd, K: Ioctl> Volume<'fd, K> {
    /// Use `kernel` instead of the real ioctls.
    pub fn with_kernel(fd: BorrowedFd<'fd>, kernel: K) -> Self {
        Self {
            fd,
            kernel,
            search: SearchConfig::default(),
            ino_paths: InoPathsConfig::default(),
        }
    }

    /// Override page and buffer sizes, usually from `bdup_config::config()`.
    pub fn with_config(mut self, search: SearchConfig, ino_paths: InoPathsConfig) -> Self {
        self.search = search;
        self.ino_paths = ino_paths;
        self
    }

    pub fn fd(&self) -> BorrowedFd<'fd> {
        self.fd
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn ioctl_error(&self, op: &'static str) -> impl FnOnce(io::Error) -> BtrfsError {
        let fd = self.raw_fd();
        move |source| BtrfsError::Ioctl { op, fd, source }
    }
}
