//! Extent sharing and defragmentation.
//!
//! [`ExtentCloner::clone_data`] makes a destination file reference the
//! physical extents of a source file through `BTRFS_IOC_CLONE`. Any later
//! write to either file diverges them again by ordinary copy-on-write.
//!
//! [`ExtentCloner::defragment`] rewrites a file's extents. It can drop
//! compression and unshare extents, undoing an earlier clone.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use bdup_config::{log_dedup_debug, log_dedup_info};

use crate::fiemap::FiemapOracle;
use crate::{BtrfsError, Ioctl, Result, SysIoctl};

/// Decides whether two files already reference identical physical extents.
pub trait ExtentOracle {
    fn same_extents(&self, dest: BorrowedFd<'_>, src: BorrowedFd<'_>) -> io::Result<bool>;
}

impl<T: ExtentOracle + ?Sized> ExtentOracle for &T {
    fn same_extents(&self, dest: BorrowedFd<'_>, src: BorrowedFd<'_>) -> io::Result<bool> {
        (**self).same_extents(dest, src)
    }
}

/// What [`ExtentCloner::clone_data`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneOutcome {
    /// The clone ioctl was issued.
    Cloned,
    /// The pre-check found the data already shared; nothing was issued.
    AlreadyShared,
}

impl CloneOutcome {
    pub fn performed(self) -> bool {
        matches!(self, CloneOutcome::Cloned)
    }
}

impl fmt::Display for CloneOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloneOutcome::Cloned => write!(f, "cloned"),
            CloneOutcome::AlreadyShared => write!(f, "already shared"),
        }
    }
}

/// Issues CLONE and DEFRAG, consulting an [`ExtentOracle`] first when asked.
#[derive(Debug, Clone, Default)]
pub struct ExtentCloner<K = SysIoctl, O = FiemapOracle> {
    kernel: K,
    oracle: O,
}

impl ExtentCloner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K: Ioctl, O: ExtentOracle> ExtentCloner<K, O> {
    pub fn with_parts(kernel: K, oracle: O) -> Self {
        Self { kernel, oracle }
    }

    /// Make `dest` share the data of `src`.
    ///
    /// With `check_first`, the oracle is asked whether the two already
    /// share extents; if so no ioctl is issued, so repeating a call is
    /// cheap.
    pub fn clone_data(
        &self,
        dest: BorrowedFd<'_>,
        src: BorrowedFd<'_>,
        check_first: bool,
    ) -> Result<CloneOutcome> {
        if check_first {
            let shared =
                self.oracle
                    .same_extents(dest, src)
                    .map_err(|source| BtrfsError::ExtentCheck {
                        dest: dest.as_raw_fd(),
                        src: src.as_raw_fd(),
                        source,
                    })?;
            if shared {
                log_dedup_debug!(
                    "extents already shared, skipping clone",
                    dest = dest.as_raw_fd(),
                    src = src.as_raw_fd(),
                );
                return Ok(CloneOutcome::AlreadyShared);
            }
        }

        self.kernel
            .clone_file(dest, src)
            .map_err(|source| BtrfsError::Ioctl {
                op: "CLONE",
                fd: dest.as_raw_fd(),
                source,
            })?;
        log_dedup_info!("cloned extents", dest = dest.as_raw_fd(), src = src.as_raw_fd());
        Ok(CloneOutcome::Cloned)
    }

    /// Defragment the whole of `fd`. May unshare previously cloned extents.
    pub fn defragment(&self, fd: BorrowedFd<'_>) -> Result<()> {
        self.kernel.defrag(fd).map_err(|source| BtrfsError::Ioctl {
            op: "DEFRAG",
            fd: fd.as_raw_fd(),
            source,
        })?;
        log_dedup_debug!("defragmented", fd = fd.as_raw_fd());
        Ok(())
    }
}
