//! Inode to path resolution through `BTRFS_IOC_INO_PATHS`.
//!
//! The kernel fills a `btrfs_data_container`: a 16-byte head, a table of
//! `u64` offsets, then NUL-terminated paths relative to the subvolume. The
//! offsets count from the start of the table.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use bdup_config::{log_inode_debug, log_inode_warn};

use crate::abi::DataContainerHeader;
use crate::items::DecodeError;
use crate::{BtrfsError, Ioctl, Result, Volume};

/// Paths of one inode, read lazily out of the kernel's buffer.
///
/// Yields each path once; the buffer is dropped with the iterator.
#[derive(Debug)]
pub struct InodePaths {
    buf: Vec<u8>,
    count: u32,
    next: u32,
}

impl InodePaths {
    fn new(buf: Vec<u8>, count: u32) -> Self {
        Self {
            buf,
            count,
            next: 0,
        }
    }

    /// Number of paths the kernel returned.
    pub fn count_total(&self) -> u32 {
        self.count
    }

    fn path_at(&self, index: u32) -> std::result::Result<PathBuf, DecodeError> {
        let values = &self.buf[DataContainerHeader::SIZE..];
        let slot = index as usize * 8;
        let raw: [u8; 8] = values
            .get(slot..slot + 8)
            .and_then(|s| s.try_into().ok())
            .ok_or(DecodeError::PathOffset {
                index,
                offset: slot as u64,
                available: values.len(),
            })?;
        let offset = u64::from_ne_bytes(raw);

        let start = usize::try_from(offset)
            .ok()
            .filter(|&start| start < values.len())
            .ok_or(DecodeError::PathOffset {
                index,
                offset,
                available: values.len(),
            })?;
        let tail = &values[start..];
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnterminatedPath { index })?;
        Ok(PathBuf::from(OsStr::from_bytes(&tail[..len])))
    }
}

impl Iterator for InodePaths {
    type Item = std::result::Result<PathBuf, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.path_at(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.count - self.next) as usize;
        (left, Some(left))
    }
}

impl<K: Ioctl> Volume<'_, K> {
    /// Paths (relative to the subvolume) that link to inode `inum`.
    ///
    /// When the kernel reports paths that did not fit, the buffer is grown
    /// and the call repeated, up to the configured maximum. The kernel may
    /// cap how much it fills regardless of the buffer, so a retry that
    /// recovers nothing ends with [`BtrfsError::BufferTooSmall`].
    pub fn ino_paths(&self, inum: u64) -> Result<InodePaths> {
        let max = self.ino_paths.max_buffer.max(DataContainerHeader::SIZE);
        let mut size = self
            .ino_paths
            .initial_buffer
            .clamp(DataContainerHeader::SIZE, max);
        let mut previous: Option<DataContainerHeader> = None;

        loop {
            let mut buf = vec![0u8; size];
            self.kernel
                .ino_paths(self.fd, inum, &mut buf)
                .map_err(|source| BtrfsError::InoPaths {
                    inum,
                    fd: self.raw_fd(),
                    source,
                })?;
            let header = DataContainerHeader::read(&buf).ok_or(DecodeError::Overrun {
                offset: 0,
                needed: DataContainerHeader::SIZE,
                available: buf.len(),
            })?;

            if header.is_complete() {
                log_inode_debug!("inode paths resolved", inum = inum, paths = header.elem_cnt);
                return Ok(InodePaths::new(buf, header.elem_cnt));
            }

            let too_small = BtrfsError::BufferTooSmall {
                inum,
                size,
                bytes_missing: header.bytes_missing,
                elem_missed: header.elem_missed,
            };
            if let Some(prev) = previous {
                if header.bytes_missing >= prev.bytes_missing
                    && header.elem_missed >= prev.elem_missed
                {
                    return Err(too_small);
                }
            }
            let grown = size
                .saturating_add(header.bytes_missing as usize)
                .max(size.saturating_mul(2))
                .min(max);
            if grown <= size {
                return Err(too_small);
            }

            log_inode_warn!(
                "inode path buffer too small, retrying",
                inum = inum,
                size = size,
                grown = grown,
                bytes_missing = header.bytes_missing,
                elem_missed = header.elem_missed,
            );
            previous = Some(header);
            size = grown;
        }
    }
}
