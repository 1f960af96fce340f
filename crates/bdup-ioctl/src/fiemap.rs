//! Extent maps through `FS_IOC_FIEMAP`.
//!
//! Two files already share their data when the kernel maps every logical
//! range of both to the same physical bytes. [`FiemapOracle`] answers that
//! question for [`crate::ExtentCloner`] before it issues a clone.

use std::io;
use std::os::fd::BorrowedFd;

use crate::clone::ExtentOracle;

/// Extents fetched per FIEMAP call.
const BATCH: usize = 64;

pub const FIEMAP_FLAG_SYNC: u32 = 0x0001;

pub const FIEMAP_EXTENT_LAST: u32 = 0x0001;
pub const FIEMAP_EXTENT_UNKNOWN: u32 = 0x0002;
pub const FIEMAP_EXTENT_DELALLOC: u32 = 0x0004;
pub const FIEMAP_EXTENT_ENCODED: u32 = 0x0008;
pub const FIEMAP_EXTENT_NOT_ALIGNED: u32 = 0x0100;
pub const FIEMAP_EXTENT_DATA_INLINE: u32 = 0x0200;
pub const FIEMAP_EXTENT_DATA_TAIL: u32 = 0x0400;

/// Extents carrying any of these flags have no stable physical address
/// and never count as shared.
const UNSHAREABLE: u32 = FIEMAP_EXTENT_UNKNOWN
    | FIEMAP_EXTENT_DELALLOC
    | FIEMAP_EXTENT_ENCODED
    | FIEMAP_EXTENT_NOT_ALIGNED
    | FIEMAP_EXTENT_DATA_INLINE
    | FIEMAP_EXTENT_DATA_TAIL;

/// `struct fiemap` without its trailing extent array.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Fiemap {
    pub fm_start: u64,
    pub fm_length: u64,
    pub fm_flags: u32,
    pub fm_mapped_extents: u32,
    pub fm_extent_count: u32,
    pub fm_reserved: u32,
}

/// `struct fiemap_extent`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct FiemapExtent {
    pub fe_logical: u64,
    pub fe_physical: u64,
    pub fe_length: u64,
    pub fe_reserved64: [u64; 2],
    pub fe_flags: u32,
    pub fe_reserved: [u32; 3],
}

/// A `struct fiemap` followed by room for `BATCH` extents.
#[repr(C)]
struct FiemapRequest {
    head: Fiemap,
    extents: [FiemapExtent; BATCH],
}

const _: () = assert!(std::mem::size_of::<Fiemap>() == 32);
const _: () = assert!(std::mem::size_of::<FiemapExtent>() == 56);

#[cfg(target_os = "linux")]
mod sys {
    nix::ioctl_readwrite!(fs_ioc_fiemap, b'f', 11, super::Fiemap);
}

/// The full extent map of `fd`, flushing delayed allocation first.
#[cfg(target_os = "linux")]
pub fn extent_map(fd: BorrowedFd<'_>) -> io::Result<Vec<FiemapExtent>> {
    use std::os::fd::AsRawFd;

    let mut extents = Vec::new();
    let mut start = 0u64;
    loop {
        let mut req = Box::new(FiemapRequest {
            head: Fiemap {
                fm_start: start,
                fm_length: u64::MAX - start,
                fm_flags: FIEMAP_FLAG_SYNC,
                fm_extent_count: BATCH as u32,
                ..Default::default()
            },
            extents: [FiemapExtent::default(); BATCH],
        });
        // The kernel writes up to fm_extent_count extents right after the
        // head, which is exactly the layout of FiemapRequest.
        let head = std::ptr::addr_of_mut!(*req).cast::<Fiemap>();
        unsafe { sys::fs_ioc_fiemap(fd.as_raw_fd(), head) }?;

        let mapped = (req.head.fm_mapped_extents as usize).min(BATCH);
        let batch = &req.extents[..mapped];
        extents.extend_from_slice(batch);
        match batch.last() {
            Some(last) if last.fe_flags & FIEMAP_EXTENT_LAST == 0 => {
                let next = last.fe_logical.saturating_add(last.fe_length);
                if next <= start {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "FIEMAP returned a non-advancing extent",
                    ));
                }
                start = next;
            }
            _ => return Ok(extents),
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn extent_map(_fd: BorrowedFd<'_>) -> io::Result<Vec<FiemapExtent>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "FIEMAP requires Linux",
    ))
}

/// True when both maps cover the same logical ranges with the same
/// physical bytes, and every extent has a stable physical address.
pub fn extents_match(a: &[FiemapExtent], b: &[FiemapExtent]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            (x.fe_flags | y.fe_flags) & UNSHAREABLE == 0
                && x.fe_logical == y.fe_logical
                && x.fe_physical == y.fe_physical
                && x.fe_length == y.fe_length
        })
}

/// Compares FIEMAP output of the two descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct FiemapOracle;

impl ExtentOracle for FiemapOracle {
    fn same_extents(&self, dest: BorrowedFd<'_>, src: BorrowedFd<'_>) -> io::Result<bool> {
        let dest_map = extent_map(dest)?;
        let src_map = extent_map(src)?;
        Ok(extents_match(&dest_map, &src_map))
    }
}
