//! The ioctl seam.
//!
//! Everything above this module talks to the kernel through [`Ioctl`], so a
//! synthetic kernel (see [`crate::testing::FakeKernel`]) can stand in for a
//! mounted volume. [`SysIoctl`] is the real thing.
//!
//! Request codes are computed by nix from the magic number, the command
//! number and the argument struct size, the same way `_IOWR()` does in
//! `linux/btrfs.h`.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use crate::abi::{FsInfoArgs, InoLookupArgs, InoPathArgs, SearchArgs};

/// The btrfs ioctls this crate issues.
///
/// Implementations fill the argument structures exactly as the kernel
/// would and report failures as the raw OS error.
pub trait Ioctl {
    /// `BTRFS_IOC_TREE_SEARCH`
    fn tree_search(&self, fd: BorrowedFd<'_>, args: &mut SearchArgs) -> io::Result<()>;

    /// `BTRFS_IOC_INO_LOOKUP`
    fn ino_lookup(&self, fd: BorrowedFd<'_>, args: &mut InoLookupArgs) -> io::Result<()>;

    /// `BTRFS_IOC_INO_PATHS`, writing a `btrfs_data_container` into `container`.
    fn ino_paths(&self, fd: BorrowedFd<'_>, inum: u64, container: &mut [u8]) -> io::Result<()>;

    /// `BTRFS_IOC_FS_INFO`
    fn fs_info(&self, fd: BorrowedFd<'_>, args: &mut FsInfoArgs) -> io::Result<()>;

    /// `BTRFS_IOC_CLONE`: make all of `dest` share the extents of `src`.
    fn clone_file(&self, dest: BorrowedFd<'_>, src: BorrowedFd<'_>) -> io::Result<()>;

    /// `BTRFS_IOC_DEFRAG` over the whole file.
    fn defrag(&self, fd: BorrowedFd<'_>) -> io::Result<()>;
}

impl<T: Ioctl + ?Sized> Ioctl for &T {
    fn tree_search(&self, fd: BorrowedFd<'_>, args: &mut SearchArgs) -> io::Result<()> {
        (**self).tree_search(fd, args)
    }

    fn ino_lookup(&self, fd: BorrowedFd<'_>, args: &mut InoLookupArgs) -> io::Result<()> {
        (**self).ino_lookup(fd, args)
    }

    fn ino_paths(&self, fd: BorrowedFd<'_>, inum: u64, container: &mut [u8]) -> io::Result<()> {
        (**self).ino_paths(fd, inum, container)
    }

    fn fs_info(&self, fd: BorrowedFd<'_>, args: &mut FsInfoArgs) -> io::Result<()> {
        (**self).fs_info(fd, args)
    }

    fn clone_file(&self, dest: BorrowedFd<'_>, src: BorrowedFd<'_>) -> io::Result<()> {
        (**self).clone_file(dest, src)
    }

    fn defrag(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        (**self).defrag(fd)
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use crate::abi::{
        FsInfoArgs, InoLookupArgs, InoPathArgs, SearchArgs, VolArgs, BTRFS_IOCTL_MAGIC,
    };

    nix::ioctl_write_ptr!(btrfs_defrag, BTRFS_IOCTL_MAGIC, 2, VolArgs);
    nix::ioctl_write_int!(btrfs_clone, BTRFS_IOCTL_MAGIC, 9);
    nix::ioctl_readwrite!(btrfs_tree_search, BTRFS_IOCTL_MAGIC, 17, SearchArgs);
    nix::ioctl_readwrite!(btrfs_ino_lookup, BTRFS_IOCTL_MAGIC, 18, InoLookupArgs);
    nix::ioctl_read!(btrfs_fs_info, BTRFS_IOCTL_MAGIC, 31, FsInfoArgs);
    nix::ioctl_readwrite!(btrfs_ino_paths, BTRFS_IOCTL_MAGIC, 35, InoPathArgs);
}

/// Issues the ioctls against the running kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysIoctl;

#[cfg(target_os = "linux")]
impl Ioctl for SysIoctl {
    fn tree_search(&self, fd: BorrowedFd<'_>, args: &mut SearchArgs) -> io::Result<()> {
        unsafe { sys::btrfs_tree_search(fd.as_raw_fd(), args) }?;
        Ok(())
    }

    fn ino_lookup(&self, fd: BorrowedFd<'_>, args: &mut InoLookupArgs) -> io::Result<()> {
        unsafe { sys::btrfs_ino_lookup(fd.as_raw_fd(), args) }?;
        Ok(())
    }

    fn ino_paths(&self, fd: BorrowedFd<'_>, inum: u64, container: &mut [u8]) -> io::Result<()> {
        let mut args = InoPathArgs {
            inum,
            size: container.len() as u64,
            fspath: container.as_mut_ptr() as u64,
            ..Default::default()
        };
        // The kernel writes at most `size` bytes through `fspath`, which
        // stays borrowed for the duration of the call.
        unsafe { sys::btrfs_ino_paths(fd.as_raw_fd(), &mut args) }?;
        Ok(())
    }

    fn fs_info(&self, fd: BorrowedFd<'_>, args: &mut FsInfoArgs) -> io::Result<()> {
        unsafe { sys::btrfs_fs_info(fd.as_raw_fd(), args) }?;
        Ok(())
    }

    fn clone_file(&self, dest: BorrowedFd<'_>, src: BorrowedFd<'_>) -> io::Result<()> {
        let src_fd = src.as_raw_fd() as nix::sys::ioctl::ioctl_param_type;
        unsafe { sys::btrfs_clone(dest.as_raw_fd(), src_fd) }?;
        Ok(())
    }

    fn defrag(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        unsafe { sys::btrfs_defrag(fd.as_raw_fd(), std::ptr::null()) }?;
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl Ioctl for SysIoctl {
    fn tree_search(&self, _fd: BorrowedFd<'_>, _args: &mut SearchArgs) -> io::Result<()> {
        Err(unsupported())
    }

    fn ino_lookup(&self, _fd: BorrowedFd<'_>, _args: &mut InoLookupArgs) -> io::Result<()> {
        Err(unsupported())
    }

    fn ino_paths(&self, _fd: BorrowedFd<'_>, _inum: u64, _container: &mut [u8]) -> io::Result<()> {
        Err(unsupported())
    }

    fn fs_info(&self, _fd: BorrowedFd<'_>, _args: &mut FsInfoArgs) -> io::Result<()> {
        Err(unsupported())
    }

    fn clone_file(&self, _dest: BorrowedFd<'_>, _src: BorrowedFd<'_>) -> io::Result<()> {
        Err(unsupported())
    }

    fn defrag(&self, _fd: BorrowedFd<'_>) -> io::Result<()> {
        Err(unsupported())
    }
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "btrfs ioctls require Linux")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::fd::AsFd;

    /// A character device never answers btrfs requests; the error must
    /// come back instead of a half-filled buffer being trusted.
    #[test]
    fn test_tree_search_on_non_btrfs_fd_fails() {
        let file = File::open("/dev/null").unwrap();
        let mut args = SearchArgs::new(crate::abi::SearchKey::new(0));
        args.key.nr_items = 1;
        assert!(SysIoctl.tree_search(file.as_fd(), &mut args).is_err());
    }

    #[test]
    fn test_fs_info_on_non_btrfs_fd_fails() {
        let file = File::open("/dev/null").unwrap();
        let mut args = FsInfoArgs::default();
        assert!(SysIoctl.fs_info(file.as_fd(), &mut args).is_err());
    }
}
