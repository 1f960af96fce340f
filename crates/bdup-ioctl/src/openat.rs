//! Opening files relative to a directory descriptor.
//!
//! Paths from [`crate::Volume::ino_paths`] are relative to the subvolume,
//! so they are opened against the volume's descriptor rather than the
//! process working directory.

use std::fs::File;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd};
use std::path::Path;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;

use crate::{BtrfsError, Result};

fn open_relative(dirfd: BorrowedFd<'_>, path: &Path, flags: OFlag) -> Result<File> {
    let raw = fcntl::openat(
        Some(dirfd.as_raw_fd()),
        path,
        flags | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|errno| BtrfsError::Open {
        dirfd: dirfd.as_raw_fd(),
        path: path.to_path_buf(),
        source: errno.into(),
    })?;
    // openat returned a fresh descriptor that nothing else owns.
    Ok(unsafe { File::from_raw_fd(raw) })
}

/// Open `path` read-only relative to `dirfd`.
pub fn fopenat(dirfd: BorrowedFd<'_>, path: impl AsRef<Path>) -> Result<File> {
    open_relative(dirfd, path.as_ref(), OFlag::O_RDONLY)
}

/// Open `path` for reading and writing relative to `dirfd`. CLONE needs
/// the destination writable.
pub fn fopenat_rw(dirfd: BorrowedFd<'_>, path: impl AsRef<Path>) -> Result<File> {
    open_relative(dirfd, path.as_ref(), OFlag::O_RDWR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    #[test]
    fn test_open_relative_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"hello").unwrap();
        let handle = File::open(dir.path()).unwrap();

        let mut file = fopenat(handle.as_fd(), "sub/a.txt").unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello");
    }

    #[test]
    fn test_read_only_handle_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let handle = File::open(dir.path()).unwrap();

        let mut file = fopenat(handle.as_fd(), "a.txt").unwrap();
        assert!(file.write_all(b"y").is_err());

        let mut file = fopenat_rw(handle.as_fd(), "a.txt").unwrap();
        file.write_all(b"y").unwrap();
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"y");
    }

    #[test]
    fn test_missing_file_carries_path() {
        let dir = tempfile::tempdir().unwrap();
        let handle = File::open(dir.path()).unwrap();

        let err = fopenat(handle.as_fd(), "nope/missing").unwrap_err();
        match err {
            BtrfsError::Open { path, source, dirfd } => {
                assert_eq!(path, Path::new("nope/missing"));
                assert_eq!(dirfd, handle.as_raw_fd());
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
