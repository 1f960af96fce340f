//! Filesystem identity through `BTRFS_IOC_FS_INFO`.

use serde::Serialize;
use uuid::Uuid;

use crate::abi::FsInfoArgs;
use crate::{Ioctl, Result, Volume};

/// The parts of `btrfs_ioctl_fs_info_args` a deduplicator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsInfo {
    pub fsid: Uuid,
    pub max_id: u64,
    pub num_devices: u64,
    pub nodesize: u32,
    pub sectorsize: u32,
    /// Granularity for CLONE ranges; 0 on kernels that do not report it.
    pub clone_alignment: u32,
}

impl From<&FsInfoArgs> for FsInfo {
    fn from(args: &FsInfoArgs) -> Self {
        Self {
            fsid: Uuid::from_bytes(args.fsid),
            max_id: args.max_id,
            num_devices: args.num_devices,
            nodesize: args.nodesize,
            sectorsize: args.sectorsize,
            clone_alignment: args.clone_alignment,
        }
    }
}

impl<K: Ioctl> Volume<'_, K> {
    pub fn fs_info(&self) -> Result<FsInfo> {
        let mut args = Box::<FsInfoArgs>::default();
        self.kernel
            .fs_info(self.fd, &mut args)
            .map_err(self.ioctl_error("FS_INFO"))?;
        Ok(FsInfo::from(&*args))
    }

    /// UUID of the filesystem; the same for every subvolume on it.
    pub fn fsid(&self) -> Result<Uuid> {
        Ok(self.fs_info()?.fsid)
    }
}
