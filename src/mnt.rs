//! FUSE kernel driver plumbing: opening `/dev/fuse`, mounting the
//! filesystem onto it, and cloning per-thread session fds.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};

use log::{error, warn};
use nix::mount::{MntFlags, MsFlags, umount2};
use nix::sys::stat::stat;

use crate::error::ServiceError;

/// Flag to tell the kernel to clone the underlying fuse handle so several
/// session fds can serve one mount. `_IOR(229, 0, uint32_t)`.
pub const FUSE_DEV_IOC_CLONE: libc::c_ulong = 0x_80_04_e5_00;

/// A newtype for `File` that represents the `/dev/fuse` device.
#[derive(Debug)]
pub struct DevFuse(pub File);

impl AsRawFd for DevFuse {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for DevFuse {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl DevFuse {
    pub const PATH: &'static str = "/dev/fuse";

    pub fn open() -> Result<DevFuse, ServiceError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(Self::PATH)
            .map(DevFuse)
            .map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    error!("{} not found. Try 'modprobe fuse'", Self::PATH);
                }
                ServiceError::OpenDevice(err)
            })
    }

    /// Clone a worker session fd off the primary one via
    /// `FUSE_DEV_IOC_CLONE`.
    pub fn clone_session(&self) -> Result<DevFuse, ServiceError> {
        let clone = DevFuse::open()?;
        let source_fd: u32 = self.as_raw_fd() as u32;
        let code =
            unsafe { libc::ioctl(clone.as_raw_fd(), FUSE_DEV_IOC_CLONE, &raw const source_fd) };
        if code < 0 {
            return Err(ServiceError::OpenDevice(io::Error::last_os_error()));
        }
        Ok(clone)
    }
}

/// A mounted filesystem; lazily unmounted on drop.
#[derive(Debug)]
pub struct Mount {
    mountpoint: PathBuf,
}

/// Mount the filesystem at `mountpoint` over the given device fd.
///
/// Any stale instance at the mountpoint is detached first, matching a server
/// restarted by its supervisor after a crash.
pub fn mount(dev: &DevFuse, mountpoint: &Path) -> Result<Mount, ServiceError> {
    let _ = umount2(mountpoint, MntFlags::MNT_DETACH);

    let meta = stat(mountpoint).map_err(|err| ServiceError::BackingFile(err.into()))?;
    let root_mode = meta.st_mode & libc::S_IFMT;

    let opts = format!(
        "fd={},rootmode={:o},user_id=0,group_id=0,default_permissions,allow_other",
        dev.as_raw_fd(),
        root_mode,
    );
    nix::mount::mount(
        Some("splicefs"),
        mountpoint,
        Some("fuse"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOATIME | MsFlags::MS_NOEXEC,
        Some(opts.as_str()),
    )
    .map_err(|err| ServiceError::Mount(err.into()))?;

    Ok(Mount {
        mountpoint: mountpoint.to_path_buf(),
    })
}

impl Drop for Mount {
    fn drop(&mut self) {
        if let Err(err) = umount2(&self.mountpoint, MntFlags::MNT_DETACH) {
            warn!("unmount of {} failed: {err}", self.mountpoint.display());
        }
    }
}
