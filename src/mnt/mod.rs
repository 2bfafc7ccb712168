//! Platform mount/unmount plumbing.

pub(crate) mod fuse_pure;
pub(crate) mod mount_options;
pub(crate) mod unmount_options;

use std::fs::File;
use std::os::unix::io::AsRawFd;

pub(crate) use fuse_pure::Mount;
pub use mount_options::MountOption;
pub use unmount_options::UnmountOption;

/// Check whether the given FUSE device file descriptor is still attached to a mount.
///
/// The kernel sets `POLLERR` on the fd once the corresponding mountpoint has been
/// unmounted from under us, which is how `Drop` on `Mount` decides whether issuing
/// another unmount would be redundant.
pub(crate) fn is_mounted(fuse_device: &File) -> bool {
    let mut poll_fd = libc::pollfd {
        fd: fuse_device.as_raw_fd(),
        events: 0,
        revents: 0,
    };
    let poll_rc = unsafe { libc::poll(&mut poll_fd, 1, 0) };
    poll_rc >= 0 && (poll_fd.revents & libc::POLLERR) == 0
}
