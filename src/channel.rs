//! Raw communication channel to the FUSE kernel driver.

use std::fs::File;
use std::io;
use std::io::IoSlice;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

/// A raw communication channel to the FUSE kernel driver.
///
/// Wraps the `/dev/fuse` file descriptor handed back by the mount call. Cloning a
/// `Channel` is cheap and shares the same underlying fd, which is how reply sends
/// from worker threads reach the kernel while the main loop still owns `receive`.
#[derive(Debug, Clone)]
pub(crate) struct Channel(Arc<File>);

impl Channel {
    pub(crate) fn new(device: Arc<File>) -> Self {
        Channel(device)
    }

    /// Receives data up to the capacity of the given buffer.
    pub(crate) fn receive(&self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            let rc = unsafe {
                libc::read(
                    self.0.as_raw_fd(),
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    buffer.len(),
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(rc as usize);
        }
    }

    pub(crate) fn sender(&self) -> ChannelSender {
        ChannelSender(self.0.clone())
    }
}

/// Handle for sending replies to the kernel driver.
///
/// Can be called from any thread, independent of and in parallel to the receive loop.
#[derive(Debug, Clone)]
pub(crate) struct ChannelSender(Arc<File>);

impl ChannelSender {
    /// Sends a reply as a vectored write so the header and any trailing data are
    /// written atomically from the kernel's point of view.
    pub(crate) fn send(&self, buf: &[IoSlice<'_>]) -> io::Result<()> {
        let fd = self.0.as_raw_fd();
        let iov = buf.as_ptr() as *const libc::iovec;
        let rc = unsafe { libc::writev(fd, iov, buf.len() as libc::c_int) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // The filesystem was unmounted or the request was interrupted; the
            // kernel has already discarded the corresponding request, so dropping
            // the reply is not an error worth surfacing to the caller.
            match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::EBADF) => Ok(()),
                _ => Err(err),
            }
        } else {
            Ok(())
        }
    }
}
