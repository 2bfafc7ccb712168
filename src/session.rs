//! Filesystem session
//!
//! A session runs a filesystem implementation while it is mounted at a specific mount
//! point. A session begins by mounting the filesystem and ends by unmounting it. While
//! mounted, the session loop receives, dispatches and replies to kernel requests for
//! filesystem operations under its mount point.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use libc::{EAGAIN, EINTR, ENODEV, ENOENT};
use log::{error, info, warn};

use crate::channel::Channel;
use crate::mnt::Mount;
use crate::notify::Notifier;
use crate::request::Request;
use crate::{Filesystem, MountOption};

/// The max size of write requests from the kernel. The absolute minimum is 4k,
/// FUSE recommends at least 128k, max 16M. The FUSE default is 16M on macOS
/// and 128k on other systems.
pub const MAX_WRITE_SIZE: usize = 16 * 1024 * 1024;

/// Size of the buffer for reading a request from the kernel. Since the kernel may send
/// up to MAX_WRITE_SIZE bytes in a write request, we use that value plus some extra space.
pub(crate) const BUFFER_SIZE: usize = MAX_WRITE_SIZE + 4096;

/// Which clients are allowed to access a mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionACL {
    /// Only the session's owning user (and root) may access the filesystem.
    #[default]
    Owner,
    /// The `allow_root` mount option is in effect.
    RootOnly,
    /// The `allow_other` mount option is in effect.
    All,
}

/// Determines the access restriction implied by a set of mount options.
pub(crate) fn acl_for_options(options: &[MountOption]) -> SessionACL {
    if options
        .iter()
        .any(|o| matches!(o, MountOption::CUSTOM(s) if s == "allow_root"))
    {
        SessionACL::RootOnly
    } else if options
        .iter()
        .any(|o| matches!(o, MountOption::CUSTOM(s) if s == "allow_other"))
    {
        SessionACL::All
    } else {
        SessionACL::Owner
    }
}

/// The session data structure
#[derive(Debug)]
pub struct Session<FS: Filesystem> {
    /// Filesystem operation implementations
    pub(crate) filesystem: FS,
    /// Mountpoint of the filesystem
    mountpoint: PathBuf,
    /// Communication channel to the kernel driver
    ch: Channel,
    /// Handle to the mount, kept alive so dropping the session unmounts the filesystem
    mount: Option<Mount>,
    /// Whether to restrict access to owner, root + owner, or unrestricted
    pub(crate) allowed: SessionACL,
    /// Session state: true if the filesystem is initialized (init operation done)
    pub(crate) initialized: bool,
    /// Session state: true if the filesystem was destroyed (destroy operation done)
    pub(crate) destroyed: bool,
}

impl<FS: Filesystem> Session<FS> {
    /// Create a new session by mounting the given filesystem to the given mountpoint
    /// # Errors
    /// Returns an error if the mountpoint doesn't exist or if the fuse device can't be
    /// mounted.
    pub fn new(filesystem: FS, mountpoint: &Path, options: &[MountOption]) -> io::Result<Self> {
        let mountpoint = mountpoint.canonicalize()?;
        let allowed = acl_for_options(options);

        info!("Mounting {}", mountpoint.display());
        let (file, mount) = Mount::new(&mountpoint, options)?;
        let ch = Channel::new(file);
        Ok(Session {
            filesystem,
            mountpoint,
            ch,
            mount: Some(mount),
            allowed,
            initialized: false,
            destroyed: false,
        })
    }

    /// Return path of the mounted filesystem
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Returns a handle for sending this session's filesystem unsolicited
    /// cache-invalidation notifications.
    pub fn notifier(&self) -> Notifier {
        Notifier::new(self.ch.sender())
    }

    /// Run the session loop that receives kernel requests and dispatches them to method
    /// calls into the filesystem. This read-dispatch-loop is non-concurrent to prevent
    /// having multiple buffers (which take up much memory), but might change in the
    /// future. Allocates a buffer for requests of a reasonable size.
    /// # Errors
    /// Returns an error if reading from the kernel driver fails.
    pub fn run(&mut self) -> io::Result<()> {
        let mut buffer = vec![0; BUFFER_SIZE];
        loop {
            match self.ch.receive(&mut buffer) {
                Ok(size) => match Request::new(self.ch.sender(), &buffer[..size]) {
                    Some(req) => req.dispatch(self),
                    None => continue,
                },
                Err(err) => match err.raw_os_error() {
                    Some(ENOENT) => break,
                    Some(EINTR) | Some(EAGAIN) => continue,
                    Some(ENODEV) => {
                        info!("Filesystem unmounted");
                        break;
                    }
                    _ => {
                        error!("Failed to read from fuse device: {err}");
                        return Err(err);
                    }
                },
            }
            if self.destroyed {
                break;
            }
        }
        Ok(())
    }

    /// Unmount the filesystem
    pub fn unmount(&mut self) {
        drop(self.mount.take());
    }

    /// Returns a thread-safe object that can be used to unmount the Filesystem
    pub fn unmounter(&mut self) -> SessionUnmounter {
        SessionUnmounter {
            mount: self.mount.take().map(Arc::new),
        }
    }

    /// Run the session loop in a background thread
    pub fn spawn(self) -> io::Result<BackgroundSession> {
        BackgroundSession::new(self)
    }
}

impl<FS: Filesystem> Drop for Session<FS> {
    fn drop(&mut self) {
        if let Some(mount) = self.mount.take() {
            drop(mount);
        }
        if !self.destroyed {
            self.filesystem.destroy();
            self.destroyed = true;
        }
    }
}

#[derive(Debug)]
/// A thread-safe handle that can unmount a session even if `run()` is blocked in another thread.
pub struct SessionUnmounter {
    mount: Option<Arc<Mount>>,
}

impl SessionUnmounter {
    /// Unmount the filesystem
    pub fn unmount(&mut self) -> io::Result<()> {
        drop(self.mount.take());
        Ok(())
    }
}

/// The background session data structure
pub struct BackgroundSession {
    /// Thread guard of the background session
    guard: Option<JoinHandle<io::Result<()>>>,
    /// Object for creating Sessionunmounter. Required because Drop impl cannot consume self.
    mount: Option<Arc<Mount>>,
}

impl BackgroundSession {
    /// Create a new background session for the given session by running its
    /// session loop in a background thread. If the returned handle is dropped,
    /// the filesystem is unmounted and the background thread exits.
    fn new<FS: Filesystem + Send + 'static>(mut se: Session<FS>) -> io::Result<BackgroundSession> {
        let mount = se.mount.take().map(Arc::new);
        let guard = std::thread::spawn(move || se.run());
        Ok(BackgroundSession {
            guard: Some(guard),
            mount,
        })
    }

    /// Unmount the filesystem and join the background thread.
    pub fn join(mut self) {
        drop(self.mount.take());
        if let Some(guard) = self.guard.take() {
            let _ = guard.join();
        }
    }

    /// Returns an object that can be used to unmount the Filesystem
    pub fn unmounter(&self) -> SessionUnmounter {
        SessionUnmounter {
            mount: self.mount.clone(),
        }
    }
}

impl Drop for BackgroundSession {
    fn drop(&mut self) {
        drop(self.mount.take());
        if let Some(guard) = self.guard.take() {
            let _ = guard.join();
        }
    }
}

impl fmt::Debug for BackgroundSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundSession").finish()
    }
}
