//! Multi-threaded session loop.
//!
//! Mirrors [`Session`]'s single-threaded read-dispatch loop, but drives a small fixed
//! pool of worker threads that all read from the same `/dev/fuse` channel and dispatch
//! concurrently. The FUSE_INIT handshake runs on the caller's thread before any worker
//! is spawned, so the filesystem is solely owned (and therefore safely `&mut`-accessible)
//! at that point; every other operation goes through `Request::dispatch_shared`, which
//! only ever needs `&FS`, relying on interior mutability in the filesystem implementation
//! for thread-safety (per the `Filesystem: Send + Sync + 'static` bound).

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use libc::{EAGAIN, EINTR, ENODEV, ENOENT};
use log::{error, info, warn};

use crate::channel::Channel;
use crate::mnt::Mount;
use crate::notify::Notifier;
use crate::request::Request;
use crate::session::{acl_for_options, SessionACL, BUFFER_SIZE};
use crate::{Filesystem, MountOption};

/// Default number of worker threads when a caller doesn't ask for a specific pool size.
const DEFAULT_MAX_THREADS: usize = 10;

/// Upper bound on `max_threads`, to keep a typo from trying to spawn an unreasonable
/// number of OS threads.
const MAX_THREADS_LIMIT: usize = 100_000;

/// Configuration for a [`MtSession`]'s worker pool.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Number of worker threads reading from the FUSE channel concurrently.
    pub max_threads: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
        }
    }
}

impl SessionConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of worker threads.
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads.min(MAX_THREADS_LIMIT);
        self
    }

    /// Validates the configuration.
    /// # Errors
    /// Returns an error if `max_threads` is zero or unreasonably large.
    pub fn validate(&self) -> io::Result<()> {
        if self.max_threads == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "max_threads must be at least 1",
            ));
        }
        if self.max_threads > MAX_THREADS_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("max_threads cannot exceed {MAX_THREADS_LIMIT}"),
            ));
        }
        Ok(())
    }

    /// Whether this configuration runs a single worker thread.
    pub fn is_single_threaded(&self) -> bool {
        self.max_threads == 1
    }
}

/// A multi-threaded FUSE session: like [`Session`], but dispatches kernel requests
/// across a pool of worker threads instead of a single read-dispatch loop.
pub struct MtSession<FS: Filesystem> {
    mountpoint: PathBuf,
    ch: Channel,
    mount: Option<Mount>,
    fs: Arc<FS>,
    config: SessionConfig,
    allowed: SessionACL,
    initialized: Arc<AtomicBool>,
    destroyed: Arc<AtomicBool>,
}

impl<FS: Filesystem> fmt::Debug for MtSession<FS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtSession")
            .field("mountpoint", &self.mountpoint)
            .field("config", &self.config)
            .field("allowed", &self.allowed)
            .field("initialized", &self.initialized)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl<FS: Filesystem> MtSession<FS> {
    /// Creates a new multi-threaded session by mounting `filesystem` at `mountpoint`.
    /// # Errors
    /// Returns an error if the mountpoint doesn't exist, the fuse device can't be
    /// mounted, or `config` is invalid.
    pub fn new(
        filesystem: FS,
        mountpoint: &Path,
        options: &[MountOption],
        config: SessionConfig,
    ) -> io::Result<Self> {
        config.validate()?;
        let mountpoint = mountpoint.canonicalize()?;
        let allowed = acl_for_options(options);

        info!(
            "Mounting {} ({} worker threads)",
            mountpoint.display(),
            config.max_threads
        );
        let (file, mount) = Mount::new(&mountpoint, options)?;
        let ch = Channel::new(file);
        Ok(Self {
            mountpoint,
            ch,
            mount: Some(mount),
            fs: Arc::new(filesystem),
            config,
            allowed,
            initialized: Arc::new(AtomicBool::new(false)),
            destroyed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns the path of the mounted filesystem.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmounts the filesystem.
    pub fn unmount(&mut self) {
        drop(self.mount.take());
    }

    /// Returns a handle for sending this session's filesystem unsolicited
    /// cache-invalidation notifications.
    pub fn notifier(&self) -> Notifier {
        Notifier::new(self.ch.sender())
    }
}

impl<FS: Filesystem + Send + Sync + 'static> MtSession<FS> {
    /// Runs the FUSE_INIT handshake, then the worker pool, blocking until the
    /// filesystem is unmounted and every worker has exited.
    /// # Errors
    /// Returns an error if reading the init request or spawning a worker thread fails.
    pub fn run(&mut self) -> io::Result<()> {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let size = loop {
            match self.ch.receive(&mut buffer) {
                Ok(size) => break size,
                Err(err) => match err.raw_os_error() {
                    Some(ENOENT) | Some(ENODEV) => {
                        info!("Filesystem unmounted before init");
                        return Ok(());
                    }
                    Some(EINTR) | Some(EAGAIN) => continue,
                    _ => {
                        error!("Failed to read from fuse device: {err}");
                        return Err(err);
                    }
                },
            }
        };
        let req = Request::new(self.ch.sender(), &buffer[..size]).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "malformed FUSE_INIT request")
        })?;
        // No worker has been spawned yet, so this Arc has exactly one owner.
        let fs = Arc::get_mut(&mut self.fs).expect("sole owner of filesystem before init");
        if !req.dispatch_init(fs) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "FUSE init handshake failed",
            ));
        }
        self.initialized.store(true, Ordering::Release);

        let mut workers = Vec::with_capacity(self.config.max_threads);
        for id in 0..self.config.max_threads {
            let ch = self.ch.clone();
            let fs = self.fs.clone();
            let initialized = self.initialized.clone();
            let destroyed = self.destroyed.clone();
            let handle = thread::Builder::new()
                .name(format!("fuse-worker-{id}"))
                .spawn(move || worker_loop(&ch, &fs, &initialized, &destroyed))?;
            workers.push(handle);
        }
        for worker in workers {
            let _ = worker.join();
        }

        if !self.destroyed.swap(true, Ordering::AcqRel) {
            match Arc::get_mut(&mut self.fs) {
                Some(fs) => fs.destroy(),
                None => warn!("Filesystem still has outstanding references after workers exited"),
            }
        }
        Ok(())
    }

    /// Runs the session loop in a background thread.
    /// # Errors
    /// Returns an error if the worker thread can't be spawned.
    pub fn spawn(self) -> io::Result<MtBackgroundSession> {
        MtBackgroundSession::new(self)
    }
}

impl<FS: Filesystem> Drop for MtSession<FS> {
    fn drop(&mut self) {
        if let Some(mount) = self.mount.take() {
            drop(mount);
        }
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            if let Some(fs) = Arc::get_mut(&mut self.fs) {
                fs.destroy();
            }
        }
    }
}

fn worker_loop<FS: Filesystem>(
    ch: &Channel,
    fs: &Arc<FS>,
    initialized: &Arc<AtomicBool>,
    destroyed: &Arc<AtomicBool>,
) {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        if destroyed.load(Ordering::Acquire) {
            break;
        }
        match ch.receive(&mut buffer) {
            Ok(size) => match Request::new(ch.sender(), &buffer[..size]) {
                Some(req) => req.dispatch_shared(fs.as_ref(), initialized, destroyed),
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
                    error!("Worker failed to read from fuse device: {err}");
                    break;
                }
            },
        }
    }
}

/// A multi-threaded session running in a background thread. Dropping it unmounts the
/// filesystem and waits for every worker thread to exit.
pub struct MtBackgroundSession {
    guard: Option<JoinHandle<io::Result<()>>>,
    mount: Option<Arc<Mount>>,
}

impl MtBackgroundSession {
    fn new<FS: Filesystem + Send + Sync + 'static>(
        mut se: MtSession<FS>,
    ) -> io::Result<MtBackgroundSession> {
        let mount = se.mount.take().map(Arc::new);
        let guard = thread::spawn(move || se.run());
        Ok(MtBackgroundSession {
            guard: Some(guard),
            mount,
        })
    }

    /// Unmounts the filesystem and joins the background thread.
    pub fn join(mut self) {
        drop(self.mount.take());
        if let Some(guard) = self.guard.take() {
            let _ = guard.join();
        }
    }
}

impl Drop for MtBackgroundSession {
    fn drop(&mut self) {
        drop(self.mount.take());
        if let Some(guard) = self.guard.take() {
            let _ = guard.join();
        }
    }
}

impl fmt::Debug for MtBackgroundSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtBackgroundSession").finish()
    }
}
