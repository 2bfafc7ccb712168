//! FUSE userspace library implementation for a read-only relay filesystem.
//!
//! This is a trimmed rewrite of the FUSE userspace library (lowlevel interface), kept
//! close to the upstream kernel ABI. The only thing relied on from the system is the
//! mount/unmount machinery needed to establish a fd to talk to the kernel driver.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

use std::cmp::min;
use std::convert::AsRef;
use std::ffi::OsStr;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::time::Duration;
use std::time::SystemTime;

use log::warn;

#[cfg(feature = "serializable")]
use serde::Deserialize;
#[cfg(feature = "serializable")]
use serde::Serialize;

pub use crate::access_flags::AccessFlags;
pub use crate::bsd_file_flags::BsdFileFlags;
pub use crate::ll::Errno;
pub use crate::ll::Generation;
pub use crate::ll::RequestId;
pub use crate::ll::TimeOrNow;
pub use crate::ll::flags::copy_file_range_flags::CopyFileRangeFlags;
pub use crate::ll::flags::fopen_flags::FopenFlags;
pub use crate::ll::flags::init_flags::InitFlags;
pub use crate::ll::flags::read_flags::ReadFlags;
pub use crate::ll::flags::write_flags::WriteFlags;
pub use crate::ll::fuse_abi::consts;
pub use crate::ll::{FileHandle, INodeNo, LockOwner, Version};
pub use crate::mnt::mount_options::MountOption;
pub use crate::open_flags::OpenAccMode;
pub use crate::open_flags::OpenFlags;
pub use crate::poll_events::PollEvents;
pub use crate::rename_flags::RenameFlags;
pub use crate::reply::{
    ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyXattr,
};
pub use crate::request_param::Request;
pub use crate::session::BackgroundSession;
pub use crate::session::Session;
pub use crate::session::SessionACL;
pub use crate::session::SessionUnmounter;
use crate::session::MAX_WRITE_SIZE;
pub use crate::session_mt::{MtBackgroundSession, MtSession, SessionConfig};
pub use crate::notify::Notifier;

mod access_flags;
mod bsd_file_flags;
mod channel;
pub mod ctldev;
pub mod filesystem;
mod ll;
mod mnt;
mod nodes;
mod notify;
mod open_flags;
mod poll_events;
pub mod protocol;
mod rename_flags;
mod reply;
mod request;
mod request_param;
mod session;
mod session_mt;

pub(crate) use ll::fuse_abi;

/// We generally support async reads.
const INIT_FLAGS: InitFlags = InitFlags::FUSE_ASYNC_READ.union(InitFlags::FUSE_BIG_WRITES);

fn default_init_flags(_capabilities: InitFlags) -> InitFlags {
    INIT_FLAGS
}

/// File types
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum FileType {
    /// Named pipe (`S_IFIFO`)
    NamedPipe,
    /// Character device (`S_IFCHR`)
    CharDevice,
    /// Block device (`S_IFBLK`)
    BlockDevice,
    /// Directory (`S_IFDIR`)
    Directory,
    /// Regular file (`S_IFREG`)
    RegularFile,
    /// Symbolic link (`S_IFLNK`)
    Symlink,
    /// Unix domain socket (`S_IFSOCK`)
    Socket,
}

impl FileType {
    /// Convert std `FileType` to `fuser`-style `FileType`.
    pub fn from_std(file_type: std::fs::FileType) -> Option<Self> {
        if file_type.is_file() {
            Some(FileType::RegularFile)
        } else if file_type.is_dir() {
            Some(FileType::Directory)
        } else if file_type.is_symlink() {
            Some(FileType::Symlink)
        } else if file_type.is_fifo() {
            Some(FileType::NamedPipe)
        } else if file_type.is_socket() {
            Some(FileType::Socket)
        } else if file_type.is_char_device() {
            Some(FileType::CharDevice)
        } else if file_type.is_block_device() {
            Some(FileType::BlockDevice)
        } else {
            None
        }
    }
}

/// File attributes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FileAttr {
    /// Inode number
    pub ino: INodeNo,
    /// Size in bytes
    pub size: u64,
    /// Allocated size in 512-byte blocks.
    pub blocks: u64,
    /// Time of last access
    pub atime: SystemTime,
    /// Time of last modification
    pub mtime: SystemTime,
    /// Time of last change
    pub ctime: SystemTime,
    /// Time of creation (macOS only)
    pub crtime: SystemTime,
    /// Kind of file (directory, file, pipe, etc)
    pub kind: FileType,
    /// Permissions
    pub perm: u16,
    /// Number of hard links
    pub nlink: u32,
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
    /// Rdev
    pub rdev: u32,
    /// Block size to be reported by `stat()`. If unsure, set to 4096.
    pub blksize: u32,
    /// Flags (macOS only, see chflags(2))
    pub flags: u32,
}

/// Configuration of the fuse kernel module connection, handed to
/// [`Filesystem::init`].
#[derive(Debug)]
pub struct KernelConfig {
    capabilities: InitFlags,
    requested: InitFlags,
    max_readahead: u32,
    max_max_readahead: u32,
    max_background: u16,
    congestion_threshold: Option<u16>,
    max_write: u32,
    kernel_abi: Version,
}

impl KernelConfig {
    fn new(capabilities: InitFlags, max_readahead: u32, kernel_abi: Version) -> Self {
        Self {
            capabilities,
            requested: default_init_flags(capabilities),
            max_readahead,
            max_max_readahead: max_readahead,
            max_background: 16,
            congestion_threshold: None,
            max_write: MAX_WRITE_SIZE as u32,
            kernel_abi,
        }
    }

    /// Query kernel capabilities.
    pub fn capabilities(&self) -> InitFlags {
        self.capabilities
    }

    /// Kernel ABI version.
    pub fn kernel_abi(&self) -> Version {
        self.kernel_abi
    }

    pub(crate) fn requested(&self) -> InitFlags {
        self.requested
    }

    pub(crate) fn max_readahead(&self) -> u32 {
        self.max_readahead
    }

    pub(crate) fn max_background(&self) -> u16 {
        self.max_background
    }

    pub(crate) fn max_write(&self) -> u32 {
        self.max_write
    }

    /// Add a set of capabilities.
    /// # Errors
    /// When the argument includes capabilities not supported by the kernel, returns the
    /// bits of the capabilities not supported.
    pub fn add_capabilities(&mut self, capabilities_to_add: InitFlags) -> Result<(), InitFlags> {
        if !self.capabilities.contains(capabilities_to_add) {
            let unsupported = capabilities_to_add & !self.capabilities;
            return Err(unsupported);
        }
        self.requested |= capabilities_to_add;
        Ok(())
    }

    /// Set the maximum write size for a single request.
    /// # Errors
    /// If the argument is too large, returns the nearest value which will succeed.
    pub fn set_max_write(&mut self, value: u32) -> Result<u32, u32> {
        if value == 0 {
            return Err(1);
        }
        if value > MAX_WRITE_SIZE as u32 {
            return Err(MAX_WRITE_SIZE as u32);
        }
        let previous = self.max_write;
        self.max_write = value;
        Ok(previous)
    }

    /// Set the maximum readahead size.
    /// # Errors
    /// If the argument is too large, returns the nearest value which will succeed.
    pub fn set_max_readahead(&mut self, value: u32) -> Result<u32, u32> {
        if value == 0 {
            return Err(1);
        }
        if value > self.max_max_readahead {
            return Err(self.max_max_readahead);
        }
        let previous = self.max_readahead;
        self.max_readahead = value;
        Ok(previous)
    }

    /// Set the maximum number of pending background requests.
    /// # Errors
    /// If the argument is too small, returns the nearest value which will succeed.
    pub fn set_max_background(&mut self, value: u16) -> Result<u16, u16> {
        if value == 0 {
            return Err(1);
        }
        let previous = self.max_background;
        self.max_background = value;
        Ok(previous)
    }

    /// Set the threshold of background requests at which the kernel will consider the
    /// filesystem request queue congested.
    /// # Errors
    /// If the argument is too small, returns the nearest value which will succeed.
    pub fn set_congestion_threshold(&mut self, value: u16) -> Result<u16, u16> {
        if value == 0 {
            return Err(1);
        }
        let previous = self.congestion_threshold();
        self.congestion_threshold = Some(value);
        Ok(previous)
    }

    pub(crate) fn congestion_threshold(&self) -> u16 {
        match self.congestion_threshold {
            None => (u32::from(self.max_background) * 3 / 4) as u16,
            Some(value) => min(value, self.max_background),
        }
    }
}

/// Filesystem trait.
///
/// This trait must be implemented to provide a userspace filesystem via FUSE. These
/// methods correspond to the subset of `fuse_lowlevel_ops` that a read-only relay
/// filesystem can receive; operations that mutate the tree (`setattr`, `mknod`,
/// `mkdir`, `unlink`, `rmdir`, `symlink`, `rename`, `link`, `write`, `setxattr`,
/// `removexattr`, `create`) are rejected with `EROFS` before dispatch ever reaches an
/// implementation, so they have no method here. Reasonable default implementations
/// are provided to get a mountable filesystem that does nothing.
#[allow(clippy::too_many_arguments)]
pub trait Filesystem: Send + Sync + 'static {
    /// Initialize filesystem.
    /// Called before any other filesystem method.
    /// The kernel module connection can be configured using the `KernelConfig` object.
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), Errno> {
        Ok(())
    }

    /// Clean up filesystem. Called on filesystem exit.
    fn destroy(&mut self) {}

    /// Look up a directory entry by name and get its attributes.
    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        warn!("[Not Implemented] lookup(parent: {parent:#x?}, name {name:?})");
        reply.error(Errno::ENOSYS);
    }

    /// Forget about an inode.
    /// The nlookup parameter indicates the number of lookups previously performed on
    /// this inode. The filesystem may ignore forget calls if inodes don't need to have
    /// a limited lifetime.
    fn forget(&self, _req: &Request, _ino: INodeNo, _nlookup: u64) {}

    /// Get file attributes.
    fn getattr(&self, _req: &Request, ino: INodeNo, fh: Option<FileHandle>, reply: ReplyAttr) {
        warn!("[Not Implemented] getattr(ino: {ino:#x?}, fh: {fh:#x?})");
        reply.error(Errno::ENOSYS);
    }

    /// Read symbolic link.
    fn readlink(&self, _req: &Request, ino: INodeNo, reply: ReplyData) {
        warn!("[Not Implemented] readlink(ino: {ino:#x?})");
        reply.error(Errno::ENOSYS);
    }

    /// Open a file. Filesystem may store an arbitrary file handle (pointer, index,
    /// etc) in fh, and use this in all other file operations (read, flush, release).
    fn open(&self, _req: &Request, _ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        reply.opened(0, FopenFlags::empty().bits());
    }

    /// Read data.
    /// Read should send exactly the number of bytes requested except on EOF or error,
    /// otherwise the rest of the data will be substituted with zeroes.
    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        read_flags: ReadFlags,
        flags: u32,
        lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        warn!(
            "[Not Implemented] read(ino: {ino:#x?}, fh: {fh}, offset: {offset}, \
            size: {size}, read_flags: {read_flags:#x?}, flags: {flags:#x?}, lock_owner: {lock_owner:?})"
        );
        reply.error(Errno::ENOSYS);
    }

    /// Flush method, called on each `close()` of the opened file.
    fn flush(&self, _req: &Request, ino: INodeNo, fh: FileHandle, lock_owner: LockOwner, reply: ReplyEmpty) {
        warn!("[Not Implemented] flush(ino: {ino:#x?}, fh: {fh}, lock_owner: {lock_owner:?})");
        reply.ok();
    }

    /// Release an open file. Called when there are no more references to it.
    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    /// Open a directory. Filesystem may store an arbitrary file handle (pointer,
    /// index, etc) in fh, and use this in readdir/releasedir.
    fn opendir(&self, _req: &Request, _ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        reply.opened(0, FopenFlags::empty().bits());
    }

    /// Read directory. Send entries via `reply.add()`, then finish with `reply.ok()`.
    fn readdir(&self, _req: &Request, ino: INodeNo, fh: FileHandle, offset: u64, reply: ReplyDirectory) {
        warn!("[Not Implemented] readdir(ino: {ino:#x?}, fh: {fh}, offset: {offset})");
        reply.error(Errno::ENOSYS);
    }

    /// Release an open directory.
    fn releasedir(&self, _req: &Request, _ino: INodeNo, _fh: FileHandle, _flags: OpenFlags, reply: ReplyEmpty) {
        reply.ok();
    }

    /// Get file system statistics.
    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
    }

    /// Get an extended attribute.
    /// If `size` is 0, the size of the value should be sent with `reply.size()`.
    /// If `size` is not 0, and the value fits, send it with `reply.data()`, or
    /// `reply.error(ERANGE)` if it doesn't.
    fn getxattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, size: u32, reply: ReplyXattr) {
        warn!("[Not Implemented] getxattr(ino: {ino:#x?}, name: {name:?}, size: {size})");
        reply.error(Errno::ENOSYS);
    }

    /// List extended attribute names.
    fn listxattr(&self, _req: &Request, ino: INodeNo, size: u32, reply: ReplyXattr) {
        warn!("[Not Implemented] listxattr(ino: {ino:#x?}, size: {size})");
        reply.error(Errno::ENOSYS);
    }

    /// Check file access permissions.
    /// This will be called for the `access()` system call. If the `default_permissions`
    /// mount option is given, this method is not called.
    fn access(&self, _req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        warn!("[Not Implemented] access(ino: {ino:#x?}, mask: {mask})");
        reply.error(Errno::ENOSYS);
    }
}

/// Mount the given filesystem to the given mountpoint. This function will not return
/// until the filesystem is unmounted.
/// # Errors
/// Returns an error if the fuse device can't be mounted, and any final error when the
/// session comes to an end.
pub fn mount<FS: Filesystem>(filesystem: FS, mountpoint: impl AsRef<Path>, options: &[MountOption]) -> io::Result<()> {
    Session::new(filesystem, mountpoint.as_ref(), options).and_then(|mut se| se.run())
}

/// Mount the given filesystem to the given mountpoint. This function spawns a
/// background thread to handle filesystem operations while being mounted and
/// therefore returns immediately. The returned handle should be stored to reference
/// the mounted filesystem; if it's dropped, the filesystem will be unmounted.
/// # Errors
/// Returns an error if the fuse device can't be mounted.
pub fn spawn_mount<FS: Filesystem + Send + 'static>(
    filesystem: FS,
    mountpoint: impl AsRef<Path>,
    options: &[MountOption],
) -> io::Result<BackgroundSession> {
    Session::new(filesystem, mountpoint.as_ref(), options).and_then(Session::spawn)
}

/// Mount the given filesystem to the given mountpoint, dispatching kernel requests
/// across a pool of worker threads as configured by `config`. Does not return until the
/// filesystem is unmounted.
/// # Errors
/// Returns an error if the fuse device can't be mounted, `config` is invalid, or any
/// final error when the session comes to an end.
pub fn mount_mt<FS: Filesystem + Send + Sync + 'static>(
    filesystem: FS,
    mountpoint: impl AsRef<Path>,
    options: &[MountOption],
    config: SessionConfig,
) -> io::Result<()> {
    MtSession::new(filesystem, mountpoint.as_ref(), options, config).and_then(|mut se| se.run())
}

/// Mount the given filesystem to the given mountpoint with a worker-pool session,
/// running it in a background thread and returning immediately. The returned handle
/// should be stored to reference the mounted filesystem; if it's dropped, the filesystem
/// will be unmounted.
/// # Errors
/// Returns an error if the fuse device can't be mounted or `config` is invalid.
pub fn spawn_mount_mt<FS: Filesystem + Send + Sync + 'static>(
    filesystem: FS,
    mountpoint: impl AsRef<Path>,
    options: &[MountOption],
    config: SessionConfig,
) -> io::Result<MtBackgroundSession> {
    MtSession::new(filesystem, mountpoint.as_ref(), options, config).and_then(MtSession::spawn)
}
