//! Dispatches a parsed low-level kernel request to the configured filesystem.

use log::{debug, error, warn};

use crate::channel::ChannelSender;
use crate::ll;
use crate::ll::fuse_abi::consts;
use crate::ll::reply::Response;
use crate::ll::{Errno, FileHandle, INodeNo, LockOwner};
use crate::reply::{
    Reply, ReplyDirectory, ReplyEmpty,
};
use crate::request_param::Request as RequestParam;
use crate::session::Session;
use crate::{Filesystem, KernelConfig};

/// Current FUSE kernel protocol version this crate speaks.
const FUSE_KERNEL_VERSION: u32 = 7;
/// Minimum minor version accepted from the kernel.
const MIN_MINOR_VERSION: u32 = 6;
/// Newest minor version we understand; advertised back to the kernel at init.
const MAX_MINOR_VERSION: u32 = 31;

/// A request and the reply channel it came in on.
pub(crate) struct Request<'a> {
    ch: ChannelSender,
    request: ll::Request<'a>,
}

impl<'a> Request<'a> {
    /// Parses a request from the given data.
    pub(crate) fn new(ch: ChannelSender, data: &'a [u8]) -> Option<Request<'a>> {
        let request = match ll::Request::try_from(data) {
            Ok(r) => r,
            Err(err) => {
                error!("{err}");
                return None;
            }
        };
        Some(Self { ch, request })
    }

    /// Dispatches this request to the given single-threaded session.
    pub(crate) fn dispatch<FS: Filesystem>(&self, se: &mut Session<FS>) {
        debug!("{}", self.request);

        match self.request.operation() {
            ll::Operation::Init(x) => {
                if self.init(x.arg, |config| se.filesystem.init(self.param(), config)).is_ok() {
                    se.initialized = true;
                }
            }
            _ if !se.initialized => self.reject_before_init(),
            ll::Operation::Destroy(_) => {
                se.filesystem.destroy();
                se.destroyed = true;
                self.send_raw(Response::new_empty());
            }
            _ if se.destroyed => self.reject_after_destroy(),
            op => self.dispatch_op(op, &se.filesystem),
        }
    }

    /// Dispatches this request to a filesystem shared across a worker pool. The INIT and
    /// DESTROY handshakes are driven outside the pool (see `MtSession`); a worker only ever
    /// sees this once `initialized` is set and before `destroyed` is set.
    pub(crate) fn dispatch_shared<FS: Filesystem>(
        &self,
        fs: &FS,
        initialized: &std::sync::atomic::AtomicBool,
        destroyed: &std::sync::atomic::AtomicBool,
    ) {
        use std::sync::atomic::Ordering;

        debug!("{}", self.request);

        match self.request.operation() {
            ll::Operation::Init(_) => {
                warn!("Ignoring unexpected INIT on an already-running session");
                self.send_raw_error(Errno::EIO);
            }
            _ if !initialized.load(Ordering::Acquire) => self.reject_before_init(),
            ll::Operation::Destroy(_) => {
                destroyed.store(true, Ordering::Release);
                self.send_raw(Response::new_empty());
            }
            _ if destroyed.load(Ordering::Acquire) => self.reject_after_destroy(),
            op => self.dispatch_op(op, fs),
        }
    }

    /// Runs the INIT handshake: validates the protocol version, hands the filesystem a
    /// chance to configure itself, and sends the kernel its reply. Returns `Err(())` if a
    /// reply (error or otherwise) was already sent and the caller should not proceed.
    pub(crate) fn init(
        &self,
        arg: &ll::fuse_abi::fuse_init_in,
        init_fs: impl FnOnce(&mut KernelConfig) -> Result<(), Errno>,
    ) -> Result<(), ()> {
        if arg.major != FUSE_KERNEL_VERSION || arg.minor < MIN_MINOR_VERSION {
            error!(
                "Unsupported FUSE protocol version: {}.{}",
                arg.major, arg.minor
            );
            self.send_raw_error(Errno::EPROTO);
            return Err(());
        }
        let mut config = KernelConfig::new(
            crate::InitFlags::from_bits_truncate(u64::from(arg.flags)),
            arg.max_readahead,
            ll::Version {
                major: arg.major,
                minor: arg.minor,
            },
        );
        if let Err(err) = init_fs(&mut config) {
            error!("Filesystem initialization failed: {err:?}");
            self.send_raw_error(err);
            return Err(());
        }
        let reply = ll::fuse_abi::fuse_init_out {
            major: FUSE_KERNEL_VERSION,
            minor: arg.minor.min(MAX_MINOR_VERSION),
            max_readahead: config.max_readahead(),
            flags: config.requested().bits() as u32,
            max_background: config.max_background(),
            congestion_threshold: config.congestion_threshold(),
            max_write: config.max_write(),
        };
        self.send_raw(Response::from_struct(&reply));
        Ok(())
    }

    /// Drives the FUSE_INIT handshake directly against `fs`, with no `Session` involved.
    /// Used by `MtSession` on the main thread before any worker threads are spawned, so
    /// that `fs` is still solely owned and no concurrent access is possible yet.
    pub(crate) fn dispatch_init<FS: Filesystem>(&self, fs: &mut FS) -> bool {
        match self.request.operation() {
            ll::Operation::Init(x) => self.init(x.arg, |config| fs.init(self.param(), config)).is_ok(),
            _ => {
                warn!("Expected FUSE_INIT as the first request, got: {}", self.request);
                self.send_raw_error(Errno::EIO);
                false
            }
        }
    }

    fn reject_before_init(&self) {
        warn!("Ignoring request before init: {}", self.request);
        self.send_raw_error(Errno::EIO);
    }

    fn reject_after_destroy(&self) {
        warn!("Ignoring request after destroy: {}", self.request);
        self.send_raw_error(Errno::EIO);
    }

    /// Dispatches every operation whose `Filesystem` method takes `&self`; INIT and DESTROY
    /// are handled by the two callers above and never reach here.
    fn dispatch_op<FS: Filesystem>(&self, op: &ll::Operation<'_>, fs: &FS) {
        match op {
            ll::Operation::Init(_) | ll::Operation::Destroy(_) => unreachable!(),

            ll::Operation::Interrupt(_) => {
                self.send_raw_error(Errno::ENOSYS);
            }

            ll::Operation::Lookup(x) => {
                fs.lookup(self.param(), self.ino(), x.name, self.reply());
            }
            ll::Operation::Forget(x) => {
                fs.forget(self.param(), self.ino(), x.arg.nlookup);
            }
            ll::Operation::GetAttr(_) => {
                fs.getattr(self.param(), self.ino(), None, self.reply());
            }
            ll::Operation::ReadLink(_) => {
                fs.readlink(self.param(), self.ino(), self.reply());
            }
            ll::Operation::Open(x) => {
                fs.open(
                    self.param(),
                    self.ino(),
                    crate::OpenFlags(x.arg.flags),
                    self.reply(),
                );
            }
            ll::Operation::Read(x) => {
                fs.read(
                    self.param(),
                    self.ino(),
                    FileHandle(x.arg.fh),
                    x.arg.offset as u64,
                    x.arg.size,
                    crate::ReadFlags::from_bits_truncate(x.arg.read_flags),
                    x.arg.flags as u32,
                    lock_owner_if(
                        x.arg.read_flags & consts::FUSE_READ_LOCKOWNER != 0,
                        x.arg.lock_owner,
                    ),
                    self.reply(),
                );
            }
            ll::Operation::Flush(x) => {
                fs.flush(
                    self.param(),
                    self.ino(),
                    FileHandle(x.arg.fh),
                    LockOwner(x.arg.lock_owner),
                    self.reply(),
                );
            }
            ll::Operation::Release(x) => {
                fs.release(
                    self.param(),
                    self.ino(),
                    FileHandle(x.arg.fh),
                    crate::OpenFlags(x.arg.flags),
                    lock_owner_if(
                        x.arg.release_flags & consts::FUSE_RELEASE_FLOCK_UNLOCK != 0,
                        x.arg.lock_owner,
                    ),
                    x.arg.release_flags & consts::FUSE_RELEASE_FLUSH != 0,
                    self.reply(),
                );
            }
            ll::Operation::OpenDir(x) => {
                fs.opendir(
                    self.param(),
                    self.ino(),
                    crate::OpenFlags(x.arg.flags),
                    self.reply(),
                );
            }
            ll::Operation::ReadDir(x) => {
                fs.readdir(
                    self.param(),
                    self.ino(),
                    FileHandle(x.arg.fh),
                    x.arg.offset as u64,
                    ReplyDirectory::new(self.unique(), self.ch.clone(), x.arg.size as usize),
                );
            }
            ll::Operation::ReleaseDir(x) => {
                fs.releasedir(
                    self.param(),
                    self.ino(),
                    FileHandle(x.arg.fh),
                    crate::OpenFlags(x.arg.flags),
                    self.reply(),
                );
            }
            ll::Operation::FSyncDir(_) | ll::Operation::FSync(_) => {
                let reply: ReplyEmpty = self.reply();
                reply.ok();
            }
            ll::Operation::StatFs(_) => {
                fs.statfs(self.param(), self.ino(), self.reply());
            }
            ll::Operation::GetXAttr(x) => {
                fs.getxattr(self.param(), self.ino(), x.name, x.arg.size, self.reply());
            }
            ll::Operation::ListXAttr(x) => {
                fs.listxattr(self.param(), self.ino(), x.arg.size, self.reply());
            }
            ll::Operation::Access(x) => {
                fs.access(
                    self.param(),
                    self.ino(),
                    crate::AccessFlags::from_bits_truncate(x.arg.mask),
                    self.reply(),
                );
            }

            // Read-only filesystem: every mutating opcode is rejected up front, without
            // ever reaching the Filesystem implementation.
            ll::Operation::SetAttr(_)
            | ll::Operation::SymLink(_)
            | ll::Operation::MkNod(_)
            | ll::Operation::MkDir(_)
            | ll::Operation::Unlink(_)
            | ll::Operation::RmDir(_)
            | ll::Operation::Rename(_)
            | ll::Operation::Link(_)
            | ll::Operation::Write(_)
            | ll::Operation::SetXAttr(_)
            | ll::Operation::RemoveXAttr(_)
            | ll::Operation::Create(_) => {
                let reply: ReplyEmpty = self.reply();
                reply.error(Errno::EROFS);
            }

            // Locking and block mapping are not meaningful for a relay filesystem with
            // no local write path; report them as unsupported rather than faking state.
            ll::Operation::GetLk(_)
            | ll::Operation::SetLk(_)
            | ll::Operation::SetLkW(_)
            | ll::Operation::BMap(_) => {
                let reply: ReplyEmpty = self.reply();
                reply.error(Errno::ENOSYS);
            }
        }
    }

    fn ino(&self) -> INodeNo {
        INodeNo(self.request.nodeid())
    }

    fn unique(&self) -> u64 {
        self.request.unique()
    }

    fn param(&self) -> &RequestParam {
        RequestParam::ref_cast(self.request.header())
    }

    fn reply<T: Reply>(&self) -> T {
        T::new(self.unique(), self.ch.clone())
    }

    fn send_raw(&self, response: Response<'_>) {
        if let Err(err) =
            response.with_iovec(ll::RequestId(self.unique()), |iov| self.ch.send(iov))
        {
            warn!("Failed to send FUSE reply: {err}");
        }
    }

    fn send_raw_error(&self, err: Errno) {
        self.send_raw(Response::new_error(err));
    }
}

fn lock_owner_if(present: bool, lock_owner: u64) -> Option<LockOwner> {
    present.then_some(LockOwner(lock_owner))
}
