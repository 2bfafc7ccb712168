//! Filesystem operation reply types.
//!
//! Each FUSE operation gets a single-use reply object. The matching `send`-style
//! method consumes it; dropping it unused sends `EIO` so a filesystem bug never
//! leaves the kernel waiting on a request forever.

use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use log::warn;

use crate::channel::ChannelSender;
use crate::ll::fuse_abi::FopenFlags;
use crate::ll::reply::{Attr, DirEntList, DirEntOffset, DirEntry, Response};
use crate::ll::{Errno, FileHandle, Generation, INodeNo, RequestId};
use crate::{FileAttr, FileType};

/// Base send/drop behavior shared by every reply type.
struct ReplySender {
    unique: RequestId,
    sender: Option<ChannelSender>,
}

impl fmt::Debug for ReplySender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySender")
            .field("unique", &self.unique)
            .finish()
    }
}

impl ReplySender {
    fn new(unique: u64, sender: ChannelSender) -> Self {
        ReplySender {
            unique: RequestId(unique),
            sender: Some(sender),
        }
    }

    fn send(&mut self, response: Response<'_>) {
        let sender = self.sender.take().expect("reply already sent");
        if let Err(err) = response.with_iovec(self.unique, |iov| sender.send(iov)) {
            warn!("Failed to send FUSE reply: {}", err);
        }
    }
}

impl Drop for ReplySender {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            warn!(
                "Reply to request {} was dropped without a reply; replying EIO",
                self.unique.0
            );
            let _ = Response::new_error(Errno::EIO).with_iovec(self.unique, |iov| sender.send(iov));
        }
    }
}

/// Constructs a reply type from a request's unique id and reply channel.
pub(crate) trait Reply {
    fn new(unique: u64, sender: ChannelSender) -> Self;
}

macro_rules! impl_reply_new {
    ($t:ident) => {
        impl Reply for $t {
            fn new(unique: u64, sender: ChannelSender) -> Self {
                $t(ReplySender::new(unique, sender))
            }
        }
    };
}

/// Generic reply carrying no data besides success/failure.
#[derive(Debug)]
pub(crate) struct ReplyEmpty(ReplySender);
impl_reply_new!(ReplyEmpty);

impl ReplyEmpty {
    pub(crate) fn ok(mut self) {
        self.0.send(Response::new_empty());
    }
    pub(crate) fn error(mut self, err: Errno) {
        self.0.send(Response::new_error(err));
    }
}

/// Generic reply carrying a raw byte payload (read, readlink, getxattr data, ...).
#[derive(Debug)]
pub(crate) struct ReplyData(ReplySender);
impl_reply_new!(ReplyData);

impl ReplyData {
    pub(crate) fn data(mut self, data: &[u8]) {
        self.0.send(Response::new_slice(data));
    }
    pub(crate) fn error(mut self, err: Errno) {
        self.0.send(Response::new_error(err));
    }
}

/// Reply to a `lookup`, `mknod`, `mkdir`, `symlink` or `link` request.
#[derive(Debug)]
pub(crate) struct ReplyEntry(ReplySender);
impl_reply_new!(ReplyEntry);

impl ReplyEntry {
    pub(crate) fn entry(mut self, ttl: &Duration, attr: &FileAttr, generation: u64) {
        self.0.send(Response::new_entry(
            attr.ino,
            Generation(generation),
            &Attr::from(attr),
            *ttl,
            *ttl,
        ));
    }
    pub(crate) fn error(mut self, err: Errno) {
        self.0.send(Response::new_error(err));
    }
}

/// Reply to a `getattr` or `setattr` request.
#[derive(Debug)]
pub(crate) struct ReplyAttr(ReplySender);
impl_reply_new!(ReplyAttr);

impl ReplyAttr {
    pub(crate) fn attr(mut self, ttl: &Duration, attr: &FileAttr) {
        self.0.send(Response::new_attr(ttl, &Attr::from(attr)));
    }
    pub(crate) fn error(mut self, err: Errno) {
        self.0.send(Response::new_error(err));
    }
}

/// Reply to an `open` or `opendir` request.
#[derive(Debug)]
pub(crate) struct ReplyOpen(ReplySender);
impl_reply_new!(ReplyOpen);

impl ReplyOpen {
    pub(crate) fn opened(mut self, fh: u64, flags: u32) {
        self.0.send(Response::new_open(
            FileHandle(fh),
            FopenFlags::from_bits_truncate(flags),
            0,
        ));
    }
    pub(crate) fn error(mut self, err: Errno) {
        self.0.send(Response::new_error(err));
    }
}

/// Reply to a `statfs` request.
#[derive(Debug)]
pub(crate) struct ReplyStatfs(ReplySender);
impl_reply_new!(ReplyStatfs);

impl ReplyStatfs {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn statfs(
        mut self,
        blocks: u64,
        bfree: u64,
        bavail: u64,
        files: u64,
        ffree: u64,
        bsize: u32,
        namelen: u32,
        frsize: u32,
    ) {
        self.0.send(Response::new_statfs(
            blocks, bfree, bavail, files, ffree, bsize, namelen, frsize,
        ));
    }
    pub(crate) fn error(mut self, err: Errno) {
        self.0.send(Response::new_error(err));
    }
}

/// Reply to a `getxattr` or `listxattr` request.
#[derive(Debug)]
pub(crate) struct ReplyXattr(ReplySender);
impl_reply_new!(ReplyXattr);

impl ReplyXattr {
    /// Respond with the exact attribute data.
    pub(crate) fn data(mut self, data: &[u8]) {
        self.0.send(Response::new_slice(data));
    }
    /// Respond with only the buffer size the caller would need.
    pub(crate) fn size(mut self, size: u32) {
        self.0.send(Response::new_xattr_size(size));
    }
    pub(crate) fn error(mut self, err: Errno) {
        self.0.send(Response::new_error(err));
    }
}

/// Reply to a `readdir` request; entries are accumulated with `add` until full or
/// the directory is exhausted, then finished with `ok`.
#[derive(Debug)]
pub(crate) struct ReplyDirectory {
    reply: ReplySender,
    buf: DirEntList,
}

impl ReplyDirectory {
    pub(crate) fn new(unique: u64, sender: ChannelSender, size: usize) -> Self {
        ReplyDirectory {
            reply: ReplySender::new(unique, sender),
            buf: DirEntList::new(size),
        }
    }

    /// Adds an entry to the reply. Returns true if the buffer is full and the
    /// entry was *not* added; the caller should stop and finish with `ok`.
    #[must_use]
    pub(crate) fn add<T: AsRef<OsStr>>(
        &mut self,
        ino: u64,
        offset: i64,
        kind: FileType,
        name: T,
    ) -> bool {
        let name: &Path = Path::new(name.as_ref());
        self.buf.push(&DirEntry::new(
            INodeNo(ino),
            DirEntOffset(offset as u64),
            kind,
            name,
        ))
    }

    pub(crate) fn ok(mut self) {
        let buf = std::mem::replace(&mut self.buf, DirEntList::new(0));
        self.reply.send(Response::from(buf));
    }

    pub(crate) fn error(mut self, err: Errno) {
        self.reply.send(Response::new_error(err));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;
    use std::os::unix::net::UnixStream;

    fn test_sender() -> ChannelSender {
        let (a, _b) = UnixStream::pair().expect("socketpair");
        crate::channel::Channel::new(std::sync::Arc::new(File::from(a))).sender()
    }

    #[test]
    fn empty_reply_sends_ok() {
        let reply = ReplyEmpty::new(42, test_sender());
        reply.ok();
    }

    #[test]
    fn dropped_reply_does_not_panic() {
        let reply = ReplyEmpty::new(7, test_sender());
        drop(reply);
    }

    #[test]
    fn directory_add_reports_full_buffer() {
        let mut reply = ReplyDirectory::new(1, test_sender(), 0);
        let full = reply.add(1, 1, FileType::Directory, ".");
        assert!(full);
        reply.ok();
    }
}
