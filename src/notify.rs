//! Unsolicited kernel notifications sent outside the normal request/reply cycle.
//!
//! A reply always carries the `unique` value of the request it answers; a notification
//! carries `unique == 0` and the notify code where a reply would carry its error.

use std::io;
use std::io::IoSlice;

use zerocopy::IntoBytes;

use crate::channel::ChannelSender;
use crate::ll::fuse_abi::{fuse_notify_code, fuse_notify_inval_inode_out, fuse_out_header};
use crate::ll::INodeNo;

/// A handle for sending a mounted filesystem unsolicited cache-invalidation
/// notifications. Obtained from a running [`Session`](crate::Session) or
/// [`MtSession`](crate::MtSession).
#[derive(Debug, Clone)]
pub struct Notifier(ChannelSender);

impl Notifier {
    pub(crate) fn new(ch: ChannelSender) -> Self {
        Self(ch)
    }

    /// Invalidates cached data for `ino` in the kernel's page cache. `offset` and `len`
    /// bound the invalidated range; `len` of `0` invalidates to the end of the file.
    /// # Errors
    /// Returns an error if the notification couldn't be written to the fuse device.
    pub fn inval_inode(&self, ino: INodeNo, offset: i64, len: i64) -> io::Result<()> {
        let payload = fuse_notify_inval_inode_out {
            ino: ino.0,
            off: offset,
            len,
        };
        let header = fuse_out_header {
            len: (size_of::<fuse_out_header>() + size_of::<fuse_notify_inval_inode_out>()) as u32,
            error: -(fuse_notify_code::FUSE_NOTIFY_INVAL_INODE as i32),
            unique: 0,
        };
        self.0.send(&[
            IoSlice::new(header.as_bytes()),
            IoSlice::new(payload.as_bytes()),
        ])
    }
}
