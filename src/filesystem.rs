//! `RelayFs`, the VFS frontend: translates FUSE callbacks into `ctldev` broker
//! round trips and keeps the node cache current.

use std::ffi::OsStr;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;
use zerocopy::Ref;

use crate::ctldev::ControlState;
use crate::ctldev::error::RelayError;
use crate::nodes::{Node, NodeKind, NodeTable, join_path};
use crate::notify::Notifier;
use crate::protocol::{GetattrData, MountOptions, REPLY_MOREDATA, RequestRecord};
use crate::{
    AccessFlags, Errno, FileAttr, FileHandle, INodeNo, KernelConfig, LockOwner, ReadFlags,
    ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyStatfs, Request,
};

/// Kernel attribute-cache TTL. Zero, since every `getattr` already does a live round
/// trip to the daemon — there is nothing for the kernel to usefully cache on top of it.
const ATTR_TTL: Duration = Duration::from_secs(0);

/// A handle for supplying `RelayFs`'s session [`Notifier`] once it exists.
///
/// `Session::new`/`MtSession::new` consume the filesystem by value and only hand back
/// a `Notifier` afterwards, so `RelayFs::new` returns this alongside the filesystem;
/// fill it in between constructing the session and running it.
#[derive(Debug, Clone)]
pub struct NotifierSlot(Arc<OnceLock<Notifier>>);

impl NotifierSlot {
    /// Supplies the session's notifier. A no-op if one has already been set.
    pub fn set(&self, notifier: Notifier) {
        let _ = self.0.set(notifier);
    }
}

/// A read-only FUSE filesystem backed by a single remote-relay daemon, reached
/// through one [`ControlState`] rendezvous.
pub struct RelayFs {
    options: MountOptions,
    nodes: Arc<NodeTable>,
    state: Arc<ControlState>,
    cancel: Arc<AtomicBool>,
    notifier: Arc<OnceLock<Notifier>>,
}

impl fmt::Debug for RelayFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayFs")
            .field("server", &self.options.server())
            .field("basepath", &self.options.basepath())
            .finish()
    }
}

impl RelayFs {
    /// Builds a new relay filesystem served through `state`, plus a slot for the
    /// session [`Notifier`] it will use once mounted.
    pub fn new(options: MountOptions, state: Arc<ControlState>) -> (Self, NotifierSlot) {
        let notifier = Arc::new(OnceLock::new());
        let fs = Self {
            options,
            nodes: NodeTable::new(u64::from(std::process::id())),
            state,
            cancel: Arc::new(AtomicBool::new(false)),
            notifier: notifier.clone(),
        };
        (fs, NotifierSlot(notifier))
    }

    fn file_attr(&self, node: &Node) -> FileAttr {
        node.with_attrs(|a| FileAttr {
            ino: node.id,
            size: a.size,
            blocks: a.size.div_ceil(512),
            atime: a.atime,
            mtime: a.mtime,
            ctime: a.ctime,
            crtime: a.ctime,
            kind: node.kind.to_file_type(),
            perm: a.perm,
            nlink: if node.kind.is_directory() { 2 } else { 1 },
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            rdev: 0,
            blksize: page_size::get() as u32,
            flags: 0,
        })
    }

    /// Runs `f` with the broker slot held for its whole duration, regardless of how
    /// many round trips `f` makes to the daemon.
    fn with_slot<T>(&self, f: impl FnOnce() -> Result<T, RelayError>) -> Result<T, RelayError> {
        self.state.enter(&self.cancel)?;
        let result = f();
        self.state.exit();
        result
    }

    fn remote_getattr(&self, pathname: &str) -> Result<GetattrData, RelayError> {
        self.with_slot(|| {
            let record = RequestRecord::getattr(self.options, pathname);
            self.state.start(record, &self.cancel)?;
            let bytes = self.state.copy_page(size_of::<GetattrData>());
            let (data, _) = Ref::<_, GetattrData>::from_prefix(bytes.as_slice())
                .map_err(|_| RelayError::MalformedRequest("getattr payload".to_string()))?;
            Ok(*Ref::into_ref(data))
        })
    }

    /// Applies a fresh `GetattrData` to `node`, invalidating the kernel's cached
    /// pages through the session notifier if the mtime moved. Returns whether it did.
    fn apply_getattr(&self, node: &Node, data: &GetattrData) -> bool {
        let changed = node.refresh_attrs(
            (data.mode & 0o7777) as u16,
            data.size,
            systime_from(data.atime_sec, data.atime_nsec),
            systime_from(data.mtime_sec, data.mtime_nsec),
            systime_from(data.ctime_sec, data.ctime_nsec),
        );
        if changed {
            if let Some(notifier) = self.notifier.get() {
                if let Err(err) = notifier.inval_inode(node.id, 0, 0) {
                    debug!("inval_inode failed for {:?}: {err}", node.id);
                }
            }
        }
        changed
    }

    /// Detaches a node whose backing path has vanished remotely: drops it from its
    /// parent's directory listing and frees it from the cache.
    fn forget_vanished(&self, node: &Node) {
        if let Some(parent) = self.nodes.find_parent(node) {
            if let Some(name) = node.pathname.rsplit('/').next() {
                parent.remove_entry(name);
            }
        }
        self.nodes.free(node.id);
    }

    /// Resolves `name` under `parent`: first from the directory's own entry list
    /// (already-known directories and never-placeholder `.`/`..`), then from the
    /// pathname index (previously resolved regular files), and only then by issuing
    /// a GETATTR-as-lookup against the daemon. `..` at the filesystem root resolves
    /// to the root's own id because its directory buffer was seeded that way.
    fn lookup_impl(&self, parent: &Arc<Node>, name: &str) -> Result<Arc<Node>, i32> {
        if let Some(id) = parent.find_by_name(name) {
            if id.0 != 0 {
                if let Some(node) = self.nodes.find_by_nodeid(id) {
                    node.bump_lookup();
                    return Ok(node);
                }
            }
        }

        let child_path = join_path(&parent.pathname, name);
        if let Some(node) = self.nodes.find_by_pathname(&child_path) {
            node.bump_lookup();
            return Ok(node);
        }

        let data = self.remote_getattr(&child_path).map_err(|e| e.to_errno())?;
        let kind = NodeKind::from_wire(data.kind).unwrap_or(NodeKind::RegularFile);
        let node = if kind.is_directory() {
            self.nodes.make_directory_with_name(parent, name)
        } else {
            let node = self.nodes.alloc(kind, child_path);
            parent.add_entry(name, kind, node.id);
            node
        };
        self.apply_getattr(&node, &data);
        Ok(node)
    }

    /// Brings a directory's attributes and, if stale or empty, its entry list up to
    /// date with the daemon.
    fn refresh_directory(&self, node: &Arc<Node>) -> Result<(), i32> {
        let data = self.remote_getattr(&node.pathname).map_err(|e| e.to_errno())?;
        let changed = self.apply_getattr(node, &data);
        if changed || node.dir_is_empty() {
            self.refill_directory(node).map_err(|e| e.to_errno())?;
        }
        Ok(())
    }

    /// Rescans a directory's contents from the daemon, following MOREDATA
    /// continuations until the reply is 0. New names are added as unresolved
    /// placeholders (node-id 0); `lookup` resolves their real kind and id on demand.
    fn refill_directory(&self, node: &Arc<Node>) -> Result<(), RelayError> {
        node.clear_remote_entries();
        let page = page_size::get() as u64;
        self.with_slot(|| {
            let mut offset = 0u64;
            loop {
                let record = RequestRecord::readdir(self.options, &node.pathname, offset, page);
                let code = self.state.start(record, &self.cancel)?;
                let data = self.state.copy_page(page as usize);
                let consumed = parse_readdir_page(&data, |name| {
                    if !node.entry_exists(name) {
                        node.add_entry(name, NodeKind::RegularFile, INodeNo(0));
                    }
                });
                offset += consumed as u64;
                if code != REPLY_MOREDATA || consumed == 0 {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Reads `len` bytes at `offset`, one page-sized daemon round trip at a time,
    /// using and filling the node's per-node page cache. The broker slot is held for
    /// the whole multi-page loop so no other request can overwrite the shared page
    /// mid-read.
    fn getapage(&self, node: &Arc<Node>, offset: u64, len: u32) -> Result<Vec<u8>, RelayError> {
        let page = page_size::get() as u64;
        let mut out = vec![0u8; len as usize];
        let start_page = offset - offset % page;
        let end = offset + u64::from(len);

        self.with_slot(|| {
            let mut page_offset = start_page;
            while page_offset < end {
                let bytes = match node.cached_page(page_offset) {
                    Some(cached) => cached,
                    None => {
                        let record =
                            RequestRecord::read(self.options, &node.pathname, page_offset, page);
                        self.state.start(record, &self.cancel)?;
                        let data = self.state.copy_page(page as usize).into_boxed_slice();
                        node.cache_page(page_offset, data.clone());
                        data
                    }
                };
                copy_overlap(&bytes, page_offset, &mut out, offset, len);
                page_offset += page;
            }
            Ok(())
        })?;
        Ok(out)
    }
}

/// Copies the portion of a page-sized buffer at `page_offset` that overlaps the
/// range `[offset, offset + len)` into the matching slice of `out`.
fn copy_overlap(page: &[u8], page_offset: u64, out: &mut [u8], offset: u64, len: u32) {
    let page_end = page_offset + page.len() as u64;
    let want_start = offset.max(page_offset);
    let want_end = (offset + u64::from(len)).min(page_end);
    if want_start >= want_end {
        return;
    }
    let src = (want_start - page_offset) as usize..(want_end - page_offset) as usize;
    let dst = (want_start - offset) as usize..(want_end - offset) as usize;
    out[dst].copy_from_slice(&page[src]);
}

/// Parses a READDIR shared-page buffer (NUL-terminated names, each followed by one
/// extra NUL), invoking `on_name` for every complete entry found. Returns the number
/// of bytes consumed, stopping short of a truncated trailing entry.
fn parse_readdir_page(data: &[u8], mut on_name: impl FnMut(&str)) -> usize {
    let mut consumed = 0usize;
    let mut i = 0usize;
    while i < data.len() {
        let Some(rel) = memchr::memchr(0, &data[i..]) else {
            break;
        };
        let name_end = i + rel;
        if name_end == i {
            break;
        }
        if name_end + 1 >= data.len() || data[name_end + 1] != 0 {
            break;
        }
        if let Ok(name) = std::str::from_utf8(&data[i..name_end]) {
            on_name(name);
        }
        consumed += (name_end - i) + 2;
        i = name_end + 2;
    }
    consumed
}

fn systime_from(secs: i64, nsec: u32) -> SystemTime {
    UNIX_EPOCH
        .checked_add(Duration::new(secs.max(0) as u64, nsec))
        .unwrap_or(UNIX_EPOCH)
}

impl crate::Filesystem for RelayFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), Errno> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.nodes.free_all();
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_node) = self.nodes.find_by_nodeid(parent) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(Errno::EINVAL);
            return;
        };
        match self.lookup_impl(&parent_node, name) {
            Ok(node) => {
                let attr = self.file_attr(&node);
                // Node-ids are never reused (see `NodeTable::alloc`), so a nodeid's
                // generation must stay constant for its whole lifetime; `version`
                // changes on every `getattr` and isn't eligible here.
                reply.entry(&ATTR_TTL, &attr, self.nodes.generation);
            }
            Err(errno) => reply.error(Errno::from_i32(errno)),
        }
    }

    fn forget(&self, _req: &Request, ino: INodeNo, nlookup: u64) {
        if let Some(node) = self.nodes.find_by_nodeid(ino) {
            if node.forget(nlookup) {
                self.nodes.free(ino);
            }
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let Some(node) = self.nodes.find_by_nodeid(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        match self.remote_getattr(&node.pathname) {
            Ok(data) => {
                self.apply_getattr(&node, &data);
                reply.attr(&ATTR_TTL, &self.file_attr(&node));
            }
            Err(err) => {
                let errno = err.to_errno();
                if errno == libc::ENOENT {
                    self.forget_vanished(&node);
                }
                reply.error(Errno::from_i32(errno));
            }
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        size: u32,
        _read_flags: ReadFlags,
        _flags: u32,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let Some(node) = self.nodes.find_by_nodeid(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        match self.getapage(&node, offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(Errno::from_i32(err.to_errno())),
        }
    }

    fn flush(&self, _req: &Request, _ino: INodeNo, _fh: FileHandle, _lock_owner: LockOwner, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(&self, _req: &Request, ino: INodeNo, _fh: FileHandle, offset: u64, mut reply: ReplyDirectory) {
        let Some(node) = self.nodes.find_by_nodeid(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        if let Err(errno) = self.refresh_directory(&node) {
            reply.error(Errno::from_i32(errno));
            return;
        }
        node.touch_atime();
        for (i, entry) in node.dir_entries().into_iter().enumerate().skip(offset as usize) {
            let full = reply.add(entry.id.0, (i + 1) as i64, entry.kind.to_file_type(), &entry.name);
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        let page = page_size::get() as u32;
        reply.statfs(0, 0, 0, self.nodes.node_count() as u64, 0, page, 255, page);
    }

    fn access(&self, _req: &Request, _ino: INodeNo, _mask: AccessFlags, reply: ReplyEmpty) {
        reply.ok();
    }
}

// `getxattr`, `listxattr`, `readlink`, `open`, `opendir`, `release`, and `releasedir`
// keep the trait's defaults: this protocol has no xattr or symlink-target request
// kind, and open/close are pure local bookkeeping with no remote interaction.

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    use zerocopy::IntoBytes;

    use crate::protocol::REPLY_OK;

    #[test]
    fn copy_overlap_clips_to_requested_range() {
        let page = [1u8; 4096];
        let mut out = vec![0u8; 10];
        copy_overlap(&page, 4096, &mut out, 4100, 10);
        assert_eq!(out, vec![1u8; 10]);
    }

    #[test]
    fn copy_overlap_ignores_non_overlapping_page() {
        let page = [1u8; 4096];
        let mut out = vec![0u8; 10];
        copy_overlap(&page, 8192, &mut out, 0, 10);
        assert_eq!(out, vec![0u8; 10]);
    }

    #[test]
    fn parse_readdir_page_splits_double_nul_entries() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"one\0\0two\0\0");
        buf.resize(4096, 0);
        let mut names = Vec::new();
        let consumed = parse_readdir_page(&buf, |n| names.push(n.to_string()));
        assert_eq!(names, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(consumed, 10);
    }

    #[test]
    fn parse_readdir_page_stops_at_empty_name() {
        let buf = vec![0u8; 4096];
        let mut names: Vec<String> = Vec::new();
        let consumed = parse_readdir_page(&buf, |n| names.push(n.to_string()));
        assert!(names.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn lookup_then_read_round_trip_against_fake_daemon() {
        let state = Arc::new(ControlState::new());
        state.open().unwrap();
        let options = MountOptions::new("ftp", "ftp", "ftp.example.com", "/");
        let (fs, _slot) = RelayFs::new(options, state.clone());

        let daemon = thread::spawn(move || {
            let req = state.read_request();
            assert_eq!(req.pathname(), "/greeting");
            let data = GetattrData::new(NodeKind::RegularFile.to_wire(), 0o644, 5, 0, 0, 0, 0, 0, 0);
            state.write_reply(REPLY_OK, data.as_bytes());

            let req = state.read_request();
            assert_eq!(req.pathname(), "/greeting");
            let mut payload = vec![0u8; page_size::get()];
            payload[..5].copy_from_slice(b"hello");
            state.write_reply(REPLY_OK, &payload);
        });

        let root = fs.nodes.find_by_nodeid(fs.nodes.root_id()).unwrap();
        let node = fs.lookup_impl(&root, "greeting").unwrap();
        assert_eq!(node.kind, NodeKind::RegularFile);

        let data = fs.getapage(&node, 0, 5).unwrap();
        assert_eq!(&data, b"hello");

        daemon.join().unwrap();
    }
}
