//! The in-process node cache: every live node for one mounted filesystem instance,
//! indexed by node-id and by pathname, plus each directory's entry list.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::{FileType, INodeNo};

/// The FUSE root inode number, used as this cache's root node-id.
pub(crate) const ROOT_ID: u64 = 1;

/// Page size used for the per-node page-cache stand-in (see `getapage`).
fn page_size() -> usize {
    page_size::get()
}

/// Number of cached pages kept per node before the oldest is evicted.
const PAGE_CACHE_CAPACITY: usize = 16;

/// The kind of filesystem object a node represents. A superset of `fuser::FileType`:
/// Solaris door/port nodes have no FUSE analogue, so they're mapped to `FileType::Socket`
/// at the VFS boundary (see `to_file_type`) while their real kind is preserved here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
    Door,
    Port,
}

impl NodeKind {
    pub(crate) fn to_file_type(self) -> FileType {
        match self {
            NodeKind::RegularFile => FileType::RegularFile,
            NodeKind::Directory => FileType::Directory,
            NodeKind::Symlink => FileType::Symlink,
            NodeKind::BlockDevice => FileType::BlockDevice,
            NodeKind::CharDevice => FileType::CharDevice,
            NodeKind::Fifo => FileType::NamedPipe,
            NodeKind::Socket | NodeKind::Door | NodeKind::Port => FileType::Socket,
        }
    }

    pub(crate) fn is_directory(self) -> bool {
        matches!(self, NodeKind::Directory)
    }

    /// Decodes the `kind` field of a `GetattrData` payload.
    pub(crate) fn from_wire(code: u32) -> Option<Self> {
        match code {
            0 => Some(NodeKind::RegularFile),
            1 => Some(NodeKind::Directory),
            2 => Some(NodeKind::Symlink),
            3 => Some(NodeKind::BlockDevice),
            4 => Some(NodeKind::CharDevice),
            5 => Some(NodeKind::Fifo),
            6 => Some(NodeKind::Socket),
            7 => Some(NodeKind::Door),
            8 => Some(NodeKind::Port),
            _ => None,
        }
    }

    /// Encodes this kind into the `kind` field of a `GetattrData` payload.
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            NodeKind::RegularFile => 0,
            NodeKind::Directory => 1,
            NodeKind::Symlink => 2,
            NodeKind::BlockDevice => 3,
            NodeKind::CharDevice => 4,
            NodeKind::Fifo => 5,
            NodeKind::Socket => 6,
            NodeKind::Door => 7,
            NodeKind::Port => 8,
        }
    }
}

/// One record in a directory's entry list.
#[derive(Debug, Clone)]
pub(crate) struct DirEntry {
    pub(crate) name: String,
    pub(crate) id: INodeNo,
    pub(crate) kind: NodeKind,
}

/// A directory's in-memory entry list. `.` and `..` are always entries 0 and 1.
#[derive(Debug, Default)]
pub(crate) struct DirBuffer {
    entries: Vec<DirEntry>,
}

impl DirBuffer {
    fn new(self_id: INodeNo, parent_id: INodeNo) -> Self {
        Self {
            entries: vec![
                DirEntry {
                    name: ".".to_string(),
                    id: self_id,
                    kind: NodeKind::Directory,
                },
                DirEntry {
                    name: "..".to_string(),
                    id: parent_id,
                    kind: NodeKind::Directory,
                },
            ],
        }
    }

    /// Adds a fresh entry, or updates an existing one's id/kind in place. The update
    /// path is what lets a placeholder entry (id 0, assumed `RegularFile`, added by a
    /// READDIR rescan) get upgraded to its real kind and id once `lookup` resolves it.
    pub(crate) fn add_entry(&mut self, name: &str, kind: NodeKind, id: INodeNo) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.id = id;
            entry.kind = kind;
            return;
        }
        self.entries.push(DirEntry {
            name: name.to_string(),
            id,
            kind,
        });
    }

    pub(crate) fn remove_entry(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        self.entries.len() != before
    }

    pub(crate) fn find_by_name(&self, name: &str) -> Option<INodeNo> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.id)
    }

    pub(crate) fn entry_exists(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// True if only `.` and `..` are present.
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.len() <= 2
    }

    pub(crate) fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    fn clear_remote_entries(&mut self) {
        self.entries.retain(|e| e.name == "." || e.name == "..");
    }
}

/// Small bounded cache of page-sized buffers, standing in for the host page cache that
/// a kernel-resident filesystem would rely on; see `getapage`.
#[derive(Debug, Default)]
struct PageCache {
    pages: VecDeque<(u64, Box<[u8]>)>,
}

impl PageCache {
    fn get(&self, page_offset: u64) -> Option<&[u8]> {
        self.pages
            .iter()
            .find(|(off, _)| *off == page_offset)
            .map(|(_, buf)| buf.as_ref())
    }

    fn insert(&mut self, page_offset: u64, data: Box<[u8]>) {
        self.pages.retain(|(off, _)| *off != page_offset);
        if self.pages.len() >= PAGE_CACHE_CAPACITY {
            self.pages.pop_front();
        }
        self.pages.push_back((page_offset, data));
    }

    fn invalidate(&mut self) {
        self.pages.clear();
    }
}

/// Attributes and cached state guarded by a node's per-node lock.
#[derive(Debug)]
pub(crate) struct NodeAttrs {
    pub(crate) perm: u16,
    pub(crate) size: u64,
    pub(crate) atime: SystemTime,
    pub(crate) mtime: SystemTime,
    pub(crate) ctime: SystemTime,
    pub(crate) initialized: bool,
    dir: Option<DirBuffer>,
    pages: PageCache,
}

/// One cached filesystem node: a file or directory under the mount.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) id: INodeNo,
    pub(crate) pathname: String,
    pub(crate) kind: NodeKind,
    lookup_count: AtomicU64,
    inner: Mutex<NodeAttrs>,
}

impl Node {
    fn new(id: INodeNo, pathname: String, kind: NodeKind) -> Self {
        let dir = kind
            .is_directory()
            .then(|| DirBuffer::new(id, id));
        Self {
            id,
            pathname,
            kind,
            lookup_count: AtomicU64::new(1),
            inner: Mutex::new(NodeAttrs {
                perm: if kind.is_directory() { 0o755 } else { 0o644 },
                size: 0,
                atime: SystemTime::now(),
                mtime: SystemTime::now(),
                ctime: SystemTime::now(),
                initialized: false,
                dir,
                pages: PageCache::default(),
            }),
        }
    }

    pub(crate) fn with_attrs<T>(&self, f: impl FnOnce(&NodeAttrs) -> T) -> T {
        f(&self.inner.lock())
    }

    pub(crate) fn with_attrs_mut<T>(&self, f: impl FnOnce(&mut NodeAttrs) -> T) -> T {
        f(&mut self.inner.lock())
    }

    /// Applies a GETATTR reply: updates cached attributes and reports whether the
    /// mtime changed (the caller invalidates pages on `true`).
    pub(crate) fn refresh_attrs(
        &self,
        perm: u16,
        size: u64,
        atime: SystemTime,
        mtime: SystemTime,
        ctime: SystemTime,
    ) -> bool {
        let mut inner = self.inner.lock();
        let changed = inner.initialized && inner.mtime != mtime;
        inner.perm = perm;
        inner.size = size;
        inner.atime = atime;
        inner.mtime = mtime;
        inner.ctime = ctime;
        inner.initialized = true;
        if changed {
            inner.pages.invalidate();
        }
        changed
    }

    pub(crate) fn touch_atime(&self) {
        self.inner.lock().atime = SystemTime::now();
    }

    pub(crate) fn cached_page(&self, page_offset: u64) -> Option<Box<[u8]>> {
        self.inner
            .lock()
            .pages
            .get(page_offset)
            .map(|b| b.to_vec().into_boxed_slice())
    }

    pub(crate) fn cache_page(&self, page_offset: u64, data: Box<[u8]>) {
        self.inner.lock().pages.insert(page_offset, data);
    }

    pub(crate) fn add_entry(&self, name: &str, kind: NodeKind, id: INodeNo) {
        if let Some(dir) = self.inner.lock().dir.as_mut() {
            dir.add_entry(name, kind, id);
        }
    }

    pub(crate) fn remove_entry(&self, name: &str) -> bool {
        self.inner
            .lock()
            .dir
            .as_mut()
            .is_some_and(|dir| dir.remove_entry(name))
    }

    pub(crate) fn find_by_name(&self, name: &str) -> Option<INodeNo> {
        self.inner.lock().dir.as_ref().and_then(|dir| dir.find_by_name(name))
    }

    pub(crate) fn entry_exists(&self, name: &str) -> bool {
        self.inner
            .lock()
            .dir
            .as_ref()
            .is_some_and(|dir| dir.entry_exists(name))
    }

    pub(crate) fn dir_is_empty(&self) -> bool {
        self.inner.lock().dir.as_ref().is_none_or(DirBuffer::is_empty)
    }

    pub(crate) fn dir_entries(&self) -> Vec<DirEntry> {
        self.inner
            .lock()
            .dir
            .as_ref()
            .map(|dir| dir.entries().to_vec())
            .unwrap_or_default()
    }

    pub(crate) fn clear_remote_entries(&self) {
        if let Some(dir) = self.inner.lock().dir.as_mut() {
            dir.clear_remote_entries();
        }
    }

    pub(crate) fn lookup_count(&self) -> u64 {
        self.lookup_count.load(Ordering::Acquire)
    }

    pub(crate) fn bump_lookup(&self) {
        self.lookup_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the lookup count by `n`, returning `true` if it reached zero.
    pub(crate) fn forget(&self, n: u64) -> bool {
        let mut cur = self.lookup_count.load(Ordering::Acquire);
        loop {
            let next = cur.saturating_sub(n);
            match self.lookup_count.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next == 0,
                Err(observed) => cur = observed,
            }
        }
    }
}

struct Inner {
    by_id: HashMap<u64, Arc<Node>>,
    by_path: HashMap<String, u64>,
    next_id: u64,
}

/// Owns every live node for one mounted filesystem instance.
pub(crate) struct NodeTable {
    inner: Mutex<Inner>,
    /// Generation counter distinguishing concurrent instances; surfaced in `statfs`.
    pub(crate) generation: u64,
}

impl NodeTable {
    pub(crate) fn new(generation: u64) -> Arc<Self> {
        let table = Arc::new(Self {
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                by_path: HashMap::new(),
                next_id: ROOT_ID,
            }),
            generation,
        });
        let root = table.alloc_locked(NodeKind::Directory, "/".to_string());
        debug_assert_eq!(root.id.0, ROOT_ID);
        table
    }

    pub(crate) fn root_id(&self) -> INodeNo {
        INodeNo(ROOT_ID)
    }

    fn alloc_locked(self: &Arc<Self>, kind: NodeKind, pathname: String) -> Arc<Node> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let node = Arc::new(Node::new(INodeNo(id), pathname.clone(), kind));
        inner.by_id.insert(id, node.clone());
        inner.by_path.insert(pathname, id);
        node
    }

    /// Allocates and publishes a new node of the given kind at `pathname`.
    pub(crate) fn alloc(self: &Arc<Self>, kind: NodeKind, pathname: String) -> Arc<Node> {
        self.alloc_locked(kind, pathname)
    }

    /// Allocates a directory node under `parent` named `name`, wires up `.`/`..`, and
    /// registers the entry in the parent's directory buffer.
    pub(crate) fn make_directory_with_name(
        self: &Arc<Self>,
        parent: &Node,
        name: &str,
    ) -> Arc<Node> {
        let pathname = join_path(&parent.pathname, name);
        let dir = self.alloc(NodeKind::Directory, pathname);
        {
            let mut inner = dir.inner.lock();
            inner.dir = Some(DirBuffer::new(dir.id, parent.id));
        }
        parent.add_entry(name, NodeKind::Directory, dir.id);
        dir
    }

    pub(crate) fn find_by_nodeid(&self, id: INodeNo) -> Option<Arc<Node>> {
        self.inner.lock().by_id.get(&id.0).cloned()
    }

    pub(crate) fn find_by_pathname(&self, path: &str) -> Option<Arc<Node>> {
        let inner = self.inner.lock();
        let id = *inner.by_path.get(path)?;
        inner.by_id.get(&id).cloned()
    }

    /// Looks up the parent of `node` by stripping its last pathname component. At the
    /// filesystem root, resolves to the root's own node-id (there is no vnode above it).
    pub(crate) fn find_parent(&self, node: &Node) -> Option<Arc<Node>> {
        if node.id.0 == ROOT_ID {
            return self.find_by_nodeid(node.id);
        }
        let parent_path = parent_of(&node.pathname);
        self.find_by_pathname(&parent_path)
    }

    pub(crate) fn free(&self, id: INodeNo) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.by_id.remove(&id.0) {
            inner.by_path.remove(&node.pathname);
        }
    }

    pub(crate) fn free_all(&self) {
        let mut inner = self.inner.lock();
        inner.by_id.clear();
        inner.by_path.clear();
    }

    pub(crate) fn node_count(&self) -> usize {
        self.inner.lock().by_id.len()
    }
}

/// Joins a parent pathname and a child name into a child pathname.
pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => "/".to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn root_is_its_own_parent_and_dot_dot() {
        let table = NodeTable::new(0);
        let root = table.find_by_nodeid(table.root_id()).unwrap();
        assert_eq!(root.find_by_name("..").unwrap(), root.id);
        let parent = table.find_parent(&root).unwrap();
        assert_eq!(parent.id, root.id);
    }

    #[test]
    fn make_directory_registers_entry_in_parent() {
        let table = NodeTable::new(0);
        let root = table.find_by_nodeid(table.root_id()).unwrap();
        let child = table.make_directory_with_name(&root, "pub");
        assert_eq!(root.find_by_name("pub"), Some(child.id));
        assert_eq!(child.find_by_name(".."), Some(root.id));
        assert!(child.dir_is_empty());
    }

    #[test]
    fn add_entry_is_idempotent() {
        let table = NodeTable::new(0);
        let root = table.find_by_nodeid(table.root_id()).unwrap();
        root.add_entry("a", NodeKind::RegularFile, INodeNo(0));
        root.add_entry("a", NodeKind::RegularFile, INodeNo(0));
        let names: Vec<_> = root.dir_entries().into_iter().map(|e| e.name).collect();
        assert_eq!(names.iter().filter(|n| *n == "a").count(), 1);
    }

    #[test]
    fn dot_and_dotdot_are_always_first_two_entries() {
        let table = NodeTable::new(0);
        let root = table.find_by_nodeid(table.root_id()).unwrap();
        root.add_entry("a", NodeKind::RegularFile, INodeNo(0));
        let entries = root.dir_entries();
        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[1].name, "..");
    }

    #[test]
    fn forget_frees_at_zero() {
        let table = NodeTable::new(0);
        let node = table.alloc(NodeKind::RegularFile, "/f".to_string());
        assert!(!node.forget(0));
        assert!(node.forget(1));
        table.free(node.id);
        assert!(table.find_by_nodeid(node.id).is_none());
    }

    #[test]
    fn refresh_attrs_reports_mtime_change_and_invalidates_pages() {
        let table = NodeTable::new(0);
        let node = table.alloc(NodeKind::RegularFile, "/f".to_string());
        let t0 = SystemTime::now();
        let t1 = t0 + std::time::Duration::from_secs(1);
        assert!(!node.refresh_attrs(0o644, 10, t0, t0, t0));
        node.cache_page(0, vec![1u8; page_size()].into_boxed_slice());
        assert!(node.cached_page(0).is_some());
        assert!(node.refresh_attrs(0o644, 10, t1, t1, t1));
        assert!(node.cached_page(0).is_none());
    }
}
