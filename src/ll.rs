//! Low-level request/reply types, closely modeled on the FUSE kernel ABI.

pub(crate) mod argument;
pub(crate) mod flags;
pub(crate) mod fuse_abi;
pub(crate) mod ioslice_concat;
pub(crate) mod reply;
pub(crate) mod request;

#[cfg(test)]
pub(crate) mod test {
    use std::io::IoSlice;
    use std::ops::Deref;

    /// Forces 8-byte alignment on fixture byte arrays so zerocopy parsing never
    /// trips an alignment check on test data embedded in the binary.
    #[repr(align(8))]
    pub(crate) struct AlignedData<T>(pub(crate) T);

    impl<T, Idx> std::ops::Index<Idx> for AlignedData<T>
    where
        T: std::ops::Index<Idx>,
    {
        type Output = T::Output;
        fn index(&self, index: Idx) -> &T::Output {
            self.0.index(index)
        }
    }

    impl<T: Deref<Target = [u8]>> Deref for AlignedData<T> {
        type Target = [u8];
        fn deref(&self) -> &[u8] {
            &self.0
        }
    }

    pub(crate) fn ioslice_to_vec(slices: &[IoSlice<'_>]) -> Vec<u8> {
        slices.iter().flat_map(|s| s.iter().copied()).collect()
    }
}

use std::num::NonZeroI32;

pub(crate) use request::Operation;
pub(crate) use request::Request;
pub(crate) use request::RequestError;

/// Unique identifier FUSE assigns to a request; echoed back in the reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RequestId(pub(crate) u64);

/// The node-id the kernel uses to address an inode for the lifetime of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct INodeNo(pub(crate) u64);

impl From<u64> for INodeNo {
    fn from(v: u64) -> Self {
        INodeNo(v)
    }
}
impl From<INodeNo> for u64 {
    fn from(v: INodeNo) -> Self {
        v.0
    }
}

/// Generation number paired with a node-id to detect node-id reuse across a remount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Generation(pub(crate) u64);

/// Handle a filesystem hands back from open/opendir, opaque to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FileHandle(pub(crate) u64);

impl From<u64> for FileHandle {
    fn from(v: u64) -> Self {
        FileHandle(v)
    }
}
impl From<FileHandle> for u64 {
    fn from(v: FileHandle) -> Self {
        v.0
    }
}

/// Owner token for byte-range locks; opaque to the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LockOwner(pub(crate) u64);

/// Negotiated FUSE protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Version {
    pub(crate) major: u32,
    pub(crate) minor: u32,
}

/// A `setattr` timestamp argument: either an explicit time or "now", per `UTIME_NOW`.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TimeOrNow {
    SpecificTime(std::time::SystemTime),
    Now,
}

/// File lock description used by the `getlk`/`setlk` reply path.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Lock {
    pub(crate) range: (u64, u64),
    pub(crate) typ: i32,
    pub(crate) pid: u32,
}

/// A POSIX errno value, always non-zero (zero is represented by the absence of an error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Errno(pub(crate) NonZeroI32);

impl Errno {
    pub(crate) const EPERM: Errno = Errno::new(libc::EPERM);
    pub(crate) const ENOENT: Errno = Errno::new(libc::ENOENT);
    pub(crate) const EIO: Errno = Errno::new(libc::EIO);
    pub(crate) const EAGAIN: Errno = Errno::new(libc::EAGAIN);
    pub(crate) const EACCES: Errno = Errno::new(libc::EACCES);
    pub(crate) const EBUSY: Errno = Errno::new(libc::EBUSY);
    pub(crate) const EEXIST: Errno = Errno::new(libc::EEXIST);
    pub(crate) const ENOTDIR: Errno = Errno::new(libc::ENOTDIR);
    pub(crate) const EISDIR: Errno = Errno::new(libc::EISDIR);
    pub(crate) const EINVAL: Errno = Errno::new(libc::EINVAL);
    pub(crate) const ENOSPC: Errno = Errno::new(libc::ENOSPC);
    pub(crate) const EROFS: Errno = Errno::new(libc::EROFS);
    pub(crate) const ERANGE: Errno = Errno::new(libc::ERANGE);
    pub(crate) const ENOSYS: Errno = Errno::new(libc::ENOSYS);
    pub(crate) const ENOTEMPTY: Errno = Errno::new(libc::ENOTEMPTY);
    pub(crate) const EINTR: Errno = Errno::new(libc::EINTR);
    pub(crate) const ENODATA: Errno = Errno::new(libc::ENODATA);

    pub(crate) const fn new(code: i32) -> Self {
        match NonZeroI32::new(code) {
            Some(v) => Errno(v),
            None => panic!("errno must be non-zero"),
        }
    }

    pub(crate) fn from_i32(code: i32) -> Self {
        Self::new(if code == 0 { libc::EIO } else { code })
    }

    pub(crate) fn code(&self) -> i32 {
        self.0.get()
    }
}

impl From<i32> for Errno {
    fn from(code: i32) -> Self {
        Errno::from_i32(code)
    }
}
