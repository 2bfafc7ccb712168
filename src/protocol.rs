//! Wire format shared between `ctldev`'s in-process rendezvous and the Unix-socket
//! transport a daemon process connects through.
//!
//! Everything here is native-endian and POD: producer and consumer always run on the
//! same machine, so there's no need for network byte order.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Maximum length, in bytes, of the `user` mount option.
pub const MAX_USER_LEN: usize = 100;
/// Maximum length, in bytes, of the `pass` mount option.
pub const MAX_PASS_LEN: usize = 100;
/// Maximum length, in bytes, of the `server` mount option.
pub const MAX_SERVER_LEN: usize = 100;
/// Maximum length, in bytes, of the `basepath` mount option and of any pathname
/// carried in a request record.
pub const MAX_PATH_LEN: usize = 4096;

/// Reply code meaning the shared page is valid and this is the whole answer.
pub const REPLY_OK: i32 = 0;
/// Reply code meaning the shared page is valid but the daemon has more to send.
pub const REPLY_MOREDATA: i32 = 240;

/// The kind of request carried by a [`RequestRecord`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read = 1,
    ReadDir = 2,
    GetAttr = 3,
}

/// A `kind` field in a [`RequestRecord`] that doesn't match any known [`RequestKind`].
#[derive(Debug, Clone, Copy)]
pub struct InvalidRequestKind(pub u32);

impl TryFrom<u32> for RequestKind {
    type Error = InvalidRequestKind;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(RequestKind::Read),
            2 => Ok(RequestKind::ReadDir),
            3 => Ok(RequestKind::GetAttr),
            other => Err(InvalidRequestKind(other)),
        }
    }
}

/// The four mount-time options, packed as fixed-width NUL-padded byte strings so the
/// whole record has a stable size on the wire.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct MountOptions {
    user: [u8; MAX_USER_LEN],
    pass: [u8; MAX_PASS_LEN],
    server: [u8; MAX_SERVER_LEN],
    basepath: [u8; MAX_PATH_LEN],
}

impl MountOptions {
    pub fn new(user: &str, pass: &str, server: &str, basepath: &str) -> Self {
        Self {
            user: pack(user),
            pass: pack(pass),
            server: pack(server),
            basepath: pack(basepath),
        }
    }

    pub fn user(&self) -> &str {
        unpack(&self.user)
    }

    pub fn pass(&self) -> &str {
        unpack(&self.pass)
    }

    pub fn server(&self) -> &str {
        unpack(&self.server)
    }

    pub fn basepath(&self) -> &str {
        unpack(&self.basepath)
    }
}

fn pack<const N: usize>(s: &str) -> [u8; N] {
    let mut buf = [0u8; N];
    let bytes = s.as_bytes();
    let n = bytes.len().min(N - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

fn unpack(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

/// The fixed-size value handed from a broker to the daemon across `ctldev`.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RequestRecord {
    kind: u32,
    options: MountOptions,
    pathname: [u8; MAX_PATH_LEN],
    /// Byte offset for READ/READDIR; unused for GETATTR.
    pub offset: u64,
    /// Byte length for READ/READDIR; unused for GETATTR.
    pub len: u64,
}

impl RequestRecord {
    pub fn read(options: MountOptions, pathname: &str, offset: u64, len: u64) -> Self {
        Self::with_payload(RequestKind::Read, options, pathname, offset, len)
    }

    pub fn readdir(options: MountOptions, pathname: &str, offset: u64, len: u64) -> Self {
        Self::with_payload(RequestKind::ReadDir, options, pathname, offset, len)
    }

    pub fn getattr(options: MountOptions, pathname: &str) -> Self {
        Self::with_payload(RequestKind::GetAttr, options, pathname, 0, 0)
    }

    fn with_payload(
        kind: RequestKind,
        options: MountOptions,
        pathname: &str,
        offset: u64,
        len: u64,
    ) -> Self {
        Self {
            kind: kind as u32,
            options,
            pathname: pack(pathname),
            offset,
            len,
        }
    }

    pub fn kind(&self) -> Result<RequestKind, InvalidRequestKind> {
        RequestKind::try_from(self.kind)
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn pathname(&self) -> &str {
        unpack(&self.pathname)
    }
}

/// The GETATTR reply payload: file type, mode bits, size, and three timestamps.
/// Field order is chosen so the struct contains no implicit padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct GetattrData {
    pub size: u64,
    pub atime_sec: i64,
    pub mtime_sec: i64,
    pub ctime_sec: i64,
    pub kind: u32,
    pub mode: u32,
    pub atime_nsec: u32,
    pub mtime_nsec: u32,
    pub ctime_nsec: u32,
    _reserved: u32,
}

impl GetattrData {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: u32,
        mode: u32,
        size: u64,
        atime_sec: i64,
        atime_nsec: u32,
        mtime_sec: i64,
        mtime_nsec: u32,
        ctime_sec: i64,
        ctime_nsec: u32,
    ) -> Self {
        Self {
            size,
            atime_sec,
            mtime_sec,
            ctime_sec,
            kind,
            mode,
            atime_nsec,
            mtime_nsec,
            ctime_nsec,
            _reserved: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mount_options_round_trip() {
        let opts = MountOptions::new("alice", "hunter2", "ftp.example.com", "/pub");
        assert_eq!(opts.user(), "alice");
        assert_eq!(opts.pass(), "hunter2");
        assert_eq!(opts.server(), "ftp.example.com");
        assert_eq!(opts.basepath(), "/pub");
    }

    #[test]
    fn mount_options_truncates_overlong_values() {
        let long = "x".repeat(MAX_USER_LEN + 10);
        let opts = MountOptions::new(&long, "ftp", "ftp", "/");
        assert_eq!(opts.user().len(), MAX_USER_LEN - 1);
    }

    #[test]
    fn request_record_round_trips_kind_and_pathname() {
        let opts = MountOptions::new("ftp", "ftp", "ftp.example.com", "/");
        let rec = RequestRecord::read(opts, "/a/b/c", 4096, 4096);
        assert!(matches!(rec.kind(), Ok(RequestKind::Read)));
        assert_eq!(rec.pathname(), "/a/b/c");
        assert_eq!(rec.offset, 4096);
        assert_eq!(rec.len, 4096);
    }

    #[test]
    fn request_record_has_no_implicit_padding() {
        // offset/len must land on an 8-byte boundary given kind + options + pathname.
        assert_eq!(size_of::<RequestRecord>(), 4 + size_of::<MountOptions>() + MAX_PATH_LEN + 16);
    }

    #[test]
    fn getattr_data_has_no_implicit_padding() {
        assert_eq!(size_of::<GetattrData>(), 56);
    }
}
