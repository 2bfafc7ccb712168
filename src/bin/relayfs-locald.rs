//! Reference relay daemon: answers READ/READDIR/GETATTR requests from `relayfs-mount`
//! against a real local directory tree, standing in for an actual FTP-speaking relay.
//!
//! Connects to the control socket a `relayfs-mount` process is listening on and plays
//! the daemon side of the `ctldev` protocol: one request in, one reply out, repeat.

use std::fs::Metadata;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::{info, warn};
use zerocopy::IntoBytes;

use relayfs::ctldev::server::{connect, read_request, write_reply};
use relayfs::protocol::{GetattrData, RequestKind, REPLY_MOREDATA, REPLY_OK};

#[derive(Parser)]
#[command(version, about = "Serves a local directory tree over the relayfs control socket")]
struct Args {
    /// Local directory tree to serve as the filesystem's contents
    root: PathBuf,

    /// Unix-domain control socket a `relayfs-mount` process is listening on
    #[clap(long, default_value = "/tmp/relayfs.sock")]
    socket: PathBuf,
}

/// Encodes a local file's type into the same `GetattrData.kind` wire values
/// `relayfs::nodes::NodeKind::to_wire` produces: 0=regular, 1=directory, 2=symlink,
/// 3=block device, 4=char device, 5=fifo, 6=socket. Doors and ports (7, 8) have no
/// local-filesystem analogue and never appear here.
fn kind_code(meta: &Metadata) -> u32 {
    let ft = meta.file_type();
    if ft.is_dir() {
        1
    } else if ft.is_symlink() {
        2
    } else if ft.is_block_device() {
        3
    } else if ft.is_char_device() {
        4
    } else if ft.is_fifo() {
        5
    } else if ft.is_socket() {
        6
    } else {
        0
    }
}

/// Joins a request's pathname (always absolute, e.g. `/a/b`) onto the served root.
fn resolve(root: &Path, pathname: &str) -> PathBuf {
    let relative = pathname.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

fn errno_of(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn handle_getattr(stream: &mut UnixStream, path: &Path) {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => {
            let data = GetattrData::new(
                kind_code(&meta),
                (meta.mode() & 0o7777) as u32,
                meta.size(),
                meta.atime(),
                meta.atime_nsec() as u32,
                meta.mtime(),
                meta.mtime_nsec() as u32,
                meta.ctime(),
                meta.ctime_nsec() as u32,
            );
            let _ = write_reply(stream, REPLY_OK, data.as_bytes());
        }
        Err(err) => {
            let _ = write_reply(stream, errno_of(&err), &[]);
        }
    }
}

fn handle_read(stream: &mut UnixStream, path: &Path, offset: u64, len: u64) {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(err) => {
            let _ = write_reply(stream, errno_of(&err), &[]);
            return;
        }
    };
    if let Err(err) = file.seek(SeekFrom::Start(offset)) {
        let _ = write_reply(stream, errno_of(&err), &[]);
        return;
    }
    let mut buf = vec![0u8; len as usize];
    match file.read(&mut buf) {
        Ok(n) => {
            let _ = write_reply(stream, REPLY_OK, &buf[..n]);
        }
        Err(err) => {
            let _ = write_reply(stream, errno_of(&err), &[]);
        }
    }
}

/// Builds the full NUL/NUL-terminated name stream for a directory's entries, sorted
/// for a stable, deterministic byte offset across repeated calls.
fn dir_stream(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut names: Vec<String> = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort_unstable();

    let mut buf = Vec::new();
    for name in names {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        buf.push(0);
    }
    Ok(buf)
}

fn handle_readdir(stream: &mut UnixStream, path: &Path, offset: u64) {
    match dir_stream(path) {
        Ok(full) => {
            let page = page_size::get();
            let start = (offset as usize).min(full.len());
            let end = (start + page).min(full.len());
            let code = if end < full.len() { REPLY_MOREDATA } else { REPLY_OK };
            let _ = write_reply(stream, code, &full[start..end]);
        }
        Err(err) => {
            let _ = write_reply(stream, errno_of(&err), &[]);
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut stream = connect(&args.socket).expect("failed to connect to control socket");
    info!("Connected to control socket at {}", args.socket.display());

    loop {
        let record = match read_request(&mut stream) {
            Ok(record) => record,
            Err(err) => {
                warn!("Control connection closed: {err}");
                break;
            }
        };

        let path = resolve(&args.root, record.pathname());
        match record.kind() {
            Ok(RequestKind::GetAttr) => handle_getattr(&mut stream, &path),
            Ok(RequestKind::Read) => handle_read(&mut stream, &path, record.offset, record.len),
            Ok(RequestKind::ReadDir) => handle_readdir(&mut stream, &path, record.offset),
            Err(invalid) => {
                warn!("Unknown request kind {}", invalid.0);
                let _ = write_reply(&mut stream, libc::EINVAL, &[]);
            }
        }
    }
}
