//! The Unix-domain socket transport a daemon process connects through.
//!
//! There being no kernel character device to host the rendezvous in this environment,
//! the "pseudo-device" becomes a `UnixListener`: a single daemon connects, and its
//! read/write/poll calls against the device are played out here as socket I/O against
//! [`ControlState`](super::ControlState). The shared page's bytes travel piggy-backed
//! on the same stream rather than through `mmap`, which is externally indistinguishable
//! to the daemon protocol described alongside it.

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{info, warn};
use zerocopy::{IntoBytes, Ref};

use super::ControlState;
use crate::protocol::{RequestRecord, REPLY_MOREDATA, REPLY_OK};

/// Listens for exactly one daemon connection at a time and bridges it to a
/// [`ControlState`].
#[derive(Debug)]
pub struct ControlServer {
    listener: UnixListener,
    state: Arc<ControlState>,
    path: PathBuf,
}

impl ControlServer {
    /// Binds a control socket at `path`.
    /// # Errors
    /// Returns an error if the path is already in use and can't be bound.
    pub fn bind(path: impl AsRef<Path>, state: Arc<ControlState>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        Ok(Self {
            listener,
            state,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs the accept loop on the calling thread. A second connection attempt while
    /// one daemon is already open is refused outright.
    pub(crate) fn serve(self) -> io::Result<()> {
        for stream in self.listener.incoming() {
            let stream = stream?;
            if self.state.open().is_err() {
                warn!("Rejecting daemon connection: control device already open");
                drop(stream);
                continue;
            }
            info!("Daemon connected to control socket");
            self.run_session(stream);
            self.state.close();
            info!("Daemon disconnected");
        }
        Ok(())
    }

    /// Spawns `serve` on a background thread.
    pub fn spawn(self) -> JoinHandle<io::Result<()>> {
        thread::Builder::new()
            .name("ctldev-server".to_string())
            .spawn(move || self.serve())
            .expect("failed to spawn control-device server thread")
    }

    fn run_session(&self, mut stream: UnixStream) {
        loop {
            let record = self.state.read_request();
            if let Err(err) = stream.write_all(record.as_bytes()) {
                warn!("Failed to forward request to daemon: {err}");
                break;
            }

            let mut code_buf = [0u8; 4];
            if let Err(err) = stream.read_exact(&mut code_buf) {
                warn!("Failed to read reply code from daemon: {err}");
                self.state.write_reply(libc::EIO, &[]);
                break;
            }
            let code = i32::from_ne_bytes(code_buf);

            let payload = if code == REPLY_OK || code == REPLY_MOREDATA {
                let mut buf = vec![0u8; page_size::get()];
                if let Err(err) = stream.read_exact(&mut buf) {
                    warn!("Failed to read reply payload from daemon: {err}");
                    self.state.write_reply(libc::EIO, &[]);
                    break;
                }
                buf
            } else {
                Vec::new()
            };
            self.state.write_reply(code, &payload);
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Daemon-side helper: connects to a control socket and exchanges exactly one
/// request/reply pair. Used by `relayfs-locald`'s request loop.
pub fn read_request(stream: &mut UnixStream) -> io::Result<RequestRecord> {
    let mut buf = vec![0u8; size_of::<RequestRecord>()];
    stream.read_exact(&mut buf)?;
    let (record, _) = Ref::<_, RequestRecord>::from_prefix(buf.as_slice())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed request record"))?;
    Ok(*Ref::into_ref(record))
}

/// Daemon-side helper: writes a reply code and, if valid, a full page of payload.
pub fn write_reply(stream: &mut UnixStream, code: i32, payload: &[u8]) -> io::Result<()> {
    stream.write_all(&code.to_ne_bytes())?;
    if code == REPLY_OK || code == REPLY_MOREDATA {
        let mut page = vec![0u8; page_size::get()];
        let n = payload.len().min(page.len());
        page[..n].copy_from_slice(&payload[..n]);
        stream.write_all(&page)?;
    }
    Ok(())
}

/// Daemon-side helper: connects to the control socket at `path`.
pub fn connect(path: impl AsRef<Path>) -> io::Result<UnixStream> {
    UnixStream::connect(path)
}
