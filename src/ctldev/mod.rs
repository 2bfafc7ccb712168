//! The control-device rendezvous: a single-opener channel that lets exactly one broker
//! hand one request to a daemon and receive exactly one reply, with cancellation if
//! the broker-side thread is interrupted.
//!
//! There is no kernel memory to host this in; `ControlState` is the in-process half
//! (mutex, condvar, reply slot, shared page) described in full below, and
//! [`server`] is the Unix-domain socket transport an out-of-process daemon connects
//! through.

pub(crate) mod error;
pub mod server;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use log::warn;
use parking_lot::{Condvar, Mutex};

use crate::protocol::{RequestRecord, REPLY_MOREDATA, REPLY_OK};
use error::RelayError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct StateFlags: u32 {
        const OPENED                = 0b0000_0001;
        const REQUEST_INPROGRESS    = 0b0000_0010;
        const REQUEST_IS_SET        = 0b0000_0100;
        const DAEMON_INPROGRESS     = 0b0000_1000;
        const MAPDATA_INVALID       = 0b0001_0000;
        const REQUEST_IS_CANCELED   = 0b0010_0000;
    }
}

/// How long a blocking wait sleeps between checks of an external cancellation flag.
/// Keeps `enter`/`start`/daemon `poll` cooperatively interruptible without real
/// per-thread signal delivery.
const POLL_TICK: Duration = Duration::from_millis(50);

/// Result of the daemon-side `poll` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// `REQUEST_IS_SET`: a request is ready to be read.
    Readable,
    /// `REQUEST_IS_CANCELED`: the waiting broker gave up; abandon the in-flight request.
    ErrorBand,
    /// Nothing happened before the timeout elapsed.
    TimedOut,
}

#[derive(Debug)]
struct State {
    flags: StateFlags,
    request: Option<RequestRecord>,
    reply_code: i32,
}

/// The rendezvous primitive itself: one state word, one condition variable, one
/// reply slot, and one page-sized shared buffer.
#[derive(Debug)]
pub struct ControlState {
    state: Mutex<State>,
    cond: Condvar,
    page: Mutex<Box<[u8]>>,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                flags: StateFlags::empty(),
                request: None,
                reply_code: REPLY_OK,
            }),
            cond: Condvar::new(),
            page: Mutex::new(vec![0u8; page_size::get()].into_boxed_slice()),
        }
    }

    // ---- daemon-side operations -------------------------------------------------

    /// Opens the device. Fails with `AlreadyOpen` if a daemon is already connected.
    pub(crate) fn open(&self) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        if state.flags.contains(StateFlags::OPENED) {
            return Err(RelayError::AlreadyOpen);
        }
        state.flags.insert(StateFlags::OPENED);
        Ok(())
    }

    /// Closes the device. If a broker is mid-rendezvous, it is woken with `EIO`
    /// rather than left waiting forever for a daemon that's gone.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.flags.remove(StateFlags::OPENED);
        if state.flags.contains(StateFlags::DAEMON_INPROGRESS) {
            state.flags.insert(StateFlags::MAPDATA_INVALID);
            state.flags.remove(StateFlags::DAEMON_INPROGRESS);
            state.reply_code = libc::EIO;
            self.cond.notify_all();
        }
    }

    /// Blocks until a request is ready, copies it out, and clears `REQUEST_IS_SET`.
    pub(crate) fn read_request(&self) -> RequestRecord {
        let mut state = self.state.lock();
        self.cond
            .wait_while(&mut state, |s| !s.flags.contains(StateFlags::REQUEST_IS_SET));
        state.flags.remove(StateFlags::REQUEST_IS_SET);
        state.request.expect("REQUEST_IS_SET implies a stored request")
    }

    /// Writes the daemon's reply code and, if the page is valid, its payload. Always
    /// clears `DAEMON_INPROGRESS` and wakes the waiting broker.
    pub(crate) fn write_reply(&self, code: i32, payload: &[u8]) {
        if code == REPLY_OK || code == REPLY_MOREDATA {
            let mut page = self.page.lock();
            let n = payload.len().min(page.len());
            page[..n].copy_from_slice(&payload[..n]);
            if n < page.len() {
                page[n..].fill(0);
            }
        }
        let mut state = self.state.lock();
        state.reply_code = code;
        if code != REPLY_OK && code != REPLY_MOREDATA {
            state.flags.insert(StateFlags::MAPDATA_INVALID);
        }
        state.flags.remove(StateFlags::DAEMON_INPROGRESS);
        self.cond.notify_all();
    }

    /// Reports readiness for the daemon's poll loop: readable when a request is
    /// waiting, an error band when the broker gave up, otherwise blocks up to
    /// `timeout`.
    pub(crate) fn poll(&self, timeout: Duration) -> PollResult {
        let mut state = self.state.lock();
        if state.flags.contains(StateFlags::REQUEST_IS_SET) {
            return PollResult::Readable;
        }
        if state.flags.contains(StateFlags::REQUEST_IS_CANCELED) {
            return PollResult::ErrorBand;
        }
        let result = self.cond.wait_for(&mut state, timeout);
        if result.timed_out() {
            return PollResult::TimedOut;
        }
        if state.flags.contains(StateFlags::REQUEST_IS_CANCELED) {
            PollResult::ErrorBand
        } else if state.flags.contains(StateFlags::REQUEST_IS_SET) {
            PollResult::Readable
        } else {
            PollResult::TimedOut
        }
    }

    // ---- broker-side operations, called in strict order: enter, start*, exit ----

    /// Waits for the slot to be free, then claims it. Returns `Interrupted` if
    /// `cancel` is set before the slot becomes available.
    pub(crate) fn enter(&self, cancel: &AtomicBool) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        loop {
            if cancel.load(Ordering::Acquire) {
                return Err(RelayError::Interrupted);
            }
            if !state.flags.contains(StateFlags::REQUEST_INPROGRESS) {
                state.flags.insert(StateFlags::REQUEST_INPROGRESS);
                return Ok(());
            }
            self.cond.wait_for(&mut state, POLL_TICK);
        }
    }

    /// Hands `record` to the daemon and waits for its reply. Returns the reply code
    /// (0, `MOREDATA`, or a positive errno) on success. On interrupt, cancels the
    /// request and wakes the daemon's poll error band.
    pub(crate) fn start(
        &self,
        record: RequestRecord,
        cancel: &AtomicBool,
    ) -> Result<i32, RelayError> {
        {
            let mut state = self.state.lock();
            state.request = Some(record);
            state.flags.insert(StateFlags::REQUEST_IS_SET | StateFlags::DAEMON_INPROGRESS);
            self.cond.notify_all();
        }

        let mut state = self.state.lock();
        loop {
            if !state.flags.contains(StateFlags::DAEMON_INPROGRESS) {
                break;
            }
            if cancel.load(Ordering::Acquire) {
                state.flags.insert(StateFlags::REQUEST_IS_CANCELED);
                state.flags.remove(StateFlags::DAEMON_INPROGRESS);
                self.cond.notify_all();
                return Err(RelayError::Interrupted);
            }
            self.cond.wait_for(&mut state, POLL_TICK);
        }

        if state.flags.contains(StateFlags::MAPDATA_INVALID) {
            return Err(RelayError::Io);
        }
        match state.reply_code {
            REPLY_OK | REPLY_MOREDATA => Ok(state.reply_code),
            errno if errno > 0 => Err(RelayError::Errno(errno)),
            _ => {
                warn!("Unexpected reply code from daemon: {}", state.reply_code);
                Err(RelayError::Io)
            }
        }
    }

    /// Copies up to `len` bytes out of the shared page. Only meaningful right after a
    /// `start` that returned `Ok`.
    pub(crate) fn copy_page(&self, len: usize) -> Vec<u8> {
        let page = self.page.lock();
        let n = len.min(page.len());
        page[..n].to_vec()
    }

    /// Releases the slot, clearing every per-request flag, and wakes the next waiter.
    pub(crate) fn exit(&self) {
        let mut state = self.state.lock();
        state.flags.remove(
            StateFlags::REQUEST_INPROGRESS
                | StateFlags::REQUEST_IS_SET
                | StateFlags::MAPDATA_INVALID
                | StateFlags::REQUEST_IS_CANCELED,
        );
        self.cond.notify_all();
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::MountOptions;
    use std::sync::Arc;
    use std::thread;

    fn opts() -> MountOptions {
        MountOptions::new("ftp", "ftp", "ftp.example.com", "/")
    }

    #[test]
    fn broker_daemon_round_trip() {
        let state = Arc::new(ControlState::new());
        state.open().unwrap();

        let daemon_state = state.clone();
        let daemon = thread::spawn(move || {
            let req = daemon_state.read_request();
            assert_eq!(req.pathname(), "/hello");
            daemon_state.write_reply(REPLY_OK, b"payload");
        });

        let cancel = AtomicBool::new(false);
        state.enter(&cancel).unwrap();
        let code = state
            .start(RequestRecord::getattr(opts(), "/hello"), &cancel)
            .unwrap();
        assert_eq!(code, REPLY_OK);
        assert_eq!(&state.copy_page(7), b"payload");
        state.exit();

        daemon.join().unwrap();
    }

    #[test]
    fn second_open_is_rejected() {
        let state = ControlState::new();
        state.open().unwrap();
        assert!(matches!(state.open(), Err(RelayError::AlreadyOpen)));
    }

    #[test]
    fn close_while_daemon_inprogress_wakes_broker_with_eio() {
        let state = Arc::new(ControlState::new());
        state.open().unwrap();
        let cancel = AtomicBool::new(false);
        state.enter(&cancel).unwrap();

        let closer_state = state.clone();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer_state.close();
        });

        let result = state.start(RequestRecord::getattr(opts(), "/x"), &cancel);
        assert!(matches!(result, Err(RelayError::Io)));
        closer.join().unwrap();
    }

    #[test]
    fn interrupting_the_broker_sets_error_band_and_frees_the_slot() {
        let state = Arc::new(ControlState::new());
        state.open().unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        state.enter(&cancel).unwrap();

        let canceller = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.store(true, Ordering::Release);
        });

        let result = state.start(RequestRecord::getattr(opts(), "/x"), &cancel);
        assert!(matches!(result, Err(RelayError::Interrupted)));
        assert_eq!(state.poll(Duration::from_millis(10)), PollResult::ErrorBand);
        state.exit();
        assert_eq!(state.poll(Duration::from_millis(10)), PollResult::TimedOut);
    }
}
