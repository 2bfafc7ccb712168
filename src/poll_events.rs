//! Poll readiness flags returned to the kernel in answer to a `poll` request.

use std::fmt::Display;
use std::fmt::Formatter;

use bitflags::bitflags;

bitflags! {
    /// Readiness mask for a `poll` reply, using the same bit values as `libc::POLL*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PollEvents: u32 {
        /// Data other than high-priority data may be read without blocking.
        const POLLIN = 0x0001;
        /// Urgent data may be read without blocking.
        const POLLPRI = 0x0002;
        /// Normal data may be written without blocking.
        const POLLOUT = 0x0004;
        /// An error has occurred.
        const POLLERR = 0x0008;
        /// Hang up.
        const POLLHUP = 0x0010;
        /// Invalid request: fd not open.
        const POLLNVAL = 0x0020;
    }
}

impl Display for PollEvents {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.bits(), f)
    }
}
