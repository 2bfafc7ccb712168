//! Errors raised by the control-device rendezvous, with a mapping to POSIX errno.

/// An error from the control-device rendezvous or its socket transport.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RelayError {
    #[error("control device is already open")]
    AlreadyOpen,
    #[error("operation interrupted")]
    Interrupted,
    #[error("daemon I/O error")]
    Io,
    #[error("daemon reported errno {0}")]
    Errno(i32),
    #[error("malformed request record: {0}")]
    MalformedRequest(String),
    #[error("control socket error: {0}")]
    Socket(#[from] std::io::Error),
}

impl RelayError {
    /// Maps this error to the nearest POSIX errno, so `vfs` only ever deals in errno
    /// values once it crosses into `fuser` territory.
    pub(crate) fn to_errno(&self) -> i32 {
        match self {
            RelayError::AlreadyOpen => libc::EBUSY,
            RelayError::Interrupted => libc::EINTR,
            RelayError::Io => libc::EIO,
            RelayError::Errno(errno) => *errno,
            RelayError::MalformedRequest(_) => libc::EINVAL,
            RelayError::Socket(_) => libc::EIO,
        }
    }
}
