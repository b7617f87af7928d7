//! Protocol error type and its mapping onto POSIX error numbers.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

use super::codec::Tag;
use super::op::OpCode;

/// Result alias used throughout the protocol layer.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Everything that can go wrong while framing, encoding or exchanging packets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the stream before a full header or payload arrived.
    #[error("connection closed by peer")]
    Closed,

    #[error("tag mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: Tag, found: u64 },

    #[error("payload truncated: need {needed} bytes, {remaining} remaining")]
    OutOfBounds { needed: u64, remaining: usize },

    #[error("value list has no end or block-end terminator")]
    Unterminated,

    #[error("cannot grow payload buffer by {0} bytes")]
    Alloc(usize),

    #[error("unknown op code {0}")]
    UnknownOp(u8),

    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    /// The device answered with a non-zero error code.
    #[error("{op} failed on device: {message} (errno {errno})")]
    Remote {
        op: OpCode,
        errno: i32,
        message: String,
    },

    #[error("unexpected reply: sent {sent}, got {received} (host flag {host_flag})")]
    UnexpectedReply {
        sent: OpCode,
        received: u8,
        host_flag: u8,
    },

    #[error("{0} trailing bytes after reply")]
    TrailingBytes(usize),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// An earlier exchange failed mid-stream; replies can no longer be
    /// matched to requests.
    #[error("connection out of sync after an earlier failure")]
    Desynced,
}

impl ProtocolError {
    /// Positive POSIX error number describing this failure.
    pub fn errno(&self) -> i32 {
        match self {
            ProtocolError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            ProtocolError::Closed | ProtocolError::Desynced => libc::ENOTCONN,
            ProtocolError::TypeMismatch { .. }
            | ProtocolError::OutOfBounds { .. }
            | ProtocolError::VersionMismatch { .. }
            | ProtocolError::UnexpectedReply { .. }
            | ProtocolError::TrailingBytes(_) => libc::EPROTO,
            ProtocolError::Unterminated => libc::EINVAL,
            ProtocolError::Alloc(_) => libc::ENOMEM,
            ProtocolError::UnknownOp(_) => libc::ENOSYS,
            ProtocolError::Remote { errno, .. } => *errno,
            ProtocolError::PayloadTooLarge(_) => libc::EMSGSIZE,
        }
    }

    /// Signed status code: always negative.
    pub fn status(&self) -> i32 {
        -self.errno()
    }

    /// True for the graceful end-of-stream case.
    pub fn is_closed(&self) -> bool {
        matches!(self, ProtocolError::Closed)
    }
}

/// Collapse a result into the single signed code callers of the
/// filesystem layer expect: `0` on success, `-errno` otherwise.
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status(),
    }
}

/// Human readable description of an errno, as sent in error replies.
pub fn describe_errno(errno: i32) -> &'static str {
    Errno::from_raw(errno).desc()
}

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(inner) => inner,
            other => io::Error::from_raw_os_error(other.errno()),
        }
    }
}
