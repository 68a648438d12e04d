//! Error taxonomy shared by both channels and the pipelines above them.
//!
//! The absorbed kinds (`Wait`, `Truncated`, `Stale`, `ResourceMissing`) are
//! handled inside the owning task and never terminate it; `Fatal` errors
//! propagate to the supervisor, which drains the connection.

use crate::hashing::StringId;
use std::io;
use std::net;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    /// Not enough data yet, or the operation would block; retry later.
    Wait,
    /// The OS delivered a datagram shorter than its declared content.
    Truncated,
    /// Datagram generation below the high-water mark; dropped silently.
    Stale,
    /// An update referenced an id this endpoint does not know; discarded.
    ResourceMissing(StringId),
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    /// Stream EOF or closed socket.
    Disconnected,
    /// Reliable type byte of zero or above the known range.
    UnknownMessage,
    /// A reliable message that is valid but wrong for the current protocol
    /// step.
    UnexpectedMessage,
    /// Chunk type byte outside the known range during a validation walk.
    UnknownChunk,
    /// A declared size exceeds its budget.
    SizeOverflow,
    /// A chunk walk did not terminate exactly at the declared payload size.
    ChunkOverrun,
    /// A handshake step or keepalive exceeded its deadline.
    Timeout,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                NetError::Wait
            }
            io::ErrorKind::UnexpectedEof => NetError::Fatal(ErrorType::Disconnected),
            kind => NetError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    /// True only for errors that must terminate the owning task.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Err(NetError::Fatal(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_folding() {
        let wait: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(wait, NetError::Wait);

        let wait: NetError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert_eq!(wait, NetError::Wait);

        let eof: NetError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert_eq!(eof, NetError::Fatal(ErrorType::Disconnected));

        let refused: NetError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(
            refused,
            NetError::Fatal(ErrorType::Io(io::ErrorKind::ConnectionRefused))
        );
    }

    #[test]
    fn test_absorbed_kinds_are_not_failures() {
        assert!(!NetResult::<()>::Err(NetError::Wait).has_failed());
        assert!(!NetResult::<()>::Err(NetError::Stale).has_failed());
        assert!(!NetResult::<()>::Err(NetError::Truncated).has_failed());
        assert!(!NetResult::<()>::Err(NetError::ResourceMissing(7)).has_failed());
        assert!(!NetResult::<()>::Ok(()).has_failed());
        assert!(NetResult::<()>::Err(NetError::Fatal(ErrorType::Disconnected)).has_failed());
    }
}
