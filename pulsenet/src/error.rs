use std::io;
use thiserror::Error;

/// Non-fatal signal distinguished from hard failures: the caller should simply try again later.
/// Mirrors the `io::ErrorKind::WouldBlock` distinction that the non-blocking socket calls make.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum NetworkError {
    #[error("operation would block, try again later")]
    Wait,
    #[error(transparent)]
    Fatal(#[from] ErrorKind),
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ErrorKind {
    #[error("failed to create the underlying socket")]
    SocketCreate,
    #[error("failed to bind the socket to the requested address")]
    SocketBind,
    #[error("failed to put the socket into non-blocking mode")]
    SocketNonBlocking,
    #[error("packet shorter than the minimum header size")]
    PacketTooShort,
    #[error("packet protocol id does not match this context")]
    ProtocolMismatch,
    #[error("connect packet declared an unknown subtype")]
    BadConnectSubtype,
    #[error("connect packet size does not match its declared subtype")]
    BadConnectSize,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("sequence number is a duplicate or too old")]
    SequenceStale,
    #[error("packet identity is not a recognized active connection")]
    UnknownIdentity,
    #[error("auth policy violation between peers")]
    AuthPolicyViolation,
    #[error("payload exceeds the maximum datagram size")]
    PayloadTooLarge,
    #[error("io error: {0:?}")]
    Io(io::ErrorKind),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

/// Convenience extension mirroring this lineage's `ErrorUtils` trait: distinguishes "genuinely
/// failed" from "would block, not a failure".
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(NetworkError::Wait))
    }
}
