//! Failure taxonomy for the socket runtime and the redirect control plane.
//!
//! Every kind that originates in a syscall carries the OS error as its
//! source. Nothing in this crate retries internally; each failure is
//! reported to the caller, which owns the policy.

use std::io;
use thiserror::Error;

/// Errors raised by [`crate::socket::XskSocket`] and the ring layer.
#[derive(Debug, Error)]
pub enum XskError {
    /// The `AF_XDP` socket itself could not be opened.
    #[error("failed to create AF_XDP socket: {0}")]
    SocketCreationFailed(#[source] io::Error),

    /// A configuration or query syscall on the socket failed.
    #[error("{call} failed: {source}")]
    SyscallFailed {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// Neither an RX nor a TX ring was requested.
    #[error("socket options configure neither an RX nor a TX ring")]
    MissingRing,

    /// The socket handle is not usable.
    #[error("invalid file descriptor")]
    InvalidFileDescriptor,

    /// The option record is inconsistent (sizes that are not powers of
    /// two, a zero frame count, and similar).
    #[error("invalid socket options: {0}")]
    InvalidOptions(&'static str),

    /// The transmit wake-up failed with a hard error.
    #[error("transmit wake-up failed: {0}")]
    SendFailed(#[source] io::Error),

    /// A standalone kernel kick failed with a hard error.
    #[error("kernel kick failed: {0}")]
    KickFailed(#[source] io::Error),

    /// A caller-provided buffer cannot hold a received frame, or a
    /// frame to transmit does not fit into a UMEM slot.
    #[error("buffer of {buffer} bytes cannot hold a {frame} byte frame")]
    BufferTooSmall { buffer: usize, frame: usize },
}

/// Errors raised by [`crate::redirect::RedirectProgram`].
#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("failed to create {map} map: {source}")]
    MapCreateFailed {
        map: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to update {map}[{key}]: {source}")]
    MapUpdateFailed {
        map: &'static str,
        key: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to load redirect program: {0}")]
    BpfLoadFailed(#[source] io::Error),

    #[error("failed to attach to interface {if_index}: {source}")]
    AttachFailed {
        if_index: u32,
        #[source]
        source: crate::netlink::NetlinkError,
    },

    #[error("failed to detach from interface {if_index}: {source}")]
    DetachFailed {
        if_index: u32,
        #[source]
        source: crate::netlink::NetlinkError,
    },
}
