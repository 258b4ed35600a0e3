//! # Protocol header codecs
//!
//! Pure, allocation-free parse and write routines for the headers the
//! packet view understands. Integer fields are big-endian on the wire;
//! bit-packed fields are masked and shifted explicitly. Each codec
//! checks lengths up front and never touches bytes past what it needs.

use thiserror::Error;

pub mod arp;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod tcp;
pub mod udp;

pub use arp::ArpHeader;
pub use ethernet::EthernetHeader;
pub use icmp::IcmpHeader;
pub use ipv4::Ipv4Header;
pub use tcp::TcpHeader;
pub use udp::UdpHeader;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// The input slice cannot hold the requested header.
    #[error("packet too short: need {need} bytes, have {have}")]
    PacketTooShort { need: usize, have: usize },

    /// The output buffer cannot hold the serialized header.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
}

pub(crate) fn check_len(bytes: &[u8], need: usize) -> Result<(), CodecError> {
    if bytes.len() < need {
        return Err(CodecError::PacketTooShort {
            need,
            have: bytes.len(),
        });
    }
    Ok(())
}

pub(crate) fn check_capacity(buf: &[u8], need: usize) -> Result<(), CodecError> {
    if buf.len() < need {
        return Err(CodecError::BufferTooSmall {
            need,
            have: buf.len(),
        });
    }
    Ok(())
}
