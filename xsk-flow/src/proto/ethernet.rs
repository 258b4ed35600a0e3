//! Ethernet II framing.

use super::{check_capacity, check_len, CodecError};

pub const HEADER_LEN: usize = 14;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub destination: [u8; 6],
    pub source: [u8; 6],
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        check_len(bytes, HEADER_LEN)?;
        let mut destination = [0u8; 6];
        let mut source = [0u8; 6];
        destination.copy_from_slice(&bytes[0..6]);
        source.copy_from_slice(&bytes[6..12]);
        Ok(EthernetHeader {
            destination,
            source,
            ethertype: u16::from_be_bytes([bytes[12], bytes[13]]),
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        check_capacity(buf, HEADER_LEN)?;
        buf[0..6].copy_from_slice(&self.destination);
        buf[6..12].copy_from_slice(&self.source);
        buf[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
        Ok(HEADER_LEN)
    }

    pub fn header_len(&self) -> usize {
        HEADER_LEN
    }
}
