//! ARP for IPv4 over Ethernet, per RFC 826. The fixed 28-byte layout
//! assumes 6-byte hardware and 4-byte protocol addresses, which is the
//! only combination this service encounters.

use super::{check_capacity, check_len, CodecError};
use std::net::Ipv4Addr;

pub const HEADER_LEN: usize = 28;

pub const HTYPE_ETHERNET: u16 = 1;
pub const OPER_REQUEST: u16 = 1;
pub const OPER_REPLY: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpHeader {
    pub hardware_type: u16,
    pub protocol_type: u16,
    pub hardware_len: u8,
    pub protocol_len: u8,
    pub operation: u16,
    pub sender_hardware: [u8; 6],
    pub sender_protocol: Ipv4Addr,
    pub target_hardware: [u8; 6],
    pub target_protocol: Ipv4Addr,
}

impl ArpHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        check_len(bytes, HEADER_LEN)?;
        let mut sender_hardware = [0u8; 6];
        let mut target_hardware = [0u8; 6];
        sender_hardware.copy_from_slice(&bytes[8..14]);
        target_hardware.copy_from_slice(&bytes[18..24]);
        Ok(ArpHeader {
            hardware_type: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_type: u16::from_be_bytes([bytes[2], bytes[3]]),
            hardware_len: bytes[4],
            protocol_len: bytes[5],
            operation: u16::from_be_bytes([bytes[6], bytes[7]]),
            sender_hardware,
            sender_protocol: Ipv4Addr::new(bytes[14], bytes[15], bytes[16], bytes[17]),
            target_hardware,
            target_protocol: Ipv4Addr::new(bytes[24], bytes[25], bytes[26], bytes[27]),
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        check_capacity(buf, HEADER_LEN)?;
        buf[0..2].copy_from_slice(&self.hardware_type.to_be_bytes());
        buf[2..4].copy_from_slice(&self.protocol_type.to_be_bytes());
        buf[4] = self.hardware_len;
        buf[5] = self.protocol_len;
        buf[6..8].copy_from_slice(&self.operation.to_be_bytes());
        buf[8..14].copy_from_slice(&self.sender_hardware);
        buf[14..18].copy_from_slice(&self.sender_protocol.octets());
        buf[18..24].copy_from_slice(&self.target_hardware);
        buf[24..28].copy_from_slice(&self.target_protocol.octets());
        Ok(HEADER_LEN)
    }

    pub fn header_len(&self) -> usize {
        HEADER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let header = ArpHeader {
            hardware_type: HTYPE_ETHERNET,
            protocol_type: 0x0800,
            hardware_len: 6,
            protocol_len: 4,
            operation: OPER_REQUEST,
            sender_hardware: [2, 0, 0, 0, 0, 1],
            sender_protocol: Ipv4Addr::new(192, 168, 77, 100),
            target_hardware: [0; 6],
            target_protocol: Ipv4Addr::new(192, 168, 77, 101),
        };
        let mut buf = [0u8; HEADER_LEN];
        header.write(&mut buf).unwrap();
        assert_eq!(ArpHeader::parse(&buf).unwrap(), header);
    }

    #[test]
    fn too_short() {
        assert!(matches!(
            ArpHeader::parse(&[0u8; 27]),
            Err(CodecError::PacketTooShort { need: 28, have: 27 })
        ));
    }
}
