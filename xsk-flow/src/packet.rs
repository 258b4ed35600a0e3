//! # Zero-copy packet view
//!
//! ## Purpose
//!
//! [`Packet`] wraps a received frame in place: the backing bytes live in
//! the socket's UMEM and are never copied. Layer accessors parse on
//! first use, cache the result together with the offset of the next
//! layer, and enforce dependency order, so asking for the TCP header of
//! a frame resolves Ethernet and IPv4 along the way.
//!
//! A view is valid for one pipeline pass. Once the worker has applied
//! the verdict the backing frame may be re-donated to the kernel, and
//! any outstanding view must be gone by then.

use crate::proto::{
    arp, ethernet, icmp, ipv4, udp, ArpHeader, CodecError, EthernetHeader, IcmpHeader,
    Ipv4Header, TcpHeader, UdpHeader,
};
use std::time::Instant;
use thiserror::Error;
use xsk_socket::XdpDesc;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// An in-place write would run past the frame's valid bytes.
    #[error("modification of {len} bytes at offset {offset} exceeds frame length {frame_len}")]
    ModificationOutOfBounds {
        offset: usize,
        len: usize,
        frame_len: usize,
    },

    /// A layer accessor was used on a frame whose enclosing header names
    /// a different protocol.
    #[error("{layer} header requested but the enclosing header names a different protocol")]
    UnexpectedProtocol { layer: &'static str },
}

/// Where a frame entered the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSource {
    pub if_index: u32,
    pub queue_id: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct LayerCache {
    ethernet: Option<EthernetHeader>,
    /// Offset of the layer-3 header, known once Ethernet is parsed.
    l3_offset: Option<usize>,
    ipv4: Option<Ipv4Header>,
    l4_offset: Option<usize>,
    tcp: Option<TcpHeader>,
    udp: Option<UdpHeader>,
    icmp: Option<IcmpHeader>,
    arp: Option<ArpHeader>,
    /// Offset of the first byte past the deepest parsed header.
    payload_offset: Option<usize>,
}

/// A mutable, lazily parsed view over one received frame.
pub struct Packet<'a> {
    data: &'a mut [u8],
    desc: XdpDesc,
    source: PacketSource,
    timestamp: Option<Instant>,
    cache: LayerCache,
}

impl<'a> Packet<'a> {
    /// Wraps a frame. `data` must span exactly the descriptor's valid
    /// bytes.
    pub fn new(data: &'a mut [u8], desc: XdpDesc, source: PacketSource) -> Self {
        debug_assert_eq!(data.len(), desc.len as usize);
        Packet {
            data,
            desc,
            source,
            timestamp: None,
            cache: LayerCache::default(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: Instant) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    pub fn source(&self) -> PacketSource {
        self.source
    }

    pub fn desc(&self) -> XdpDesc {
        self.desc
    }

    pub fn len(&self) -> usize {
        self.desc.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.desc.len == 0
    }

    /// The frame's valid bytes, read-only.
    pub fn raw(&self) -> &[u8] {
        self.data
    }

    /// The frame's valid bytes, writable. Writing through this view does
    /// not invalidate cached headers; use [`Self::modify`] for that.
    pub fn payload(&mut self) -> &mut [u8] {
        self.data
    }

    pub fn ethernet(&mut self) -> Result<EthernetHeader, PacketError> {
        if let Some(header) = self.cache.ethernet {
            return Ok(header);
        }
        let header = EthernetHeader::parse(self.data)?;
        self.cache.ethernet = Some(header);
        self.cache.l3_offset = Some(ethernet::HEADER_LEN);
        self.bump_payload_offset(ethernet::HEADER_LEN);
        Ok(header)
    }

    pub fn ipv4(&mut self) -> Result<Ipv4Header, PacketError> {
        if let Some(header) = self.cache.ipv4 {
            return Ok(header);
        }
        let ethernet = self.ethernet()?;
        if ethernet.ethertype != ethernet::ETHERTYPE_IPV4 {
            return Err(PacketError::UnexpectedProtocol { layer: "ipv4" });
        }
        let l3 = self.cache.l3_offset.unwrap_or(ethernet::HEADER_LEN);
        let header = Ipv4Header::parse(&self.data[l3..])?;
        self.cache.ipv4 = Some(header);
        self.cache.l4_offset = Some(l3 + header.header_len());
        self.bump_payload_offset(l3 + header.header_len());
        Ok(header)
    }

    pub fn tcp(&mut self) -> Result<TcpHeader, PacketError> {
        if let Some(header) = self.cache.tcp {
            return Ok(header);
        }
        let l4 = self.l4_for(ipv4::PROTO_TCP, "tcp")?;
        let header = TcpHeader::parse(&self.data[l4..])?;
        self.cache.tcp = Some(header);
        self.bump_payload_offset(l4 + header.header_len());
        Ok(header)
    }

    pub fn udp(&mut self) -> Result<UdpHeader, PacketError> {
        if let Some(header) = self.cache.udp {
            return Ok(header);
        }
        let l4 = self.l4_for(ipv4::PROTO_UDP, "udp")?;
        let header = UdpHeader::parse(&self.data[l4..])?;
        self.cache.udp = Some(header);
        self.bump_payload_offset(l4 + udp::HEADER_LEN);
        Ok(header)
    }

    pub fn icmp(&mut self) -> Result<IcmpHeader, PacketError> {
        if let Some(header) = self.cache.icmp {
            return Ok(header);
        }
        let l4 = self.l4_for(ipv4::PROTO_ICMP, "icmp")?;
        let header = IcmpHeader::parse(&self.data[l4..])?;
        self.cache.icmp = Some(header);
        self.bump_payload_offset(l4 + icmp::HEADER_LEN);
        Ok(header)
    }

    pub fn arp(&mut self) -> Result<ArpHeader, PacketError> {
        if let Some(header) = self.cache.arp {
            return Ok(header);
        }
        let ethernet = self.ethernet()?;
        if ethernet.ethertype != ethernet::ETHERTYPE_ARP {
            return Err(PacketError::UnexpectedProtocol { layer: "arp" });
        }
        let l3 = self.cache.l3_offset.unwrap_or(ethernet::HEADER_LEN);
        let header = ArpHeader::parse(&self.data[l3..])?;
        self.cache.arp = Some(header);
        self.bump_payload_offset(l3 + arp::HEADER_LEN);
        Ok(header)
    }

    /// Bytes after the deepest header parsed so far. Before any accessor
    /// has run this is the whole frame.
    pub fn payload_data(&self) -> &[u8] {
        let offset = self.cache.payload_offset.unwrap_or(0).min(self.data.len());
        &self.data[offset..]
    }

    /// Overwrites bytes in place and drops every cached header whose
    /// footprint intersects the modified range.
    pub fn modify(&mut self, offset: usize, bytes: &[u8]) -> Result<(), PacketError> {
        let end = offset.checked_add(bytes.len()).ok_or(
            PacketError::ModificationOutOfBounds {
                offset,
                len: bytes.len(),
                frame_len: self.data.len(),
            },
        )?;
        if end > self.data.len() {
            return Err(PacketError::ModificationOutOfBounds {
                offset,
                len: bytes.len(),
                frame_len: self.data.len(),
            });
        }
        self.data[offset..end].copy_from_slice(bytes);
        self.invalidate(offset, end);
        Ok(())
    }

    fn l4_for(&mut self, protocol: u8, layer: &'static str) -> Result<usize, PacketError> {
        let ipv4 = self.ipv4()?;
        if ipv4.protocol != protocol {
            return Err(PacketError::UnexpectedProtocol { layer });
        }
        Ok(self
            .cache
            .l4_offset
            .unwrap_or(ethernet::HEADER_LEN + ipv4.header_len()))
    }

    fn bump_payload_offset(&mut self, offset: usize) {
        let current = self.cache.payload_offset.unwrap_or(0);
        if offset > current {
            self.cache.payload_offset = Some(offset);
        }
    }

    fn invalidate(&mut self, start: usize, end: usize) {
        let intersects = |range: Option<(usize, usize)>| match range {
            Some((lo, hi)) => start < hi && lo < end,
            None => false,
        };
        if self.cache.ethernet.is_some() && intersects(Some((0, ethernet::HEADER_LEN))) {
            self.cache.ethernet = None;
        }
        let l3 = self.cache.l3_offset;
        if let (Some(header), Some(l3)) = (self.cache.ipv4, l3) {
            if intersects(Some((l3, l3 + header.header_len()))) {
                self.cache.ipv4 = None;
            }
        }
        if let (Some(header), Some(l3)) = (self.cache.arp, l3) {
            if intersects(Some((l3, l3 + header.header_len()))) {
                self.cache.arp = None;
            }
        }
        let l4 = self.cache.l4_offset;
        if let (Some(header), Some(l4)) = (self.cache.tcp, l4) {
            if intersects(Some((l4, l4 + header.header_len()))) {
                self.cache.tcp = None;
            }
        }
        if let (Some(header), Some(l4)) = (self.cache.udp, l4) {
            if intersects(Some((l4, l4 + header.header_len()))) {
                self.cache.udp = None;
            }
        }
        if let (Some(header), Some(l4)) = (self.cache.icmp, l4) {
            if intersects(Some((l4, l4 + header.header_len()))) {
                self.cache.icmp = None;
            }
        }
    }
}
