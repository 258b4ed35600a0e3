//! Raw-socket frame injection, the external path the service is
//! observed through.

use std::ffi::CString;
use std::io::{Error, Result};
use std::mem::size_of;
use std::net::Ipv4Addr;
use xsk_flow::proto::{ethernet, ipv4, EthernetHeader, Ipv4Header, UdpHeader};

/// Sends one Ethernet frame on the named interface through an
/// `AF_PACKET` socket.
pub fn send_frame(if_name: &str, frame: &[u8]) -> Result<()> {
    let name = CString::new(if_name).map_err(Error::other)?;
    let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if ifindex == 0 {
        return Err(Error::last_os_error());
    }
    let protocol = (libc::ETH_P_ALL as u16).to_be();
    let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol as i32) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = protocol;
    addr.sll_ifindex = ifindex as i32;
    addr.sll_halen = 6;
    addr.sll_addr[..6].copy_from_slice(&frame[..6]);
    let rc = unsafe {
        libc::sendto(
            fd,
            frame.as_ptr() as *const libc::c_void,
            frame.len(),
            0,
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    let err = Error::last_os_error();
    unsafe { libc::close(fd) };
    if rc < 0 {
        return Err(err);
    }
    Ok(())
}

/// Builds a broadcast Ethernet/IPv4/UDP frame with `payload_len` bytes
/// of payload; 20 payload bytes give the classic 62-byte test frame.
pub fn broadcast_udp_frame(src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Vec<u8> {
    let total = ethernet::HEADER_LEN + ipv4::MIN_HEADER_LEN + 8 + payload_len;
    let mut frame = vec![0u8; total];
    EthernetHeader {
        destination: [0xff; 6],
        source: [0x02, 0, 0, 0, 0, 0x01],
        ethertype: ethernet::ETHERTYPE_IPV4,
    }
    .write(&mut frame)
    .expect("frame sized for the headers");
    let mut ip = Ipv4Header {
        version: 4,
        ihl: 5,
        dscp: 0,
        ecn: 0,
        total_length: (ipv4::MIN_HEADER_LEN + 8 + payload_len) as u16,
        identification: 0x4242,
        flags: 0,
        fragment_offset: 0,
        ttl: 64,
        protocol: ipv4::PROTO_UDP,
        checksum: 0,
        source: src,
        destination: dst,
    };
    ip.checksum = ip.compute_checksum().expect("fixed-size header");
    ip.write(&mut frame[14..]).expect("frame sized for the headers");
    UdpHeader {
        source_port: 9000,
        destination_port: 9001,
        length: (8 + payload_len) as u16,
        checksum: 0,
    }
    .write(&mut frame[34..])
    .expect("frame sized for the headers");
    for (i, byte) in frame[42..].iter_mut().enumerate() {
        *byte = i as u8;
    }
    frame
}
