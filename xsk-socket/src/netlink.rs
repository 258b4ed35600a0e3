//! # Netlink control plane
//!
//! ## Purpose
//!
//! Two jobs, both over `NETLINK_ROUTE`: enumerating the system's network
//! interfaces (the directory the service resolves names against), and
//! installing or removing an XDP program on an interface's hook.
//!
//! ## How it works
//!
//! Interface enumeration sends a `GetLink` dump request and folds the
//! multi-part response through the typed netlink-packet messages.
//!
//! The attach path is a `RTM_SETLINK` request with `NLM_F_REQUEST |
//! NLM_F_ACK` carrying an interface-info header and a nested `IFLA_XDP`
//! attribute holding the program file descriptor and the flag word. The
//! kernel's `NLMSG_ERROR` acknowledgement carries the errno, zero for
//! success. Detaching is the same message with the descriptor set to -1.

use netlink_packet_core::{
    NetlinkDeserializable, NetlinkMessage, NetlinkPayload, NetlinkSerializable, NLM_F_DUMP,
    NLM_F_REQUEST,
};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{Socket, SocketAddr};
use std::io;
use std::mem::size_of;
use std::os::fd::RawFd;
use thiserror::Error;

const IFLA_XDP: u16 = 43;
const IFLA_XDP_FD: u16 = 1;
const IFLA_XDP_FLAGS: u16 = 3;
const NLA_F_NESTED: u16 = 0x8000;
const NLMSG_HDRLEN: usize = 16;

#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("netlink I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The kernel acknowledged the request with a nonzero errno.
    #[error("kernel rejected the request: {0}")]
    Nack(#[source] io::Error),

    #[error("malformed netlink reply")]
    Malformed,
}

/// One entry of the interface directory.
#[derive(Clone, Debug, Default)]
pub struct Link {
    pub if_index: u32,
    pub name: String,
    pub mtu: u32,
    pub mac: [u8; 6],
}

/// Sends a dump request and folds every message of the multi-part
/// response through `f`.
fn dump<T, F, R>(mut req: NetlinkMessage<T>, f: F) -> Result<Vec<R>, NetlinkError>
where
    T: NetlinkSerializable + NetlinkDeserializable,
    F: Fn(NetlinkMessage<T>) -> Option<R>,
{
    let mut socket = Socket::new(netlink_sys::constants::NETLINK_ROUTE)?;
    socket.bind(&SocketAddr::new(0, 0))?;
    req.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
    req.finalize();
    let mut send_buf = vec![0u8; req.buffer_len()];
    req.serialize(&mut send_buf);
    if socket.send(send_buf.as_slice(), 0)? != send_buf.len() {
        return Err(NetlinkError::Io(io::Error::other(
            "short write on netlink request",
        )));
    }

    let mut result = Vec::new();
    loop {
        let (recv_buf, _) = socket.recv_from_full()?;
        let mut view = &recv_buf[..];
        while !view.is_empty() {
            let msg = NetlinkMessage::<T>::deserialize(view)
                .map_err(|_| NetlinkError::Malformed)?;
            let len = msg.header.length as usize;
            if len == 0 || len > view.len() {
                return Err(NetlinkError::Malformed);
            }
            match msg.payload {
                NetlinkPayload::Done(_) => return Ok(result),
                NetlinkPayload::Error(e) => {
                    let errno = e.raw_code();
                    if errno != 0 {
                        return Err(NetlinkError::Nack(io::Error::from_raw_os_error(-errno)));
                    }
                    return Ok(result);
                }
                _ => {
                    if let Some(r) = f(msg) {
                        result.push(r);
                    }
                }
            }
            view = &view[len..];
        }
    }
}

/// Enumerates every network interface known to the kernel.
pub fn get_links() -> Result<Vec<Link>, NetlinkError> {
    let req = NetlinkMessage::from(RouteNetlinkMessage::GetLink(LinkMessage::default()));
    dump(req, |msg| match msg.payload {
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(ref link_msg)) => {
            let mut link = Link {
                if_index: link_msg.header.index,
                ..Default::default()
            };
            for attr in link_msg.attributes.iter() {
                match attr {
                    LinkAttribute::IfName(name) => link.name = name.to_string(),
                    LinkAttribute::Mtu(mtu) => link.mtu = *mtu,
                    LinkAttribute::Address(mac) => {
                        if mac.len() == 6 {
                            link.mac.copy_from_slice(&mac[..6]);
                        }
                    }
                    _ => {}
                }
            }
            Some(link)
        }
        _ => None,
    })
}

/// Resolves an interface name to its index through the link directory.
pub fn ifindex_by_name(name: &str) -> Result<Option<u32>, NetlinkError> {
    Ok(get_links()?
        .into_iter()
        .find(|link| link.name == name)
        .map(|link| link.if_index))
}

/// Installs `prog_fd` on the interface's XDP hook.
pub fn attach_xdp(if_index: u32, prog_fd: RawFd, flags: u32) -> Result<(), NetlinkError> {
    set_link_xdp(if_index, prog_fd, flags)
}

/// Removes whatever program is installed on the interface's XDP hook.
/// Succeeds if nothing is attached.
pub fn detach_xdp(if_index: u32) -> Result<(), NetlinkError> {
    set_link_xdp(if_index, -1, 0)
}

fn set_link_xdp(if_index: u32, prog_fd: RawFd, flags: u32) -> Result<(), NetlinkError> {
    let mut socket = Socket::new(netlink_sys::constants::NETLINK_ROUTE)?;
    socket.bind(&SocketAddr::new(0, 0))?;

    let req = build_setlink_xdp(if_index, prog_fd, flags);
    if socket.send(&req, 0)? != req.len() {
        return Err(NetlinkError::Io(io::Error::other(
            "short write on netlink request",
        )));
    }

    let (reply, _) = socket.recv_from_full()?;
    parse_ack(&reply)
}

/// Encodes the `RTM_SETLINK` request carrying the nested XDP attribute.
fn build_setlink_xdp(if_index: u32, prog_fd: RawFd, flags: u32) -> Vec<u8> {
    let mut req = vec![0u8; NLMSG_HDRLEN];

    // struct ifinfomsg: family, pad, type, index, flags, change
    req.push(libc::AF_UNSPEC as u8);
    req.push(0);
    req.extend_from_slice(&0u16.to_ne_bytes());
    req.extend_from_slice(&(if_index as i32).to_ne_bytes());
    req.extend_from_slice(&0u32.to_ne_bytes());
    req.extend_from_slice(&0u32.to_ne_bytes());

    let mut xdp = Vec::with_capacity(16);
    put_attr(&mut xdp, IFLA_XDP_FD, &(prog_fd as i32).to_ne_bytes());
    put_attr(&mut xdp, IFLA_XDP_FLAGS, &flags.to_ne_bytes());
    put_attr(&mut req, IFLA_XDP | NLA_F_NESTED, &xdp);

    let hdr = libc::nlmsghdr {
        nlmsg_len: req.len() as u32,
        nlmsg_type: libc::RTM_SETLINK,
        nlmsg_flags: (libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16,
        nlmsg_seq: 1,
        nlmsg_pid: 0,
    };
    req[..NLMSG_HDRLEN].copy_from_slice(unsafe {
        std::slice::from_raw_parts(&hdr as *const libc::nlmsghdr as *const u8, NLMSG_HDRLEN)
    });
    req
}

/// Appends one netlink attribute, padded to the 4-byte alignment the
/// protocol requires.
fn put_attr(buf: &mut Vec<u8>, attr_type: u16, payload: &[u8]) {
    let attr_len = (4 + payload.len()) as u16;
    buf.extend_from_slice(&attr_len.to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(payload);
    let padded = (payload.len() + 3) & !3;
    buf.resize(buf.len() + padded - payload.len(), 0);
}

/// Extracts the errno from an `NLMSG_ERROR` acknowledgement.
fn parse_ack(reply: &[u8]) -> Result<(), NetlinkError> {
    if reply.len() < NLMSG_HDRLEN + size_of::<i32>() {
        return Err(NetlinkError::Malformed);
    }
    let msg_type = u16::from_ne_bytes([reply[4], reply[5]]);
    if msg_type != libc::NLMSG_ERROR as u16 {
        return Err(NetlinkError::Malformed);
    }
    let errno = i32::from_ne_bytes([reply[16], reply[17], reply[18], reply[19]]);
    if errno != 0 {
        return Err(NetlinkError::Nack(io::Error::from_raw_os_error(-errno)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_are_padded_to_four_bytes() {
        let mut buf = Vec::new();
        put_attr(&mut buf, IFLA_XDP_FD, &5i32.to_ne_bytes());
        assert_eq!(buf.len(), 8);
        assert_eq!(u16::from_ne_bytes([buf[0], buf[1]]), 8);
        assert_eq!(u16::from_ne_bytes([buf[2], buf[3]]), IFLA_XDP_FD);

        let mut odd = Vec::new();
        put_attr(&mut odd, 99, &[1, 2, 3]);
        assert_eq!(odd.len(), 8);
        assert_eq!(u16::from_ne_bytes([odd[0], odd[1]]), 7);
        assert_eq!(&odd[4..], &[1, 2, 3, 0]);
    }

    #[test]
    fn setlink_request_layout() {
        let req = build_setlink_xdp(9, 33, 0x6);
        assert_eq!(u32::from_ne_bytes(req[0..4].try_into().unwrap()), req.len() as u32);
        assert_eq!(
            u16::from_ne_bytes([req[4], req[5]]),
            libc::RTM_SETLINK
        );
        // ifinfomsg index
        assert_eq!(
            i32::from_ne_bytes(req[20..24].try_into().unwrap()),
            9
        );
        // nested attribute header follows the 16-byte ifinfomsg
        let nested_type = u16::from_ne_bytes([req[34], req[35]]);
        assert_eq!(nested_type, IFLA_XDP | NLA_F_NESTED);
        // first nested attribute is the program fd
        assert_eq!(u16::from_ne_bytes([req[38], req[39]]), IFLA_XDP_FD);
        assert_eq!(
            i32::from_ne_bytes(req[40..44].try_into().unwrap()),
            33
        );
        // second is the flag word
        assert_eq!(u16::from_ne_bytes([req[46], req[47]]), IFLA_XDP_FLAGS);
        assert_eq!(
            u32::from_ne_bytes(req[48..52].try_into().unwrap()),
            0x6
        );
    }

    #[test]
    fn ack_parsing() {
        let mut ok = vec![0u8; 36];
        ok[4] = libc::NLMSG_ERROR as u8;
        assert!(parse_ack(&ok).is_ok());

        let mut nack = ok.clone();
        nack[16..20].copy_from_slice(&(-(libc::EBUSY)).to_ne_bytes());
        match parse_ack(&nack) {
            Err(NetlinkError::Nack(e)) => {
                assert_eq!(e.raw_os_error(), Some(libc::EBUSY));
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(matches!(parse_ack(&[0u8; 4]), Err(NetlinkError::Malformed)));
    }
}
