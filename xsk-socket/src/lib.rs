//! # AF_XDP socket runtime
//!
//! ## Purpose
//!
//! This crate carries the kernel-facing half of the packet service: the
//! AF_XDP socket with its UMEM and four shared rings, the in-kernel
//! redirect program with its two control maps, and the netlink surface
//! used to enumerate interfaces and to install the program on an XDP hook.
//!
//! ## Main components
//!
//! - [`XskSocket`]: an AF_XDP socket bound to one (interface, queue) pair,
//!   owning its UMEM and the Fill/Completion/RX/TX rings.
//! - [`RedirectProgram`]: the in-kernel filter that steers frames from an
//!   RX queue into a registered socket, plus its `queue_enable` and
//!   `queue_to_socket` maps.
//! - [`netlink`]: interface directory lookup and the XDP attach/detach
//!   control path.

pub mod bpf;
pub mod error;
pub mod mmap;
pub mod netlink;
pub mod redirect;
pub mod ring;
pub mod socket;

pub use error::{RedirectError, XskError};
pub use mmap::OwnedMmap;
pub use redirect::{
    RedirectProgram, XDP_FLAGS_DEFAULT, XDP_FLAGS_DRV_MODE, XDP_FLAGS_HW_MODE,
    XDP_FLAGS_REPLACE, XDP_FLAGS_SKB_MODE, XDP_FLAGS_UPDATE_IF_NOEXIST,
};
pub use ring::{Ring, RingType, XdpDesc};
pub use socket::{SocketOptions, XskSocket};
