//! Veth pair lifecycle for the end-to-end binaries.
//!
//! The pair is an RAII guard in the same spirit as the crate's owning
//! types: constructing it brings both ends up with addresses assigned,
//! dropping it deletes the link again, error paths included.

use crate::suite::command::sudo;
use std::io::Result;
use std::net::Ipv4Addr;
use std::process::Command;

/// One end of the pair: its device name and host address.
pub struct VethEnd {
    pub dev: &'static str,
    pub addr: Ipv4Addr,
}

/// A connected veth pair, deleted on drop.
pub struct VethPair {
    pub a: VethEnd,
    pub b: VethEnd,
}

impl VethPair {
    /// Brings the test pair up. A pair left behind by an interrupted
    /// run is reused as is.
    pub fn up() -> Result<Self> {
        let pair = VethPair {
            a: VethEnd {
                dev: "xskflowA",
                addr: Ipv4Addr::new(192, 168, 90, 1),
            },
            b: VethEnd {
                dev: "xskflowB",
                addr: Ipv4Addr::new(192, 168, 90, 2),
            },
        };
        if link_exists(pair.a.dev)? {
            log::info!("reusing leftover veth pair {}/{}", pair.a.dev, pair.b.dev);
            return Ok(pair);
        }
        sudo(&[
            "ip", "link", "add", pair.a.dev, "type", "veth", "peer", "name", pair.b.dev,
        ])?;
        for end in [&pair.a, &pair.b] {
            sudo(&["ip", "addr", "add", &format!("{}/24", end.addr), "dev", end.dev])?;
            sudo(&["ip", "link", "set", end.dev, "up"])?;
        }
        log::info!("veth pair {} <-> {} is up", pair.a.dev, pair.b.dev);
        Ok(pair)
    }
}

impl Drop for VethPair {
    fn drop(&mut self) {
        // deleting one end removes its peer with it
        if let Err(e) = sudo(&["ip", "link", "del", self.a.dev]) {
            log::warn!("leaving veth pair {} behind: {e}", self.a.dev);
        }
    }
}

fn link_exists(dev: &str) -> Result<bool> {
    Ok(Command::new("ip")
        .args(["link", "show", dev])
        .output()?
        .status
        .success())
}
