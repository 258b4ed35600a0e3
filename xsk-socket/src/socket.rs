//! # AF_XDP socket construction and I/O
//!
//! ## Purpose
//!
//! [`XskSocket`] owns everything one bound AF_XDP socket needs: the file
//! descriptor, the UMEM, the four shared rings and the (interface, queue)
//! pair it is bound to. It exposes the raw ring operations the service
//! worker drives plus copying convenience paths for standalone use.
//!
//! ## How it works
//!
//! Construction follows the kernel's required order: open the socket,
//! map and register the UMEM, size the rings, query the mmap offsets,
//! map each configured ring, then bind. Any failure unwinds the already
//! acquired resources in reverse order through their owners.
//!
//! When both RX and TX rings are configured the UMEM frame pool is split
//! in half: the lower half is donated to the Fill ring for reception, the
//! upper half feeds the copying transmit path. Frames coming back on the
//! Completion ring are routed to whichever half they belong to.
//!
//! ## Main components
//!
//! - [`SocketOptions`]: the immutable option record.
//! - [`XskSocket`]: the socket with `fill`/`complete`/`rx`/`tx`,
//!   `send_packets`/`receive_packets`, `kick` and `poll_readable`.

use crate::error::XskError;
use crate::mmap::OwnedMmap;
use crate::ring::{Ring, RingType, XdpDesc};
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::{io, ptr, slice};

/// Immutable socket option record.
///
/// `frame_size` and every nonzero ring size must be a power of two. A
/// ring size of zero disables that direction; at least one of
/// `rx_ring_size` and `tx_ring_size` must be nonzero.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    /// Total UMEM frames; `num_frames * frame_size` bytes are mapped.
    pub num_frames: usize,
    /// Bytes per frame.
    pub frame_size: usize,
    pub fill_ring_size: usize,
    pub completion_ring_size: usize,
    pub rx_ring_size: usize,
    pub tx_ring_size: usize,
    /// Huge-page backing for the UMEM: forced on, forced off, or probed.
    pub huge_pages: Option<bool>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            num_frames: 4096,
            frame_size: 2048,
            fill_ring_size: 2048,
            completion_ring_size: 2048,
            rx_ring_size: 2048,
            tx_ring_size: 2048,
            huge_pages: None,
        }
    }
}

impl SocketOptions {
    pub fn umem_len(&self) -> usize {
        self.num_frames * self.frame_size
    }

    fn validate(&self) -> Result<(), XskError> {
        if self.rx_ring_size == 0 && self.tx_ring_size == 0 {
            return Err(XskError::MissingRing);
        }
        if self.num_frames == 0 {
            return Err(XskError::InvalidOptions("num_frames must be nonzero"));
        }
        if !self.frame_size.is_power_of_two() {
            return Err(XskError::InvalidOptions("frame_size must be a power of two"));
        }
        for size in [
            self.fill_ring_size,
            self.completion_ring_size,
            self.rx_ring_size,
            self.tx_ring_size,
        ] {
            if size != 0 && !size.is_power_of_two() {
                return Err(XskError::InvalidOptions("ring sizes must be powers of two"));
            }
        }
        if self.fill_ring_size == 0 || self.completion_ring_size == 0 {
            return Err(XskError::InvalidOptions(
                "fill and completion rings must be nonzero",
            ));
        }
        Ok(())
    }
}

/// An AF_XDP socket bound to one (interface, queue) pair.
///
/// The bind takes exclusive ownership of that queue for the lifetime of
/// the socket. All ring operations are non-blocking.
pub struct XskSocket {
    fd: OwnedFd,
    umem: OwnedMmap,
    options: SocketOptions,
    if_index: u32,
    queue_id: u32,
    fill: Ring<u64>,
    completion: Ring<u64>,
    rx: Ring<XdpDesc>,
    tx: Ring<XdpDesc>,
    /// Byte offset where the transmit frame region starts; everything
    /// below it belongs to the fill/RX pool.
    tx_region_base: u64,
    /// Free frames of the transmit region, for the copying send path.
    tx_free: Vec<u64>,
    /// Receive-pool addresses that could not be re-donated because the
    /// fill ring was momentarily full.
    pending_fill: Vec<u64>,
}

// The rings hold raw pointers into socket-owned mappings; the kernel is
// the only other party and the SPSC index protocol covers it.
unsafe impl Send for XskSocket {}

impl XskSocket {
    /// Creates, configures and binds a socket.
    pub fn new(if_index: u32, queue_id: u32, options: SocketOptions) -> Result<Self, XskError> {
        options.validate()?;

        let (fd, raw_fd) = unsafe {
            let fd = libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0);
            if fd < 0 {
                return Err(XskError::SocketCreationFailed(io::Error::last_os_error()));
            }
            (OwnedFd::from_raw_fd(fd), fd)
        };

        let umem = OwnedMmap::map_anonymous(options.umem_len(), options.huge_pages).map_err(
            |source| XskError::SyscallFailed {
                call: "mmap(umem)",
                source,
            },
        )?;
        register_umem(raw_fd, &umem, options.frame_size)?;

        RingType::Fill.set_size(raw_fd, options.fill_ring_size)?;
        RingType::Completion.set_size(raw_fd, options.completion_ring_size)?;
        if options.rx_ring_size > 0 {
            RingType::Rx.set_size(raw_fd, options.rx_ring_size)?;
        }
        if options.tx_ring_size > 0 {
            RingType::Tx.set_size(raw_fd, options.tx_ring_size)?;
        }

        let offsets = ring_offsets(raw_fd)?;
        let fill = RingType::Fill.map(raw_fd, &offsets, options.fill_ring_size)?;
        let completion = RingType::Completion.map(raw_fd, &offsets, options.completion_ring_size)?;
        let rx = if options.rx_ring_size > 0 {
            RingType::Rx.map(raw_fd, &offsets, options.rx_ring_size)?
        } else {
            Ring::default()
        };
        let tx = if options.tx_ring_size > 0 {
            RingType::Tx.map(raw_fd, &offsets, options.tx_ring_size)?
        } else {
            Ring::default()
        };

        let sxdp = libc::sockaddr_xdp {
            sxdp_family: libc::AF_XDP as libc::sa_family_t,
            sxdp_flags: 0,
            sxdp_ifindex: if_index,
            sxdp_queue_id: queue_id,
            sxdp_shared_umem_fd: 0,
        };
        let rc = unsafe {
            libc::bind(
                raw_fd,
                &sxdp as *const libc::sockaddr_xdp as *const libc::sockaddr,
                size_of::<libc::sockaddr_xdp>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(XskError::SyscallFailed {
                call: "bind",
                source: io::Error::last_os_error(),
            });
        }

        let frame_size = options.frame_size as u64;
        let (tx_region_base, tx_frames) = if options.tx_ring_size == 0 {
            (options.umem_len() as u64, 0)
        } else if options.rx_ring_size == 0 {
            (0, options.num_frames)
        } else {
            let rx_frames = options.num_frames / 2;
            (rx_frames as u64 * frame_size, options.num_frames - rx_frames)
        };
        let tx_base_frame = tx_region_base / frame_size;
        let tx_free: Vec<u64> = (tx_base_frame..tx_base_frame + tx_frames as u64)
            .rev()
            .map(|i| i * frame_size)
            .collect();

        Ok(XskSocket {
            fd,
            umem,
            options,
            if_index,
            queue_id,
            fill,
            completion,
            rx,
            tx,
            tx_region_base,
            tx_free,
            pending_fill: Vec::new(),
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    /// Addresses of every frame in the fill/RX pool, for pre-populating
    /// the Fill ring.
    pub fn fill_frame_addrs(&self) -> impl Iterator<Item = u64> + '_ {
        let frame_size = self.options.frame_size as u64;
        let rx_frames = self.tx_region_base / frame_size;
        (0..rx_frames).map(move |i| i * frame_size)
    }

    /// Rounds a descriptor address down to its frame base.
    pub fn frame_base(&self, addr: u64) -> u64 {
        addr & !(self.options.frame_size as u64 - 1)
    }

    /// Donates empty frame addresses to the Fill ring. Returns how many
    /// the ring accepted.
    pub fn fill(&mut self, addrs: &[u64]) -> usize {
        if !self.pending_fill.is_empty() {
            let pending = std::mem::take(&mut self.pending_fill);
            let accepted = self.fill.submit(&pending);
            self.pending_fill.extend_from_slice(&pending[accepted..]);
        }
        self.fill.submit(addrs)
    }

    /// Drains transmitted frame addresses from the Completion ring into
    /// `out`. The addresses are eligible for reuse.
    pub fn complete(&mut self, out: &mut [u64]) -> usize {
        self.completion.drain(out)
    }

    /// Drains received descriptors from the RX ring into `out`.
    pub fn rx(&mut self, out: &mut [XdpDesc]) -> usize {
        self.rx.drain(out)
    }

    /// Submits descriptors to the TX ring. Returns how many the ring
    /// accepted; the caller still has to `kick` for the kernel to start
    /// sending.
    pub fn tx(&mut self, descs: &[XdpDesc]) -> usize {
        self.tx.submit(descs)
    }

    /// Drains the Completion ring and recycles every returned frame:
    /// transmit-region frames go back to the copy-path free list,
    /// receive-pool frames are re-donated to the Fill ring. Returns the
    /// number of completions reaped.
    pub fn reclaim_completions(&mut self) -> usize {
        let mut addrs = [0u64; 64];
        let mut total = 0;
        loop {
            let n = self.completion.drain(&mut addrs);
            if n == 0 {
                break;
            }
            total += n;
            for &addr in &addrs[..n] {
                let base = self.frame_base(addr);
                if base >= self.tx_region_base {
                    self.tx_free.push(base);
                } else {
                    self.pending_fill.push(base);
                }
            }
        }
        if !self.pending_fill.is_empty() {
            let pending = std::mem::take(&mut self.pending_fill);
            let accepted = self.fill.submit(&pending);
            self.pending_fill.extend_from_slice(&pending[accepted..]);
        }
        total
    }

    /// Copies packets into free transmit frames, publishes them on the TX
    /// ring and wakes the kernel. Returns the number queued, which is
    /// bounded by ring space and free frames.
    pub fn send_packets(&mut self, packets: &[&[u8]]) -> Result<usize, XskError> {
        if !self.tx.is_mapped() {
            return Err(XskError::MissingRing);
        }
        self.reclaim_completions();
        let frame_size = self.options.frame_size;
        let mut descs: Vec<XdpDesc> = Vec::with_capacity(packets.len());
        for &packet in packets {
            if packet.len() > frame_size {
                return Err(XskError::BufferTooSmall {
                    buffer: frame_size,
                    frame: packet.len(),
                });
            }
            let Some(addr) = self.tx_free.pop() else {
                break;
            };
            unsafe {
                ptr::copy_nonoverlapping(
                    packet.as_ptr(),
                    self.umem.as_ptr().add(addr as usize),
                    packet.len(),
                );
            }
            descs.push(XdpDesc::new(addr, packet.len() as u32));
        }
        let queued = self.tx.submit(&descs);
        // frames the ring had no room for go straight back to the pool
        for desc in &descs[queued..] {
            self.tx_free.push(desc.addr);
        }
        if queued > 0 {
            self.wake().map_err(XskError::SendFailed)?;
        }
        Ok(queued)
    }

    /// Drains received frames, copying each into the caller's buffer and
    /// returning the actual lengths. The consumed frames are re-donated
    /// to the Fill ring, whether or not the call succeeds.
    pub fn receive_packets(&mut self, bufs: &mut [&mut [u8]]) -> Result<Vec<usize>, XskError> {
        if !self.rx.is_mapped() {
            return Err(XskError::MissingRing);
        }
        let mut descs = vec![XdpDesc::default(); bufs.len()];
        let n = self.rx.drain(&mut descs);
        let recycle = |sock: &mut Self, descs: &[XdpDesc]| {
            let addrs: Vec<u64> = descs.iter().map(|d| sock.frame_base(d.addr)).collect();
            let accepted = sock.fill.submit(&addrs);
            sock.pending_fill.extend_from_slice(&addrs[accepted..]);
        };
        for (i, desc) in descs[..n].iter().enumerate() {
            if bufs[i].len() < desc.len as usize {
                let short = bufs[i].len();
                let frame = desc.len as usize;
                recycle(self, &descs[..n]);
                return Err(XskError::BufferTooSmall {
                    buffer: short,
                    frame,
                });
            }
        }
        let mut lens = Vec::with_capacity(n);
        for (i, desc) in descs[..n].iter().enumerate() {
            let frame = unsafe { self.frame(desc.addr, desc.len as usize) };
            bufs[i][..frame.len()].copy_from_slice(frame);
            lens.push(frame.len());
        }
        recycle(self, &descs[..n]);
        Ok(lens)
    }

    /// Nudges the kernel to dequeue TX and Fill entries. Carries no data.
    pub fn kick(&self) -> Result<(), XskError> {
        self.wake().map_err(XskError::KickFailed)
    }

    fn wake(&self) -> Result<(), io::Error> {
        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                ptr::null(),
                0,
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                ptr::null(),
                0,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                None | Some(libc::EBUSY | libc::ENOBUFS | libc::EAGAIN) => {}
                Some(libc::ENETDOWN) => {
                    log::warn!(
                        "interface index {} is down, wake-up skipped",
                        self.if_index
                    );
                }
                Some(_) => return Err(err),
            }
        }
        Ok(())
    }

    /// Waits up to `timeout_ms` for the socket to become readable.
    /// Returns `Ok(false)` on timeout or interruption.
    pub fn poll_readable(&self, timeout_ms: i32) -> Result<bool, XskError> {
        poll_fd_readable(self.fd.as_raw_fd(), timeout_ms)
    }

    /// Immutable view of a frame's valid bytes.
    ///
    /// # Safety
    ///
    /// `addr`/`len` must describe a frame the user side currently owns
    /// and no mutable view of the same frame may be live.
    pub unsafe fn frame<'a>(&self, addr: u64, len: usize) -> &'a [u8] {
        debug_assert!(addr as usize + len <= self.umem.len());
        slice::from_raw_parts(self.umem.as_ptr().add(addr as usize), len)
    }

    /// Mutable view of a frame's valid bytes.
    ///
    /// # Safety
    ///
    /// Same as [`Self::frame`], and no two views of the same frame may be
    /// live at once.
    pub unsafe fn frame_mut<'a>(&self, addr: u64, len: usize) -> &'a mut [u8] {
        debug_assert!(addr as usize + len <= self.umem.len());
        slice::from_raw_parts_mut(self.umem.as_ptr().add(addr as usize), len)
    }
}

/// Waits up to `timeout_ms` for a descriptor to become readable.
/// Returns `Ok(false)` on timeout or interruption.
pub fn poll_fd_readable(fd: RawFd, timeout_ms: i32) -> Result<bool, XskError> {
    if fd < 0 {
        return Err(XskError::InvalidFileDescriptor);
    }
    let mut fds = [libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }];
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(XskError::SyscallFailed {
            call: "poll",
            source: err,
        });
    }
    Ok(rc > 0 && fds[0].revents & libc::POLLIN != 0)
}

/// Registers the UMEM region with the socket.
pub(crate) fn register_umem(
    raw_fd: libc::c_int,
    umem: &OwnedMmap,
    frame_size: usize,
) -> Result<(), XskError> {
    if raw_fd < 0 {
        return Err(XskError::InvalidFileDescriptor);
    }
    let reg = unsafe {
        libc::xdp_umem_reg {
            addr: umem.as_void_ptr() as u64,
            len: umem.len() as u64,
            chunk_size: frame_size as u32,
            ..std::mem::zeroed()
        }
    };
    let rc = unsafe {
        libc::setsockopt(
            raw_fd,
            libc::SOL_XDP,
            libc::XDP_UMEM_REG,
            &reg as *const libc::xdp_umem_reg as *const libc::c_void,
            size_of::<libc::xdp_umem_reg>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(XskError::SyscallFailed {
            call: "setsockopt(XDP_UMEM_REG)",
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Queries the kernel for the mmap offsets of all four rings.
pub(crate) fn ring_offsets(raw_fd: libc::c_int) -> Result<libc::xdp_mmap_offsets, XskError> {
    if raw_fd < 0 {
        return Err(XskError::InvalidFileDescriptor);
    }
    let mut offsets: libc::xdp_mmap_offsets = unsafe { std::mem::zeroed() };
    let mut optlen = size_of::<libc::xdp_mmap_offsets>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            raw_fd,
            libc::SOL_XDP,
            libc::XDP_MMAP_OFFSETS,
            &mut offsets as *mut libc::xdp_mmap_offsets as *mut libc::c_void,
            &mut optlen,
        )
    };
    if rc < 0 {
        return Err(XskError::SyscallFailed {
            call: "getsockopt(XDP_MMAP_OFFSETS)",
            source: io::Error::last_os_error(),
        });
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_require_at_least_one_data_ring() {
        let options = SocketOptions {
            rx_ring_size: 0,
            tx_ring_size: 0,
            ..SocketOptions::default()
        };
        assert!(matches!(options.validate(), Err(XskError::MissingRing)));
    }

    #[test]
    fn options_reject_non_power_of_two_sizes() {
        let options = SocketOptions {
            frame_size: 1500,
            ..SocketOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(XskError::InvalidOptions(_))
        ));
        let options = SocketOptions {
            rx_ring_size: 100,
            ..SocketOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(XskError::InvalidOptions(_))
        ));
    }

    #[test]
    fn default_options_are_valid() {
        assert!(SocketOptions::default().validate().is_ok());
        assert_eq!(SocketOptions::default().umem_len(), 4096 * 2048);
    }

    #[test]
    fn single_direction_options_are_valid() {
        let rx_only = SocketOptions {
            tx_ring_size: 0,
            ..SocketOptions::default()
        };
        assert!(rx_only.validate().is_ok());
        let tx_only = SocketOptions {
            rx_ring_size: 0,
            ..SocketOptions::default()
        };
        assert!(tx_only.validate().is_ok());
    }
}
