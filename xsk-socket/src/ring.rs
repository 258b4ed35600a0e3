//! # Shared ring buffers
//!
//! ## Purpose
//!
//! The four rings of an AF_XDP socket are single-producer/single-consumer
//! circular buffers living in memory mapped from the socket descriptor.
//! One side of each ring belongs to this process, the other to the kernel:
//! the user produces on Fill and TX and consumes on RX and Completion.
//!
//! ## How it works
//!
//! [`Ring`] keeps the kernel-shared producer and consumer indices behind
//! raw `AtomicU32` pointers and caches a local copy of the index it owns
//! plus an acquire-refreshed snapshot of the peer index. `submit` writes
//! entries first and publishes the producer index last with release
//! ordering; `drain` snapshots the peer producer with acquire ordering
//! before reading entries. Indices grow monotonically and wrap through
//! masking with `len - 1`, so `producer - consumer` in wrapping arithmetic
//! is always the number of readable entries.
//!
//! ## Main components
//!
//! - [`Ring`]: a mapped ring with `submit`/`drain` operations.
//! - [`RingMmap`]: the raw mapped components of one ring.
//! - [`XdpDesc`]: the 16-byte frame descriptor used by RX and TX.
//! - [`RingType`]: per-ring socket option names and mmap page offsets.

use crate::error::XskError;
use crate::mmap::OwnedMmap;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};
use std::{io, ptr};

/// A frame descriptor, bit-compatible with `struct xdp_desc`.
///
/// `addr` is a byte offset into the UMEM, `len` the number of valid bytes
/// starting there. `options` is reserved by the kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

impl XdpDesc {
    pub fn new(addr: u64, len: u32) -> Self {
        XdpDesc {
            addr,
            len,
            options: 0,
        }
    }
}

/// Raw mapped components of one ring: the owned mapping plus pointers to
/// the producer index, consumer index, descriptor array and flags word
/// inside it.
pub struct RingMmap<T> {
    pub(crate) mmap: OwnedMmap,
    producer: *mut AtomicU32,
    consumer: *mut AtomicU32,
    desc: *mut T,
    flags: *mut AtomicU32,
}

impl<T> Default for RingMmap<T> {
    fn default() -> Self {
        RingMmap {
            mmap: OwnedMmap::null(),
            producer: ptr::null_mut(),
            consumer: ptr::null_mut(),
            desc: ptr::null_mut(),
            flags: ptr::null_mut(),
        }
    }
}

/// One side of a kernel-shared SPSC ring.
///
/// A defaulted ring is unmapped: it reports zero capacity and both
/// operations return 0. Disabled RX or TX sides are represented this way.
pub struct Ring<T> {
    mmap: RingMmap<T>,
    len: usize,
    mod_mask: u32,
    /// Mirror of the shared index this side owns.
    local_prod: u32,
    local_cons: u32,
    /// Last observed value of the peer-owned index.
    cached_prod: u32,
    cached_cons: u32,
}

impl<T> Default for Ring<T> {
    fn default() -> Self {
        Ring {
            mmap: RingMmap::default(),
            len: 0,
            mod_mask: 0,
            local_prod: 0,
            local_cons: 0,
            cached_prod: 0,
            cached_cons: 0,
        }
    }
}

impl<T: Copy> Ring<T> {
    /// Maps a ring of `len` entries from the socket descriptor at the
    /// given page offset, interpreting the kernel-supplied field offsets.
    pub fn map(
        fd: i32,
        len: usize,
        page_offset: u64,
        offsets: &libc::xdp_ring_offset,
    ) -> Result<Self, io::Error> {
        debug_assert!(len.is_power_of_two());
        Ok(Ring {
            mmap: mmap_ring(fd, len * size_of::<T>(), offsets, page_offset)?,
            len,
            mod_mask: len as u32 - 1,
            local_prod: 0,
            local_cons: 0,
            cached_prod: 0,
            cached_cons: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn is_mapped(&self) -> bool {
        self.len != 0
    }

    /// Readable entries as seen by the last peer snapshot.
    pub fn pending(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        self.cached_prod.wrapping_sub(self.local_cons) as usize
    }

    fn shared_producer(&self) -> u32 {
        unsafe { (*self.mmap.producer).load(Ordering::Acquire) }
    }

    fn shared_consumer(&self) -> u32 {
        unsafe { (*self.mmap.consumer).load(Ordering::Acquire) }
    }

    fn publish_producer(&mut self, value: u32) {
        unsafe { (*self.mmap.producer).store(value, Ordering::Release) }
    }

    fn publish_consumer(&mut self, value: u32) {
        unsafe { (*self.mmap.consumer).store(value, Ordering::Release) }
    }

    /// Whether the kernel asked to be woken before it will look at this
    /// ring again.
    pub fn needs_wakeup(&self) -> bool {
        if self.mmap.flags.is_null() {
            return false;
        }
        unsafe { (*self.mmap.flags).load(Ordering::Relaxed) & libc::XDP_RING_NEED_WAKEUP != 0 }
    }

    /// Producer-side operation: writes as many of `items` as there is
    /// free space for, publishes the new producer index, and returns the
    /// number accepted.
    pub fn submit(&mut self, items: &[T]) -> usize {
        if self.len == 0 || items.is_empty() {
            return 0;
        }
        let mut free = self.len as u32 - self.local_prod.wrapping_sub(self.cached_cons);
        if (free as usize) < items.len() {
            self.cached_cons = self.shared_consumer();
            free = self.len as u32 - self.local_prod.wrapping_sub(self.cached_cons);
        }
        let n = items.len().min(free as usize);
        if n == 0 {
            return 0;
        }
        for (i, item) in items[..n].iter().enumerate() {
            let slot = (self.local_prod.wrapping_add(i as u32) & self.mod_mask) as usize;
            unsafe { ptr::write(self.mmap.desc.add(slot), *item) };
        }
        self.local_prod = self.local_prod.wrapping_add(n as u32);
        self.publish_producer(self.local_prod);
        n
    }

    /// Consumer-side operation: copies out up to `out.len()` readable
    /// entries, publishes the new consumer index, and returns the number
    /// copied.
    pub fn drain(&mut self, out: &mut [T]) -> usize {
        if self.len == 0 || out.is_empty() {
            return 0;
        }
        let mut avail = self.cached_prod.wrapping_sub(self.local_cons);
        if (avail as usize) < out.len() {
            self.cached_prod = self.shared_producer();
            avail = self.cached_prod.wrapping_sub(self.local_cons);
        }
        let n = out.len().min(avail as usize);
        if n == 0 {
            return 0;
        }
        for (i, slot_out) in out[..n].iter_mut().enumerate() {
            let slot = (self.local_cons.wrapping_add(i as u32) & self.mod_mask) as usize;
            *slot_out = unsafe { ptr::read(self.mmap.desc.add(slot)) };
        }
        self.local_cons = self.local_cons.wrapping_add(n as u32);
        self.publish_consumer(self.local_cons);
        n
    }
}

/// Maps a single ring through the socket descriptor.
///
/// The mapping covers the kernel header area (indices, flags) followed by
/// the descriptor array; the field offsets inside it come from the
/// `XDP_MMAP_OFFSETS` query.
fn mmap_ring<T>(
    fd: i32,
    desc_bytes: usize,
    offsets: &libc::xdp_ring_offset,
    page_offset: u64,
) -> Result<RingMmap<T>, io::Error> {
    let map_size = (offsets.desc as usize).saturating_add(desc_bytes);
    let map_addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            map_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd,
            page_offset as i64,
        )
    };
    if map_addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(RingMmap {
        mmap: OwnedMmap::from_raw(map_addr, map_size),
        producer: unsafe { map_addr.add(offsets.producer as usize) as *mut AtomicU32 },
        consumer: unsafe { map_addr.add(offsets.consumer as usize) as *mut AtomicU32 },
        desc: unsafe { map_addr.add(offsets.desc as usize) as *mut T },
        flags: unsafe { map_addr.add(offsets.flags as usize) as *mut AtomicU32 },
    })
}

/// The four ring kinds and their kernel plumbing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RingType {
    Fill,
    Completion,
    Rx,
    Tx,
}

impl RingType {
    fn sockopt(&self) -> libc::c_int {
        match self {
            RingType::Fill => libc::XDP_UMEM_FILL_RING,
            RingType::Completion => libc::XDP_UMEM_COMPLETION_RING,
            RingType::Rx => libc::XDP_RX_RING,
            RingType::Tx => libc::XDP_TX_RING,
        }
    }

    fn page_offset(&self) -> u64 {
        match self {
            RingType::Fill => libc::XDP_UMEM_PGOFF_FILL_RING,
            RingType::Completion => libc::XDP_UMEM_PGOFF_COMPLETION_RING,
            RingType::Rx => libc::XDP_PGOFF_RX_RING as u64,
            RingType::Tx => libc::XDP_PGOFF_TX_RING as u64,
        }
    }

    pub(crate) fn sockopt_name(&self) -> &'static str {
        match self {
            RingType::Fill => "setsockopt(XDP_UMEM_FILL_RING)",
            RingType::Completion => "setsockopt(XDP_UMEM_COMPLETION_RING)",
            RingType::Rx => "setsockopt(XDP_RX_RING)",
            RingType::Tx => "setsockopt(XDP_TX_RING)",
        }
    }

    /// Tells the kernel how many entries this ring gets.
    pub fn set_size(self, raw_fd: libc::c_int, ring_size: usize) -> Result<(), XskError> {
        let ring_size = ring_size as u32;
        let rc = unsafe {
            libc::setsockopt(
                raw_fd,
                libc::SOL_XDP,
                self.sockopt(),
                &ring_size as *const u32 as *const libc::c_void,
                size_of::<u32>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(XskError::SyscallFailed {
                call: self.sockopt_name(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Maps this ring using the offsets the kernel reported for it.
    pub fn map<T: Copy>(
        self,
        raw_fd: libc::c_int,
        offsets: &libc::xdp_mmap_offsets,
        ring_size: usize,
    ) -> Result<Ring<T>, XskError> {
        let ring_offsets = match self {
            RingType::Fill => &offsets.fr,
            RingType::Completion => &offsets.cr,
            RingType::Rx => &offsets.rx,
            RingType::Tx => &offsets.tx,
        };
        Ring::<T>::map(raw_fd, ring_size, self.page_offset(), ring_offsets).map_err(|source| {
            XskError::SyscallFailed {
                call: "mmap(ring)",
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a ring over an anonymous mapping laid out like the kernel
    /// does it: producer, consumer, flags words, then the entry array.
    fn test_ring<T: Copy>(len: usize) -> Ring<T> {
        let header = 16usize;
        let map =
            OwnedMmap::map_anonymous(header + len * size_of::<T>(), Some(false)).unwrap();
        let base = map.as_ptr();
        Ring {
            mmap: RingMmap {
                producer: base as *mut AtomicU32,
                consumer: unsafe { base.add(4) } as *mut AtomicU32,
                flags: unsafe { base.add(8) } as *mut AtomicU32,
                desc: unsafe { base.add(header) } as *mut T,
                mmap: map,
            },
            len,
            mod_mask: len as u32 - 1,
            local_prod: 0,
            local_cons: 0,
            cached_prod: 0,
            cached_cons: 0,
        }
    }

    /// Plays the kernel side of a ring: consumes `n` entries.
    fn kernel_consume<T: Copy>(ring: &Ring<T>, n: u32) {
        unsafe {
            let cur = (*ring.mmap.consumer).load(Ordering::Acquire);
            (*ring.mmap.consumer).store(cur.wrapping_add(n), Ordering::Release);
        }
    }

    /// Plays the kernel side of a ring: produces the given entries.
    fn kernel_produce<T: Copy>(ring: &Ring<T>, items: &[T]) {
        unsafe {
            let mut cur = (*ring.mmap.producer).load(Ordering::Acquire);
            for item in items {
                ptr::write(ring.mmap.desc.add((cur & ring.mod_mask) as usize), *item);
                cur = cur.wrapping_add(1);
            }
            (*ring.mmap.producer).store(cur, Ordering::Release);
        }
    }

    #[test]
    fn submit_accepts_up_to_free_space() {
        let mut ring = test_ring::<u64>(4);
        let addrs: Vec<u64> = (0..6).map(|i| i * 2048).collect();
        assert_eq!(ring.submit(&addrs), 4);
        // full now, nothing more fits
        assert_eq!(ring.submit(&addrs), 0);
        kernel_consume(&ring, 3);
        assert_eq!(ring.submit(&addrs[4..]), 2);
    }

    #[test]
    fn drain_returns_zero_when_empty() {
        let mut ring = test_ring::<u64>(8);
        let mut out = [0u64; 8];
        assert_eq!(ring.drain(&mut out), 0);
    }

    #[test]
    fn drain_is_bounded_by_out_slice() {
        let mut ring = test_ring::<u64>(8);
        kernel_produce(&ring, &[10, 20, 30, 40, 50]);
        let mut out = [0u64; 2];
        assert_eq!(ring.drain(&mut out), 2);
        assert_eq!(out, [10, 20]);
        let mut rest = [0u64; 8];
        assert_eq!(ring.drain(&mut rest), 3);
        assert_eq!(&rest[..3], &[30, 40, 50]);
    }

    #[test]
    fn indices_wrap_across_the_ring_boundary() {
        let mut ring = test_ring::<XdpDesc>(4);
        let mut out = [XdpDesc::default(); 4];
        for round in 0u64..10 {
            let descs: Vec<XdpDesc> =
                (0..3).map(|i| XdpDesc::new((round * 3 + i) * 2048, 64)).collect();
            kernel_produce(&ring, &descs);
            assert_eq!(ring.drain(&mut out), 3);
            assert_eq!(out[0].addr, round * 3 * 2048);
            assert_eq!(out[2].addr, (round * 3 + 2) * 2048);
        }
    }

    #[test]
    fn submitted_entries_are_visible_in_order() {
        let mut ring = test_ring::<XdpDesc>(8);
        let descs: Vec<XdpDesc> = (0..5).map(|i| XdpDesc::new(i * 4096, i as u32)).collect();
        assert_eq!(ring.submit(&descs), 5);
        unsafe {
            assert_eq!((*ring.mmap.producer).load(Ordering::Acquire), 5);
            for (i, d) in descs.iter().enumerate() {
                assert_eq!(ptr::read(ring.mmap.desc.add(i)), *d);
            }
        }
    }

    #[test]
    fn unmapped_ring_is_inert() {
        let mut ring = Ring::<u64>::default();
        assert!(!ring.is_mapped());
        assert_eq!(ring.submit(&[1, 2, 3]), 0);
        let mut out = [0u64; 4];
        assert_eq!(ring.drain(&mut out), 0);
        assert!(!ring.needs_wakeup());
    }
}
