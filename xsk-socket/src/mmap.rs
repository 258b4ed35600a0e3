//! # UMEM memory mapping
//!
//! ## Purpose
//!
//! Owning wrapper around the anonymous mapping that backs a socket's UMEM.
//! The region is mapped read/write, private and pre-populated so the
//! kernel never takes a fault on the hot path, and optionally backed by
//! 2 MiB huge pages when the system has free ones.
//!
//! ## Main components
//!
//! - [`OwnedMmap`]: owns the mapping and unmaps it on drop.
//! - [`get_hugepage_info`]: parses `/proc/meminfo` to decide whether
//!   huge-page backing is worth requesting.

use std::fs::File;
use std::io::{BufRead as _, BufReader};
use std::{io, ptr};

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// An owned, page-aligned memory mapping.
///
/// Unmapped on drop; a failed `munmap` is logged rather than propagated
/// because drop has nowhere to report it.
pub struct OwnedMmap {
    ptr: *mut libc::c_void,
    len: usize,
}

// The mapping is private to this process; sharing happens only through
// kernel registration, never through aliased user pointers.
unsafe impl Send for OwnedMmap {}

impl OwnedMmap {
    /// Maps an anonymous, populated region of at least `size` bytes.
    ///
    /// `huge_pages` forces huge-page backing on (`Some(true)`), off
    /// (`Some(false)`), or probes `/proc/meminfo` (`None`). The returned
    /// length is rounded up to the backing page size.
    pub fn map_anonymous(size: usize, huge_pages: Option<bool>) -> Result<Self, io::Error> {
        let huge_tlb = match huge_pages {
            Some(yes) => yes,
            None => {
                let info = get_hugepage_info()?;
                matches!((info.free, info.size_kb), (Some(free), Some(2048)) if free > 0)
            }
        };
        let page_size = if huge_tlb {
            HUGE_PAGE_SIZE
        } else {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        };
        let aligned_size = (size + page_size - 1) & !(page_size - 1);
        let flags = libc::MAP_PRIVATE
            | libc::MAP_ANONYMOUS
            | libc::MAP_POPULATE
            | if huge_tlb {
                libc::MAP_HUGETLB | libc::MAP_HUGE_2MB
            } else {
                0
            };
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedMmap {
            ptr,
            len: aligned_size,
        })
    }

    /// Wraps an already mapped region. Used by the ring layer, which maps
    /// through the socket descriptor instead of anonymously.
    pub(crate) fn from_raw(ptr: *mut libc::c_void, len: usize) -> Self {
        OwnedMmap { ptr, len }
    }

    pub(crate) fn null() -> Self {
        OwnedMmap {
            ptr: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn as_void_ptr(&self) -> *mut libc::c_void {
        self.ptr
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for OwnedMmap {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.ptr != libc::MAP_FAILED {
            let res = unsafe { libc::munmap(self.ptr, self.len) };
            if res < 0 {
                log::error!("failed to unmap region: {}", io::Error::last_os_error());
            }
        }
    }
}

/// Huge-page availability as read from `/proc/meminfo`.
#[derive(Debug, Default)]
pub struct HugePageInfo {
    pub size_kb: Option<u64>,
    pub total: Option<u64>,
    pub free: Option<u64>,
}

pub fn get_hugepage_info() -> io::Result<HugePageInfo> {
    let file = File::open("/proc/meminfo")?;
    let reader = BufReader::new(file);
    let mut info = HugePageInfo::default();
    for line in reader.lines() {
        let line = line?;
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_end_matches(" kB");
        match key.trim() {
            "Hugepagesize" => info.size_kb = Some(value.parse().map_err(io::Error::other)?),
            "HugePages_Total" => info.total = Some(value.parse().map_err(io::Error::other)?),
            "HugePages_Free" => info.free = Some(value.parse().map_err(io::Error::other)?),
            _ => {}
        }
    }
    Ok(info)
}
