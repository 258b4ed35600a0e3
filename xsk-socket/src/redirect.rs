//! # Redirect program and control maps
//!
//! ## Purpose
//!
//! [`RedirectProgram`] owns the in-kernel filter and the two maps that
//! steer traffic: `queue_enable`, an array keyed by queue id holding a
//! 0/1 gate, and `queue_to_socket`, an XSK map keyed the same way and
//! holding the socket each enabled queue redirects into.
//!
//! ## How it works
//!
//! Construction creates both maps, synthesises the bytecode with their
//! descriptors embedded, and loads it under the GPL licence string; a
//! load failure releases the maps through their owners. Attachment and
//! detachment go through the netlink SETLINK path and are idempotent and
//! tolerant respectively. Queue registration writes the socket first and
//! the gate second, rolling the socket entry back if the gate write
//! fails, so the two maps never disagree.

use crate::bpf;
use crate::error::RedirectError;
use crate::netlink;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

pub const XDP_FLAGS_UPDATE_IF_NOEXIST: u32 = 1 << 0;
pub const XDP_FLAGS_SKB_MODE: u32 = 1 << 1;
pub const XDP_FLAGS_DRV_MODE: u32 = 1 << 2;
pub const XDP_FLAGS_HW_MODE: u32 = 1 << 3;
pub const XDP_FLAGS_REPLACE: u32 = 1 << 4;

/// Native XDP, and never silently replace somebody else's program.
pub const XDP_FLAGS_DEFAULT: u32 = XDP_FLAGS_DRV_MODE | XDP_FLAGS_UPDATE_IF_NOEXIST;

/// The loaded redirect program plus its two maps.
pub struct RedirectProgram {
    queue_enable: OwnedFd,
    queue_to_socket: OwnedFd,
    prog: OwnedFd,
    max_queues: u32,
    attached: Vec<u32>,
}

impl RedirectProgram {
    /// Creates the maps and loads the program. `max_queues` bounds the
    /// queue ids that can ever be registered.
    pub fn new(max_queues: u32) -> Result<Self, RedirectError> {
        let max_queues = max_queues.max(1);
        let queue_enable = create_map(
            libbpf_sys::BPF_MAP_TYPE_ARRAY,
            "queue_enable",
            c"queue_enable",
            max_queues,
        )?;
        let queue_to_socket = create_map(
            libbpf_sys::BPF_MAP_TYPE_XSKMAP,
            "queue_to_socket",
            c"queue_to_socket",
            max_queues,
        )?;

        let insns = bpf::redirect_program(
            queue_enable.as_raw_fd(),
            queue_to_socket.as_raw_fd(),
        );
        let prog_fd = unsafe {
            libbpf_sys::bpf_prog_load(
                libbpf_sys::BPF_PROG_TYPE_XDP,
                c"xsk_redirect".as_ptr(),
                c"GPL".as_ptr(),
                insns.as_ptr() as *const libbpf_sys::bpf_insn,
                insns.len() as libbpf_sys::size_t,
                ptr::null(),
            )
        };
        if prog_fd < 0 {
            return Err(RedirectError::BpfLoadFailed(io::Error::last_os_error()));
        }

        Ok(RedirectProgram {
            queue_enable,
            queue_to_socket,
            prog: unsafe { OwnedFd::from_raw_fd(prog_fd) },
            max_queues,
            attached: Vec::new(),
        })
    }

    pub fn max_queues(&self) -> u32 {
        self.max_queues
    }

    pub fn prog_fd(&self) -> RawFd {
        self.prog.as_raw_fd()
    }

    /// Installs the program on the interface's XDP hook. A second attach
    /// to the same interface is a no-op.
    pub fn attach(&mut self, if_index: u32, flags: u32) -> Result<(), RedirectError> {
        if self.attached.contains(&if_index) {
            return Ok(());
        }
        netlink::attach_xdp(if_index, self.prog.as_raw_fd(), flags)
            .map_err(|source| RedirectError::AttachFailed { if_index, source })?;
        self.attached.push(if_index);
        Ok(())
    }

    /// Removes the program from the interface's XDP hook. Succeeds when
    /// nothing is attached there.
    pub fn detach(&mut self, if_index: u32) -> Result<(), RedirectError> {
        netlink::detach_xdp(if_index)
            .map_err(|source| RedirectError::DetachFailed { if_index, source })?;
        self.attached.retain(|&i| i != if_index);
        Ok(())
    }

    /// Binds `socket_fd` to `queue_id`: the redirect target first, then
    /// the enable gate. If the gate write fails the target entry is
    /// rolled back so the maps stay consistent.
    pub fn register(&self, queue_id: u32, socket_fd: RawFd) -> Result<(), RedirectError> {
        if socket_fd < 0 {
            return Err(RedirectError::MapUpdateFailed {
                map: "queue_to_socket",
                key: queue_id,
                source: io::Error::from_raw_os_error(libc::EBADF),
            });
        }
        map_update(
            &self.queue_to_socket,
            "queue_to_socket",
            queue_id,
            socket_fd as u32,
        )?;
        if let Err(e) = map_update(&self.queue_enable, "queue_enable", queue_id, 1u32) {
            let _ = map_delete(&self.queue_to_socket, "queue_to_socket", queue_id);
            return Err(e);
        }
        Ok(())
    }

    /// Unbinds a queue. The redirect target is deleted (absent entries
    /// are an error) and the gate is cleared; array maps have no delete,
    /// so a present-and-zero gate is the quiescent state.
    pub fn unregister(&self, queue_id: u32) -> Result<(), RedirectError> {
        map_delete(&self.queue_to_socket, "queue_to_socket", queue_id)?;
        map_update(&self.queue_enable, "queue_enable", queue_id, 0u32)?;
        Ok(())
    }
}

impl Drop for RedirectProgram {
    fn drop(&mut self) {
        for if_index in std::mem::take(&mut self.attached) {
            if let Err(e) = netlink::detach_xdp(if_index) {
                log::warn!("leaving program attached to interface {if_index}: {e}");
            }
        }
    }
}

fn create_map(
    map_type: libbpf_sys::bpf_map_type,
    map: &'static str,
    name: &'static std::ffi::CStr,
    max_entries: u32,
) -> Result<OwnedFd, RedirectError> {
    let fd = unsafe {
        libbpf_sys::bpf_map_create(
            map_type,
            name.as_ptr(),
            4,
            4,
            max_entries,
            ptr::null(),
        )
    };
    if fd < 0 {
        return Err(RedirectError::MapCreateFailed {
            map,
            source: io::Error::last_os_error(),
        });
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn map_update(
    fd: &OwnedFd,
    map: &'static str,
    key: u32,
    value: u32,
) -> Result<(), RedirectError> {
    let rc = unsafe {
        libbpf_sys::bpf_map_update_elem(
            fd.as_raw_fd(),
            &key as *const u32 as *const libc::c_void,
            &value as *const u32 as *const libc::c_void,
            0,
        )
    };
    if rc < 0 {
        return Err(RedirectError::MapUpdateFailed {
            map,
            key,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn map_delete(fd: &OwnedFd, map: &'static str, key: u32) -> Result<(), RedirectError> {
    let rc = unsafe {
        libbpf_sys::bpf_map_delete_elem(
            fd.as_raw_fd(),
            &key as *const u32 as *const libc::c_void,
        )
    };
    if rc < 0 {
        return Err(RedirectError::MapUpdateFailed {
            map,
            key,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}
