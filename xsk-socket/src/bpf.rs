//! # Redirect program bytecode
//!
//! ## Purpose
//!
//! Emits the in-kernel filter as a fixed instruction sequence, ready for
//! the program-load syscall. The observable behaviour: read the packet's
//! RX queue index, look it up in the `queue_enable` array; a missing
//! entry aborts, a zero entry passes the frame to the host stack, a
//! nonzero entry redirects the frame through the `queue_to_socket` map
//! to the socket registered for that queue.
//!
//! The program is synthesised at load time so the map file descriptors
//! can be embedded as `BPF_PSEUDO_MAP_FD` immediates; no object file or
//! compiler is involved.

use std::os::fd::RawFd;

const BPF_LD: u8 = 0x00;
const BPF_LDX: u8 = 0x01;
const BPF_STX: u8 = 0x03;
const BPF_ALU64: u8 = 0x07;
const BPF_JMP: u8 = 0x05;

const BPF_W: u8 = 0x00;
const BPF_DW: u8 = 0x18;
const BPF_IMM: u8 = 0x00;
const BPF_MEM: u8 = 0x60;

const BPF_ADD: u8 = 0x00;
const BPF_MOV: u8 = 0xb0;
const BPF_K: u8 = 0x00;
const BPF_X: u8 = 0x08;
const BPF_JEQ: u8 = 0x10;
const BPF_CALL: u8 = 0x80;
const BPF_EXIT: u8 = 0x90;

const BPF_PSEUDO_MAP_FD: u8 = 1;

const BPF_FUNC_MAP_LOOKUP_ELEM: i32 = 1;
const BPF_FUNC_REDIRECT_MAP: i32 = 51;

/// Byte offset of `rx_queue_index` in `struct xdp_md`.
const XDP_MD_RX_QUEUE_INDEX: i16 = 16;

const XDP_ABORTED: i32 = 0;
const XDP_PASS: i32 = 2;

/// One eBPF instruction, bit-compatible with `struct bpf_insn`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub code: u8,
    /// Destination register in the low nibble, source in the high.
    pub regs: u8,
    pub off: i16,
    pub imm: i32,
}

const fn insn(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Insn {
    Insn {
        code,
        regs: dst | (src << 4),
        off,
        imm,
    }
}

const fn mov64_reg(dst: u8, src: u8) -> Insn {
    insn(BPF_ALU64 | BPF_MOV | BPF_X, dst, src, 0, 0)
}

const fn mov64_imm(dst: u8, imm: i32) -> Insn {
    insn(BPF_ALU64 | BPF_MOV | BPF_K, dst, 0, 0, imm)
}

const fn add64_imm(dst: u8, imm: i32) -> Insn {
    insn(BPF_ALU64 | BPF_ADD | BPF_K, dst, 0, 0, imm)
}

const fn ldx_w(dst: u8, src: u8, off: i16) -> Insn {
    insn(BPF_LDX | BPF_MEM | BPF_W, dst, src, off, 0)
}

const fn stx_w(dst: u8, src: u8, off: i16) -> Insn {
    insn(BPF_STX | BPF_MEM | BPF_W, dst, src, off, 0)
}

const fn jeq_imm(dst: u8, imm: i32, off: i16) -> Insn {
    insn(BPF_JMP | BPF_JEQ | BPF_K, dst, 0, off, imm)
}

const fn call(func: i32) -> Insn {
    insn(BPF_JMP | BPF_CALL, 0, 0, 0, func)
}

const fn exit() -> Insn {
    insn(BPF_JMP | BPF_EXIT, 0, 0, 0, 0)
}

/// A 64-bit immediate load carrying a map file descriptor. Occupies two
/// instruction slots; the second is a continuation.
const fn ld_map_fd(dst: u8, fd: i32) -> [Insn; 2] {
    [
        insn(BPF_LD | BPF_IMM | BPF_DW, dst, BPF_PSEUDO_MAP_FD, 0, fd),
        insn(0, 0, 0, 0, 0),
    ]
}

/// Emits the queue-gated redirect program over the two control maps.
pub fn redirect_program(queue_enable_fd: RawFd, queue_to_socket_fd: RawFd) -> Vec<Insn> {
    let [enable_lo, enable_hi] = ld_map_fd(1, queue_enable_fd);
    let [socket_lo, socket_hi] = ld_map_fd(1, queue_to_socket_fd);
    vec![
        // r6 = ctx, preserved across helper calls
        mov64_reg(6, 1),
        // q = ctx->rx_queue_index, spilled for the lookup key
        ldx_w(2, 6, XDP_MD_RX_QUEUE_INDEX),
        stx_w(10, 2, -4),
        mov64_reg(2, 10),
        add64_imm(2, -4),
        enable_lo,
        enable_hi,
        call(BPF_FUNC_MAP_LOOKUP_ELEM),
        // no entry for this queue: abort
        jeq_imm(0, 0, 10),
        ldx_w(1, 0, 0),
        // entry present but zero: hand the frame to the host stack
        jeq_imm(1, 0, 6),
        socket_lo,
        socket_hi,
        ldx_w(2, 6, XDP_MD_RX_QUEUE_INDEX),
        mov64_imm(3, 0),
        call(BPF_FUNC_REDIRECT_MAP),
        exit(),
        mov64_imm(0, XDP_PASS),
        exit(),
        mov64_imm(0, XDP_ABORTED),
        exit(),
    ]
}
