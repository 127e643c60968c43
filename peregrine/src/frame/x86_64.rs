// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! 64-bit guest signal frame layout.

use core::mem::offset_of;

use peregrine_common_x86::signal::GuestStack;
use peregrine_common_x86::signal::x86_64 as abi;
use peregrine_common_x86::signal::x86_64::greg;
use peregrine_common_x86::{CpuStateFrame, Reg};

use crate::siginfo::{HostSiginfo, SIGINFO_SIZE};

use super::write_guest;

/// Guest ucontext greg slot for each translator register.
const GREG_MAP: [(usize, Reg); 16] = [
    (greg::R8, Reg::R8),
    (greg::R9, Reg::R9),
    (greg::R10, Reg::R10),
    (greg::R11, Reg::R11),
    (greg::R12, Reg::R12),
    (greg::R13, Reg::R13),
    (greg::R14, Reg::R14),
    (greg::R15, Reg::R15),
    (greg::RDI, Reg::Rdi),
    (greg::RSI, Reg::Rsi),
    (greg::RBP, Reg::Rbp),
    (greg::RBX, Reg::Rbx),
    (greg::RDX, Reg::Rdx),
    (greg::RAX, Reg::Rax),
    (greg::RCX, Reg::Rcx),
    (greg::RSP, Reg::Rsp),
];

/// Writes the guest `ucontext_t` and `siginfo_t` onto the guest stack and
/// wires the handler's register arguments. Returns the lowered guest SP.
pub(super) fn write_siginfo_frame(
    frame: &mut CpuStateFrame,
    signal: i32,
    info: &HostSiginfo,
    stack: &GuestStack,
    mut sp: u64,
) -> u64 {
    sp -= size_of::<abi::Ucontext>() as u64;
    let ucontext_loc = sp;
    sp -= SIGINFO_SIZE as u64;
    let siginfo_loc = sp;

    let mut uctx = abi::Ucontext::zeroed();

    // Extended float state lives in the embedded area.
    uctx.flags |= abi::UC_FP_XSTATE;
    uctx.mcontext.fpregs = ucontext_loc + offset_of!(abi::Ucontext, fpregs_mem) as u64;

    uctx.mcontext.gregs[greg::RIP] = frame.state.rip;
    uctx.mcontext.gregs[greg::EFL] = 0;
    uctx.mcontext.gregs[greg::CSGSFS] = 0;
    uctx.mcontext.gregs[greg::ERR] = 0;
    uctx.mcontext.gregs[greg::TRAPNO] = signal as u64;
    uctx.mcontext.gregs[greg::OLDMASK] = 0;
    uctx.mcontext.gregs[greg::CR2] = 0;
    for (slot, reg) in GREG_MAP {
        uctx.mcontext.gregs[slot] = frame.state.greg(reg);
    }

    uctx.fpregs_mem.st = frame.state.mm;
    uctx.fpregs_mem.xmm = frame.state.xmm;
    uctx.fpregs_mem.cwd = frame.state.fcw;
    uctx.fpregs_mem.ftw = frame.state.ftw;
    uctx.fpregs_mem.swd = frame.state.reconstruct_fsw();

    uctx.stack = abi::Stack {
        sp: stack.sp,
        flags: stack.flags.bits() as i32,
        size: stack.size,
    };

    unsafe {
        write_guest(ucontext_loc, uctx);
        // The host and 64-bit guest siginfo layouts match; copy verbatim.
        // User-queued payloads can carry arbitrary data, so this must stay
        // bit perfect.
        core::ptr::copy_nonoverlapping(
            info.raw().as_ptr(),
            siginfo_loc as *mut u8,
            SIGINFO_SIZE,
        );
    }

    frame.state.set_greg(Reg::Rsi, siginfo_loc);
    frame.state.set_greg(Reg::Rdx, ucontext_loc);

    sp
}
