// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! 32-bit guest signal frame layout.

use core::mem::offset_of;

use peregrine_common_x86::signal::x86 as abi;
use peregrine_common_x86::signal::x86::greg;
use peregrine_common_x86::signal::{GuestStack, Signal};
use peregrine_common_x86::{CpuStateFrame, Reg};

use crate::siginfo::HostSiginfo;

use super::write_guest;

const GREG_MAP: [(usize, Reg); 8] = [
    (greg::EDI, Reg::Rdi),
    (greg::ESI, Reg::Rsi),
    (greg::EBP, Reg::Rbp),
    (greg::EBX, Reg::Rbx),
    (greg::EDX, Reg::Rdx),
    (greg::EAX, Reg::Rax),
    (greg::ECX, Reg::Rcx),
    (greg::ESP, Reg::Rsp),
];

/// Writes the guest `ucontext_t` and `siginfo_t` onto the guest stack and
/// pushes the handler's three stack arguments. Returns the lowered guest SP.
pub(super) fn write_siginfo_frame(
    frame: &mut CpuStateFrame,
    signal: i32,
    info: &HostSiginfo,
    stack: &GuestStack,
    mut sp: u64,
) -> u64 {
    sp -= size_of::<abi::Ucontext>() as u64;
    let ucontext_loc = sp;
    sp -= size_of::<abi::Siginfo>() as u64;
    let siginfo_loc = sp;

    let mut uctx = abi::Ucontext::zeroed();

    uctx.flags |= abi::UC_FP_XSTATE;
    uctx.mcontext.fpregs = (ucontext_loc + offset_of!(abi::Ucontext, fpregs_mem) as u64) as u32;

    uctx.mcontext.gregs[greg::GS] = frame.state.gs.into();
    uctx.mcontext.gregs[greg::FS] = frame.state.fs.into();
    uctx.mcontext.gregs[greg::ES] = frame.state.es.into();
    uctx.mcontext.gregs[greg::DS] = frame.state.ds.into();
    uctx.mcontext.gregs[greg::TRAPNO] = signal as u32;
    uctx.mcontext.gregs[greg::ERR] = 0;
    uctx.mcontext.gregs[greg::EIP] = frame.state.rip as u32;
    uctx.mcontext.gregs[greg::CS] = frame.state.cs.into();
    uctx.mcontext.gregs[greg::EFL] = 0;
    uctx.mcontext.gregs[greg::UESP] = 0;
    uctx.mcontext.gregs[greg::SS] = frame.state.ss.into();
    for (slot, reg) in GREG_MAP {
        uctx.mcontext.gregs[slot] = frame.state.greg(reg) as u32;
    }

    // The legacy 10-byte x87 slots take the low 80 bits of each 16-byte
    // translator slot.
    for (dst, src) in uctx.fpregs_mem.st.iter_mut().zip(frame.state.mm.iter()) {
        dst.significand = [
            src[0] as u16,
            (src[0] >> 16) as u16,
            (src[0] >> 32) as u16,
            (src[0] >> 48) as u16,
        ];
        dst.exponent = src[1] as u16;
    }
    // 32-bit guests only get x87 state: no extended area follows, and the
    // trailing magic says so.
    uctx.fpregs_mem.magic = abi::MAGIC_FPU;
    uctx.fpregs_mem.cw = frame.state.fcw.into();
    uctx.fpregs_mem.tag = frame.state.ftw.into();
    uctx.fpregs_mem.sw = frame.state.reconstruct_fsw().into();

    uctx.stack = abi::Stack {
        sp: stack.sp as u32,
        flags: stack.flags.bits() as i32,
        size: stack.size as u32,
    };

    let mut guest_info = abi::Siginfo::new(info.signo(), info.errno(), info.code());
    match Signal::try_from(signal) {
        Ok(Signal::SIGSEGV) | Ok(Signal::SIGBUS) => {
            // No faithful guest fault address exists at this layer; the
            // guest RIP stands in.
            guest_info.data.sigfault = abi::Sigfault {
                addr: frame.state.rip as u32,
            };
        }
        Ok(Signal::SIGCHLD) => {
            let (pid, uid, status, utime, stime) = info.sigchld();
            guest_info.data.sigchld = abi::Sigchld {
                pid,
                uid,
                status,
                utime: utime as i32,
                stime: stime as i32,
            };
        }
        _ => {
            // Most payloads copy over field for field.
            let fields = info.fields();
            let len = fields.len().min(size_of::<abi::SiginfoData>());
            unsafe {
                core::ptr::copy_nonoverlapping(
                    fields.as_ptr(),
                    (&raw mut guest_info.data).cast::<u8>(),
                    len,
                );
            }
        }
    }

    unsafe {
        write_guest(ucontext_loc, uctx);
        write_guest(siginfo_loc, guest_info);
    }

    // Handler arguments go on the stack, last-pushed first.
    sp -= 4;
    unsafe { write_guest::<u32>(sp, ucontext_loc as u32) };
    sp -= 4;
    unsafe { write_guest::<u32>(sp, siginfo_loc as u32) };
    sp -= 4;
    unsafe { write_guest::<u32>(sp, signal as u32) };

    sp
}
