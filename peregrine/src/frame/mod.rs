// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Synthesis of guest signal frames.
//!
//! When a host signal must be delivered to the guest, the dispatcher has
//! already parked the host side; this module rewrites the *guest* state so
//! that the JIT resumes straight into the guest's registered handler with an
//! architecturally faithful `ucontext`/`siginfo` pair on the guest stack and
//! the translator's sigreturn trampoline as the return address.

mod x86;
mod x86_64;

use peregrine_common_x86::signal::{GuestSigAction, GuestStack, SI_QUEUE, SI_USER, SaFlags, SsFlags};
use peregrine_common_x86::Reg;
use peregrine_platform_arm64::context::HostContext;

use crate::config::GuestBitness;
use crate::dispatcher::Dispatcher;
use crate::siginfo::HostSiginfo;

/// The guest red zone both bitnesses reserve below the interrupted RSP.
const GUEST_RED_ZONE: u64 = 128;

pub(crate) unsafe fn write_guest<T: Copy>(addr: u64, value: T) {
    unsafe { (addr as *mut T).write_unaligned(value) }
}

pub(crate) fn build_guest_frame(
    dispatcher: &Dispatcher,
    ctx: &mut dyn HostContext,
    trap_pc: u64,
    signal: i32,
    info: &HostSiginfo,
    action: &GuestSigAction,
    stack: &GuestStack,
) {
    let old_guest_sp = unsafe { dispatcher.thread().frame_mut() }.state.greg(Reg::Rsp);
    let mut new_guest_sp = old_guest_sp;

    // If the guest is already inside its alternate stack we are handling
    // recursive signals and keep walking that stack; otherwise switch to its
    // top.
    if !stack.flags.contains(SsFlags::DISABLE) && !stack.contains(old_guest_sp) {
        new_guest_sp = stack.sp + stack.size;
    }

    new_guest_sp -= GUEST_RED_ZONE;

    // Signals originating from userspace carry no machine state worth
    // synthesizing a full mcontext for.
    let use_siginfo = action.flags.contains(SaFlags::SIGINFO)
        && !(info.code() == SI_QUEUE || info.code() == SI_USER);

    if use_siginfo {
        if dispatcher.config().sra_enabled {
            if dispatcher.is_in_jit_code(trap_pc, false) {
                // We are in jit, SRA must be spilled before the frame reads
                // guest registers.
                dispatcher.spill_sra(&*ctx);
            } else {
                assert!(
                    !dispatcher.is_in_jit_code(trap_pc, true),
                    "signals in dispatcher have unsynchronized context"
                );
            }
        }

        let frame = unsafe { dispatcher.thread().frame_mut() };
        new_guest_sp = match dispatcher.config().bitness {
            GuestBitness::Bits64 => {
                x86_64::write_siginfo_frame(frame, signal, info, stack, new_guest_sp)
            }
            GuestBitness::Bits32 => {
                x86::write_siginfo_frame(frame, signal, info, stack, new_guest_sp)
            }
        };
    } else if !dispatcher.config().is_64bit() {
        new_guest_sp -= 4;
        unsafe { write_guest::<u32>(new_guest_sp, signal as u32) };
    }

    let frame = unsafe { dispatcher.thread().frame_mut() };
    frame.state.rip = action.sigaction;

    let signal_return = dispatcher.entry_points().signal_return;
    if dispatcher.config().is_64bit() {
        frame.state.set_greg(Reg::Rdi, signal as u64);
        new_guest_sp -= 8;
        unsafe { write_guest::<u64>(new_guest_sp, signal_return) };
    } else {
        assert!(
            signal_return < 0x1_0000_0000,
            "sigreturn trampoline must sit below 4GiB for 32-bit guests"
        );
        new_guest_sp -= 4;
        unsafe { write_guest::<u32>(new_guest_sp, signal_return as u32) };
    }
    frame.state.set_greg(Reg::Rsp, new_guest_sp);
}
