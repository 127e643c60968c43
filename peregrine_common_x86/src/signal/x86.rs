// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Definitions for 32-bit guest signal context structures.

/// Indices into [`Sigcontext::gregs`], in guest ABI order.
pub mod greg {
    pub const GS: usize = 0;
    pub const FS: usize = 1;
    pub const ES: usize = 2;
    pub const DS: usize = 3;
    pub const EDI: usize = 4;
    pub const ESI: usize = 5;
    pub const EBP: usize = 6;
    pub const ESP: usize = 7;
    pub const EBX: usize = 8;
    pub const EDX: usize = 9;
    pub const ECX: usize = 10;
    pub const EAX: usize = 11;
    pub const TRAPNO: usize = 12;
    pub const ERR: usize = 13;
    pub const EIP: usize = 14;
    pub const CS: usize = 15;
    pub const EFL: usize = 16;
    pub const UESP: usize = 17;
    pub const SS: usize = 18;
    pub const COUNT: usize = 19;
}

/// `uc_flags` bit indicating extended FP state is present.
pub const UC_FP_XSTATE: u32 = 1;

/// Trailing magic of the legacy fpstate: x87-only state follows.
pub const MAGIC_FPU: u16 = 0xffff;
/// Trailing magic of the legacy fpstate: an extended (FXSR) area follows.
pub const MAGIC_XFPSTATE: u16 = 0x0000;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Sigcontext {
    pub gregs: [u32; greg::COUNT],
    /// Guest pointer to the fpstate area.
    pub fpregs: u32,
    pub oldmask: u32,
    pub cr2: u32,
}

impl Sigcontext {
    pub const fn zeroed() -> Self {
        Self {
            gregs: [0; greg::COUNT],
            fpregs: 0,
            oldmask: 0,
            cr2: 0,
        }
    }
}

/// One 80-bit x87 register in the legacy 10-byte layout.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FpReg {
    pub significand: [u16; 4],
    pub exponent: u16,
}

/// The 112-byte legacy fpstate embedded in the 32-bit guest ucontext.
///
/// The trailing `magic` tells the guest whether an extended area follows;
/// this translator only ever emits [`MAGIC_FPU`] for 32-bit guests.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FpState {
    pub cw: u32,
    pub sw: u32,
    pub tag: u32,
    pub ipoff: u32,
    pub cssel: u32,
    pub dataoff: u32,
    pub datasel: u32,
    pub st: [FpReg; 8],
    pub status: u16,
    pub magic: u16,
}

impl FpState {
    pub const fn zeroed() -> Self {
        Self {
            cw: 0,
            sw: 0,
            tag: 0,
            ipoff: 0,
            cssel: 0,
            dataoff: 0,
            datasel: 0,
            st: [FpReg {
                significand: [0; 4],
                exponent: 0,
            }; 8],
            status: 0,
            magic: MAGIC_FPU,
        }
    }
}

/// Guest `stack_t`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Stack {
    pub sp: u32,
    pub flags: i32,
    pub size: u32,
}

/// Guest `ucontext_t`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Ucontext {
    pub flags: u32,
    pub link: u32,
    pub stack: Stack,
    pub mcontext: Sigcontext,
    pub sigmask: [u32; 32],
    pub fpregs_mem: FpState,
    pub ssp: [u32; 4],
}

impl Ucontext {
    pub const fn zeroed() -> Self {
        Self {
            flags: 0,
            link: 0,
            stack: Stack {
                sp: 0,
                flags: 0,
                size: 0,
            },
            mcontext: Sigcontext::zeroed(),
            sigmask: [0; 32],
            fpregs_mem: FpState::zeroed(),
            ssp: [0; 4],
        }
    }
}

/// Guest `siginfo_t` for 32-bit guests. Unlike the 64-bit variant this cannot
/// be copied from the host wholesale; the signal-specific payload is
/// marshalled field by field.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Siginfo {
    pub signo: i32,
    pub errno: i32,
    pub code: i32,
    pub data: SiginfoData,
}

impl Siginfo {
    pub const fn new(signo: i32, errno: i32, code: i32) -> Self {
        Self {
            signo,
            errno,
            code,
            data: SiginfoData { pad: [0; 29] },
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union SiginfoData {
    pub pad: [u32; 29],
    pub sigfault: Sigfault,
    pub sigchld: Sigchld,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Sigfault {
    pub addr: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Sigchld {
    pub pid: i32,
    pub uid: u32,
    pub status: i32,
    pub utime: i32,
    pub stime: i32,
}

/// `epoll_event` as seen by 32-bit guests: packed, with no alignment padding
/// between `events` and `data`.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct EpollEvent {
    pub events: u32,
    pub data: u64,
}
