// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Definitions for 64-bit guest signal context structures.
//!
//! These are written to guest memory when a signal frame is synthesized, so
//! every layout here is bit-exact against the guest ABI.

/// Indices into [`Sigcontext::gregs`], in guest ABI order.
pub mod greg {
    pub const R8: usize = 0;
    pub const R9: usize = 1;
    pub const R10: usize = 2;
    pub const R11: usize = 3;
    pub const R12: usize = 4;
    pub const R13: usize = 5;
    pub const R14: usize = 6;
    pub const R15: usize = 7;
    pub const RDI: usize = 8;
    pub const RSI: usize = 9;
    pub const RBP: usize = 10;
    pub const RBX: usize = 11;
    pub const RDX: usize = 12;
    pub const RAX: usize = 13;
    pub const RCX: usize = 14;
    pub const RSP: usize = 15;
    pub const RIP: usize = 16;
    pub const EFL: usize = 17;
    pub const CSGSFS: usize = 18;
    pub const ERR: usize = 19;
    pub const TRAPNO: usize = 20;
    pub const OLDMASK: usize = 21;
    pub const CR2: usize = 22;
    pub const COUNT: usize = 23;
}

/// `uc_flags` bit indicating extended FP state is present.
pub const UC_FP_XSTATE: u64 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Sigcontext {
    pub gregs: [u64; greg::COUNT],
    /// Guest pointer to the fpstate area.
    pub fpregs: u64,
    pub reserved1: [u64; 8],
}

impl Sigcontext {
    pub const fn zeroed() -> Self {
        Self {
            gregs: [0; greg::COUNT],
            fpregs: 0,
            reserved1: [0; 8],
        }
    }
}

/// The 512-byte FXSAVE-layout FP state embedded in the guest ucontext.
///
/// `st` and `xmm` entries are 16-byte slots, matching the translator's
/// in-memory `mm`/`xmm` representation so they can be copied wholesale.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FpState {
    pub cwd: u16,
    pub swd: u16,
    pub ftw: u16,
    pub fop: u16,
    pub rip: u64,
    pub rdp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub st: [[u64; 2]; 8],
    pub xmm: [[u64; 2]; 16],
    pub padding: [u32; 24],
}

impl FpState {
    pub const fn zeroed() -> Self {
        Self {
            cwd: 0,
            swd: 0,
            ftw: 0,
            fop: 0,
            rip: 0,
            rdp: 0,
            mxcsr: 0,
            mxcsr_mask: 0,
            st: [[0; 2]; 8],
            xmm: [[0; 2]; 16],
            padding: [0; 24],
        }
    }
}

/// Guest `stack_t`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Stack {
    pub sp: u64,
    pub flags: i32,
    pub size: u64,
}

/// Guest `ucontext_t`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Ucontext {
    pub flags: u64,
    pub link: u64,
    pub stack: Stack,
    pub mcontext: Sigcontext,
    pub sigmask: [u64; 16],
    pub fpregs_mem: FpState,
    pub ssp: [u64; 4],
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
            sigmask: [0; 16],
            fpregs_mem: FpState::zeroed(),
            ssp: [0; 4],
        }
    }
}

/// Guest `siginfo_t`. The 64-bit layout matches the host's, so delivery can
/// copy the host structure verbatim; the union accessors exist for tests and
/// for code that fabricates siginfo.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Siginfo {
    pub signo: i32,
    pub errno: i32,
    pub code: i32,
    _pad0: i32,
    pub data: SiginfoData,
}

impl Siginfo {
    pub const fn new(signo: i32, errno: i32, code: i32) -> Self {
        Self {
            signo,
            errno,
            code,
            _pad0: 0,
            data: SiginfoData { pad: [0; 14] },
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union SiginfoData {
    pub pad: [u64; 14],
    pub sigfault: Sigfault,
    pub sigchld: Sigchld,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Sigfault {
    pub addr: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Sigchld {
    pub pid: i32,
    pub uid: u32,
    pub status: i32,
    pub utime: i64,
    pub stime: i64,
}
