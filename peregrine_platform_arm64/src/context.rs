// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Uniform access to the host trap context.
//!
//! Signal handlers receive a `libc::ucontext_t` from the kernel; everything
//! above this module manipulates it through the [`HostContext`] trait so that
//! the dispatcher and the atomic emulator never touch raw mcontext layout.

/// Size of the red zone below the host stack pointer that signal frames must
/// not disturb. The AArch64 ABI has none.
pub const RED_ZONE_SIZE: u64 = 0;

/// The host register the JIT dedicates to the guest thread-state pointer.
pub const STATE_REG: u32 = 28;

/// A snapshot of the full host machine context at trap time.
///
/// This is what gets spilled below the host stack pointer when a signal
/// arrives and restored on `sigreturn`; it must round-trip every register
/// the JIT may have live, including the FPSIMD file.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MachineContext {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    pub vregs: [[u64; 2]; 32],
    pub fpsr: u32,
    pub fpcr: u32,
}

impl MachineContext {
    pub const fn zeroed() -> Self {
        Self {
            regs: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
            vregs: [[0; 2]; 32],
            fpsr: 0,
            fpcr: 0,
        }
    }
}

/// Uniform getters/setters over an OS trap context.
pub trait HostContext {
    fn pc(&self) -> u64;
    fn set_pc(&mut self, pc: u64);
    fn sp(&self) -> u64;
    fn set_sp(&mut self, sp: u64);
    fn gpr(&self, reg: u32) -> u64;
    fn set_gpr(&mut self, reg: u32, value: u64);

    /// Points the JIT's thread-state register at the guest `CpuStateFrame`.
    fn set_state_reg(&mut self, value: u64) {
        self.set_gpr(STATE_REG, value);
    }

    fn save_machine_context(&self) -> MachineContext;
    fn restore_machine_context(&mut self, saved: &MachineContext);
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        /// Magic of the `fpsimd_context` record in the mcontext reserved area.
        const FPSIMD_MAGIC: u32 = 0x4650_8001;

        #[repr(C)]
        struct FpsimdContext {
            magic: u32,
            size: u32,
            fpsr: u32,
            fpcr: u32,
            vregs: [[u64; 2]; 32],
        }

        /// [`HostContext`] over the kernel-provided `ucontext_t`.
        pub struct UContext<'a> {
            uctx: &'a mut libc::ucontext_t,
        }

        impl<'a> UContext<'a> {
            /// # Safety
            ///
            /// `uctx` must be the ucontext passed to a live signal handler
            /// invocation on this thread.
            pub unsafe fn new(uctx: &'a mut libc::ucontext_t) -> Self {
                Self { uctx }
            }

            /// Offset of the 16-byte-aligned `__reserved` record area from the
            /// start of the kernel `sigcontext` (fault_address + 31 GPRs + sp
            /// + pc + pstate, rounded up).
            const RESERVED_OFFSET: usize = 288;
            const RESERVED_LEN: usize = 4096;

            /// Walks the `__reserved` record chain for the FPSIMD state.
            fn fpsimd(&self) -> Option<*mut FpsimdContext> {
                let base = (&raw const self.uctx.uc_mcontext).cast::<u8>();
                let base = unsafe { base.add(Self::RESERVED_OFFSET) };
                let mut offset = 0usize;
                while offset + 8 <= Self::RESERVED_LEN {
                    let head = unsafe { base.add(offset) }.cast::<u32>();
                    let (magic, size) = unsafe { (*head, *head.add(1)) };
                    if magic == 0 || size == 0 {
                        return None;
                    }
                    if magic == FPSIMD_MAGIC {
                        return Some(unsafe { base.add(offset) } as *mut FpsimdContext);
                    }
                    offset += size as usize;
                }
                None
            }
        }

        impl HostContext for UContext<'_> {
            fn pc(&self) -> u64 {
                self.uctx.uc_mcontext.pc
            }

            fn set_pc(&mut self, pc: u64) {
                self.uctx.uc_mcontext.pc = pc;
            }

            fn sp(&self) -> u64 {
                self.uctx.uc_mcontext.sp
            }

            fn set_sp(&mut self, sp: u64) {
                self.uctx.uc_mcontext.sp = sp;
            }

            fn gpr(&self, reg: u32) -> u64 {
                self.uctx.uc_mcontext.regs[reg as usize]
            }

            fn set_gpr(&mut self, reg: u32, value: u64) {
                self.uctx.uc_mcontext.regs[reg as usize] = value;
            }

            fn save_machine_context(&self) -> MachineContext {
                let mcontext = &self.uctx.uc_mcontext;
                let mut saved = MachineContext::zeroed();
                saved.regs = mcontext.regs;
                saved.sp = mcontext.sp;
                saved.pc = mcontext.pc;
                saved.pstate = mcontext.pstate;
                if let Some(fpsimd) = self.fpsimd() {
                    let fpsimd = unsafe { &*fpsimd };
                    saved.vregs = fpsimd.vregs;
                    saved.fpsr = fpsimd.fpsr;
                    saved.fpcr = fpsimd.fpcr;
                }
                saved
            }

            fn restore_machine_context(&mut self, saved: &MachineContext) {
                let mcontext = &mut self.uctx.uc_mcontext;
                mcontext.regs = saved.regs;
                mcontext.sp = saved.sp;
                mcontext.pc = saved.pc;
                mcontext.pstate = saved.pstate;
                if let Some(fpsimd) = self.fpsimd() {
                    let fpsimd = unsafe { &mut *fpsimd };
                    fpsimd.vregs = saved.vregs;
                    fpsimd.fpsr = saved.fpsr;
                    fpsimd.fpcr = saved.fpcr;
                }
            }
        }
    }
}
