// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-thread dispatcher state: saving and restoring thread state around
//! host signals, and the pause/stop/return protocol.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;
use peregrine_common_x86::CpuStateFrame;
use peregrine_platform_arm64::context::{HostContext, MachineContext, RED_ZONE_SIZE};

use crate::code_buffers::CodeBufferRegistry;
use crate::config::Config;
use crate::thread::{GuestThread, IdleWait, SignalEvent};

/// Maximum nesting of host signals while guest code runs. Each level costs
/// `size_of::<ContextBackup>()` bytes of host stack; the bound exists only to
/// keep the frame-pointer stack allocation-free.
pub const MAX_SIGNAL_DEPTH: usize = 64;

/// Entry addresses into the generated dispatcher/JIT code. Immutable after
/// the dispatcher is built.
#[derive(Copy, Clone, Debug, Default)]
pub struct JitEntryPoints {
    /// Loop top that refills shadow register allocation from the guest frame
    /// before resuming guest execution.
    pub absolute_loop_top_fill_sra: u64,
    pub thread_pause_handler: u64,
    pub thread_pause_handler_spill_sra: u64,
    pub thread_stop_handler: u64,
    pub thread_stop_handler_spill_sra: u64,
    /// Synthetic host address a returning guest signal handler lands on.
    pub signal_handler_return_address: u64,
    /// Synthetic host address the pause loop parks on.
    pub pause_return_instruction: u64,
    /// Guest-visible trampoline pushed as the return address of every
    /// synthesized guest signal frame.
    pub signal_return: u64,
}

/// Hook back into the signal delegator used when unwinding nested signal
/// state.
pub trait SignalDelegation {
    /// Reports the signal now outermost after a frame restore, so recursive
    /// signal masking unwinds correctly.
    fn set_current_signal(&self, signal: i32);
}

/// Everything spilled below the host SP when a signal interrupts guest
/// execution.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ContextBackup {
    host: MachineContext,
    guest: CpuStateFrame,
    signal: i32,
}

/// Host registers the JIT statically allocates to guest GPRs, indexed by
/// [`Reg`]. x18 (platform), x28 (thread state), and x29/x30 are off limits.
pub const SRA_MAP: [u32; 16] = [4, 5, 6, 7, 8, 9, 10, 11, 19, 20, 21, 22, 23, 24, 25, 26];

pub struct Dispatcher {
    config: Config,
    entry_points: JitEntryPoints,
    thread: Arc<GuestThread>,
    code_buffers: Arc<CodeBufferRegistry>,
    /// Host addresses of the `ContextBackup` frames outstanding on this
    /// thread, innermost last.
    signal_frames: ArrayVec<u64, MAX_SIGNAL_DEPTH>,
    /// Outstanding signal-frame count; the JIT's code-reclaim path waits for
    /// this to drain before reusing retired buffers.
    signal_handler_ref_count: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        config: Config,
        entry_points: JitEntryPoints,
        thread: Arc<GuestThread>,
        code_buffers: Arc<CodeBufferRegistry>,
    ) -> Self {
        Self {
            config,
            entry_points,
            thread,
            code_buffers,
            signal_frames: ArrayVec::new(),
            signal_handler_ref_count: AtomicU64::new(0),
        }
    }

    pub fn entry_points(&self) -> &JitEntryPoints {
        &self.entry_points
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn thread(&self) -> &Arc<GuestThread> {
        &self.thread
    }

    pub fn signal_handler_ref_count(&self) -> u64 {
        self.signal_handler_ref_count.load(Ordering::Acquire)
    }

    pub fn signal_frame_depth(&self) -> usize {
        self.signal_frames.len()
    }

    pub(crate) fn is_in_jit_code(&self, addr: u64, include_dispatcher: bool) -> bool {
        self.code_buffers.contains(addr, include_dispatcher)
    }

    /// Spills shadow-register-allocated guest GPRs from the host trap context
    /// back into the guest frame.
    pub(crate) fn spill_sra(&self, ctx: &dyn HostContext) {
        let frame = unsafe { self.thread.frame_mut() };
        for (guest_reg, &host_reg) in SRA_MAP.iter().enumerate() {
            frame.state.gregs[guest_reg] = ctx.gpr(host_reg);
        }
    }

    /// Decides which of a plain/SpillSRA handler-address pair to resume at,
    /// enforcing the dispatcher-context invariant.
    fn select_handler_address(&self, trap_pc: u64, plain: u64, spill_sra: u64) -> u64 {
        if self.config.sra_enabled && self.is_in_jit_code(trap_pc, false) {
            // We are in jit, SRA must be spilled on the way out.
            return spill_sra;
        }
        if self.config.sra_enabled {
            assert!(
                !self.is_in_jit_code(trap_pc, true),
                "signals in dispatcher have unsynchronized context"
            );
        }
        plain
    }

    /// Spills a full `ContextBackup` below the host SP and records it.
    ///
    /// The frame lands past the host red zone, 16-byte aligned, and the trap
    /// SP is dropped below it so nested signals stack naturally.
    pub fn store_thread_state(&mut self, signal: i32, ctx: &mut dyn HostContext) {
        let old_sp = ctx.sp();
        let mut new_sp = old_sp - RED_ZONE_SIZE - size_of::<ContextBackup>() as u64;
        new_sp &= !15;

        let backup = ContextBackup {
            host: ctx.save_machine_context(),
            // Registers may be live in host GPRs or in the frame; save
            // everything as it currently stands.
            guest: unsafe { *self.thread.frame_mut() },
            signal,
        };
        unsafe { (new_sp as *mut ContextBackup).write_unaligned(backup) };

        ctx.set_sp(new_sp);
        self.signal_frames
            .try_push(new_sp)
            .expect("signal frame stack exhausted");
    }

    /// Pops the innermost `ContextBackup` and restores it.
    ///
    /// Guest state is restored before the host context: the JIT may resume
    /// the instant the host context is in place, and it must find the guest
    /// frame already valid.
    pub fn restore_thread_state(
        &mut self,
        ctx: &mut dyn HostContext,
        delegation: &dyn SignalDelegation,
    ) {
        let frame_addr = self
            .signal_frames
            .pop()
            .expect("restoring a signal frame when none are outstanding");
        let backup = unsafe { (frame_addr as *const ContextBackup).read_unaligned() };

        unsafe { *self.thread.frame_mut() = backup.guest };
        ctx.restore_machine_context(&backup.host);

        // Tell the delegator which signal is now outermost so recursive
        // masking walks back correctly.
        delegation.set_current_signal(backup.signal);
    }

    /// Delivers a signal to the guest's registered handler. See
    /// [`crate::frame`] for the frame synthesis itself.
    pub fn handle_guest_signal(
        &mut self,
        ctx: &mut dyn HostContext,
        signal: i32,
        info: &crate::siginfo::HostSiginfo,
        action: &peregrine_common_x86::signal::GuestSigAction,
        stack: &peregrine_common_x86::signal::GuestStack,
    ) -> bool {
        let trap_pc = ctx.pc();
        self.store_thread_state(signal, ctx);
        self.signal_handler_ref_count.fetch_add(1, Ordering::AcqRel);

        // The guest resumes inside the JIT at the SRA-fill loop top with the
        // state register pointing back at its frame.
        ctx.set_pc(self.entry_points.absolute_loop_top_fill_sra);
        ctx.set_state_reg(self.thread.frame_ptr() as u64);

        crate::frame::build_guest_frame(self, ctx, trap_pc, signal, info, action, stack);
        true
    }

    /// Handles the translator-reserved pause signal.
    pub fn handle_signal_pause(
        &mut self,
        ctx: &mut dyn HostContext,
        signal: i32,
        delegation: &dyn SignalDelegation,
    ) -> bool {
        match self.thread.signal_reason() {
            SignalEvent::Pause => {
                let trap_pc = ctx.pc();
                // Store our state so Return can come back to this exact spot.
                self.store_thread_state(signal, ctx);

                let target = self.select_handler_address(
                    trap_pc,
                    self.entry_points.thread_pause_handler,
                    self.entry_points.thread_pause_handler_spill_sra,
                );
                ctx.set_pc(target);
                ctx.set_state_reg(self.thread.frame_ptr() as u64);

                self.signal_handler_ref_count.fetch_add(1, Ordering::AcqRel);
                self.thread.set_signal_reason(SignalEvent::Nothing);
                true
            }
            SignalEvent::Stop => {
                // The thread is going away; drop straight back to the stack
                // location the dispatcher was entered with and abandon every
                // nested frame.
                let frame = unsafe { self.thread.frame_mut() };
                ctx.set_sp(frame.returning_stack_location);
                self.signal_frames.clear();
                self.signal_handler_ref_count.store(0, Ordering::Release);

                let trap_pc = ctx.pc();
                let target = self.select_handler_address(
                    trap_pc,
                    self.entry_points.thread_stop_handler,
                    self.entry_points.thread_stop_handler_spill_sra,
                );
                ctx.set_pc(target);

                self.thread.set_signal_reason(SignalEvent::Nothing);
                true
            }
            SignalEvent::Return => {
                self.restore_thread_state(ctx, delegation);
                self.signal_handler_ref_count.fetch_sub(1, Ordering::AcqRel);
                self.thread.set_signal_reason(SignalEvent::Nothing);
                true
            }
            SignalEvent::Nothing => false,
        }
    }

    /// Recognizes the synthetic return addresses the dispatcher parks guest
    /// threads on and unwinds one signal frame. Any other SIGILL is not ours.
    pub fn handle_sigill(
        &mut self,
        ctx: &mut dyn HostContext,
        delegation: &dyn SignalDelegation,
    ) -> bool {
        let pc = ctx.pc();
        if pc == self.entry_points.signal_handler_return_address
            || pc == self.entry_points.pause_return_instruction
        {
            self.restore_thread_state(ctx, delegation);
            self.signal_handler_ref_count.fetch_sub(1, Ordering::AcqRel);
            return true;
        }
        false
    }

    /// Parks the thread until another thread signals `start_running`.
    pub fn sleep_thread(&self, idle: &IdleWait) {
        idle.decrement();

        self.thread.start_running.wait();

        self.thread
            .running
            .store(true, core::sync::atomic::Ordering::Release);
        idle.increment();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peregrine_common_x86::Reg;
    use peregrine_platform_arm64::mock::MockContext;

    pub(crate) struct NullDelegation;

    impl SignalDelegation for NullDelegation {
        fn set_current_signal(&self, _signal: i32) {}
    }

    fn test_dispatcher() -> (Dispatcher, Arc<GuestThread>, Arc<CodeBufferRegistry>) {
        let thread = Arc::new(GuestThread::new());
        let registry = Arc::new(CodeBufferRegistry::new());
        let entry_points = JitEntryPoints {
            absolute_loop_top_fill_sra: 0x10_0000,
            thread_pause_handler: 0x10_0100,
            thread_pause_handler_spill_sra: 0x10_0200,
            thread_stop_handler: 0x10_0300,
            thread_stop_handler_spill_sra: 0x10_0400,
            signal_handler_return_address: 0x10_0500,
            pause_return_instruction: 0x10_0600,
            signal_return: 0x7000_0000,
        };
        let dispatcher = Dispatcher::new(
            Config::new_64bit(),
            entry_points,
            thread.clone(),
            registry.clone(),
        );
        (dispatcher, thread, registry)
    }

    /// A fake host stack for placing signal frames in.
    fn host_stack() -> (Vec<u8>, u64) {
        let stack = vec![0u8; 64 * 1024];
        let top = (stack.as_ptr() as u64 + stack.len() as u64) & !15;
        (stack, top)
    }

    #[test]
    fn store_restore_round_trips() {
        let (mut dispatcher, thread, _) = test_dispatcher();
        let (_stack, top) = host_stack();

        let mut ctx = MockContext::new();
        ctx.sp = top;
        ctx.pc = 0xdead_0000;
        ctx.regs[0] = 111;
        ctx.regs[30] = 222;

        unsafe { thread.frame_mut() }.state.rip = 0x4242;
        unsafe { thread.frame_mut() }.state.set_greg(Reg::Rax, 77);

        dispatcher.store_thread_state(11, &mut ctx);
        assert_eq!(dispatcher.signal_frame_depth(), 1);
        assert!(ctx.sp < top);
        assert_eq!(ctx.sp & 15, 0);

        // Trash everything, as running a handler would.
        unsafe { thread.frame_mut() }.state.rip = 0;
        unsafe { thread.frame_mut() }.state.set_greg(Reg::Rax, 0);
        ctx.pc = 0;
        ctx.regs[0] = 0;
        ctx.regs[30] = 0;

        dispatcher.restore_thread_state(&mut ctx, &NullDelegation);
        assert_eq!(dispatcher.signal_frame_depth(), 0);
        assert_eq!(ctx.sp, top);
        assert_eq!(ctx.pc, 0xdead_0000);
        assert_eq!(ctx.regs[0], 111);
        assert_eq!(ctx.regs[30], 222);
        assert_eq!(unsafe { thread.frame_mut() }.state.rip, 0x4242);
        assert_eq!(unsafe { thread.frame_mut() }.state.greg(Reg::Rax), 77);
    }

    #[test]
    #[should_panic(expected = "none are outstanding")]
    fn restore_with_empty_stack_asserts() {
        let (mut dispatcher, _, _) = test_dispatcher();
        let mut ctx = MockContext::new();
        dispatcher.restore_thread_state(&mut ctx, &NullDelegation);
    }

    #[test]
    fn pause_then_return_round_trips() {
        // Scenario: pause redirects to the SpillSRA pause handler, Return
        // restores the pre-pause context.
        let (mut dispatcher, thread, registry) = test_dispatcher();
        let (_stack, top) = host_stack();
        registry.insert(0x5000_0000, 0x5000_1000).unwrap();

        let mut ctx = MockContext::new();
        ctx.sp = top;
        ctx.pc = 0x5000_0040; // inside JIT
        ctx.regs[4] = 9; // SRA content, irrelevant here

        thread.set_signal_reason(SignalEvent::Pause);
        assert!(dispatcher.handle_signal_pause(&mut ctx, 64, &NullDelegation));
        assert_eq!(ctx.pc, dispatcher.entry_points().thread_pause_handler_spill_sra);
        assert_eq!(
            ctx.regs[peregrine_platform_arm64::STATE_REG as usize],
            thread.frame_ptr() as u64
        );
        assert_eq!(dispatcher.signal_handler_ref_count(), 1);
        assert_eq!(thread.signal_reason(), SignalEvent::Nothing);

        thread.set_signal_reason(SignalEvent::Return);
        assert!(dispatcher.handle_signal_pause(&mut ctx, 64, &NullDelegation));
        assert_eq!(ctx.pc, 0x5000_0040);
        assert_eq!(ctx.sp, top);
        assert_eq!(dispatcher.signal_handler_ref_count(), 0);
        assert_eq!(dispatcher.signal_frame_depth(), 0);
    }

    #[test]
    fn pause_outside_jit_uses_plain_handler() {
        let (mut dispatcher, thread, _) = test_dispatcher();
        let (_stack, top) = host_stack();

        let mut ctx = MockContext::new();
        ctx.sp = top;
        ctx.pc = 0x9999_0000; // not JIT, not dispatcher

        thread.set_signal_reason(SignalEvent::Pause);
        assert!(dispatcher.handle_signal_pause(&mut ctx, 64, &NullDelegation));
        assert_eq!(ctx.pc, dispatcher.entry_points().thread_pause_handler);
    }

    #[test]
    #[should_panic(expected = "unsynchronized context")]
    fn pause_inside_dispatcher_asserts() {
        let (mut dispatcher, thread, registry) = test_dispatcher();
        let (_stack, top) = host_stack();
        registry.set_dispatcher_range(0x6000_0000, 0x6000_1000);

        let mut ctx = MockContext::new();
        ctx.sp = top;
        ctx.pc = 0x6000_0040;

        thread.set_signal_reason(SignalEvent::Pause);
        dispatcher.handle_signal_pause(&mut ctx, 64, &NullDelegation);
    }

    #[test]
    fn stop_abandons_nested_frames() {
        // Scenario: stop while two frames deep resets SP and the refcounter.
        let (mut dispatcher, thread, _) = test_dispatcher();
        let (_stack, top) = host_stack();

        let mut ctx = MockContext::new();
        ctx.sp = top;
        ctx.pc = 0x9999_0000;
        unsafe { thread.frame_mut() }.returning_stack_location = top - 0x400;

        dispatcher.store_thread_state(10, &mut ctx);
        dispatcher.store_thread_state(12, &mut ctx);
        dispatcher
            .signal_handler_ref_count
            .store(2, Ordering::Release);
        assert_eq!(dispatcher.signal_frame_depth(), 2);

        thread.set_signal_reason(SignalEvent::Stop);
        assert!(dispatcher.handle_signal_pause(&mut ctx, 64, &NullDelegation));
        assert_eq!(ctx.sp, top - 0x400);
        assert_eq!(ctx.pc, dispatcher.entry_points().thread_stop_handler);
        assert_eq!(dispatcher.signal_handler_ref_count(), 0);
        assert_eq!(dispatcher.signal_frame_depth(), 0);
    }

    #[test]
    fn pause_signal_without_reason_is_declined() {
        let (mut dispatcher, _, _) = test_dispatcher();
        let mut ctx = MockContext::new();
        assert!(!dispatcher.handle_signal_pause(&mut ctx, 64, &NullDelegation));
    }

    #[test]
    fn sigill_recognizes_synthetic_returns() {
        let (mut dispatcher, _, _) = test_dispatcher();
        let (_stack, top) = host_stack();

        let mut ctx = MockContext::new();
        ctx.sp = top;
        ctx.pc = 0x1234_5678;
        dispatcher.store_thread_state(4, &mut ctx);
        dispatcher
            .signal_handler_ref_count
            .store(1, Ordering::Release);

        ctx.pc = dispatcher.entry_points().signal_handler_return_address;
        assert!(dispatcher.handle_sigill(&mut ctx, &NullDelegation));
        assert_eq!(ctx.pc, 0x1234_5678);
        assert_eq!(dispatcher.signal_handler_ref_count(), 0);

        ctx.pc = 0xbad0_bad0;
        assert!(!dispatcher.handle_sigill(&mut ctx, &NullDelegation));
    }

    #[test]
    fn sleep_thread_blocks_until_started() {
        let (dispatcher, thread, _) = test_dispatcher();
        let idle = Arc::new(IdleWait::new(1));

        std::thread::scope(|scope| {
            let idle_waiter = idle.clone();
            let waker = thread.clone();
            scope.spawn(move || {
                // Wait until the sleeper has parked, then wake it.
                idle_waiter.wait_for(0);
                waker.start_running.notify();
            });
            dispatcher.sleep_thread(&idle);
        });

        assert_eq!(idle.count(), 1);
        assert!(thread.running.load(Ordering::Acquire));
    }
}
