// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Process-wide signal delegation.
//!
//! One delegator exists per process. It owns the per-signal handler table,
//! installs the host signal thunks, and routes every incoming host signal:
//! first to a host-level handler (trap emulation, translator control), then
//! to a frontend handler, and finally to guest delivery. Threads register
//! their per-thread state once at startup; signal handlers find it through a
//! raw thread-local, never through a lock.

use core::cell::{Cell, UnsafeCell};
use std::sync::{Mutex, OnceLock};

use peregrine_common_x86::Reg;
use peregrine_common_x86::signal::{
    GuestSigAction, GuestStack, MINSIGSTKSZ, NSIG, SIG_DFL, SIG_IGN, SaFlags, Signal,
    SignalDisposition, SsFlags,
};
use peregrine_platform_arm64::context::HostContext;

use crate::dispatcher::{Dispatcher, SignalDelegation};
use crate::siginfo::HostSiginfo;

pub const MAX_SIGNALS: usize = NSIG;

/// The translator-reserved signal used for the pause/stop/return protocol.
pub const PAUSE_SIGNAL: i32 = 64;

/// What to do when the guest leaves a signal at its default disposition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DefaultBehaviour {
    Term,
    Ignore,
    Coredump,
}

/// A host-level handler: returns true if it fully consumed the signal.
pub type HostHandlerFn =
    fn(&SignalDelegator, &mut ThreadData, i32, &HostSiginfo, &mut dyn HostContext) -> bool;

struct HandlerEntry {
    host_handler: Option<HostHandlerFn>,
    frontend_handler: Option<HostHandlerFn>,
    guest_action: GuestSigAction,
    default_behaviour: DefaultBehaviour,
    /// Required signals can never be masked away from the host handlers.
    required: bool,
    installed: bool,
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    old_action: libc::sigaction,
}

impl HandlerEntry {
    fn new() -> Self {
        Self {
            host_handler: None,
            frontend_handler: None,
            guest_action: GuestSigAction::default_action(),
            default_behaviour: DefaultBehaviour::Term,
            required: false,
            installed: false,
            #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
            old_action: unsafe { core::mem::zeroed() },
        }
    }
}

/// Per-thread signal state, owned by the thread that registered it.
pub struct ThreadData {
    pub dispatcher: Dispatcher,
    pub guest_alt_stack: GuestStack,
    /// The guest's current signal mask.
    pub current_signal_mask: u64,
    /// Signals received while masked, waiting for an unmask.
    pub pending_signals: u64,
    /// Guest `sa_mask` per signal; OR'd into the current mask on delivery.
    pub guest_sa_masks: [u64; MAX_SIGNALS + 1],
    pub pid: i32,
    pub tid: i32,
    /// Guest address to clear and futex-wake when this thread dies
    /// (`set_tid_address`); zero when unset.
    pub clear_child_tid: u64,
    /// Exit status recorded when a default-terminate signal brings the
    /// thread down.
    pub status_code: i32,
}

impl ThreadData {
    pub fn new(dispatcher: Dispatcher, pid: i32, tid: i32) -> Self {
        Self {
            dispatcher,
            guest_alt_stack: GuestStack::disabled(),
            current_signal_mask: 0,
            pending_signals: 0,
            guest_sa_masks: [0; MAX_SIGNALS + 1],
            pid,
            tid,
            clear_child_tid: 0,
            status_code: 0,
        }
    }
}

thread_local! {
    /// The current thread's [`ThreadData`], registered at thread startup.
    static THREAD_DATA: Cell<*mut ThreadData> = const { Cell::new(core::ptr::null_mut()) };
    /// The outermost signal currently being handled on this thread.
    static CURRENT_SIGNAL: Cell<i32> = const { Cell::new(0) };
}

/// How [`SignalDelegator::route_signal`] disposed of a signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Consumed: emulated, deferred, delivered to the guest, or ignored.
    Handled,
    /// The guest left the default disposition and the default terminates;
    /// the caller shuts the translator down cleanly.
    DefaultTerminate,
    /// The guest left the default disposition and the default dumps core;
    /// the caller hands the signal back to the OS so a real coredump is
    /// produced.
    DefaultCoredump,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("invalid signal number")]
    InvalidSignal,
    #[error("signal disposition cannot be changed")]
    Immutable,
    #[error("alternate signal stack is in use")]
    AltStackInUse,
    #[error("unsupported alternate stack flags")]
    BadAltStackFlags,
    #[error("alternate stack below minimum size")]
    AltStackTooSmall,
}

static GLOBAL: OnceLock<&'static SignalDelegator> = OnceLock::new();

pub struct SignalDelegator {
    /// Indexed by signal number; slot 0 unused. Mutated only under
    /// `registration_lock`; signal handlers read it without locking, exactly
    /// as host sigaction itself races with concurrent delivery.
    handlers: UnsafeCell<[HandlerEntry; MAX_SIGNALS + 1]>,
    registration_lock: Mutex<()>,
    pause_signal: i32,
}

unsafe impl Sync for SignalDelegator {}

impl SignalDelegator {
    fn new() -> Self {
        let mut handlers: [HandlerEntry; MAX_SIGNALS + 1] =
            core::array::from_fn(|_| HandlerEntry::new());

        // Signal 0 is not real, and KILL/STOP cannot be caught.
        handlers[0].installed = true;
        handlers[Signal::SIGKILL.as_i32() as usize].installed = true;
        handlers[Signal::SIGSTOP.as_i32() as usize].installed = true;

        for sig in 1..=MAX_SIGNALS as i32 {
            let Ok(signal) = Signal::try_from(sig) else {
                continue;
            };
            handlers[sig as usize].default_behaviour = match signal.default_disposition() {
                SignalDisposition::Core => DefaultBehaviour::Coredump,
                SignalDisposition::Ignore | SignalDisposition::Continue => {
                    DefaultBehaviour::Ignore
                }
                // Stop is not supported; treat as termination.
                SignalDisposition::Stop | SignalDisposition::Terminate => DefaultBehaviour::Term,
            };
        }

        Self {
            handlers: UnsafeCell::new(handlers),
            registration_lock: Mutex::new(()),
            pause_signal: PAUSE_SIGNAL,
        }
    }

    /// Creates and registers the process-wide delegator.
    ///
    /// # Panics
    ///
    /// Panics if a delegator was already installed.
    pub fn install() -> &'static Self {
        let delegator = Box::leak(Box::new(Self::new()));
        GLOBAL
            .set(delegator)
            .ok()
            .expect("signal delegator installed twice");
        delegator
    }

    pub fn global() -> Option<&'static Self> {
        GLOBAL.get().copied()
    }

    pub fn pause_signal(&self) -> i32 {
        self.pause_signal
    }

    /// Registers the current thread's state for signal handling and points
    /// the raw TLS slot at it. The caller keeps ownership and must outlive
    /// all signal delivery on this thread.
    pub fn register_tls_state(&self, data: *mut ThreadData) {
        THREAD_DATA.set(data);
    }

    pub fn uninstall_tls_state(&self) {
        THREAD_DATA.set(core::ptr::null_mut());
    }

    /// Registers a host-level handler that sees the signal before the guest.
    pub fn register_host_signal_handler(&self, signal: i32, func: HostHandlerFn, required: bool) {
        let _guard = self.registration_lock.lock().unwrap();
        let entry = unsafe { &mut (*self.handlers.get())[signal as usize] };
        entry.host_handler = Some(func);
        entry.required = required;
        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        self.install_host_thunk(signal);
    }

    pub fn register_frontend_host_signal_handler(
        &self,
        signal: i32,
        func: HostHandlerFn,
        required: bool,
    ) {
        let _guard = self.registration_lock.lock().unwrap();
        let entry = unsafe { &mut (*self.handlers.get())[signal as usize] };
        entry.frontend_handler = Some(func);
        entry.required = required;
        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        self.install_host_thunk(signal);
    }

    /// Wires up the built-in host handlers: misaligned-atomic emulation on
    /// SIGBUS, synthetic-return recognition on SIGILL, and the pause/stop
    /// protocol on the reserved signal.
    pub fn register_default_host_handlers(&self) {
        self.register_host_signal_handler(Signal::SIGBUS.as_i32(), host_sigbus_handler, true);
        self.register_host_signal_handler(Signal::SIGILL.as_i32(), host_sigill_handler, true);
        self.register_host_signal_handler(self.pause_signal, host_pause_handler, true);
    }

    /// Guest `rt_sigaction`.
    pub fn register_guest_signal_handler(
        &self,
        thread: &mut ThreadData,
        signal: i32,
        action: Option<&GuestSigAction>,
        old_action: Option<&mut GuestSigAction>,
    ) -> Result<(), SignalError> {
        let sig = Signal::try_from(signal).map_err(|_| SignalError::InvalidSignal)?;

        let _guard = self.registration_lock.lock().unwrap();
        let entry = unsafe { &mut (*self.handlers.get())[signal as usize] };

        if let Some(old_action) = old_action {
            *old_action = entry.guest_action;
        }

        if let Some(action) = action {
            if sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
                return Err(SignalError::Immutable);
            }
            entry.guest_action = *action;
            thread.guest_sa_masks[signal as usize] = action.mask.as_u64();
            #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
            if !self.install_host_thunk(signal) {
                self.update_host_thunk(signal);
            }
        }

        Ok(())
    }

    /// Guest `sigaltstack`.
    pub fn register_guest_sigaltstack(
        &self,
        thread: &mut ThreadData,
        ss: Option<&GuestStack>,
        old_ss: Option<&mut GuestStack>,
    ) -> Result<(), SignalError> {
        let guest_sp = unsafe { thread.dispatcher.thread().frame_mut() }
            .state
            .greg(Reg::Rsp);
        let using_alt_stack = thread.guest_alt_stack.contains(guest_sp);

        if let Some(old_ss) = old_ss {
            *old_ss = thread.guest_alt_stack;
            if using_alt_stack {
                old_ss.flags |= SsFlags::ONSTACK;
            } else {
                old_ss.flags |= SsFlags::DISABLE;
            }
        }

        if let Some(ss) = ss {
            // Changing the stack out from under ourselves is not allowed.
            if using_alt_stack {
                return Err(SignalError::AltStackInUse);
            }
            if !ss
                .flags
                .difference(SsFlags::AUTODISARM | SsFlags::DISABLE)
                .is_empty()
            {
                return Err(SignalError::BadAltStackFlags);
            }
            if ss.flags.contains(SsFlags::DISABLE) {
                // Disabling ignores the remaining fields.
                thread.guest_alt_stack = *ss;
                return Ok(());
            }
            if ss.size < MINSIGSTKSZ {
                return Err(SignalError::AltStackTooSmall);
            }
            thread.guest_alt_stack = *ss;
        }

        Ok(())
    }

    /// Guest signal-mask update; re-raises any pending signal the new mask
    /// uncovered.
    pub fn set_guest_signal_mask(&self, thread: &mut ThreadData, mask: u64) {
        const UNMASKABLE: u64 = (1 << (9 - 1)) | (1 << (19 - 1)); // KILL, STOP
        thread.current_signal_mask = mask & !UNMASKABLE;
        self.reraise_pending(thread);
    }

    fn reraise_pending(&self, thread: &mut ThreadData) {
        let pending = thread.pending_signals & !thread.current_signal_mask;
        if pending == 0 {
            return;
        }
        for sig in 1..=MAX_SIGNALS as i32 {
            if pending & (1 << (sig - 1)) != 0 {
                raise_thread_signal(thread, sig);
            }
        }
    }

    /// Routes one host signal for a registered thread.
    pub fn route_signal(
        &self,
        thread: &mut ThreadData,
        signal: i32,
        info: &HostSiginfo,
        ctx: &mut dyn HostContext,
    ) -> RouteOutcome {
        let (host_handler, frontend_handler, action, default_behaviour) = {
            let entry = unsafe { &(*self.handlers.get())[signal as usize] };
            (
                entry.host_handler,
                entry.frontend_handler,
                entry.guest_action,
                entry.default_behaviour,
            )
        };

        // The host gets first stab: trap emulation and translator control
        // never reach the guest.
        if let Some(handler) = host_handler {
            if handler(self, thread, signal, info, ctx) {
                return RouteOutcome::Handled;
            }
        }
        if let Some(handler) = frontend_handler {
            if handler(self, thread, signal, info, ctx) {
                return RouteOutcome::Handled;
            }
        }

        if signal == Signal::SIGCHLD.as_i32() && action.flags.contains(SaFlags::NOCLDSTOP) {
            let stop_or_resume = matches!(
                info.code(),
                libc::CLD_STOPPED | libc::CLD_CONTINUED | libc::CLD_TRAPPED
            );
            if stop_or_resume {
                // SA_NOCLDSTOP drops child stop/continue/trap notifications.
                return RouteOutcome::Handled;
            }
        }

        let bit = 1u64 << (signal - 1);
        if thread.current_signal_mask & bit != 0 {
            thread.pending_signals |= bit;
            return RouteOutcome::Handled;
        }

        thread.current_signal_mask |= thread.guest_sa_masks[signal as usize];
        if !action.flags.contains(SaFlags::NODEFER) {
            thread.current_signal_mask |= bit;
        }
        CURRENT_SIGNAL.set(signal);
        thread.pending_signals &= !bit;

        match action.sigaction {
            SIG_DFL => match default_behaviour {
                DefaultBehaviour::Ignore => RouteOutcome::Handled,
                DefaultBehaviour::Term => RouteOutcome::DefaultTerminate,
                DefaultBehaviour::Coredump => RouteOutcome::DefaultCoredump,
            },
            SIG_IGN => RouteOutcome::Handled,
            _ => {
                let stack = thread.guest_alt_stack;
                if thread
                    .dispatcher
                    .handle_guest_signal(ctx, signal, info, &action, &stack)
                {
                    RouteOutcome::Handled
                } else {
                    panic!("unhandled guest exception");
                }
            }
        }
    }

    pub fn current_signal() -> i32 {
        CURRENT_SIGNAL.get()
    }
}

impl SignalDelegation for SignalDelegator {
    fn set_current_signal(&self, signal: i32) {
        CURRENT_SIGNAL.set(signal);
    }
}

fn host_sigbus_handler(
    _delegator: &SignalDelegator,
    _thread: &mut ThreadData,
    _signal: i32,
    info: &HostSiginfo,
    ctx: &mut dyn HostContext,
) -> bool {
    peregrine_platform_arm64::atomic_emu::handle_misaligned_access(ctx, info.code())
}

fn host_sigill_handler(
    delegator: &SignalDelegator,
    thread: &mut ThreadData,
    _signal: i32,
    _info: &HostSiginfo,
    ctx: &mut dyn HostContext,
) -> bool {
    thread.dispatcher.handle_sigill(ctx, delegator)
}

fn host_pause_handler(
    delegator: &SignalDelegator,
    thread: &mut ThreadData,
    signal: i32,
    _info: &HostSiginfo,
    ctx: &mut dyn HostContext,
) -> bool {
    thread.dispatcher.handle_signal_pause(ctx, signal, delegator)
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        fn raise_thread_signal(thread: &ThreadData, signal: i32) {
            let _ = unsafe {
                syscalls::syscall3(
                    syscalls::Sysno::tgkill,
                    thread.pid as usize,
                    thread.tid as usize,
                    signal as usize,
                )
            };
        }
    } else {
        fn raise_thread_signal(_thread: &ThreadData, _signal: i32) {}
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod host {
    use super::*;
    use peregrine_platform_arm64::context::UContext;

    /// Clears the thread's `set_tid_address` word and wakes its waiters, so
    /// a join on this dying thread completes.
    fn wake_clear_child_tid(thread: &ThreadData) {
        if thread.clear_child_tid == 0 {
            return;
        }
        let addr = thread.clear_child_tid as *const core::sync::atomic::AtomicU32;
        unsafe { (*addr).store(0, core::sync::atomic::Ordering::SeqCst) };
        let _ = unsafe {
            syscalls::syscall3(
                syscalls::Sysno::futex,
                thread.clear_child_tid as usize,
                libc::FUTEX_WAKE as usize,
                usize::MAX,
            )
        };
    }

    unsafe extern "C" fn signal_handler_thunk(
        signal: libc::c_int,
        info: *mut libc::siginfo_t,
        uctx: *mut libc::c_void,
    ) {
        let Some(delegator) = SignalDelegator::global() else {
            return;
        };
        unsafe { delegator.handle_host_signal(signal, info, uctx) };
    }

    impl SignalDelegator {
        /// The real host-signal entry point.
        ///
        /// # Safety
        ///
        /// Must only be called from a signal handler with the kernel-provided
        /// `info`/`uctx` pointers.
        pub unsafe fn handle_host_signal(
            &self,
            signal: libc::c_int,
            info: *mut libc::siginfo_t,
            uctx: *mut libc::c_void,
        ) {
            let snapshot = unsafe { HostSiginfo::from_host(info) };
            let mut ctx = unsafe { UContext::new(&mut *uctx.cast::<libc::ucontext_t>()) };

            let data = THREAD_DATA.get();
            if data.is_null() {
                crate::log_println!(
                    "thread received signal {signal} without registering with the delegator"
                );
                unsafe { self.chain_to_old_action(signal, info, uctx) };
                return;
            }

            let thread = unsafe { &mut *data };
            match self.route_signal(thread, signal, &snapshot, &mut ctx) {
                RouteOutcome::Handled => {}
                RouteOutcome::DefaultTerminate => {
                    // Translator-side shutdown: wake anyone joining on this
                    // thread, record the status, and leave. The old host
                    // action is never involved.
                    crate::log_println!("-- Fatal guest signal {signal}: terminating");
                    thread.status_code = -signal;
                    wake_clear_child_tid(thread);
                    std::process::exit(128 + signal);
                }
                RouteOutcome::DefaultCoredump => {
                    // Hand the signal back to the OS default so the guest
                    // gets a real coredump.
                    crate::log_println!("-- Fatal guest signal {signal}: dumping core");
                    unsafe { self.chain_to_old_action(signal, info, uctx) };
                }
            }
        }

        /// Runs the handler that was installed before ours.
        unsafe fn chain_to_old_action(
            &self,
            signal: libc::c_int,
            info: *mut libc::siginfo_t,
            uctx: *mut libc::c_void,
        ) {
            let old_action = {
                let entry = unsafe { &(*self.handlers.get())[signal as usize] };
                entry.old_action
            };
            unsafe {
                match old_action.sa_sigaction {
                    libc::SIG_DFL => {
                        // Reinstate the default, unblock, and re-raise: the
                        // kernel terminates us the documented way.
                        let mut sa: libc::sigaction = core::mem::zeroed();
                        sa.sa_sigaction = libc::SIG_DFL;
                        libc::sigaction(signal, &raw const sa, core::ptr::null_mut());
                        let mut set: libc::sigset_t = core::mem::zeroed();
                        libc::sigemptyset(&raw mut set);
                        libc::sigaddset(&raw mut set, signal);
                        libc::sigprocmask(libc::SIG_UNBLOCK, &raw const set, core::ptr::null_mut());
                        libc::raise(signal);
                    }
                    libc::SIG_IGN => {}
                    handler => {
                        if old_action.sa_flags & libc::SA_SIGINFO != 0 {
                            let handler: extern "C" fn(
                                libc::c_int,
                                *mut libc::siginfo_t,
                                *mut libc::c_void,
                            ) = core::mem::transmute(handler);
                            handler(signal, info, uctx);
                        } else {
                            let handler: extern "C" fn(libc::c_int) =
                                core::mem::transmute(handler);
                            handler(signal);
                        }
                    }
                }
            }
        }

        /// Installs the host thunk for `signal` if it is not yet installed.
        /// Returns true if this call installed it.
        pub(super) fn install_host_thunk(&self, signal: i32) -> bool {
            let entry = unsafe { &mut (*self.handlers.get())[signal as usize] };
            if entry.installed {
                return false;
            }
            entry.installed = self.update_host_thunk(signal);
            entry.installed
        }

        /// (Re)writes the host sigaction for `signal`, folding in the flags
        /// and mask the guest asked for where the host can honor them.
        pub(super) fn update_host_thunk(&self, signal: i32) -> bool {
            let handlers = unsafe { &mut *self.handlers.get() };

            let mut sa: libc::sigaction = unsafe { core::mem::zeroed() };
            sa.sa_sigaction = signal_handler_thunk as usize;
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;

            let guest_flags = handlers[signal as usize].guest_action.flags;
            if guest_flags.contains(SaFlags::NODEFER) {
                sa.sa_flags |= libc::SA_NODEFER;
            }
            if guest_flags.contains(SaFlags::RESTART) {
                sa.sa_flags |= libc::SA_RESTART;
            }

            // Required host signals must never be masked during delivery;
            // beyond that, honor the guest's sa_mask.
            let guest_mask = handlers[signal as usize].guest_action.mask;
            unsafe {
                libc::sigemptyset(&raw mut sa.sa_mask);
                for sig in 1..=MAX_SIGNALS as i32 {
                    let Ok(guest_sig) = Signal::try_from(sig) else {
                        continue;
                    };
                    if handlers[sig as usize].required {
                        continue;
                    }
                    if guest_mask.contains(guest_sig) {
                        libc::sigaddset(&raw mut sa.sa_mask, sig);
                    }
                }
            }

            let installed = handlers[signal as usize].installed;
            let old_action = if installed {
                core::ptr::null_mut()
            } else {
                &raw mut handlers[signal as usize].old_action
            };
            let result = unsafe { libc::sigaction(signal, &raw const sa, old_action) };
            if result < 0 {
                crate::log_println!("failed to install host signal thunk for signal {signal}");
                return false;
            }
            true
        }
    }

    /// Allocates and registers a host alternate signal stack for this
    /// thread, returning its base for later teardown.
    pub fn setup_host_alt_stack() -> *mut libc::c_void {
        let size = libc::SIGSTKSZ;
        let stack = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert!(stack != libc::MAP_FAILED, "failed to map alt signal stack");

        let altstack = libc::stack_t {
            ss_sp: stack,
            ss_flags: 0,
            ss_size: size,
        };
        let result = unsafe { libc::sigaltstack(&raw const altstack, core::ptr::null_mut()) };
        assert!(result == 0, "failed to install alt signal stack");
        stack
    }

    pub fn teardown_host_alt_stack(stack: *mut libc::c_void) {
        let altstack = libc::stack_t {
            ss_sp: core::ptr::null_mut(),
            ss_flags: libc::SS_DISABLE,
            ss_size: 0,
        };
        unsafe {
            libc::sigaltstack(&raw const altstack, core::ptr::null_mut());
            libc::munmap(stack, libc::SIGSTKSZ);
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub use host::{setup_host_alt_stack, teardown_host_alt_stack};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_buffers::CodeBufferRegistry;
    use crate::config::Config;
    use crate::dispatcher::JitEntryPoints;
    use crate::thread::{GuestThread, SignalEvent};
    use peregrine_platform_arm64::mock::MockContext;
    use std::sync::Arc;

    fn delegator() -> SignalDelegator {
        SignalDelegator::new()
    }

    fn thread_data() -> ThreadData {
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
        let dispatcher = Dispatcher::new(Config::new_64bit(), entry_points, thread, registry);
        ThreadData::new(dispatcher, 1000, 1001)
    }

    #[test]
    fn sigaltstack_validation() {
        let delegator = delegator();
        let mut thread = thread_data();

        // Unknown flags are rejected.
        let bad_flags = GuestStack {
            sp: 0x1000,
            flags: SsFlags::ONSTACK,
            size: 0x4000,
        };
        assert_eq!(
            delegator.register_guest_sigaltstack(&mut thread, Some(&bad_flags), None),
            Err(SignalError::BadAltStackFlags)
        );

        // Undersized stacks are rejected.
        let small = GuestStack {
            sp: 0x1000,
            flags: SsFlags::empty(),
            size: MINSIGSTKSZ - 1,
        };
        assert_eq!(
            delegator.register_guest_sigaltstack(&mut thread, Some(&small), None),
            Err(SignalError::AltStackTooSmall)
        );

        let good = GuestStack {
            sp: 0x6000_0000,
            flags: SsFlags::empty(),
            size: 0x1_0000,
        };
        delegator
            .register_guest_sigaltstack(&mut thread, Some(&good), None)
            .unwrap();

        // While executing on the alt stack, changing it is EPERM and the old
        // stack reports ONSTACK.
        unsafe { thread.dispatcher.thread().frame_mut() }
            .state
            .set_greg(Reg::Rsp, 0x6000_8000);
        let mut old = GuestStack::disabled();
        assert_eq!(
            delegator.register_guest_sigaltstack(&mut thread, Some(&good), Some(&mut old)),
            Err(SignalError::AltStackInUse)
        );
        assert!(old.flags.contains(SsFlags::ONSTACK));

        // Disabling ignores size validation.
        unsafe { thread.dispatcher.thread().frame_mut() }
            .state
            .set_greg(Reg::Rsp, 0x7fff_0000);
        let disable = GuestStack {
            sp: 0,
            flags: SsFlags::DISABLE,
            size: 0,
        };
        delegator
            .register_guest_sigaltstack(&mut thread, Some(&disable), None)
            .unwrap();
        assert!(thread.guest_alt_stack.flags.contains(SsFlags::DISABLE));
    }

    #[test]
    fn guest_sigaction_validation() {
        let delegator = delegator();
        let mut thread = thread_data();
        let action = GuestSigAction {
            sigaction: 0x1234,
            flags: SaFlags::SIGINFO,
            restorer: 0,
            mask: peregrine_common_x86::signal::SigSet::empty(),
        };

        assert_eq!(
            delegator.register_guest_signal_handler(&mut thread, 0, Some(&action), None),
            Err(SignalError::InvalidSignal)
        );
        assert_eq!(
            delegator.register_guest_signal_handler(
                &mut thread,
                Signal::SIGKILL.as_i32(),
                Some(&action),
                None
            ),
            Err(SignalError::Immutable)
        );

        delegator
            .register_guest_signal_handler(&mut thread, 10, Some(&action), None)
            .unwrap();
        let mut old = GuestSigAction::default_action();
        delegator
            .register_guest_signal_handler(&mut thread, 10, None, Some(&mut old))
            .unwrap();
        assert_eq!(old.sigaction, 0x1234);
    }

    #[test]
    fn masked_signal_goes_pending_and_reraises() {
        let delegator = delegator();
        let mut thread = thread_data();
        let mut ctx = MockContext::new();

        thread.current_signal_mask = 1 << (10 - 1);
        let info = HostSiginfo::synthesize(10, 0, 0);
        assert_eq!(
            delegator.route_signal(&mut thread, 10, &info, &mut ctx),
            RouteOutcome::Handled
        );
        assert_eq!(thread.pending_signals, 1 << (10 - 1));

        // Unmasking re-raises (a no-op kill on non-arm hosts) but always
        // clears the mask.
        delegator.set_guest_signal_mask(&mut thread, 0);
        assert_eq!(thread.current_signal_mask, 0);
    }

    #[test]
    fn ignored_and_default_dispositions() {
        let delegator = delegator();
        let mut thread = thread_data();
        let mut ctx = MockContext::new();

        // SIGCHLD defaults to ignore.
        let info = HostSiginfo::synthesize(17, 0, 0);
        assert_eq!(
            delegator.route_signal(&mut thread, 17, &info, &mut ctx),
            RouteOutcome::Handled
        );

        // SIGTERM defaults to terminate.
        let info = HostSiginfo::synthesize(15, 0, 0);
        assert_eq!(
            delegator.route_signal(&mut thread, 15, &info, &mut ctx),
            RouteOutcome::DefaultTerminate
        );

        // SIGSEGV defaults to a coredump, which is handed back to the OS
        // rather than shut down internally.
        let info = HostSiginfo::synthesize(11, 0, libc::SI_KERNEL);
        assert_eq!(
            delegator.route_signal(&mut thread, 11, &info, &mut ctx),
            RouteOutcome::DefaultCoredump
        );
    }

    #[test]
    fn nocldstop_drops_child_stop_notifications() {
        let delegator = delegator();
        let mut thread = thread_data();
        let mut ctx = MockContext::new();

        let action = GuestSigAction {
            sigaction: 0x5555,
            flags: SaFlags::SIGINFO | SaFlags::NOCLDSTOP,
            restorer: 0,
            mask: peregrine_common_x86::signal::SigSet::empty(),
        };
        delegator
            .register_guest_signal_handler(&mut thread, 17, Some(&action), None)
            .unwrap();

        let info = HostSiginfo::synthesize(17, 0, libc::CLD_STOPPED);
        assert_eq!(
            delegator.route_signal(&mut thread, 17, &info, &mut ctx),
            RouteOutcome::Handled
        );
        // Dropped, not delivered: no signal frame was pushed.
        assert_eq!(thread.dispatcher.signal_frame_depth(), 0);
    }

    #[test]
    fn pause_protocol_routes_through_host_handler() {
        let delegator = delegator();
        delegator.register_default_host_handlers();
        let mut thread = thread_data();

        let stack = vec![0u8; 64 * 1024];
        let mut ctx = MockContext::new();
        ctx.sp = (stack.as_ptr() as u64 + stack.len() as u64) & !15;
        ctx.pc = 0x9999_0000;

        thread.dispatcher.thread().set_signal_reason(SignalEvent::Pause);
        let info = HostSiginfo::synthesize(PAUSE_SIGNAL, 0, 0);
        assert_eq!(
            delegator.route_signal(&mut thread, PAUSE_SIGNAL, &info, &mut ctx),
            RouteOutcome::Handled
        );
        assert_eq!(ctx.pc, 0x10_0100);
        assert_eq!(thread.dispatcher.signal_handler_ref_count(), 1);
    }

    #[test]
    fn delivery_updates_current_signal_and_mask() {
        let delegator = delegator();
        let mut thread = thread_data();
        let mut ctx = MockContext::new();

        let stack = vec![0u8; 64 * 1024];
        ctx.sp = (stack.as_ptr() as u64 + stack.len() as u64) & !15;

        let guest_stack = vec![0u8; 64 * 1024];
        let guest_top = (guest_stack.as_ptr() as u64 + guest_stack.len() as u64) & !15;
        unsafe { thread.dispatcher.thread().frame_mut() }
            .state
            .set_greg(Reg::Rsp, guest_top);

        let mut mask = peregrine_common_x86::signal::SigSet::empty();
        mask.add(Signal::SIGUSR2);
        let action = GuestSigAction {
            sigaction: 0x4000_0000,
            flags: SaFlags::SIGINFO,
            restorer: 0,
            mask,
        };
        delegator
            .register_guest_signal_handler(&mut thread, 10, Some(&action), None)
            .unwrap();

        let info = HostSiginfo::synthesize(10, 0, libc::SI_KERNEL);
        assert_eq!(
            delegator.route_signal(&mut thread, 10, &info, &mut ctx),
            RouteOutcome::Handled
        );

        // sa_mask OR'd in, plus the delivered signal itself (no NODEFER).
        assert_ne!(thread.current_signal_mask & (1 << (12 - 1)), 0);
        assert_ne!(thread.current_signal_mask & (1 << (10 - 1)), 0);
        assert_eq!(SignalDelegator::current_signal(), 10);
        assert_eq!(
            unsafe { thread.dispatcher.thread().frame_mut() }.state.rip,
            0x4000_0000
        );
    }
}
