// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-guest-thread state shared between the dispatcher, the JIT, and signal
//! handlers.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

use peregrine_common_x86::CpuStateFrame;

use crate::event::Event;

/// Translator-internal reasons a thread's reserved signal may fire.
///
/// Senders store the reason before raising the signal; the receiving thread's
/// handler consumes it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u32)]
pub enum SignalEvent {
    Nothing = 0,
    Pause = 1,
    Stop = 2,
    Return = 3,
}

/// One guest thread, pinned to one host OS thread.
///
/// `frame` is mutated only by the owning host thread — either directly or
/// from a signal handler executing on it — which is what makes the
/// `UnsafeCell` sound despite `Sync`.
pub struct GuestThread {
    frame: UnsafeCell<CpuStateFrame>,
    signal_reason: AtomicU32,
    pub start_running: Event,
    pub running: AtomicBool,
}

unsafe impl Sync for GuestThread {}

impl GuestThread {
    pub fn new() -> Self {
        Self {
            frame: UnsafeCell::new(CpuStateFrame::new()),
            signal_reason: AtomicU32::new(SignalEvent::Nothing.into()),
            start_running: Event::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Pointer to the frame the JIT's thread-state register carries.
    pub fn frame_ptr(&self) -> *mut CpuStateFrame {
        self.frame.get()
    }

    /// # Safety
    ///
    /// Only the owning host thread (including its signal handlers) may call
    /// this, and the returned reference must not outlive the current
    /// handler/dispatch step.
    #[expect(clippy::mut_from_ref)]
    pub unsafe fn frame_mut(&self) -> &mut CpuStateFrame {
        unsafe { &mut *self.frame.get() }
    }

    pub fn signal_reason(&self) -> SignalEvent {
        SignalEvent::try_from(self.signal_reason.load(Ordering::Acquire))
            .unwrap_or(SignalEvent::Nothing)
    }

    pub fn set_signal_reason(&self, reason: SignalEvent) {
        self.signal_reason.store(reason.into(), Ordering::Release);
    }
}

impl Default for GuestThread {
    fn default() -> Self {
        Self::new()
    }
}

/// The context-wide idle accounting used by the sleep protocol: a count of
/// runnable threads and a condition broadcast whenever it changes.
pub struct IdleWait {
    count: Mutex<u64>,
    cond: Condvar,
}

impl IdleWait {
    pub const fn new(initial: u64) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        self.cond.notify_all();
    }

    pub fn increment(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_all();
    }

    pub fn count(&self) -> u64 {
        *self.count.lock().unwrap()
    }

    /// Blocks until the runnable count drops to `target`.
    pub fn wait_for(&self, target: u64) {
        let mut count = self.count.lock().unwrap();
        while *count != target {
            count = self.cond.wait(count).unwrap();
        }
    }
}
