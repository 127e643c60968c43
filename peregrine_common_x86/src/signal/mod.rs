// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Guest signal handling definitions.

pub mod x86;
pub mod x86_64;

/// A Linux signal number guaranteed to be in the range 1..=64.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Signal(i32);

impl Signal {
    pub const SIGHUP: Self = Self(1);
    pub const SIGINT: Self = Self(2);
    pub const SIGQUIT: Self = Self(3);
    pub const SIGILL: Self = Self(4);
    pub const SIGTRAP: Self = Self(5);
    pub const SIGABRT: Self = Self(6);
    pub const SIGBUS: Self = Self(7);
    pub const SIGFPE: Self = Self(8);
    pub const SIGKILL: Self = Self(9);
    pub const SIGUSR1: Self = Self(10);
    pub const SIGSEGV: Self = Self(11);
    pub const SIGUSR2: Self = Self(12);
    pub const SIGPIPE: Self = Self(13);
    pub const SIGALRM: Self = Self(14);
    pub const SIGTERM: Self = Self(15);
    pub const SIGSTKFLT: Self = Self(16);
    pub const SIGCHLD: Self = Self(17);
    pub const SIGCONT: Self = Self(18);
    pub const SIGSTOP: Self = Self(19);
    pub const SIGTSTP: Self = Self(20);
    pub const SIGTTIN: Self = Self(21);
    pub const SIGTTOU: Self = Self(22);
    pub const SIGURG: Self = Self(23);
    pub const SIGXCPU: Self = Self(24);
    pub const SIGXFSZ: Self = Self(25);
    pub const SIGVTALRM: Self = Self(26);
    pub const SIGPROF: Self = Self(27);
    pub const SIGWINCH: Self = Self(28);
    pub const SIGIO: Self = Self(29);
    pub const SIGPWR: Self = Self(30);
    pub const SIGSYS: Self = Self(31);

    /// Get the signal number as an `i32`, the natural representation.
    pub const fn as_i32(&self) -> i32 {
        self.0
    }

    /// Returns true if this is a real-time signal.
    pub const fn is_rt_signal(&self) -> bool {
        self.0 >= SIGRTMIN
    }

    /// Get the documented default disposition of this signal.
    pub fn default_disposition(&self) -> SignalDisposition {
        match *self {
            Signal::SIGABRT
            | Signal::SIGBUS
            | Signal::SIGFPE
            | Signal::SIGILL
            | Signal::SIGQUIT
            | Signal::SIGSEGV
            | Signal::SIGSYS
            | Signal::SIGTRAP
            | Signal::SIGXCPU
            | Signal::SIGXFSZ => SignalDisposition::Core,
            Signal::SIGCHLD | Signal::SIGURG | Signal::SIGWINCH => SignalDisposition::Ignore,
            Signal::SIGCONT => SignalDisposition::Continue,
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU => {
                SignalDisposition::Stop
            }
            _ => SignalDisposition::Terminate,
        }
    }
}

impl TryFrom<i32> for Signal {
    type Error = InvalidSignal;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        if (1..=NSIG as i32).contains(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidSignal)
        }
    }
}

/// The signal number was outside 1..=64.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InvalidSignal;

/// The default disposition of a signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SignalDisposition {
    /// Terminate the process.
    Terminate,
    /// Ignore the signal.
    Ignore,
    /// Dump core and terminate the process.
    Core,
    /// Stop the process.
    Stop,
    /// Continue the process if it is stopped.
    Continue,
}

#[derive(Clone, Copy, Default)]
#[repr(transparent)]
pub struct SigSet(u64);

impl SigSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn add(&mut self, signum: Signal) {
        self.0 |= 1 << (signum.as_i32() - 1);
    }

    #[must_use]
    pub const fn with(self, signum: Signal) -> Self {
        let mut new_set = self;
        new_set.add(signum);
        new_set
    }

    pub const fn remove(&mut self, signum: Signal) {
        self.0 &= !(1 << (signum.as_i32() - 1));
    }

    pub const fn contains(&self, signum: Signal) -> bool {
        (self.0 & (1 << (signum.as_i32() - 1))) != 0
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn from_u64(bits: u64) -> Self {
        Self(bits)
    }
}

impl core::ops::BitAnd for SigSet {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl core::ops::BitOr for SigSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::Not for SigSet {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct SaFlags: u64 {
        const NOCLDSTOP = 1;
        const NOCLDWAIT = 2;
        const SIGINFO = 4;
        const RESTORER  = 0x0400_0000;
        const ONSTACK   = 0x0800_0000;
        const RESTART   = 0x1000_0000;
        const NODEFER   = 0x4000_0000;
        const RESETHAND = 0x8000_0000;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct SsFlags: u32 {
        /// Currently executing on the signal stack.
        const ONSTACK = 1;
        /// Stack disabled.
        const DISABLE = 2;
        /// Automatically disarm the stack on delivery.
        const AUTODISARM = 0x8000_0000;
    }
}

/// The guest's registered `sigaction` for one signal.
///
/// The handler and sigaction union arms of the guest ABI hold the same
/// address, so a single field carries both; `SaFlags::SIGINFO` selects the
/// calling convention.
#[derive(Copy, Clone, Debug)]
pub struct GuestSigAction {
    pub sigaction: u64,
    pub flags: SaFlags,
    pub restorer: u64,
    pub mask: SigSet,
}

impl GuestSigAction {
    pub const fn default_action() -> Self {
        Self {
            sigaction: SIG_DFL,
            flags: SaFlags::empty(),
            restorer: 0,
            mask: SigSet::empty(),
        }
    }
}

impl core::fmt::Debug for SigSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SigSet({:#018x})", self.0)
    }
}

/// The guest's alternate signal stack.
#[derive(Copy, Clone, Debug)]
pub struct GuestStack {
    pub sp: u64,
    pub flags: SsFlags,
    pub size: u64,
}

impl GuestStack {
    pub const fn disabled() -> Self {
        Self {
            sp: 0,
            flags: SsFlags::DISABLE,
            size: 0,
        }
    }

    /// Whether `sp` lies within this stack. Always false for a disabled
    /// stack.
    pub fn contains(&self, sp: u64) -> bool {
        if self.flags.contains(SsFlags::DISABLE) {
            return false;
        }
        sp >= self.sp && sp <= self.sp + self.size
    }
}

pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

pub const SIGRTMIN: i32 = 32;
pub const NSIG: usize = 64;

/// Minimum guest alternate stack size (x86 ABI value).
pub const MINSIGSTKSZ: u64 = 0x2000;

pub const SI_USER: i32 = 0;
pub const SI_KERNEL: i32 = 0x80;
pub const SI_QUEUE: i32 = -1;
pub const SI_TIMER: i32 = -2;
pub const SI_TKILL: i32 = -6;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigset_ops() {
        let mut set = SigSet::empty();
        set.add(Signal::SIGSEGV);
        set.add(Signal::SIGCHLD);
        assert!(set.contains(Signal::SIGSEGV));
        assert!(!set.contains(Signal::SIGBUS));
        set.remove(Signal::SIGSEGV);
        assert!(!set.contains(Signal::SIGSEGV));
        assert!(set.contains(Signal::SIGCHLD));
    }

    #[test]
    fn signal_range() {
        assert!(Signal::try_from(0).is_err());
        assert!(Signal::try_from(65).is_err());
        assert_eq!(Signal::try_from(11).unwrap(), Signal::SIGSEGV);
        assert!(Signal::try_from(40).unwrap().is_rt_signal());
    }

    #[test]
    fn altstack_containment() {
        let stack = GuestStack {
            sp: 0x6000_0000,
            flags: SsFlags::empty(),
            size: 0x1_0000,
        };
        assert!(stack.contains(0x6000_8000));
        assert!(!stack.contains(0x5fff_ffff));
        assert!(!GuestStack::disabled().contains(0x6000_8000));
    }
}
