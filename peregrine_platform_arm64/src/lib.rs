//! ARMv8 host support for the peregrine translator.
//!
//! This crate owns everything that must understand the host architecture:
//! reading and writing the trap context the kernel hands to signal handlers,
//! the raw atomic primitives the emulation layer is built from, and the
//! misaligned-atomic emulator that gives x86 guests their unaligned-atomicity
//! semantics on a host whose exclusive/CAS instructions trap on unaligned
//! addresses.

pub mod atomic_emu;
pub mod atomics;
pub mod context;
pub mod insn;
pub mod mock;
pub mod telemetry;

pub use context::{HostContext, MachineContext, RED_ZONE_SIZE, STATE_REG};
