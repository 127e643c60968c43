// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # Peregrine
//!
//! Core runtime of a userspace dynamic binary translator that executes
//! x86/x86-64 guest code on an ARMv8 Linux host.
//!
//! This crate owns the trap-driven machinery around the JIT: saving and
//! restoring per-thread state when host signals interrupt guest execution,
//! synthesizing architecturally faithful guest signal frames, the cooperative
//! pause/stop/return protocol used for thread coordination, and the
//! process-wide signal delegator that installs the host handlers and routes
//! every trap to the right consumer.

pub mod code_buffers;
pub mod config;
pub mod delegator;
pub mod dispatcher;
pub mod event;
pub mod frame;
pub mod logging;
pub mod siginfo;
pub mod thread;

pub use config::{Config, GuestBitness};
pub use dispatcher::{Dispatcher, JitEntryPoints, SignalDelegation};
pub use thread::{GuestThread, SignalEvent};
