// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Guest x86/x86-64 ABI definitions for the peregrine translator.
//!
//! Everything in this crate describes the *guest's* view of the world: the
//! CPU state the JIT maintains, and the signal-related structures that must
//! be bit-exact against the guest ABI when the translator synthesizes signal
//! frames on the guest stack.

#![no_std]

pub mod signal;
pub mod state;

pub use state::{CpuState, CpuStateFrame, Reg, X87Flag};
