// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Raw atomic primitives over integer addresses.
//!
//! Callers are responsible for the alignment preconditions: every operation
//! here targets a naturally aligned address of its width. The emulation layer
//! above decomposes misaligned guest accesses into these.

use core::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};

macro_rules! impl_width {
    ($load:ident, $cas:ident, $ty:ty, $atomic:ty) => {
        pub fn $load(addr: u64) -> $ty {
            let atom = unsafe { &*(addr as *const $atomic) };
            atom.load(Ordering::Acquire)
        }

        /// Strong compare-exchange. On failure the observed value is written
        /// back into `expected`.
        pub fn $cas(expected: &mut $ty, desired: $ty, addr: u64) -> bool {
            let atom = unsafe { &*(addr as *const $atomic) };
            match atom.compare_exchange(*expected, desired, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => true,
                Err(observed) => {
                    *expected = observed;
                    false
                }
            }
        }
    };
}

impl_width!(load_acquire_u8, store_cas_u8, u8, AtomicU8);
impl_width!(load_acquire_u16, store_cas_u16, u16, AtomicU16);
impl_width!(load_acquire_u32, store_cas_u32, u32, AtomicU32);
impl_width!(load_acquire_u64, store_cas_u64, u64, AtomicU64);

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        /// 128-bit acquire load that does not leave the exclusive monitor
        /// set.
        ///
        /// A compiler-generated 128-bit atomic load is an ldaxp/stxp pair:
        /// the trailing store faults on read-only pages, and a leftover
        /// monitor can corrupt an unrelated exclusive sequence on the same
        /// core. ldaxp followed by an explicit clrex has neither problem.
        pub fn load_acquire_u128(addr: u64) -> u128 {
            let lower: u64;
            let upper: u64;
            unsafe {
                core::arch::asm!(
                    "ldaxp {lower}, {upper}, [{addr}]",
                    "clrex",
                    lower = out(reg) lower,
                    upper = out(reg) upper,
                    addr = in(reg) addr,
                    options(nostack),
                );
            }
            (u128::from(upper) << 64) | u128::from(lower)
        }

        /// Strong 128-bit compare-exchange at a 16-byte-aligned address. On
        /// failure the observed value is written back into `expected`.
        pub fn store_cas_u128(expected: &mut u128, desired: u128, addr: u64) -> bool {
            let exp_lower = *expected as u64;
            let exp_upper = (*expected >> 64) as u64;
            let des_lower = desired as u64;
            let des_upper = (desired >> 64) as u64;
            let obs_lower: u64;
            let obs_upper: u64;
            let failed: u64;
            unsafe {
                core::arch::asm!(
                    "2:",
                    "ldaxp {obs_lower}, {obs_upper}, [{addr}]",
                    "cmp {obs_lower}, {exp_lower}",
                    "ccmp {obs_upper}, {exp_upper}, #0, eq",
                    "b.ne 3f",
                    "stlxp {failed:w}, {des_lower}, {des_upper}, [{addr}]",
                    "cbnz {failed:w}, 2b",
                    "b 4f",
                    "3:",
                    "clrex",
                    "mov {failed:w}, #1",
                    "4:",
                    obs_lower = out(reg) obs_lower,
                    obs_upper = out(reg) obs_upper,
                    failed = out(reg) failed,
                    addr = in(reg) addr,
                    exp_lower = in(reg) exp_lower,
                    exp_upper = in(reg) exp_upper,
                    des_lower = in(reg) des_lower,
                    des_upper = in(reg) des_upper,
                );
            }
            if failed == 0 {
                true
            } else {
                *expected = (u128::from(obs_upper) << 64) | u128::from(obs_lower);
                false
            }
        }
    } else {
        // Non-arm64 builds exist only to run the emulator logic under test;
        // these fallbacks are not atomic across threads.

        pub fn load_acquire_u128(addr: u64) -> u128 {
            unsafe { core::ptr::read_volatile(addr as *const u128) }
        }

        pub fn store_cas_u128(expected: &mut u128, desired: u128, addr: u64) -> bool {
            let observed = unsafe { core::ptr::read_volatile(addr as *const u128) };
            if observed == *expected {
                unsafe { core::ptr::write_volatile(addr as *mut u128, desired) };
                true
            } else {
                *expected = observed;
                false
            }
        }
    }
}
