// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Set-once markers recording that the guest performed atomics the host had
//! to emulate in a way that can tear.

use core::sync::atomic::{AtomicBool, Ordering};

static SPLIT_LOCK: AtomicBool = AtomicBool::new(false);
static SPLIT_LOCK_16B: AtomicBool = AtomicBool::new(false);

/// Records an emulated atomic that straddled a 64-byte cacheline.
pub(crate) fn record_split_lock() {
    SPLIT_LOCK.store(true, Ordering::Relaxed);
}

/// Records an emulated atomic that straddled a 16-byte boundary.
pub(crate) fn record_split_lock_16b() {
    SPLIT_LOCK_16B.store(true, Ordering::Relaxed);
}

pub fn split_lock() -> bool {
    SPLIT_LOCK.load(Ordering::Relaxed)
}

pub fn split_lock_16b() -> bool {
    SPLIT_LOCK_16B.load(Ordering::Relaxed)
}

/// Clears both markers. Test support only.
pub fn reset() {
    SPLIT_LOCK.store(false, Ordering::Relaxed);
    SPLIT_LOCK_16B.store(false, Ordering::Relaxed);
}
