// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Registry of live JIT code regions.
//!
//! The JIT publishes and retires buffers outside of signal context; signal
//! handlers classify trap PCs against the registry without taking any lock.
//! Readers may observe a stale snapshot — that is fine, because retired
//! ranges are not reused until the signal-handler refcounter has drained
//! (the quiescence check lives with the JIT's reclaim path).

use core::sync::atomic::{AtomicU64, Ordering};

pub const MAX_CODE_BUFFERS: usize = 64;

struct CodeRange {
    start: AtomicU64,
    end: AtomicU64,
}

impl CodeRange {
    const fn empty() -> Self {
        Self {
            start: AtomicU64::new(0),
            end: AtomicU64::new(0),
        }
    }
}

/// The registry was already holding [`MAX_CODE_BUFFERS`] live buffers.
#[derive(Debug, thiserror::Error)]
#[error("code buffer registry is full ({MAX_CODE_BUFFERS} entries)")]
pub struct RegistryFull;

pub struct CodeBufferRegistry {
    entries: [CodeRange; MAX_CODE_BUFFERS],
    dispatcher: CodeRange,
}

impl CodeBufferRegistry {
    pub const fn new() -> Self {
        Self {
            entries: [const { CodeRange::empty() }; MAX_CODE_BUFFERS],
            dispatcher: CodeRange::empty(),
        }
    }

    /// Records the address range of the dispatcher's own generated code.
    pub fn set_dispatcher_range(&self, start: u64, end: u64) {
        self.dispatcher.end.store(end, Ordering::Relaxed);
        self.dispatcher.start.store(start, Ordering::Release);
    }

    /// Publishes a new code buffer. `start` must be nonzero.
    pub fn insert(&self, start: u64, end: u64) -> Result<(), RegistryFull> {
        assert!(start != 0 && end > start);
        for entry in &self.entries {
            if entry.start.load(Ordering::Relaxed) == 0 {
                // End first so a concurrent reader never sees a live start
                // with a stale end.
                entry.end.store(end, Ordering::Relaxed);
                entry.start.store(start, Ordering::Release);
                return Ok(());
            }
        }
        Err(RegistryFull)
    }

    /// Retires the buffer beginning at `start`.
    pub fn remove(&self, start: u64) {
        for entry in &self.entries {
            if entry.start.load(Ordering::Relaxed) == start {
                entry.start.store(0, Ordering::Release);
                entry.end.store(0, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Whether `addr` lies inside a live JIT buffer, optionally counting the
    /// dispatcher's own code. Safe to call from a signal handler.
    pub fn contains(&self, addr: u64, include_dispatcher: bool) -> bool {
        for entry in &self.entries {
            let start = entry.start.load(Ordering::Acquire);
            if start != 0 && addr >= start && addr < entry.end.load(Ordering::Relaxed) {
                return true;
            }
        }
        if include_dispatcher {
            let start = self.dispatcher.start.load(Ordering::Acquire);
            return start != 0
                && addr >= start
                && addr < self.dispatcher.end.load(Ordering::Relaxed);
        }
        false
    }
}

impl Default for CodeBufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}
