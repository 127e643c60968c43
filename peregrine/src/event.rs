// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A one-shot, auto-resetting wait primitive.

use std::sync::{Condvar, Mutex};

/// A single-shot event: `wait` blocks until another thread calls `notify`,
/// then consumes the signal so the next `wait` blocks again. A `notify`
/// delivered before `wait` is not lost.
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
        *signaled = false;
    }

    pub fn notify(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_all();
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
