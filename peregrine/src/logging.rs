// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Logging that is safe from signal-handler context.
//!
//! Messages are formatted into a fixed-size buffer (no allocation) and
//! written to stderr with a raw syscall, bypassing any locks libc's stdio
//! might hold on the interrupted thread. Overlong messages are truncated.

use arrayvec::ArrayString;

/// Prints one line to stderr.
#[macro_export]
macro_rules! log_println {
    ($($arg:tt)*) => {
        $crate::logging::write_line(core::format_args!($($arg)*))
    };
}

/// Flags a code path that exists but is not fully implemented.
#[macro_export]
macro_rules! log_unsupported {
    ($($arg:tt)*) => {
        $crate::log_println!("Unsupported: {}", core::format_args!($($arg)*))
    };
}

const LOG_BUFFER_SIZE: usize = 512;

pub fn write_line(args: core::fmt::Arguments<'_>) {
    let mut buf = ArrayString::<LOG_BUFFER_SIZE>::new();
    // A full buffer truncates the message; nothing useful to do with the
    // error either way.
    let _ = core::fmt::Write::write_fmt(&mut buf, args);
    let _ = buf.try_push('\n');
    write_stderr(buf.as_bytes());
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn write_stderr(bytes: &[u8]) {
            let _ = unsafe {
                syscalls::syscall3(
                    syscalls::Sysno::write,
                    2,
                    bytes.as_ptr() as usize,
                    bytes.len(),
                )
            };
        }
    } else {
        fn write_stderr(bytes: &[u8]) {
            use std::io::Write as _;
            let _ = std::io::stderr().write_all(bytes);
        }
    }
}
