// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tilt Level Contributors 2024.

//! In-memory debug log behind the `debug!` macro.
//!
//! Formatted messages are appended to a ring buffer owned by a
//! [`DebugQueue`] that the board registers at startup; the board drains the
//! buffer out its console from its idle loop or panic handler. When no
//! queue is registered (the default, and the case in host tests that do
//! not care about log output), `debug!` is a no-op.
//!
//! Usage
//! -----
//! ```ignore
//! // QUEUE is a statically allocated DebugQueue wrapping a RingBuffer.
//! unsafe { kernel::debug::set_debug_queue(&QUEUE) };
//! debug!("lis3dsh: entering fault");
//! ```

use core::fmt;
use core::ptr::{addr_of, addr_of_mut};

use crate::collections::queue::Queue;
use crate::collections::ring_buffer::RingBuffer;
use crate::utilities::cells::TakeCell;

/// A byte sink for debug messages, drained by the board.
pub struct DebugQueue {
    ring: TakeCell<'static, RingBuffer<'static, u8>>,
}

impl DebugQueue {
    pub fn new(ring: &'static mut RingBuffer<'static, u8>) -> DebugQueue {
        DebugQueue {
            ring: TakeCell::new(ring),
        }
    }

    /// Pops the oldest byte of buffered log output.
    pub fn dequeue(&self) -> Option<u8> {
        self.ring.map_or(None, |ring| ring.dequeue())
    }

    /// Discards all buffered log output.
    pub fn empty(&self) {
        self.ring.map(|ring| ring.empty());
    }
}

/// `core::fmt` adapter appending to a queue through a shared reference.
struct QueueWriter<'a>(&'a DebugQueue);

impl fmt::Write for QueueWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.ring.map(|ring| {
            for byte in s.bytes() {
                // Oldest bytes win: once the ring fills, later output is
                // dropped until the board drains it.
                let _ = ring.enqueue(byte);
            }
        });
        Ok(())
    }
}

static mut DEBUG_QUEUE: Option<&'static DebugQueue> = None;

/// Registers the global debug queue.
///
/// # Safety
///
/// Must be called once, before any other context can invoke `debug!`
/// (in practice: during board initialization with interrupts masked).
pub unsafe fn set_debug_queue(queue: &'static DebugQueue) {
    *addr_of_mut!(DEBUG_QUEUE) = Some(queue);
}

/// Internal function used by the `debug!` macro. Do not call directly.
pub fn debug_enqueue_fmt(args: fmt::Arguments) {
    use core::fmt::Write;
    // The queue reference is written once at startup and only read here.
    let queue = unsafe { *addr_of!(DEBUG_QUEUE) };
    if let Some(queue) = queue {
        let mut writer = QueueWriter(queue);
        let _ = writer.write_fmt(args);
        let _ = writer.write_str("\r\n");
    }
}

/// Logs a formatted message to the registered debug queue, if any.
#[macro_export]
macro_rules! debug {
    () => ({
        $crate::debug::debug_enqueue_fmt(format_args!(""))
    });
    ($msg:expr $(,)?) => ({
        $crate::debug::debug_enqueue_fmt(format_args!($msg))
    });
    ($fmt:expr, $($arg:tt)+) => ({
        $crate::debug::debug_enqueue_fmt(format_args!($fmt, $($arg)+))
    });
}
