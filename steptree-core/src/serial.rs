//! Process-wide serial number allocation.
//!
//! Local identifiers (tree ids, node ids) are monotonically increasing
//! `u64` serials, never reused within a process. The allocator is a bare
//! atomic counter: callable from any synchronous context, no suspension,
//! no error path.

use std::sync::atomic::{AtomicU64, Ordering};

/// Issues strictly increasing serial numbers.
///
/// An injectable instance for code that wants isolated numbering (tests,
/// simulators); most callers go through [`next_serial`].
#[derive(Debug)]
pub struct SerialAllocator {
    next: AtomicU64,
}

impl SerialAllocator {
    /// Start numbering at 1; 0 is never issued.
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return a fresh serial, strictly greater than every serial this
    /// allocator has returned before.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SerialAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide allocator. Initialized once at process start, never
/// reset.
static GLOBAL_SERIALS: SerialAllocator = SerialAllocator::new();

/// Return a fresh process-unique serial.
pub fn next_serial() -> u64 {
    GLOBAL_SERIALS.next()
}
