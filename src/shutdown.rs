//! Process-wide cooperative shutdown flag.
//!
//! The ctrlc handler sets it; the transfer, scan and patch loops poll it and
//! abort with `Interrupted`, which rolls the transaction back. Relaxed
//! atomics are enough for a one-way stop flag.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Request a cooperative shutdown (idempotent, signal-safe).
#[inline]
pub fn request() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

#[inline]
pub fn is_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

