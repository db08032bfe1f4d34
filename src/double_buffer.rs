//! The double-buffered per-thread resource facility (spec §4.5).
//!
//! Within one frame `current()` is written only by the owning thread;
//! `previous()` may be read by any thread. The scheduler guarantees no
//! overlap between a frame's writers and the next frame's readers (the
//! start/end barrier or join enforces happens-before), so no additional
//! synchronization is required on the payload itself — the `parity` flip
//! is the only atomic operation in the hot path.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

/// Anything the scheduler can flip at frame start. Implemented by
/// [`DoubleBuffered`]; object-safe so the scheduler can hold a registry of
/// heterogeneous buffered resources.
pub trait Flippable: Send + Sync {
    fn flip(&self);
}

/// Two storage slots plus a one-bit parity selecting which is "current".
pub struct DoubleBuffered<T> {
    slots: [UnsafeCell<T>; 2],
    /// false => slot 0 is current, slot 1 is previous; true => reversed.
    parity: AtomicBool,
}

// SAFETY: access to `slots` is disciplined by the scheduler's frame
// boundary (see module docs): at most one thread ever calls `current()`
// for a given buffer between flips, and readers only ever reach
// `previous()`, which nothing is concurrently writing.
unsafe impl<T: Send> Sync for DoubleBuffered<T> {}

impl<T> DoubleBuffered<T> {
    pub fn new(a: T, b: T) -> Self {
        Self {
            slots: [UnsafeCell::new(a), UnsafeCell::new(b)],
            parity: AtomicBool::new(false),
        }
    }

    fn current_index(&self) -> usize {
        usize::from(self.parity.load(Ordering::Acquire))
    }

    /// Mutable access to the slot this frame's owning thread writes.
    #[allow(clippy::mut_from_ref)]
    pub fn current(&self) -> &mut T {
        // SAFETY: see type-level safety comment; only the owning thread
        // calls this, and only between flips.
        unsafe { &mut *self.slots[self.current_index()].get() }
    }

    /// Read-only access to the slot any thread may observe this frame.
    pub fn previous(&self) -> &T {
        let prev = 1 - self.current_index();
        // SAFETY: the previous slot is never written to during this
        // frame; only read.
        unsafe { &*self.slots[prev].get() }
    }
}

impl<T> Flippable for DoubleBuffered<T>
where
    T: Send,
{
    fn flip(&self) {
        self.parity.fetch_xor(true, Ordering::AcqRel);
    }
}
