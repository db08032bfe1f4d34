//! Monotonic timestamp source.
//!
//! Out of scope for re-specification per spec §1 ("the monotonic timestamp
//! source... is an external collaborator"); this is the minimal concrete
//! wrapper the rest of the crate needs to exist as a standalone deliverable.

use std::time::Instant;

/// A monotonic point in time, opaque outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameInstant(Instant);

impl FrameInstant {
    pub fn now() -> Self {
        Self(Instant::now())
    }

    /// Microseconds elapsed since `earlier`. Saturates at zero if `earlier`
    /// is not actually earlier (defensive against clock weirdness, never
    /// panics).
    pub fn micros_since(&self, earlier: FrameInstant) -> u64 {
        self.0
            .checked_duration_since(earlier.0)
            .unwrap_or_default()
            .as_micros()
            .min(u128::from(u64::MAX)) as u64
    }
}
