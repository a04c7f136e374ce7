//! Cooperative cancellation.
//!
//! Abort is checked between actions and inside every suspension point; an
//! in-flight input injection is never interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

/// Shared abort flag, cloned across the playback loop and its watchers.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep in short slices so a raise cuts the wait short.
    ///
    /// Returns `false` when the wait was interrupted.
    pub fn sleep_unless_raised(&self, clock: &dyn Clock, total: Duration) -> bool {
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.is_raised() {
                return false;
            }
            let slice = remaining.min(Duration::from_millis(25));
            clock.sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        !self.is_raised()
    }
}
