use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

/// Reference-counted handle that keeps the host awake while work is pending.
///
/// The intake handler acquires once per exit from idle and releases on a
/// delayed timer after re-entering idle, so the count can briefly exceed one.
pub trait LivenessLease: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Lease for hosts with no suspend semantics.
#[derive(Debug, Default)]
pub struct NoopLease;

impl LivenessLease for NoopLease {
    fn acquire(&self) {}

    fn release(&self) {}
}

/// In-process lease that tracks its own hold count.
#[derive(Debug, Default)]
pub struct CountingLease {
    held: AtomicUsize,
}

impl CountingLease {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of outstanding acquires.
    #[must_use]
    pub fn held(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }
}

impl LivenessLease for CountingLease {
    fn acquire(&self) {
        self.held.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        let previous = self
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                held.checked_sub(1)
            });
        if previous.is_err() {
            warn!("lease released more times than acquired");
        }
    }
}
