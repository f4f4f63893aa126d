use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Shared flag allowing one outstanding save or discard.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<AtomicBool>);

impl InFlight {
    /// Creates an idle flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the flag, or returns `None` when another operation holds it.
    pub fn try_begin(&self) -> Option<InFlightGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(Arc::clone(&self.0)))
    }

    /// True while a guard is alive.
    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the flag on drop, including when the owning future is cancelled.
#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
