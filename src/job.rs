//! Shared batch-job plumbing.
//!
//! Lifecycle batches and consensus recomputes both run as per-symbol units of
//! work; the flag here provides cooperative cancellation between units.
//! Progress already committed when a job is cancelled is kept.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag for batch jobs.
///
/// Cloning is cheap; all clones observe the same flag. Runners check the flag
/// between per-symbol units of work, never mid-unit, so each symbol's update
/// stays independently transactional.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    /// Create a new, un-cancelled flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the job
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_propagates_to_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());

        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
