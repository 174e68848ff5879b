//! Cooperative cancellation shared between the orchestrator and workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lcevc_functest_error::{FunctestError, Result};

/// Cloneable flag; every clone observes the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled; used between test sub-steps.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FunctestError::Cancelled)
        } else {
            Ok(())
        }
    }
}
