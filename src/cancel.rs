use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::StplugError;

/// Cooperative cancellation flag shared between a worker and whoever may
/// cancel it. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Checkpoint helper: `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> Result<(), StplugError> {
        if self.is_cancelled() {
            return Err(StplugError::Cancelled);
        }
        Ok(())
    }
}
