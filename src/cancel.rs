use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ConvertError;

/// Cooperative cancellation flag shared between the caller and a running conversion.
///
/// The converter checks it between layers, between hashing batches and while
/// waiting for the lazifier; a cancelled lazifier child is killed.
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

    /// Returns `Err(ConvertError::Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            return Err(ConvertError::Cancelled.into());
        }
        Ok(())
    }
}
