//! Cooperative cancellation
//!
//! A failure in one iteration or task raises a shared flag; siblings observe it at
//! their next checkpoint (iteration start, chunk start, join). Nothing is ever
//! interrupted mid-iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token in the not-cancelled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns true if this call was the one that raised it.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::AcqRel)
    }

    /// Check whether the flag has been raised
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Checkpoint: `Err(Error::Cancelled)` once the flag is raised
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_cancel_wins() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.checkpoint().is_ok());
        assert!(clone.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
        assert_eq!(token.checkpoint(), Err(Error::Cancelled));
    }
}
