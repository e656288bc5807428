// ⏱️ Deadline - Caller-supplied cancellation signal
//
// Every engine operation takes a `&Deadline`. It is checked before each storage
// query and, while a statement runs, from inside SQLite's progress handler.

use crate::error::{BridgeError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Deadline {
    /// No time limit; can still be cancelled explicitly.
    pub fn none() -> Self {
        Deadline {
            expires_at: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn at(expires_at: Instant) -> Self {
        Deadline {
            expires_at: Some(expires_at),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. Visible to every clone of this deadline.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.expires_at, Some(at) if Instant::now() >= at)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(BridgeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_deadline_never_expires() {
        let deadline = Deadline::none();
        assert!(!deadline.is_expired());
        assert!(deadline.check().is_ok());
    }

    #[test]
    fn test_elapsed_deadline_reports_cancelled() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(deadline.is_expired());
        assert!(matches!(deadline.check(), Err(BridgeError::Cancelled)));
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let clone = deadline.clone();

        clone.cancel();

        assert!(deadline.is_expired());
    }
}
