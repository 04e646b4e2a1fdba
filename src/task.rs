//! Cooperative cancellation and deadlines.
//!
//! Every long-running operation accepts a [`CancelToken`]. Cancellation is
//! cooperative: components check the token between steps (at HNSW layer
//! boundaries, between predicate leaves, between planner steps) and return
//! `Cancelled`. A timeout is just a token armed with a deadline; expiration
//! is indistinguishable from explicit cancellation except in the error
//! variant reported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{QueryError, Result};

/// Shared cancellation token with an optional deadline.
///
/// Cloning is cheap; all clones observe the same cancellation flag.
///
/// # Example
/// ```
/// use nousdb::CancelToken;
/// use std::time::Duration;
///
/// let token = CancelToken::with_timeout(Duration::from_millis(50));
/// assert!(!token.is_cancelled());
/// ```
#[derive(Clone, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
    started: Instant,
}

impl CancelToken {
    /// Creates a token that never expires on its own.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: None,
            started: Instant::now(),
        }
    }

    /// Creates a token armed with a deadline `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: now.checked_add(timeout),
            started: now,
        }
    }

    /// Returns a token sharing this one's cancellation flag, armed with a
    /// deadline `timeout` from now. Used to apply a query's time budget to
    /// a caller-supplied token.
    pub fn with_deadline(&self, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            flag: Arc::clone(&self.flag),
            deadline: now.checked_add(timeout),
            started: self.started,
        }
    }

    /// Requests cancellation. All clones observe the flag.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Returns true if cancellation was requested or the deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline_passed()
    }

    /// Returns true if the deadline (if any) has passed.
    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Milliseconds elapsed since the token was created.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Checkpoint for cooperative cancellation.
    ///
    /// Returns `Timeout` when the deadline expired, `Cancelled` when the
    /// flag was raised explicitly, `Ok(())` otherwise.
    pub fn check(&self) -> Result<()> {
        if self.deadline_passed() {
            return Err(QueryError::Timeout {
                elapsed_ms: self.elapsed_ms(),
            }
            .into());
        }
        if self.flag.load(Ordering::Relaxed) {
            return Err(QueryError::Cancelled.into());
        }
        Ok(())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_fresh_token_is_live() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_propagates_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        assert_eq!(clone.check().unwrap_err().code(), ErrorCode::Cancelled);
    }

    #[test]
    fn test_deadline_expiry_reports_timeout() {
        let token = CancelToken::with_timeout(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(token.is_cancelled());
        assert_eq!(token.check().unwrap_err().code(), ErrorCode::Timeout);
    }

    #[test]
    fn test_explicit_cancel_wins_over_future_deadline() {
        let token = CancelToken::with_timeout(Duration::from_secs(3600));
        token.cancel();
        assert_eq!(token.check().unwrap_err().code(), ErrorCode::Cancelled);
    }
}
