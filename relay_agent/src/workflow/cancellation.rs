//! Cooperative cancellation for workflow runs.
//!
//! A [`CancellationTokenSource`] is owned by whoever may cancel a run (the
//! control surface, the workflow timer). Every task invocation receives a
//! cloned [`CancellationToken`] and races its worker call against
//! [`CancellationToken::cancelled`].
//!
//! # Example
//!
//! ```ignore
//! let source = CancellationTokenSource::new();
//! let token = source.token();
//!
//! tokio::select! {
//!     _ = token.cancelled() => { /* stop */ }
//!     output = worker.invoke(input, &ctx) => { /* use output */ }
//! }
//!
//! source.cancel("operator request");
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

/// Thread-safe cancellation token.
///
/// Clones share state: once the owning source cancels, every clone reports
/// cancelled and every pending [`cancelled`](Self::cancelled) future wakes.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    state: Arc<CancelState>,
}

impl CancellationToken {
    /// Creates a token that is never cancelled by anyone.
    ///
    /// Used for work that must run to completion regardless of the run's
    /// cancellation, such as rollback.
    pub fn never() -> Self {
        Self::default()
    }

    /// Returns true if the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the reason passed to [`CancellationTokenSource::cancel`].
    pub fn reason(&self) -> Option<String> {
        self.state
            .reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel
            // cannot slip between the check and the wait.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Owner of a cancellation token.
#[derive(Clone, Debug, Default)]
pub struct CancellationTokenSource {
    token: CancellationToken,
}

impl CancellationTokenSource {
    /// Creates a new cancellation source with a fresh token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels the token.
    ///
    /// Idempotent: the first reason is kept and later calls have no effect.
    ///
    /// # Returns
    ///
    /// `true` if this call performed the cancellation.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let state = &self.token.state;
        {
            let mut slot = state.reason.lock().unwrap_or_else(|e| e.into_inner());
            if state.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            *slot = Some(reason.into());
            state.cancelled.store(true, Ordering::SeqCst);
        }
        state.notify.notify_waiters();
        true
    }

    /// Returns true if the source has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clones_share_state() {
        let source = CancellationTokenSource::new();
        let token1 = source.token();
        let token2 = token1.clone();

        assert!(!token1.is_cancelled());
        assert!(source.cancel("stop"));

        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
        assert_eq!(token2.reason().as_deref(), Some("stop"));
    }

    #[test]
    fn test_cancel_is_idempotent_and_keeps_first_reason() {
        let source = CancellationTokenSource::new();
        assert!(source.cancel("first"));
        assert!(!source.cancel("second"));
        assert_eq!(source.token().reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let source = CancellationTokenSource::new();
        let token = source.token();

        let waiter = tokio::spawn(async move {
            token.cancelled().await;
            token.reason()
        });

        tokio::task::yield_now().await;
        source.cancel("timeout");

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let source = CancellationTokenSource::new();
        source.cancel("done");
        tokio::time::timeout(Duration::from_millis(50), source.token().cancelled())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_token_stays_pending() {
        let token = CancellationToken::never();
        let waited = tokio::time::timeout(Duration::from_secs(5), token.cancelled()).await;
        assert!(waited.is_err());
        assert!(!token.is_cancelled());
    }
}
