//! Execution context: an optional deadline plus a cancellation signal.
//!
//! Every runner operation takes an [`ExecContext`]. Host and Docker runners
//! race process completion against [`ExecContext::done`]; the SSH runner also
//! derives a remote `timeout` from [`ExecContext::remaining`].

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context finished before the work it guarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Deadline and cancellation carried into every runner call.
///
/// Cloning is cheap; clones observe the same cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    deadline: Option<Instant>,
    /// Own signal last, ancestors' before it.
    cancel: Vec<watch::Receiver<bool>>,
}

/// Cancels every [`ExecContext`] derived from [`ExecContext::with_cancel`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl ExecContext {
    /// A context that never expires and cannot be cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().child_with_timeout(timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: Vec::new(),
        }
    }

    /// Derive a cancellable context. The returned handle cancels the new
    /// context and its clones. Cancelling any ancestor still cancels it.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut cancel = self.cancel.clone();
        cancel.push(rx);
        let ctx = Self {
            deadline: self.deadline,
            cancel,
        };
        (ctx, CancelHandle { tx: std::sync::Arc::new(tx) })
    }

    /// Derive a context whose deadline is the earlier of the current one and
    /// `now + timeout`, sharing the parent's cancellation signal.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    /// Saturates at zero once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The reason this context is finished, or `None` while it is live.
    pub fn err(&self) -> Option<ContextError> {
        if self.cancel.iter().any(|rx| *rx.borrow()) {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    /// Never resolves for a background context.
    pub async fn done(&self) -> ContextError {
        let cancelled = wait_cancelled(self.cancel.clone());
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = cancelled => ContextError::Canceled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                cancelled.await;
                ContextError::Canceled
            }
        }
    }
}

async fn wait_cancelled(signals: Vec<watch::Receiver<bool>>) {
    if signals.is_empty() {
        return std::future::pending().await;
    }
    let waits = signals.into_iter().map(|rx| Box::pin(wait_signal(rx)));
    futures::future::select_all(waits).await;
}

async fn wait_signal(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Every handle dropped without cancelling.
            return std::future::pending().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_is_never_done() {
        let ctx = ExecContext::background();
        assert!(ctx.err().is_none());
        assert!(ctx.remaining().is_none());

        let res = tokio::time::timeout(Duration::from_millis(50), ctx.done()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_cancel_wakes_done() {
        let (ctx, handle) = ExecContext::background().with_cancel();
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.done().await })
        };

        handle.cancel();
        assert_eq!(waiter.await.unwrap(), ContextError::Canceled);
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let ctx = ExecContext::with_timeout(Duration::from_millis(20));
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_child_keeps_earlier_deadline() {
        let parent = ExecContext::with_timeout(Duration::from_secs(1));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let tighter = parent.child_with_timeout(Duration::from_millis(10));
        assert!(tighter.deadline().unwrap() < parent.deadline().unwrap());
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_cancel() {
        let (ctx, handle) = ExecContext::background().with_cancel();
        drop(handle);
        let res = tokio::time::timeout(Duration::from_millis(30), ctx.done()).await;
        assert!(res.is_err());
        assert!(ctx.err().is_none());
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let (parent, parent_handle) = ExecContext::background().with_cancel();
        let (child, child_handle) = parent.with_cancel();

        child_handle.cancel();
        assert_eq!(child.err(), Some(ContextError::Canceled));
        assert!(parent.err().is_none(), "child cancel must not leak upward");

        let (other_child, _keep) = parent.with_cancel();
        let waiter = {
            let ctx = other_child.clone();
            tokio::spawn(async move { ctx.done().await })
        };
        parent_handle.cancel();
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("child context ignored parent cancel")
            .unwrap();
        assert_eq!(reason, ContextError::Canceled);
        assert_eq!(other_child.err(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn test_child_with_timeout_keeps_cancel_chain() {
        let (parent, handle) = ExecContext::background().with_cancel();
        let (middle, _middle_handle) = parent.with_cancel();
        let leaf = middle.child_with_timeout(Duration::from_secs(30));

        handle.cancel();
        assert_eq!(leaf.done().await, ContextError::Canceled);
    }
}
