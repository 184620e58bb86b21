//! Per-request cancellation and deadline signal.
//!
//! Every storage operation receives a [`RequestContext`]. Suspension points
//! (waiting for a read slot, database I/O) race their work against
//! [`RequestContext::done`] so a canceled caller is released promptly.

use crate::error::{StorageError, StorageResult};
use futures::future::{self, FutureExt};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cancellation and deadline carried by a single request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    signals: Vec<watch::Receiver<bool>>,
}

/// Cancels every context derived from the one it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace never fails, even when every receiver is gone
        self.tx.send_replace(true);
    }
}

impl RequestContext {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A background context with a deadline `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().deadline_in(timeout)
    }

    /// Derive a context whose deadline is at most `timeout` from now.
    pub fn deadline_in(self, timeout: Duration) -> Self {
        self.deadline_at(Instant::now() + timeout)
    }

    /// Derive a context whose deadline is at most `deadline`.
    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Derive a cancelable context. Canceling the parent still cancels it.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut child = self.clone();
        child.signals.push(rx);
        (child, CancelHandle { tx })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check: the error the context is done with, if any.
    pub fn err(&self) -> Option<StorageError> {
        if self.signals.iter().any(|rx| *rx.borrow()) {
            return Some(StorageError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StorageError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is canceled or its deadline passes.
    pub async fn done(&self) -> StorageError {
        let cancelled = self.cancelled();
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = cancelled => StorageError::Cancelled,
                    () = tokio::time::sleep_until(deadline) => StorageError::DeadlineExceeded,
                }
            }
            None => {
                cancelled.await;
                StorageError::Cancelled
            }
        }
    }

    /// Race `work` against the context; the context wins ties.
    ///
    /// # Errors
    ///
    /// Returns the context's error if it finishes first, otherwise whatever
    /// `work` resolves to.
    pub async fn run<F, T>(&self, work: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            result = work => result,
        }
    }

    async fn cancelled(&self) {
        if self.signals.is_empty() {
            future::pending::<()>().await;
            return;
        }
        let waits = self
            .signals
            .iter()
            .cloned()
            .map(|rx| wait_for_cancel(rx).boxed());
        future::select_all(waits).await;
    }
}

async fn wait_for_cancel(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // handle dropped without canceling: never fires
            future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_context_is_never_done() {
        let ctx = RequestContext::background();
        assert!(ctx.err().is_none());
        let raced = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(raced.is_err());
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let (parent, handle) = RequestContext::background().with_cancel();
        let (child, _child_handle) = parent.with_cancel();

        handle.cancel();

        assert_eq!(child.err(), Some(StorageError::Cancelled));
        assert_eq!(child.done().await, StorageError::Cancelled);
    }

    #[tokio::test]
    async fn test_deadline_reports_deadline_exceeded() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(5));
        assert_eq!(ctx.done().await, StorageError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(StorageError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_run_prefers_context_error_over_pending_work() {
        let (ctx, handle) = RequestContext::background().with_cancel();
        handle.cancel();
        let result: StorageResult<()> = ctx.run(future::pending()).await;
        assert_eq!(result, Err(StorageError::Cancelled));
    }
}
