//! Cancellation context with a cause.
//!
//! Every suspending operation inside a session honors one of these: the
//! websocket gateway cancels it when the socket dies, a timer cancels it
//! when the session timeout fires, and the cause string travels verbatim
//! into the terminal frame the front-end sees.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::watch;

/// Cause attached to session timeouts, surfaced verbatim to the front-end.
pub const TIMEOUT_CAUSE: &str = "Session timeout exceeded";

/// A cancellation signal carrying the cause of the first cancellation.
///
/// Cheap to clone; all clones observe the same signal. The first call to
/// [`cancel`](Self::cancel) wins, later causes are ignored.
#[derive(Clone)]
pub struct SessionContext {
    tx: Arc<watch::Sender<Option<String>>>,
    rx: watch::Receiver<Option<String>>,
}

impl SessionContext {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// A context that cancels itself with [`TIMEOUT_CAUSE`] after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        let ctx = Self::new();
        ctx.arm(timeout, TIMEOUT_CAUSE.to_string());
        ctx
    }

    /// Derive a context that is cancelled when `self` is, or when the given
    /// sub-timeout fires with `cause`, whichever happens first.
    pub fn child_with_timeout(&self, timeout: Duration, cause: impl Into<String>) -> Self {
        let child = Self::new();
        let parent = self.clone();
        let child_handle = child.clone();
        let cause = cause.into();
        tokio::spawn(async move {
            tokio::select! {
                parent_cause = parent.done() => child_handle.cancel(parent_cause),
                () = tokio::time::sleep(timeout) => child_handle.cancel(cause),
            }
        });

        child
    }

    fn arm(&self, timeout: Duration, cause: String) {
        let ctx = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            ctx.cancel(cause);
        });
    }

    /// Cancel with the given cause. Only the first cause is recorded.
    pub fn cancel(&self, cause: impl Into<String>) {
        let cause = cause.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        });
    }

    /// Wait until the context is cancelled; resolves to the cause.
    pub async fn done(&self) -> String {
        let mut rx = self.rx.clone();
        loop {
            if let Some(cause) = rx.borrow().clone() {
                return cause;
            }
            if rx.changed().await.is_err() {
                // All senders gone without a cause; treat as cancellation.
                return "context dropped".to_string();
            }
        }
    }

    /// The cause, if the context has been cancelled.
    pub fn cause(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Run a future, aborting with the cancellation cause if the context
    /// fires first.
    pub async fn run<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            result = fut => result,
            cause = self.done() => Err(anyhow!(cause)),
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_cancel_delivers_cause() {
        let ctx = SessionContext::new();
        assert!(!ctx.is_cancelled());

        ctx.cancel("socket closed");
        assert_eq!(ctx.done().await, "socket closed");
        assert_eq!(ctx.cause().as_deref(), Some("socket closed"));
    }

    #[tokio::test]
    async fn test_first_cause_wins() {
        let ctx = SessionContext::new();
        ctx.cancel("first");
        ctx.cancel("second");

        assert_eq!(ctx.done().await, "first");
    }

    #[tokio::test]
    async fn test_timeout_fires_with_canonical_cause() {
        let ctx = SessionContext::with_timeout(Duration::from_millis(20));
        let cause = timeout(Duration::from_secs(2), ctx.done()).await.unwrap();

        assert_eq!(cause, TIMEOUT_CAUSE);
    }

    #[tokio::test]
    async fn test_clones_share_the_signal() {
        let ctx = SessionContext::new();
        let clone = ctx.clone();

        ctx.cancel("done");
        assert_eq!(clone.done().await, "done");
    }

    #[tokio::test]
    async fn test_child_inherits_parent_cancellation() {
        let parent = SessionContext::new();
        let child = parent.child_with_timeout(Duration::from_secs(60), "child timeout");

        parent.cancel("parent gone");
        let cause = timeout(Duration::from_secs(2), child.done()).await.unwrap();
        assert_eq!(cause, "parent gone");
        assert!(!parent.is_cancelled() || parent.cause().as_deref() == Some("parent gone"));
    }

    #[tokio::test]
    async fn test_child_timeout_does_not_cancel_parent() {
        let parent = SessionContext::new();
        let child = parent.child_with_timeout(Duration::from_millis(20), "lookup timed out");

        let cause = timeout(Duration::from_secs(2), child.done()).await.unwrap();
        assert_eq!(cause, "lookup timed out");
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_aborts_with_cause() {
        let ctx = SessionContext::new();
        ctx.cancel("too slow");

        let result: Result<()> = ctx.run(std::future::pending()).await;
        assert_eq!(result.unwrap_err().to_string(), "too slow");
    }
}
