//! Per-operation cancellation and deadlines
//!
//! Every store-facing call takes an [`OpContext`]. The context is checked
//! before any I/O is issued, and in-flight operations race against the
//! cancellation token and the deadline so callers get [`Error::Cancelled`]
//! or [`Error::DeadlineExceeded`] instead of a generic store error.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().deadline_in(timeout)
    }

    /// Derive a context bound to an existing cancellation token
    pub fn with_cancel(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            deadline: None,
        }
    }

    /// Set a deadline relative to now. An earlier existing deadline wins.
    pub fn deadline_in(mut self, timeout: Duration) -> Self {
        let at = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < at => existing,
            _ => at,
        });
        self
    }

    /// Child context: cancelled when the parent is, cancellable on its own
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail fast if the context is already done
    pub fn check(&self, op: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(Error::DeadlineExceeded(op.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Run `fut` unless the context is cancelled or its deadline passes first
    pub async fn run<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(op)?;

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = expired => Err(Error::DeadlineExceeded(op.to_string())),
            result = fut => result,
        }
    }

    /// Sleep for `delay`, waking early with an error if the context ends
    pub async fn sleep(&self, op: &str, delay: Duration) -> Result<()> {
        self.run(op, async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_runs_to_completion() {
        let ctx = OpContext::background();
        let value = ctx.run("noop", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_before_running() {
        let ctx = OpContext::background();
        ctx.cancel();

        let mut ran = false;
        let result = ctx
            .run("get", async {
                ran = true;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!ran);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_slow_operation() {
        let ctx = OpContext::with_timeout(Duration::from_millis(50));
        let result = ctx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        match result {
            Err(Error::DeadlineExceeded(op)) => assert_eq!(op, "slow"),
            other => panic!("expected deadline error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_sleep() {
        let ctx = OpContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = ctx.sleep("backoff", Duration::from_secs(60)).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_child_follows_parent() {
        let parent = OpContext::background();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());

        let other = OpContext::background();
        let other_child = other.child();
        other_child.cancel();
        assert!(!other.is_cancelled());
    }

    #[tokio::test]
    async fn test_earlier_deadline_wins() {
        let ctx =
            OpContext::with_timeout(Duration::from_secs(1)).deadline_in(Duration::from_secs(60));
        let remaining = ctx.deadline().unwrap() - Instant::now();
        assert!(remaining <= Duration::from_secs(1));
    }
}
