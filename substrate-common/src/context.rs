//! Per-chain call carrier
//!
//! A [`CallContext`] carries cancellation, an optional deadline and an
//! optional dependency slot. Clones share the same token and slot, so a
//! carrier handed to several calls threads one coherence chain through them.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellable carrier attached to requests with
/// [`crate::options::with_context`]
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    transaction: Option<Arc<Mutex<Option<String>>>>,
}

impl CallContext {
    /// Carrier with no deadline and no dependency slot
    pub fn background() -> Self {
        Self::default()
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Give up waiting after `timeout` from now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Give up waiting at `deadline`; an earlier existing deadline wins
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    /// Attach a fresh, empty dependency slot
    pub fn with_transaction_slot(mut self) -> Self {
        self.transaction = Some(Arc::new(Mutex::new(None)));
        self
    }

    /// Cancel every call waiting on this carrier
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the carrier has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Underlying token
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether a dependency slot is attached
    pub fn has_transaction_slot(&self) -> bool {
        self.transaction.is_some()
    }

    /// Current chain head held in the slot
    pub fn transaction_id(&self) -> Option<String> {
        self.transaction.as_ref().and_then(|slot| slot.lock().clone())
    }

    /// Store a chain head; an empty id resets the chain.
    ///
    /// Returns `false` when no slot is attached.
    pub fn set_transaction_id(&self, transaction_id: &str) -> bool {
        match &self.transaction {
            Some(slot) => {
                *slot.lock() = Some(transaction_id.to_string()).filter(|id| !id.is_empty());
                true
            }
            None => false,
        }
    }

    /// Await `fut` unless the carrier is cancelled or its deadline passes first
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = deadline => Err(Error::DeadlineExceeded),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_shared_between_clones() {
        let ctx = CallContext::background().with_transaction_slot();
        let other = ctx.clone();

        assert!(ctx.set_transaction_id("tx-1"));
        assert_eq!(other.transaction_id().as_deref(), Some("tx-1"));

        other.set_transaction_id("");
        assert_eq!(ctx.transaction_id(), None);
    }

    #[test]
    fn test_no_slot() {
        let ctx = CallContext::background();
        assert!(!ctx.has_transaction_slot());
        assert!(!ctx.set_transaction_id("tx-1"));
        assert_eq!(ctx.transaction_id(), None);
    }

    #[test]
    fn test_earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = CallContext::background()
            .with_deadline(now + Duration::from_secs(5))
            .with_deadline(now + Duration::from_secs(10));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = CallContext::background();
        let value = ctx.run(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let ctx = CallContext::background();
        ctx.cancel();
        let result = ctx.run(async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let ctx = CallContext::background().with_timeout(Duration::from_millis(50));
        let result: Result<()> = ctx.run(std::future::pending()).await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let ctx = CallContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let result: Result<()> = ctx.run(std::future::pending()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
