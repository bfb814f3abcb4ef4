use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::UtcpError;

/// Request context carried by every client and transport operation.
///
/// Bundles an optional deadline with a cancellation token. Clones share the
/// token, so cancelling any clone cancels the whole call tree.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Signal cancellation to every operation running under this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Effective deadline for a call: the context deadline when set, else
    /// `now + default_timeout_ms` when the provider carries a nonzero default.
    /// `None` means wait forever.
    pub(crate) fn effective_deadline(&self, default_timeout_ms: Option<u64>) -> Option<Instant> {
        self.deadline.or_else(|| match default_timeout_ms {
            Some(ms) if ms > 0 => Some(Instant::now() + Duration::from_millis(ms)),
            _ => None,
        })
    }

    /// Race `fut` against cancellation and the effective deadline.
    ///
    /// Cancellation wins as `Cancelled`, an elapsed deadline as
    /// `DeadlineExceeded`; both are delivered through the normal error path so
    /// callers observe a single `Result`.
    pub(crate) async fn drive<T, F>(&self, default_timeout_ms: Option<u64>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = self.effective_deadline(default_timeout_ms);
        tokio::pin!(fut);

        let expired = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(UtcpError::Cancelled.into()),
            _ = expired => Err(UtcpError::DeadlineExceeded.into()),
            out = &mut fut => out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::as_utcp_error;

    #[tokio::test]
    async fn drive_returns_value_before_deadline() {
        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let out: i32 = ctx.drive(None, async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn provider_timeout_maps_to_deadline_exceeded() {
        let ctx = CallContext::new();
        let err = ctx
            .drive::<(), _>(Some(20), async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::DeadlineExceeded)
        ));
    }

    #[tokio::test]
    async fn zero_timeout_means_no_deadline() {
        let ctx = CallContext::new();
        assert!(ctx.effective_deadline(Some(0)).is_none());
        assert!(ctx.effective_deadline(None).is_none());
    }

    #[tokio::test]
    async fn cancel_beats_the_future() {
        let ctx = CallContext::new();
        let handle = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });
        let err = ctx
            .drive::<(), _>(None, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(as_utcp_error(&err), Some(UtcpError::Cancelled)));
    }
}
