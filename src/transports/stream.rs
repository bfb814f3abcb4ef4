use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::context::CallContext;
use crate::errors::UtcpError;

/// A lazy, finite-or-infinite sequence of JSON values.
///
/// `next` returns `Ok(None)` at end-of-stream. Once a stream has ended or hit
/// a terminal error it stays terminal: later calls replay the same signal.
#[async_trait]
pub trait StreamResult: Send {
    async fn next(&mut self) -> Result<Option<Value>>;
    /// Idempotent; releases resources. A closed stream yields EOS.
    async fn close(&mut self) -> Result<()>;
}

enum Terminal {
    Eos,
    Failed(UtcpError),
}

/// StreamResult fed by a channel of `Result<Value, UtcpError>`.
///
/// Producers drop their sender to signal EOS and send an error to terminate.
/// When built with a context, a blocked `next` also observes cancellation and
/// the deadline.
pub struct ChannelStreamResult {
    rx: mpsc::Receiver<Result<Value, UtcpError>>,
    ctx: Option<CallContext>,
    terminal: Option<Terminal>,
    close_fn: Option<Box<dyn FnOnce() + Send>>,
}

impl ChannelStreamResult {
    pub fn new(
        rx: mpsc::Receiver<Result<Value, UtcpError>>,
        close_fn: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            rx,
            ctx: None,
            terminal: None,
            close_fn,
        }
    }

    pub fn with_context(mut self, ctx: CallContext) -> Self {
        self.ctx = Some(ctx);
        self
    }

    fn release(&mut self) {
        if let Some(close_fn) = self.close_fn.take() {
            close_fn();
        }
    }

    fn fail(&mut self, err: UtcpError) -> anyhow::Error {
        self.release();
        self.terminal = Some(Terminal::Failed(err.clone()));
        err.into()
    }
}

#[async_trait]
impl StreamResult for ChannelStreamResult {
    async fn next(&mut self) -> Result<Option<Value>> {
        match &self.terminal {
            Some(Terminal::Eos) => return Ok(None),
            Some(Terminal::Failed(err)) => return Err(err.clone().into()),
            None => {}
        }

        enum Event {
            Cancelled,
            Expired,
            Recv(Option<Result<Value, UtcpError>>),
        }

        let cancel_token = self.ctx.as_ref().map(|ctx| ctx.cancellation_token());
        let deadline = self.ctx.as_ref().and_then(|ctx| ctx.deadline());
        let cancelled = async move {
            match cancel_token {
                Some(token) => token.cancelled_owned().await,
                None => std::future::pending().await,
            }
        };
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        let event = tokio::select! {
            _ = cancelled => Event::Cancelled,
            _ = expired => Event::Expired,
            msg = self.rx.recv() => Event::Recv(msg),
        };

        match event {
            Event::Cancelled => Err(self.fail(UtcpError::Cancelled)),
            Event::Expired => Err(self.fail(UtcpError::DeadlineExceeded)),
            Event::Recv(Some(Ok(value))) => Ok(Some(value)),
            Event::Recv(Some(Err(err))) => Err(self.fail(err)),
            Event::Recv(None) => {
                self.terminal = Some(Terminal::Eos);
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        self.rx.close();
        if self.terminal.is_none() {
            self.terminal = Some(Terminal::Eos);
        }
        Ok(())
    }
}

/// StreamResult over an in-memory vector, for transports whose response
/// arrives eagerly.
pub struct VecStreamResult {
    items: std::vec::IntoIter<Value>,
    closed: bool,
}

impl VecStreamResult {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: items.into_iter(),
            closed: false,
        }
    }
}

#[async_trait]
impl StreamResult for VecStreamResult {
    async fn next(&mut self) -> Result<Option<Value>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.items.next())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

pub fn boxed_channel_stream(
    rx: mpsc::Receiver<Result<Value, UtcpError>>,
    close_fn: Option<Box<dyn FnOnce() + Send>>,
) -> Box<dyn StreamResult> {
    Box::new(ChannelStreamResult::new(rx, close_fn))
}

pub fn boxed_vec_stream(items: Vec<Value>) -> Box<dyn StreamResult> {
    Box::new(VecStreamResult::new(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::as_utcp_error;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn vec_stream_yields_then_stays_at_eos() {
        let mut stream = VecStreamResult::new(vec![json!(1), json!({"two": 2})]);
        assert_eq!(stream.next().await.unwrap(), Some(json!(1)));
        assert_eq!(stream.next().await.unwrap(), Some(json!({"two": 2})));
        assert_eq!(stream.next().await.unwrap(), None);
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_forces_eos() {
        let mut stream = VecStreamResult::new(vec![json!(1), json!(2)]);
        assert_eq!(stream.next().await.unwrap(), Some(json!(1)));
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn channel_stream_replays_terminal_error() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(json!("ok"))).await.unwrap();
        tx.send(Err(UtcpError::call_failed("boom"))).await.unwrap();
        drop(tx);

        let mut stream = ChannelStreamResult::new(rx, None);
        assert_eq!(stream.next().await.unwrap(), Some(json!("ok")));

        let first = stream.next().await.unwrap_err();
        assert!(matches!(
            as_utcp_error(&first),
            Some(UtcpError::CallFailed { .. })
        ));
        // Terminal: same kind again, not the next channel state.
        let second = stream.next().await.unwrap_err();
        assert!(matches!(
            as_utcp_error(&second),
            Some(UtcpError::CallFailed { .. })
        ));
    }

    #[tokio::test]
    async fn channel_stream_runs_close_fn_once() {
        let (tx, rx) = mpsc::channel::<Result<Value, UtcpError>>(1);
        let closed = Arc::new(AtomicBool::new(false));
        let closed_clone = closed.clone();
        let mut stream = ChannelStreamResult::new(
            rx,
            Some(Box::new(move || {
                assert!(!closed_clone.swap(true, Ordering::SeqCst));
            })),
        );
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(stream.next().await.unwrap(), None);
        drop(tx);
    }

    #[tokio::test]
    async fn cancelled_context_unblocks_next() {
        let (_tx, rx) = mpsc::channel::<Result<Value, UtcpError>>(1);
        let ctx = CallContext::new();
        let handle = ctx.clone();
        let mut stream = ChannelStreamResult::new(rx, None).with_context(ctx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = stream.next().await.unwrap_err();
        assert!(matches!(as_utcp_error(&err), Some(UtcpError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(200));

        // Cancellation is terminal too.
        let again = stream.next().await.unwrap_err();
        assert!(matches!(as_utcp_error(&again), Some(UtcpError::Cancelled)));
    }

    #[tokio::test]
    async fn deadline_unblocks_next() {
        let (_tx, rx) = mpsc::channel::<Result<Value, UtcpError>>(1);
        let ctx = CallContext::with_timeout(Duration::from_millis(20));
        let mut stream = ChannelStreamResult::new(rx, None).with_context(ctx);

        let err = stream.next().await.unwrap_err();
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::DeadlineExceeded)
        ));
    }
}
