//! Cancellation and deadline context threaded through every bus operation.

use crate::UartResult;
use owp_onewire::OneWireError;
use std::{
    future::{Future, pending},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cloneable cancellation signal. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<CancelInner>);

impl CancelToken {
    /// Creates a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token and wakes every waiter.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    /// `true` once [`cancel`](CancelToken::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.0.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Deadline and cancellation carried by one logical operation.
///
/// Async suspension points race the context with [`run`](OpContext::run); the blocking
/// UART worker polls [`is_done`](OpContext::is_done) between time slots.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: Option<CancelToken>,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that never expires and cannot be cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().timeout(timeout)
    }

    /// A context cancelled through `token`.
    pub fn with_token(token: CancelToken) -> Self {
        Self {
            token: Some(token),
            deadline: None,
        }
    }

    /// Derives a context sharing this one's token whose deadline is the earlier of the
    /// current deadline and `timeout` from now.
    pub fn timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        Self {
            token: self.token.clone(),
            deadline: Some(self.deadline.map_or(candidate, |d| d.min(candidate))),
        }
    }

    /// The instant this context expires, if bounded.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `true` if the token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// `true` if the token was cancelled or the deadline has passed.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when the context is cancelled or expires. Never resolves for [`OpContext::new`].
    pub async fn done(&self) {
        let expired = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
                None => pending().await,
            }
        };
        let cancelled = async {
            match &self.token {
                Some(t) => t.cancelled().await,
                None => pending().await,
            }
        };
        tokio::select! {
            _ = expired => {}
            _ = cancelled => {}
        }
    }

    /// Runs `fut` until it completes or the context ends.
    ///
    /// # Errors
    /// [`OneWireError::Timeout`] if the context ended first.
    pub async fn run<F: Future>(&self, fut: F) -> UartResult<F::Output> {
        if self.is_done() {
            return Err(OneWireError::Timeout);
        }
        tokio::select! {
            biased;
            out = fut => Ok(out),
            _ = self.done() => Err(OneWireError::Timeout),
        }
    }

    /// Sleeps for `duration` unless the context ends first.
    pub async fn sleep(&self, duration: Duration) -> UartResult<()> {
        self.run(tokio::time::sleep(duration)).await
    }
}
