//! Cancellable retry-with-backoff

use crate::config::RetryPolicy;
use crate::error::{SyncError, SyncResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Receiving side of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Sending side of a cancellation signal
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Creates a connected handle/signal pair
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleeps for `delay` unless cancelled first
    pub async fn sleep(&self, delay: Duration) -> SyncResult<()> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let mut rx = self.rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = wait_cancelled(&mut rx) => Err(SyncError::Cancelled),
        }
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without cancelling
            std::future::pending::<()>().await;
        }
    }
}

/// Result of one attempt inside [`retry_until`]
#[derive(Debug)]
pub enum Attempt<T> {
    /// Condition met, stop retrying
    Done(T),
    /// Not yet; keep this value in case retries run out
    Retry(T),
}

/// Final value of a retry loop
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// Attempts actually made (1-based)
    pub attempts: u32,
    /// Whether the last attempt returned `Done`
    pub satisfied: bool,
}

/// Runs `attempt_fn` until it returns `Done` or the policy is exhausted
///
/// Errors from `attempt_fn` end the loop immediately. Between attempts the
/// loop sleeps according to `policy`, and cancellation during a sleep
/// yields [`SyncError::Cancelled`].
pub async fn retry_until<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelSignal,
    mut attempt_fn: F,
) -> SyncResult<RetryOutcome<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = SyncResult<Attempt<T>>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        match attempt_fn(attempt).await? {
            Attempt::Done(value) => {
                return Ok(RetryOutcome {
                    value,
                    attempts: attempt + 1,
                    satisfied: true,
                })
            }
            Attempt::Retry(value) => {
                if attempt + 1 >= max_attempts {
                    return Ok(RetryOutcome {
                        value,
                        attempts: attempt + 1,
                        satisfied: false,
                    });
                }
                let delay = policy.delay_for(attempt);
                log::debug!(
                    "Attempt {}/{} not satisfied, retrying in {}ms",
                    attempt + 1,
                    max_attempts,
                    delay.as_millis()
                );
                cancel.sleep(delay).await?;
            }
        }

        attempt += 1;
    }
}
