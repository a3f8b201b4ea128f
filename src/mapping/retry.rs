use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::PageCallError;

/// Single timeout/backoff policy shared by every render and classify call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, PageCallError>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancelSignal,
        what: &str,
        mut op: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PageCallError>>,
    {
        let attempts = self.attempts.max(1);
        let mut last_error = PageCallError::unavailable("no attempt made");

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(PageCallError::Cancelled),
                    attempts: attempt - 1,
                };
            }

            let call = tokio::time::timeout(self.timeout, op());
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PageCallError::Cancelled),
                finished = call => match finished {
                    Ok(inner) => inner,
                    Err(_) => Err(PageCallError::Timeout {
                        after_ms: self.timeout.as_millis() as u64,
                    }),
                },
            };

            match result {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(PageCallError::Cancelled) => {
                    return RetryOutcome {
                        result: Err(PageCallError::Cancelled),
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    warn!(call = what, attempt, attempts, error = %error, "page call failed");
                    last_error = error;
                }
            }

            if attempt < attempts {
                let delay = self.backoff_for(attempt);
                debug!(call = what, delay_ms = delay.as_millis() as u64, "backing off");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return RetryOutcome {
                            result: Err(PageCallError::Cancelled),
                            attempts: attempt,
                        };
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        RetryOutcome {
            result: Err(last_error),
            attempts,
        }
    }
}

/// Read side of a book- or batch-wide cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle { sender }, CancelSignal { receiver })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl CancelSignal {
    pub fn never() -> Self {
        let (_, signal) = cancel_pair();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancelled; pends forever if the handle is gone uncancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                if *receiver.borrow() {
                    return;
                }
                std::future::pending::<()>().await;
            }
        }
    }
}
