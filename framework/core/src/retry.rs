use std::time::Duration;

use crate::cancel::CancelListener;

/// A fixed-backoff retry budget.
///
/// Both the store connection and the ingestion launch use one of these, with very different
/// budgets, so the numbers come from configuration rather than from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

/// Every attempt failed, or the wait between two attempts was cancelled.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: anyhow::Error,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Call `op` with the 1-based attempt number until it succeeds.
    ///
    /// The backoff is only slept between attempts, never after the last one.
    pub fn run<T>(
        &self,
        what: &str,
        cancel: &CancelListener,
        mut op: impl FnMut(u32) -> anyhow::Result<T>,
    ) -> Result<T, RetryExhausted> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    log::error!("{what} failed on final attempt {attempt}/{attempts}: {e:?}");
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    log::warn!(
                        "{what} failed on attempt {attempt}/{attempts}, retrying in {:?}: {e:?}",
                        self.backoff
                    );
                    if let Err(cancelled) = cancel.pause(self.backoff) {
                        return Err(RetryExhausted {
                            attempts: attempt,
                            last_error: anyhow::Error::new(cancelled),
                        });
                    }
                }
            }
            attempt += 1;
        }
    }
}
