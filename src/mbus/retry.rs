//! Bounded retry helper.
//!
//! Each attempt reports a tagged [`Attempt`]; the policy only decides how
//! many attempts there are. Nothing on the bus is ever retried without an
//! upper bound.

use log::debug;
use std::future::Future;
use std::pin::Pin;

/// Result of one attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// Finished, stop retrying.
    Done(T),
    /// Transient failure (a timeout), try again if budget remains.
    Retry,
    /// Unrecoverable, stop immediately.
    Fatal(E),
}

/// Why [`RetryPolicy::run`] gave up.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    Fatal(E),
    Exhausted { attempts: u32 },
}

/// Boxed future of a single attempt, borrowing the retry context for `'a`.
pub type AttemptFuture<'a, T, E> = Pin<Box<dyn Future<Output = Attempt<T, E>> + Send + 'a>>;

/// Maximum number of attempts for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `op` until it is done, fatal, or the attempts are used up.
    ///
    /// `ctx` is handed to every attempt so the attempt future can borrow it
    /// mutably (typically the bus transport). Attempts are numbered from 1.
    pub async fn run<C, T, E, F>(&self, ctx: &mut C, mut op: F) -> Result<T, RetryError<E>>
    where
        C: ?Sized + Send,
        F: for<'a> FnMut(&'a mut C, u32) -> AttemptFuture<'a, T, E>,
    {
        for attempt in 1..=self.max_attempts {
            match op(&mut *ctx, attempt).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(e) => return Err(RetryError::Fatal(e)),
                Attempt::Retry => {
                    debug!("attempt {attempt}/{} timed out", self.max_attempts);
                }
            }
        }

        Err(RetryError::Exhausted {
            attempts: self.max_attempts,
        })
    }
}
