//! Re-runs test actions until the system under test converges.
//!
//! Mesh configuration propagates asynchronously, so almost every check of a
//! test case is wrapped in [`until_success`]: the action (typically "probe and
//! assert") is attempted sequentially, with a fixed delay between attempts,
//! until it returns `Ok` or the attempt budget is spent. Exhaustion is a hard
//! failure that carries the error of the last attempt.
//!
//! ```ignore
//! retry::until_success("productpage is reachable", |_| async {
//!     let rsp = Probe::new().send(&url).await;
//!     check::status(&rsp, 200)
//! })
//! .await?;
//! ```

use crate::{Error, Result};
use std::{future::Future, time::Duration};
use tokio::time::Instant;

/// Bounds of a retried action.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct RetryOptions {
    max_attempts: u32,
    delay_between_attempts: Duration,
    timeout: Option<Duration>,
    log_attempts: bool,
}

/// Identifies one attempt of a retried action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attempt {
    number: u32,
    max: u32,
}

// === impl RetryOptions ===

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_between_attempts: Duration::from_secs(1),
            timeout: None,
            log_attempts: true,
        }
    }
}

impl RetryOptions {
    /// Sets the attempt budget. At least one attempt is always made.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn delay_between_attempts(mut self, delay: Duration) -> Self {
        self.delay_between_attempts = delay;
        self
    }

    /// Stops retrying once the next attempt would start after `timeout` has
    /// elapsed since the first one. A running attempt is never interrupted.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn log_attempts(mut self, log_attempts: bool) -> Self {
        self.log_attempts = log_attempts;
        self
    }

    pub fn get_max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn get_delay_between_attempts(&self) -> Duration {
        self.delay_between_attempts
    }
}

// === impl Attempt ===

impl Attempt {
    /// The 1-based number of this attempt.
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Returns false on the final attempt of the budget. An overall timeout
    /// may still end the retry loop earlier.
    pub fn will_retry(&self) -> bool {
        self.number < self.max
    }
}

/// Retries `action` with the default options.
pub async fn until_success<F, Fut, T, E>(operation: &str, action: F) -> Result<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<Error>,
{
    until_success_with_options(&RetryOptions::default(), operation, action).await
}

/// Retries `action` until it returns `Ok`, returning that value.
///
/// Fails with [`Error::RetryExhausted`] wrapping the last attempt's error when
/// the attempts (or the overall timeout) run out.
pub async fn until_success_with_options<F, Fut, T, E>(
    options: &RetryOptions,
    operation: &str,
    mut action: F,
) -> Result<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<Error>,
{
    let start = Instant::now();
    let deadline = options.timeout.map(|timeout| start + timeout);
    let log_failures = options.log_attempts && crate::env::log_failed_retry_attempts();
    let max = options.max_attempts.max(1);
    let delay = options.delay_between_attempts;

    let mut number = 0;
    loop {
        number += 1;
        let error: Error = match action(Attempt { number, max }).await {
            Ok(value) => {
                if number > 1 && options.log_attempts {
                    tracing::info!(
                        %operation,
                        "attempt {number}/{max} successful; total time: {:.2}s",
                        start.elapsed().as_secs_f64()
                    );
                }
                warn_if_flaky(operation, number, max);
                return Ok(value);
            }
            Err(error) => error.into(),
        };

        let out_of_time = deadline.is_some_and(|deadline| Instant::now() + delay >= deadline);
        if number >= max || out_of_time {
            if options.log_attempts {
                tracing::warn!(%operation, "last attempt ({number}/{max}) failed");
            }
            return Err(Error::RetryExhausted {
                operation: operation.to_string(),
                attempts: number,
                elapsed: start.elapsed(),
                last: Box::new(error),
            });
        }

        if log_failures {
            tracing::warn!(%operation, %error, "attempt {number}/{max} failed; retrying in {delay:?}");
        } else {
            tracing::debug!(%operation, %error, "attempt {number}/{max} failed; retrying in {delay:?}");
        }
        tokio::time::sleep(delay).await;
    }
}

/// Runs `action` exactly once, returning its error unwrapped.
pub async fn attempt<F, Fut, T, E>(operation: &str, action: F) -> Result<T>
where
    F: FnOnce(Attempt) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<Error>,
{
    action(Attempt { number: 1, max: 1 }).await.map_err(|error| {
        let error = error.into();
        tracing::debug!(%operation, %error, "attempt failed");
        error
    })
}

/// Evaluates `condition` up to `trials` times, `interval` apart, until it
/// returns `Ok(true)`. An `Err` from the condition aborts immediately.
pub async fn poll<F, Fut>(interval: Duration, trials: u32, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let trials = trials.max(1);
    for trial in 1..=trials {
        match condition().await {
            Ok(true) => return Ok(()),
            Ok(false) => tracing::trace!(trial, trials, "condition not met"),
            Err(error) => {
                return Err(Error::PollAborted {
                    trial,
                    source: Box::new(error),
                })
            }
        }
        if trial < trials {
            tokio::time::sleep(interval).await;
        }
    }
    Err(Error::PollExhausted { trials })
}

fn warn_if_flaky(operation: &str, number: u32, max: u32) {
    if max <= 1 {
        return;
    }
    let used = budget_used(number, max);
    if used >= 90 {
        tracing::warn!(
            %operation,
            "this step is almost certainly flaky: it needed more than 90% of its {max} attempts to succeed; consider raising the attempt budget"
        );
    } else if used >= 75 {
        tracing::warn!(
            %operation,
            "this step may be flaky: it needed more than 75% of its {max} attempts to succeed; consider raising the attempt budget"
        );
    }
}

/// Percentage of `max` attempts that failed before attempt `number`
/// succeeded.
fn budget_used(number: u32, max: u32) -> u64 {
    u64::from(number.saturating_sub(1)) * 100 / u64::from(max.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_used_does_not_overflow_large_attempt_counts() {
        assert_eq!(budget_used(1, 10), 0);
        assert_eq!(budget_used(9, 10), 80);
        assert_eq!(budget_used(u32::MAX, u32::MAX), 99);
        assert_eq!(budget_used(50_000_000, 50_000_000), 99);
        warn_if_flaky("huge budget", u32::MAX, u32::MAX);
    }
    use crate::check::Failure;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[test]
    fn defaults() {
        let options = RetryOptions::default();
        assert_eq!(options.get_max_attempts(), 5);
        assert_eq!(options.get_delay_between_attempts(), Duration::from_secs(1));
        assert_eq!(RetryOptions::default().max_attempts(0).get_max_attempts(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stops_after_first_success() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let start = Instant::now();

        let value = until_success("converges", move |attempt| {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(attempt.number(), n);
                if n < 3 {
                    Err(Failure::new(format!("attempt {n} not yet")))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .expect("must succeed on the third attempt");

        assert_eq!(value, 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // Two delays: between attempts 1-2 and 2-3.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn exhausts_exactly_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let options = RetryOptions::default().max_attempts(7);

        let err = until_success_with_options(&options, "never converges", move |attempt| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                assert_eq!(attempt.max(), 7);
                Err::<(), _>(Failure::new(format!("observed {}", attempt.number())))
            }
        })
        .await
        .expect_err("must fail");

        assert_eq!(count.load(Ordering::SeqCst), 7);
        match err {
            Error::RetryExhausted {
                operation,
                attempts,
                last,
                ..
            } => {
                assert_eq!(operation, "never converges");
                assert_eq!(attempts, 7);
                assert_eq!(last.to_string(), "observed 7");
            }
            error => panic!("unexpected error: {error}"),
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn last_attempt_does_not_retry() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        let options = RetryOptions::default().max_attempts(3);

        let _ = until_success_with_options(&options, "records", move |attempt| {
            s.lock().push(attempt.will_retry());
            async move { Err::<(), _>(Failure::new("no")) }
        })
        .await;

        assert_eq!(*seen.lock(), vec![true, true, false]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn overall_timeout_ends_retries() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let options = RetryOptions::default()
            .max_attempts(100)
            .timeout(Duration::from_millis(3500));

        let err = until_success_with_options(&options, "slow", move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Failure::new("still failing"))
            }
        })
        .await
        .expect_err("must time out");

        // Attempts start at 0s, 1s, 2s and 3s; a fifth would start after the
        // deadline.
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert!(matches!(err, Error::RetryExhausted { attempts: 4, .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn single_attempt_returns_error_unwrapped() {
        let err = attempt("once", |a| async move {
            assert!(!a.will_retry());
            Err::<(), _>(Failure::new("nope"))
        })
        .await
        .expect_err("must fail");
        assert!(matches!(err, Error::Assertion(_)));

        let ok = attempt("once", |_| async { Ok::<_, Error>(1) }).await;
        assert_eq!(ok.ok(), Some(1));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn poll_until_true() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        poll(Duration::from_millis(500), 10, move || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) == 2) }
        })
        .await
        .expect("condition becomes true");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn poll_exhausts_and_aborts() {
        let err = poll(Duration::from_millis(10), 4, || async { Ok(false) })
            .await
            .expect_err("never true");
        assert!(matches!(err, Error::PollExhausted { trials: 4 }));

        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let err = poll(Duration::from_millis(10), 4, move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 1 {
                    Err(Error::Config("broken".to_string()))
                } else {
                    Ok(false)
                }
            }
        })
        .await
        .expect_err("aborted");
        assert!(matches!(err, Error::PollAborted { trial: 2, .. }));
    }
}
