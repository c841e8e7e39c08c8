use std::{fmt::Display, future::Future, time::Duration};

use log::debug;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Volume attach and detach confirmation
pub const VOLUME_ATTACHMENT_BACKOFF: Backoff = Backoff::new(Duration::from_secs(1), 1.8, 13);
/// Volume creation and resize confirmation
pub const VOLUME_CREATE_BACKOFF: Backoff = Backoff::new(Duration::from_secs(5), 1.2, 10);
/// Tag creation retries, ~255s in total
pub const TAG_CREATE_BACKOFF: Backoff = Backoff::new(Duration::from_secs(1), 2.0, 9);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackoffError<E> {
    #[error("Condition wasn't met in time!")]
    Timeout,
    #[error("Polling was aborted! Reason: {0}")]
    Aborted(E),
}

/// Exponential backoff: the condition is evaluated at most `steps` times,
/// sleeping `initial * factor^n` between evaluations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub steps: u32,
}

impl Backoff {
    pub const fn new(initial: Duration, factor: f64, steps: u32) -> Self {
        Self {
            initial,
            factor,
            steps,
        }
    }

    /// Sleeps taken between consecutive evaluations
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let (initial, factor) = (self.initial, self.factor);

        (0..self.steps.saturating_sub(1)).map(move |step| initial.mul_f64(factor.powi(step as i32)))
    }

    /// Total time spent sleeping when every evaluation fails
    pub fn ceiling(&self) -> Duration {
        self.delays().sum()
    }

    /// Evaluates `condition` until it yields a value, fails, or the steps run out.
    /// `Ok(None)` means "not yet".
    pub async fn poll<T, E, F, Fut>(&self, mut condition: F) -> Result<T, BackoffError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        if self.steps == 0 {
            return Err(BackoffError::Timeout);
        }

        let mut delays = self.delays();
        loop {
            if let Some(value) = condition().await.map_err(BackoffError::Aborted)? {
                return Ok(value);
            }

            match delays.next() {
                Some(delay) => sleep(delay).await,
                None => return Err(BackoffError::Timeout),
            }
        }
    }

    /// Retries `operation` on any error, returning the last error once the steps run out
    pub async fn retry<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut delays = self.delays();
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => match delays.next() {
                    Some(delay) => {
                        debug!("Attempt failed, retrying in {delay:?}! Reason: {error}");
                        sleep(delay).await
                    }
                    None => return Err(error),
                },
            }
        }
    }
}

/// Fixed-interval polling bounded by wall-clock time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Deadline {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub async fn poll<T, E, F, Fut>(&self, mut condition: F) -> Result<T, BackoffError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let started = Instant::now();
        loop {
            if let Some(value) = condition().await.map_err(BackoffError::Aborted)? {
                return Ok(value);
            }

            if started.elapsed() + self.interval >= self.timeout {
                return Err(BackoffError::Timeout);
            }

            sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use super::{Backoff, BackoffError, Deadline, TAG_CREATE_BACKOFF, VOLUME_ATTACHMENT_BACKOFF};

    #[test]
    fn tag_backoff_ceiling_matches_the_documented_bound() {
        assert_eq!(Duration::from_secs(255), TAG_CREATE_BACKOFF.ceiling());
    }

    #[test]
    fn attachment_backoff_sleeps_twelve_times() {
        let ceiling = VOLUME_ATTACHMENT_BACKOFF.ceiling().as_secs();

        assert_eq!(12, VOLUME_ATTACHMENT_BACKOFF.delays().count());
        assert!((1400..1500).contains(&ceiling), "ceiling was {ceiling}");
    }

    #[tokio::test(start_paused = true)]
    async fn poll_returns_the_first_value() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff::new(Duration::from_secs(1), 2.0, 5);

        let result: Result<u32, BackoffError<()>> = backoff
            .poll(|| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok((call == 2).then_some(call)) }
            })
            .await;

        assert_eq!(Ok(2), result);
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_after_the_configured_steps() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff::new(Duration::from_secs(1), 2.0, 4);

        let result: Result<(), BackoffError<()>> = backoff
            .poll(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            })
            .await;

        assert_eq!(Err(BackoffError::Timeout), result);
        assert_eq!(4, calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_aborts_on_condition_error() {
        let backoff = Backoff::new(Duration::from_secs(1), 2.0, 4);

        let result: Result<(), BackoffError<&str>> =
            backoff.poll(|| async { Err("broken") }).await;

        assert_eq!(Err(BackoffError::Aborted("broken")), result);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_the_last_error() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff::new(Duration::from_secs(1), 2.0, 3);

        let result: Result<(), String> = backoff
            .retry(|| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("attempt {call}")) }
            })
            .await;

        assert_eq!(Err("attempt 2".to_owned()), result);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_success() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff::new(Duration::from_secs(1), 2.0, 9);

        let result: Result<u32, String> = backoff
            .retry(|| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    match call {
                        0 => Err("not visible yet".to_owned()),
                        _ => Ok(call),
                    }
                }
            })
            .await;

        assert_eq!(Ok(1), result);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_gives_up_after_the_timeout() {
        let calls = AtomicU32::new(0);
        let deadline = Deadline::new(Duration::from_secs(10), Duration::from_secs(600));

        let result: Result<(), BackoffError<()>> = deadline
            .poll(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            })
            .await;

        assert_eq!(Err(BackoffError::Timeout), result);
        assert_eq!(60, calls.load(Ordering::SeqCst));
    }
}
