//! Retry with exponential backoff.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::warn;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier applied to the backoff after each attempt.
    pub base: f64,

    /// Total deadline across all attempts, including the time spent
    /// inside the retried operation. `None` retries forever.
    pub deadline: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(15),
            base: 3.0,
            deadline: None,
        }
    }
}

/// Error returned by the retry combinators.
#[derive(Debug)]
pub enum BackoffError<E> {
    /// The deadline elapsed; carries the most recent task error.
    DeadlineExceeded {
        /// Configured deadline.
        deadline: Duration,
        /// The error observed on the final attempt.
        source: E,
    },
}

impl<E: std::fmt::Display> std::fmt::Display for BackoffError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeadlineExceeded { deadline, source } => {
                write!(f, "deadline ({deadline:?}) exceeded, source: {source}")
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BackoffError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DeadlineExceeded { source, .. } => Some(source),
        }
    }
}

/// Result wrapper for the retry combinators.
pub type BackoffResult<T, E> = Result<T, BackoffError<E>>;

/// [`Backoff`] repeatedly invokes an async operation, sleeping an
/// exponentially growing interval between attempts.
#[derive(Debug)]
pub struct Backoff {
    next_backoff: Duration,
    max_backoff: Duration,
    base: f64,
    deadline: Option<Duration>,
}

impl Backoff {
    /// Create a new [`Backoff`] from `config`.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            next_backoff: config.init_backoff,
            max_backoff: config.max_backoff,
            base: config.base,
            deadline: config.deadline,
        }
    }

    /// Advance the backoff state, returning the interval to sleep.
    pub fn next(&mut self) -> Duration {
        let current = self.next_backoff;
        let grown = current.as_secs_f64() * self.base;
        self.next_backoff = Duration::from_secs_f64(grown).min(self.max_backoff);
        current
    }

    /// Retry `task` until it succeeds or the configured deadline elapses.
    ///
    /// Every error is considered retriable; `task_name` tags the retry
    /// diagnostics.
    pub async fn retry_all_errors<F, Fut, T, E>(
        &mut self,
        task_name: &str,
        mut task: F,
    ) -> BackoffResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let started = Instant::now();
        loop {
            match task().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let sleep = self.next();
                    let deadline_hit = self
                        .deadline
                        .map(|deadline| started.elapsed() + sleep >= deadline)
                        .unwrap_or(false);
                    if deadline_hit {
                        return Err(BackoffError::DeadlineExceeded {
                            deadline: self.deadline.expect("checked above"),
                            source: e,
                        });
                    }
                    warn!(task = task_name, error = %e, backoff = ?sleep, "retrying");
                    tokio::time::sleep(sleep).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn backoff_growth_is_capped() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            base: 2.0,
            deadline: None,
        };
        let mut backoff = Backoff::new(&config);
        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));
        assert_eq!(backoff.next(), Duration::from_millis(400));
        assert_eq!(backoff.next(), Duration::from_millis(500));
        assert_eq!(backoff.next(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            base: 2.0,
            deadline: None,
        };
        let attempts = Arc::new(Mutex::new(0_u32));

        let observed = Arc::clone(&attempts);
        let got = Backoff::new(&config)
            .retry_all_errors("test", move || {
                let attempts = Arc::clone(&observed);
                async move {
                    let mut n = attempts.lock();
                    *n += 1;
                    if *n < 3 {
                        Err("transient")
                    } else {
                        Ok(*n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(got, 3);
        assert_eq!(*attempts.lock(), 3);
    }

    #[tokio::test]
    async fn deadline_stops_retrying() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
            base: 1.0,
            deadline: Some(Duration::from_millis(5)),
        };

        let got: BackoffResult<(), &str> = Backoff::new(&config)
            .retry_all_errors("test", || async { Err("always failing") })
            .await;

        assert!(matches!(got, Err(BackoffError::DeadlineExceeded { .. })));
    }
}
