//! Retry and visibility polling policies.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::error::RegistryError;
use crate::ident::ArtifactId;
use crate::registry::Registry;
use crate::{Error, Result};

/// Exponential backoff on transient registry errors.
///
/// An operation is attempted at most `attempts` times. After the n-th failed attempt, the next one is delayed by
/// `base_delay * 2^(n-1)`, ie. `2s, 4s, 8s...` for a 2 seconds base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `attempt`-th (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Run `op` until it succeeds, fails with a non transient error or exhausts the attempts.
    ///
    /// ```
    /// # tokio_test::block_on(async {
    /// # use relay::retry::RetryPolicy;
    /// let policy = RetryPolicy::default();
    ///
    /// let value = policy.run("answer", || async { Ok(42) }).await.unwrap();
    /// assert_eq!(value, 42);
    /// # })
    /// ```
    pub async fn run<T, F, Fut>(&self, what: impl Display, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let attempts = self.attempts.max(1);

        for attempt in 1.. {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.delay(attempt);

                    tracing::warn!("{what}: attempt {attempt}/{attempts} failed, retrying in {delay:?}: {err}");

                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => return Err(Error::RetriesExhausted { attempts, source: err }),
                Err(err) => return Err(err.into()),
            }
        }

        unreachable!()
    }
}

/// Bounded polling of an artifact until it becomes visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for VisibilityPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(3),
        }
    }
}

impl VisibilityPolicy {
    /// Poll `id` until its descriptor can be read.
    ///
    /// Returns `false` once attempts are exhausted: a timeout is a soft failure left to the caller to report.
    pub async fn wait_visible<R: Registry>(&self, registry: &R, id: &ArtifactId) -> Result<bool> {
        for attempt in 1..=self.attempts {
            match registry.fetch_field(id, "/version").await {
                Ok(_) => {
                    tracing::trace!("{id} visible after {attempt} poll(s)");
                    return Ok(true);
                }
                Err(err) if err.is_not_found() || err.is_transient() => {
                    tracing::trace!("{id} not visible yet ({attempt}/{}): {err}", self.attempts);
                }
                Err(err) => return Err(err.into()),
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        Ok(false)
    }
}
