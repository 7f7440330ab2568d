//! Request spacing and retry backoff.
//!
//! [`RequestRateLimiter`] holds the time of the most recent request. One
//! limiter is created per process and handed to every task, including
//! sub-tasks, so the configured spacing applies across all of them.

use crate::llm::ProviderError;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Shared "last request time" clock.
#[derive(Clone, Debug, Default)]
pub struct RequestRateLimiter {
    last_request: Arc<Mutex<Option<Instant>>>,
}

impl RequestRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Time still owed before the next request may start, given a minimum
    /// spacing of `interval`.
    #[must_use]
    pub fn delay_owed(&self, interval: Duration) -> Duration {
        let last = *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        last.map_or(Duration::ZERO, |last| {
            interval.saturating_sub(last.elapsed())
        })
    }

    /// [`Self::delay_owed`] for a spacing in whole seconds, rounded up to the
    /// nearest second.
    #[must_use]
    pub fn delay_owed_seconds(&self, rate_limit_seconds: u64) -> u64 {
        ceil_seconds(self.delay_owed(Duration::from_secs(rate_limit_seconds)))
    }

    /// Record that a request is starting now.
    pub fn mark_request(&self) {
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    #[must_use]
    pub fn last_request(&self) -> Option<Instant> {
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// `min(base * 2^attempt, cap)` in seconds.
#[must_use]
pub fn backoff_delay_seconds(base: u64, attempt: u32, cap: u64) -> u64 {
    base.saturating_mul(2u64.saturating_pow(attempt)).min(cap)
}

/// Retry hint carried by a [`ProviderError`] anywhere in the error chain.
#[must_use]
pub fn provider_retry_after(error: &anyhow::Error) -> Option<u64> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<ProviderError>())
        .and_then(|provider| provider.retry_after)
        .map(ceil_seconds)
}

/// Seconds to wait before retrying a failed first chunk.
///
/// A provider retry hint replaces the exponential backoff. Either way the
/// wait is never shorter than the rate-limit delay still owed.
#[must_use]
pub fn retry_delay_seconds(
    error: &anyhow::Error,
    base: u64,
    attempt: u32,
    cap: u64,
    rate_limit_delay: u64,
) -> u64 {
    provider_retry_after(error)
        .unwrap_or_else(|| backoff_delay_seconds(base, attempt, cap))
        .max(rate_limit_delay)
}

fn ceil_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}
