//! Retry policy for storage calls.
//!
//! The decision is a pure function of the attempt number and the error, so it
//! can be tested without touching the network. The global budget is the only
//! piece of state and it lives outside the policy.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::core::models::RemotePath;
use crate::core::storage::with_timeout;
use crate::error::{ErrorClass, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a file is tried at most `retry_attempts + 1` times
    pub retry_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Decide what to do after attempt number `attempt` (1-based) failed with `error`.
    pub fn decide(&self, attempt: u32, error: &StorageError) -> RetryDecision {
        if error.class() != ErrorClass::Transient || attempt > self.retry_attempts {
            return RetryDecision::GiveUp;
        }

        let mut delay = self.backoff(attempt);
        // A provider's Retry-After wins over our own estimate, within the cap.
        if let StorageError::RateLimited {
            retry_after: Some(hint),
        } = error
        {
            delay = delay.max(*hint).min(self.max_delay);
        }
        RetryDecision::Retry(delay)
    }

    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run-wide cap on the number of retries, shared by every file of a run.
#[derive(Debug)]
pub struct RetryBudget {
    limit: Option<u32>,
    spent: AtomicU32,
    denied: AtomicBool,
}

impl RetryBudget {
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            limit,
            spent: AtomicU32::new(0),
            denied: AtomicBool::new(false),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Take one retry from the budget. Returns false once the budget is spent.
    pub fn try_consume(&self) -> bool {
        match self.limit {
            None => {
                self.spent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(limit) => {
                let granted = self
                    .spent
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |spent| {
                        (spent < limit).then_some(spent + 1)
                    })
                    .is_ok();
                if !granted {
                    self.denied.store(true, Ordering::Relaxed);
                }
                granted
            }
        }
    }

    /// True once a retry was wanted but refused.
    pub fn was_denied(&self) -> bool {
        self.denied.load(Ordering::Relaxed)
    }

    pub fn is_exhausted(&self) -> bool {
        self.limit
            .is_some_and(|limit| self.spent.load(Ordering::Relaxed) >= limit)
    }

    pub fn spent(&self) -> u32 {
        self.spent.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }
}

/// Issue a storage call, retrying transient failures per `policy` while the
/// shared `budget` allows it. Each try is bounded by `limit`.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    budget: &RetryBudget,
    limit: Duration,
    operation: &str,
    path: &RemotePath,
    mut call: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt: u32 = 1;
    loop {
        let error = match with_timeout(limit, call()).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        match policy.decide(attempt, &error) {
            RetryDecision::Retry(delay) if budget.try_consume() => {
                warn!(
                    operation,
                    path = %path,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Storage call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            _ => return Err(error),
        }
    }
}
