//! Retry policies for activity invocations.
//!
//! Retries are driven from inside the orchestration as ordinary
//! suspension primitives: each attempt is its own scheduled activity
//! and each backoff delay is a durable timer, so the whole retry
//! schedule replays deterministically from history.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::OrchestrationContext;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Same delay between every attempt.
    Fixed { delay_ms: u64 },
    /// `first_delay_ms * coefficient^(k-1)` before the retry following
    /// failed attempt k, capped at `max_delay_ms`.
    Exponential {
        first_delay_ms: u64,
        coefficient: f64,
        max_delay_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: BackoffStrategy::Fixed { delay_ms: 0 },
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay before the retry that follows failed attempt `attempt`
    /// (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffStrategy::Exponential {
                first_delay_ms,
                coefficient,
                max_delay_ms,
            } => {
                let factor = coefficient.powi(attempt.saturating_sub(1) as i32);
                let delay = (first_delay_ms as f64 * factor).min(max_delay_ms as f64);
                Duration::from_millis(delay as u64)
            }
        }
    }
}

impl OrchestrationContext {
    /// Call an activity, retrying failures per `policy`. The last
    /// error is surfaced at the call site once attempts are exhausted.
    pub async fn call_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: &RetryPolicy,
    ) -> Result<String, String> {
        let name = name.into();
        let input = input.into();
        let mut attempt = 1u32;
        loop {
            match self.call_activity(name.clone(), input.clone()).await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    if attempt >= policy.max_attempts {
                        crate::durable_warn!(
                            self,
                            activity = %name,
                            attempts = attempt,
                            error = %error,
                            "activity exhausted retries"
                        );
                        return Err(error);
                    }
                    let delay = policy.delay_for_attempt(attempt);
                    crate::durable_warn!(
                        self,
                        activity = %name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "activity failed, retrying"
                    );
                    self.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Typed wrapper over [`Self::call_activity_with_retry`].
    pub async fn call_activity_with_retry_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
        policy: &RetryPolicy,
    ) -> Result<Out, String>
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned,
    {
        let encoded = crate::codec::encode(input)?;
        let raw = self.call_activity_with_retry(name, encoded, policy).await?;
        crate::codec::decode(&raw)
    }
}
