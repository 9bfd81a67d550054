//! Retry Policy Engine.
//!
//! A retried call is an ordinary sequence of durable tasks: each attempt is
//! its own `TaskScheduled`, and the pause between attempts is a durable
//! timer. Replay walks the same attempts in the same order, so the attempt
//! counter is always the number of failed attempts history already holds.

use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

use crate::{DurableOutput, OrchestrationContext, codec, durable_debug, durable_error, durable_warn};

/// Delay to wait after a failed attempt before the next one.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    Fixed { delay: Duration },
    /// `base * attempt`, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, multiplier: f64, max: Duration },
    /// Caller-supplied schedule; must be a pure function of the attempt number.
    Custom(fn(u32) -> Duration),
}

impl BackoffStrategy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let nanos = base.as_nanos() as f64 * multiplier.powi(attempt as i32 - 1);
                if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
                    *max
                } else {
                    Duration::from_nanos(nanos.round() as u64)
                }
            }
            BackoffStrategy::Custom(f) => f(attempt),
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

/// How many times a call is attempted and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Per-attempt deadline. An attempt that outlives it counts as failed.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// # Panics
    /// If `max_attempts` is 0.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// A constant `first_interval` between attempts.
    pub fn with_first_interval(first_interval: Duration, max_attempts: u32) -> Self {
        Self::new(max_attempts).with_backoff(BackoffStrategy::Fixed { delay: first_interval })
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay before the first retry.
    pub fn first_interval(&self) -> Duration {
        self.backoff.delay_for_attempt(1)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}

#[derive(Clone, Copy)]
enum Target {
    Activity,
    SubOrchestration,
}

impl OrchestrationContext {
    /// Call an activity, retrying failures according to `policy`.
    ///
    /// Returns the first success, or the last attempt's error once
    /// `policy.max_attempts` attempts have failed.
    pub async fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: &RetryPolicy,
    ) -> Result<String, String> {
        self.with_retry(Target::Activity, name.into(), input.into(), policy).await
    }

    pub async fn schedule_activity_with_retry_typed<In: Serialize, Out: DeserializeOwned>(
        &self,
        name: impl Into<String>,
        input: &In,
        policy: &RetryPolicy,
    ) -> Result<Out, String> {
        let payload = codec::encode(input)?;
        let out = self.schedule_activity_with_retry(name, payload, policy).await?;
        codec::decode::<Out>(&out)
    }

    /// Start a sub-orchestration, retrying failed runs as fresh child instances.
    pub async fn schedule_sub_orchestration_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: &RetryPolicy,
    ) -> Result<String, String> {
        self.with_retry(Target::SubOrchestration, name.into(), input.into(), policy).await
    }

    async fn with_retry(&self, target: Target, name: String, input: String, policy: &RetryPolicy) -> Result<String, String> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            let call = match target {
                Target::Activity => self.schedule_activity_attempt(name.as_str(), input.as_str(), attempt),
                Target::SubOrchestration => self.schedule_sub_orchestration(name.as_str(), input.as_str()),
            };
            let result = match policy.timeout {
                None => call.await.into_result(),
                Some(timeout) => {
                    let deadline = self.schedule_timer(timeout.as_millis() as u64);
                    match self.select2(call, deadline).await {
                        (0, out) => out.into_result(),
                        (_, DurableOutput::Timer) => Err(format!("attempt {attempt} timed out after {timeout:?}")),
                        (_, other) => other.into_result(),
                    }
                }
            };
            match result {
                Ok(v) => {
                    if attempt > 1 {
                        durable_debug!(self, name = %name, attempt, "succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) if attempt < max_attempts => {
                    let delay = policy.delay_for_attempt(attempt);
                    durable_warn!(
                        self,
                        name = %name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        self.schedule_timer(delay.as_millis() as u64).into_timer().await;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    durable_error!(self, name = %name, attempts = attempt, error = %e, "retries exhausted");
                    return Err(e);
                }
            }
        }
    }
}
