use std::time::Duration;

use crate::error::InferenceError;

pub const RATE_LIMIT_EXHAUSTED: &str = "Rate limit exceeded. Please try again later.";

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then start the next attempt.
    Retry { next_attempt: u32, delay: Duration },
    /// Give up and end the stream with this message.
    Fail(String),
}

/// Retry policy for streaming calls: only rate limiting is retried, with
/// exponential backoff `unit * 2^attempt`, attempt counted from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub unit: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, unit: Duration) -> Self {
        Self { max_retries, unit }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.unit
            .saturating_mul(2u32.saturating_pow(attempt.min(30)))
    }

    /// `attempt` is the index of the attempt that just failed.
    pub fn decide(&self, attempt: u32, err: &InferenceError) -> RetryDecision {
        if err.is_rate_limited() {
            if attempt < self.max_retries {
                RetryDecision::Retry {
                    next_attempt: attempt + 1,
                    delay: self.delay(attempt),
                }
            } else {
                RetryDecision::Fail(RATE_LIMIT_EXHAUSTED.into())
            }
        } else {
            RetryDecision::Fail(terminal_message(err))
        }
    }
}

/// Message for a failure that is not retried.
pub fn terminal_message(err: &InferenceError) -> String {
    match err {
        InferenceError::RateLimited { .. } => RATE_LIMIT_EXHAUSTED.into(),
        InferenceError::Connection(cause) => format!(
            "API connection error: {cause}. Please check your network connection and try again."
        ),
        other => other.to_string(),
    }
}
