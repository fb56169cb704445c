//! Retry with exponential backoff for Messenger Send API calls

use std::time::{Duration, SystemTime};

/// Graph API error codes that signal a temporary condition
///
/// 1/2: unknown/service temporarily unavailable, 4/17/32/613: rate limits
const TRANSIENT_GRAPH_CODES: &[i64] = &[1, 2, 4, 17, 32, 613];

/// Retry policy for Send API calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Base delay between retries (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Determine whether an HTTP status and response body indicate a recoverable error.
///
/// Rate limits (429), server errors (5xx), Graph errors flagged
/// `is_transient` or carrying a throttling code, and transient network
/// failures surfaced in the body text are worth retrying.
#[must_use]
pub fn is_recoverable(status: u16, body: &str) -> bool {
    if status == 429 || (500..600).contains(&status) {
        return true;
    }

    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(error) = v.get("error") {
            if error
                .get("is_transient")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
            {
                return true;
            }
            if let Some(code) = error.get("code").and_then(serde_json::Value::as_i64) {
                return TRANSIENT_GRAPH_CODES.contains(&code);
            }
        }
    }

    let lower = body.to_lowercase();
    lower.contains("connection reset")
        || lower.contains("timed out")
        || lower.contains("dns error")
}

/// Compute the delay before the next retry attempt.
///
/// `min(base_delay * 2^attempt + jitter, max_delay)`, where jitter is 0-25%
/// of the computed delay derived from the system clock.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let jitter = base.mul_f64(f64::from(jitter_nanos % 250) / 1000.0);

    (base + jitter).min(policy.max_delay)
}
