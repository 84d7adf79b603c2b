use jiff::{Span, ToSpan};

// Largest number of milliseconds a `Span` can hold.
const MAX_SPAN_MILLISECONDS: f64 = 631_107_417_600_000.0;

/// Configuration of a policy for retries in case of job failure.
///
/// Used by the [`AutomaticRetry`](crate::state::AutomaticRetry) election
/// filter to decide whether a failed job is rescheduled, and how far into the
/// future.
///
/// # Example
///
/// ```rust
/// use afoot::task::RetryPolicy;
///
/// let retry_policy = RetryPolicy::builder()
///     .max_attempts(3)
///     .initial_interval_ms(500)
///     .build();
///
/// assert_eq!(retry_policy.max_attempts(), 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) initial_interval_ms: u64,
    pub(crate) max_interval_ms: u64,
    pub(crate) backoff_coefficient: f64,
}

impl RetryPolicy {
    /// Create a new builder.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Maximum number of retries before a failure is left in place.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the given retry attempt (1-based).
    pub fn calculate_delay(&self, retry_attempt: u32) -> Span {
        let exponent = retry_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_interval_ms as f64;
        let backoff_delay = base_delay * self.backoff_coefficient.powi(exponent);
        let delay = backoff_delay
            .min(self.max_interval_ms as f64)
            .clamp(0.0, MAX_SPAN_MILLISECONDS) as i64;
        delay.milliseconds()
    }
}

const DEFAULT_RETRY_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 10,
    initial_interval_ms: 15_000,
    max_interval_ms: 3_600_000,
    backoff_coefficient: 2.0,
};

impl Default for RetryPolicy {
    fn default() -> Self {
        DEFAULT_RETRY_POLICY
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug)]
pub struct Builder {
    inner: RetryPolicy,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates a new builder with the default retry settings.
    pub const fn new() -> Self {
        Self {
            inner: DEFAULT_RETRY_POLICY,
        }
    }

    /// Sets the maximum number of retry attempts.
    ///
    /// Default value is `10`.
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.inner.max_attempts = max_attempts;
        self
    }

    /// Sets the initial interval before the first retry (in milliseconds).
    ///
    /// Default value is `15_000`.
    pub const fn initial_interval_ms(mut self, initial_interval_ms: u64) -> Self {
        self.inner.initial_interval_ms = initial_interval_ms;
        self
    }

    /// Sets the maximum interval between retries (in milliseconds).
    ///
    /// Default value is `3_600_000`.
    pub const fn max_interval_ms(mut self, max_interval_ms: u64) -> Self {
        self.inner.max_interval_ms = max_interval_ms;
        self
    }

    /// Sets the backoff coefficient to apply after each retry.
    ///
    /// Default value is `2.0`.
    pub const fn backoff_coefficient(mut self, backoff_coefficient: f64) -> Self {
        self.inner.backoff_coefficient = backoff_coefficient;
        self
    }

    /// Builds the `RetryPolicy` with the configured parameters.
    pub const fn build(self) -> RetryPolicy {
        self.inner
    }
}
