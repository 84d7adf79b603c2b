//! A self-healing loop for long-running background work.
//!
//! [`BackgroundExecution`] runs a callback over and over until it's stopped.
//! Errors returned by the callback never end the loop: they're logged, and
//! the next attempt is delayed by a back-off that grows with the number of
//! consecutive failures. One success resets both the back-off and the
//! loop's [`Health`].
//!
//! Health moves between three states:
//!
//! - [`Health::Running`]: no recent failures.
//! - [`Health::Faulted`]: failing, for less than the error threshold. Failures
//!   are logged at debug level only, so short blips stay quiet.
//! - [`Health::Failed`]: failing for longer than the error threshold. The
//!   first failure past the threshold is logged at error level, and again
//!   each time the still-error threshold has passed since.
//!
//! # Example
//!
//! ```rust
//! use afoot::execution::{BackgroundExecution, ExecutionOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let stop = CancellationToken::new();
//! let execution = BackgroundExecution::new(stop.clone(), ExecutionOptions::default());
//!
//! execution
//!     .run(|context| {
//!         let stop = stop.clone();
//!         async move {
//!             println!("Iteration of {}", context.execution_id());
//!             stop.cancel();
//!             Ok::<_, std::io::Error>(())
//!         }
//!     })
//!     .await;
//! # }
//! ```

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::Rng;
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use ulid::Ulid;
use uuid::Uuid;

/// Computes the retry delay from the number of consecutive failures.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// How healthy an execution loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// No recent failures.
    Running,

    /// Failing, but not for long enough to be reported as an error.
    Faulted,

    /// Failing for longer than the error threshold.
    Failed,
}

/// Configuration of a [`BackgroundExecution`].
#[derive(Clone)]
pub struct ExecutionOptions {
    name: String,
    error_threshold: Duration,
    still_error_threshold: Duration,
    max_backoff: Duration,
    fallback_delay: Duration,
    backoff: BackoffFn,
}

impl ExecutionOptions {
    /// Create a new builder.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Name the loop is logged under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a copy of these options logged under another name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// How long a loop may keep failing before it's reported as failed.
    pub fn error_threshold(&self) -> Duration {
        self.error_threshold
    }

    /// How often a failed loop is reported again.
    pub fn still_error_threshold(&self) -> Duration {
        self.still_error_threshold
    }
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Builder::default().build()
    }
}

impl fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("name", &self.name)
            .field("error_threshold", &self.error_threshold)
            .field("still_error_threshold", &self.still_error_threshold)
            .field("max_backoff", &self.max_backoff)
            .field("fallback_delay", &self.fallback_delay)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ExecutionOptions`].
pub struct Builder {
    inner: ExecutionOptions,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            inner: ExecutionOptions {
                name: "background-execution".to_string(),
                error_threshold: Duration::from_secs(15),
                still_error_threshold: Duration::from_secs(60),
                max_backoff: Duration::from_secs(5 * 60),
                fallback_delay: Duration::from_secs(5),
                backoff: Arc::new(default_backoff),
            },
        }
    }
}

impl Builder {
    /// Sets the name the loop is logged under.
    ///
    /// Default value is `"background-execution"`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.inner.name = name.into();
        self
    }

    /// Sets how long a loop may keep failing before it's reported as failed.
    ///
    /// Default value is 15 seconds.
    pub fn error_threshold(mut self, threshold: Duration) -> Self {
        self.inner.error_threshold = threshold;
        self
    }

    /// Sets how often a failed loop is reported again.
    ///
    /// Default value is 60 seconds.
    pub fn still_error_threshold(mut self, threshold: Duration) -> Self {
        self.inner.still_error_threshold = threshold;
        self
    }

    /// Sets the upper bound of the retry delay.
    ///
    /// Default value is 5 minutes.
    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.inner.max_backoff = max_backoff;
        self
    }

    /// Sets the delay used when the back-off function returns zero.
    ///
    /// Default value is 5 seconds.
    pub fn fallback_delay(mut self, delay: Duration) -> Self {
        self.inner.fallback_delay = delay;
        self
    }

    /// Sets the back-off function, called with the number of consecutive
    /// failures (starting at 1).
    ///
    /// Default value is [`default_backoff`].
    pub fn backoff<F>(mut self, backoff: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.inner.backoff = Arc::new(backoff);
        self
    }

    /// Builds the `ExecutionOptions` with the configured parameters.
    pub fn build(self) -> ExecutionOptions {
        self.inner
    }
}

/// Randomized exponential back-off: `2^(n - 1)` seconds with 25% jitter
/// either way, for `n` consecutive failures.
pub fn default_backoff(failed_attempts: u32) -> Duration {
    if failed_attempts == 0 {
        return Duration::ZERO;
    }
    let base_ms = 1_000u64.saturating_mul(2u64.saturating_pow(failed_attempts - 1));
    let jitter_range = base_ms / 4;
    let jitter = rand::thread_rng().gen_range(0..=jitter_range.saturating_mul(2));
    Duration::from_millis(base_ms.saturating_sub(jitter_range).saturating_add(jitter))
}

pub(crate) fn next_delay(options: &ExecutionOptions, failed_attempts: u32) -> Duration {
    let delay = (options.backoff)(failed_attempts).min(options.max_backoff);
    if delay.is_zero() {
        options.fallback_delay
    } else {
        delay
    }
}

/// What an iteration of the loop gets to know about it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    execution_id: Uuid,
    stop_token: CancellationToken,
}

impl ExecutionContext {
    /// Identifier of the execution running the callback.
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Token cancelled when the loop is asked to stop.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop_token
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Debug,
    Error,
}

/// Classifies consecutive failures into health states and decides which of
/// them are worth an error log.
#[derive(Debug)]
pub(crate) struct HealthMonitor {
    health: Health,
    faulted_since: Option<Instant>,
    last_error_at: Option<Instant>,
    error_threshold: Duration,
    still_error_threshold: Duration,
}

impl HealthMonitor {
    pub(crate) fn new(error_threshold: Duration, still_error_threshold: Duration) -> Self {
        Self {
            health: Health::Running,
            faulted_since: None,
            last_error_at: None,
            error_threshold,
            still_error_threshold,
        }
    }

    pub(crate) fn health(&self) -> Health {
        self.health
    }

    pub(crate) fn record_failure(&mut self, now: Instant) -> Severity {
        let faulted_since = *self.faulted_since.get_or_insert(now);
        if now.duration_since(faulted_since) < self.error_threshold {
            self.health = Health::Faulted;
            return Severity::Debug;
        }

        self.health = Health::Failed;
        match self.last_error_at {
            Some(last) if now.duration_since(last) < self.still_error_threshold => {
                Severity::Debug
            }
            _ => {
                self.last_error_at = Some(now);
                Severity::Error
            }
        }
    }

    /// Resets to running, returning the health it recovered from.
    pub(crate) fn record_success(&mut self) -> Health {
        self.faulted_since = None;
        self.last_error_at = None;
        std::mem::replace(&mut self.health, Health::Running)
    }
}

/// A retry loop that survives errors of its callback.
pub struct BackgroundExecution {
    id: Uuid,
    options: ExecutionOptions,
    stop_token: CancellationToken,
    disposed: CancellationToken,
    succeeded: Notify,
    monitor: Mutex<HealthMonitor>,
}

impl BackgroundExecution {
    /// Creates an execution which stops once `stop_token` is cancelled.
    pub fn new(stop_token: CancellationToken, options: ExecutionOptions) -> Self {
        let monitor = HealthMonitor::new(options.error_threshold, options.still_error_threshold);
        Self {
            id: Uuid::new_v4(),
            options,
            stop_token,
            disposed: CancellationToken::new(),
            succeeded: Notify::new(),
            monitor: Mutex::new(monitor),
        }
    }

    /// The execution's identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The loop's current health.
    pub fn health(&self) -> Health {
        self.monitor().health()
    }

    /// Whether the execution was disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    /// Signals that work related to this loop succeeded elsewhere.
    ///
    /// Health is reset to running right away, and a pending retry delay is
    /// cut short.
    pub fn notify_succeeded(&self) {
        self.record_success();
        self.succeeded.notify_waiters();
    }

    /// Stops the loop for good, waking up any pending wait.
    ///
    /// Calling this more than once has no further effect.
    pub fn dispose(&self) {
        self.disposed.cancel();
    }

    /// Runs `callback` until the stop token is cancelled or the execution is
    /// disposed.
    ///
    /// An in-flight callback is dropped as soon as either happens. Errors the
    /// callback returns after a stop was requested end the loop without
    /// counting as failures.
    #[instrument(
        skip_all,
        fields(execution.id = %self.id, execution.name = %self.options.name)
    )]
    pub async fn run<F, Fut, E>(&self, mut callback: F)
    where
        F: FnMut(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let mut failed_attempts: u32 = 0;
        let mut delay = Duration::ZERO;

        loop {
            if self.should_stop() {
                break;
            }

            if !delay.is_zero() {
                tokio::select! {
                    biased;

                    _ = self.stop_token.cancelled() => break,
                    _ = self.disposed.cancelled() => break,
                    _ = self.succeeded.notified() => {
                        tracing::debug!("Retry delay cut short by a success signal");
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let context = ExecutionContext {
                execution_id: self.id,
                stop_token: self.stop_token.clone(),
            };
            let result = tokio::select! {
                biased;

                _ = self.stop_token.cancelled() => break,
                _ = self.disposed.cancelled() => break,
                result = callback(context) => result,
            };

            match result {
                Ok(()) => {
                    failed_attempts = 0;
                    delay = Duration::ZERO;
                    self.record_success();
                    // A callback that never waits must not starve the runtime.
                    tokio::task::yield_now().await;
                }

                Err(err) if self.should_stop() => {
                    tracing::debug!(%err, "Callback failed while stopping");
                    break;
                }

                Err(err) => {
                    failed_attempts = failed_attempts.saturating_add(1);
                    delay = next_delay(&self.options, failed_attempts);
                    self.record_failure(&err, failed_attempts, delay);
                }
            }
        }

        tracing::debug!("Execution stopped");
    }

    fn should_stop(&self) -> bool {
        self.stop_token.is_cancelled() || self.disposed.is_cancelled()
    }

    // Nothing panics while the lock is held.
    fn monitor(&self) -> MutexGuard<'_, HealthMonitor> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_success(&self) {
        let recovered_from = self.monitor().record_success();
        if recovered_from != Health::Running {
            tracing::info!(health.previous = ?recovered_from, "Execution recovered");
        }
    }

    fn record_failure(&self, err: &dyn fmt::Display, failed_attempts: u32, delay: Duration) {
        let error_id = Ulid::new();
        let severity = self.monitor().record_failure(Instant::now());
        match severity {
            Severity::Error => tracing::error!(
                error.id = %error_id,
                %err,
                attempt = failed_attempts,
                retry_in = ?delay,
                "Execution is failing persistently, will retry"
            ),
            Severity::Debug => tracing::debug!(
                error.id = %error_id,
                %err,
                attempt = failed_attempts,
                retry_in = ?delay,
                "Execution is faulted, will retry"
            ),
        }
    }
}

impl fmt::Debug for BackgroundExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundExecution")
            .field("id", &self.id)
            .field("name", &self.options.name)
            .field("health", &self.health())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Drop for BackgroundExecution {
    fn drop(&mut self) {
        self.dispose();
    }
}
