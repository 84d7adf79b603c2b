use std::sync::Arc;

use crate::{
    state::{ApplyStateContext, DeletedState, ElectStateContext, ScheduledState, State},
    storage::{keys, WriteTransaction},
    task::RetryPolicy,
    BoxError,
};

/// Hook into the election of a job's next state.
///
/// Election filters may inspect the candidate state and replace it, but they
/// must not perform I/O: election happens before any transaction is opened.
pub trait ElectStateFilter: Send + Sync {
    /// Called once per state change, in registration order.
    fn on_state_election(&self, context: &mut ElectStateContext<'_>) -> Result<(), BoxError>;
}

/// Hook into the application of an elected state.
///
/// Both methods run inside the application transaction. `on_state_unapplied`
/// runs before the old state's handlers, `on_state_applied` after the new
/// state's handlers.
pub trait ApplyStateFilter: Send + Sync {
    /// Called after the new state's handlers were applied.
    fn on_state_applied(
        &self,
        context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError>;

    /// Called before the old state's handlers are unapplied.
    fn on_state_unapplied(
        &self,
        context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError>;
}

/// Ordered filter lists consulted by the state machine.
#[derive(Clone, Default)]
pub struct StateFilters {
    elect: Vec<Arc<dyn ElectStateFilter>>,
    apply: Vec<Arc<dyn ApplyStateFilter>>,
}

impl StateFilters {
    /// Appends an election filter.
    pub fn with_elect_filter(mut self, filter: Arc<dyn ElectStateFilter>) -> Self {
        self.elect.push(filter);
        self
    }

    /// Appends an apply filter.
    pub fn with_apply_filter(mut self, filter: Arc<dyn ApplyStateFilter>) -> Self {
        self.apply.push(filter);
        self
    }

    /// Election filters in the order they run.
    pub fn elect_filters(&self) -> &[Arc<dyn ElectStateFilter>] {
        &self.elect
    }

    /// Apply filters in the order they run.
    pub fn apply_filters(&self) -> &[Arc<dyn ApplyStateFilter>] {
        &self.apply
    }

    /// Returns true if no filters are registered.
    pub fn is_empty(&self) -> bool {
        self.elect.is_empty() && self.apply.is_empty()
    }
}

impl std::fmt::Debug for StateFilters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateFilters")
            .field("elect", &self.elect.len())
            .field("apply", &self.apply.len())
            .finish()
    }
}

/// What [`AutomaticRetry`] does once a job ran out of retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttemptsExceededAction {
    /// Leave the job in the Failed state.
    #[default]
    Fail,

    /// Move the job to the Deleted state.
    Delete,
}

/// Election filter that turns failures into scheduled retries.
///
/// Each time a Failed state is elected, the job's `RetryCount` parameter is
/// incremented and the candidate replaced by a Scheduled state due after the
/// policy's delay for that attempt. Once the count exceeds the policy's
/// maximum, the failure stands (or the job is deleted, if configured).
///
/// ```rust
/// use std::sync::Arc;
///
/// use afoot::{
///     state::{AttemptsExceededAction, AutomaticRetry, StateFilters},
///     task::RetryPolicy,
/// };
///
/// let retry = AutomaticRetry::new(RetryPolicy::builder().max_attempts(3).build())
///     .on_attempts_exceeded(AttemptsExceededAction::Delete);
/// let filters = StateFilters::default().with_elect_filter(Arc::new(retry));
/// assert!(!filters.is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct AutomaticRetry {
    policy: RetryPolicy,
    on_attempts_exceeded: AttemptsExceededAction,
}

impl AutomaticRetry {
    /// Creates a filter retrying per `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            on_attempts_exceeded: AttemptsExceededAction::default(),
        }
    }

    /// Sets what happens once retries are exhausted.
    ///
    /// Default value is [`AttemptsExceededAction::Fail`].
    pub fn on_attempts_exceeded(mut self, action: AttemptsExceededAction) -> Self {
        self.on_attempts_exceeded = action;
        self
    }
}

impl ElectStateFilter for AutomaticRetry {
    fn on_state_election(&self, context: &mut ElectStateContext<'_>) -> Result<(), BoxError> {
        let message = match context.candidate_state() {
            State::Failed(failed) => failed.error().to_string(),
            _ => return Ok(()),
        };

        let retry_attempt = context
            .parameter(keys::RETRY_COUNT)
            .and_then(|count| count.parse::<u32>().ok())
            .unwrap_or(0)
            + 1;
        let max_attempts = self.policy.max_attempts();

        if retry_attempt <= max_attempts {
            let delay = self.policy.calculate_delay(retry_attempt);
            let scheduled = ScheduledState::after(delay)?;

            tracing::warn!(
                job.id = %context.job_id(),
                retry.attempt = retry_attempt,
                retry.max_attempts = max_attempts,
                retry.delay = %delay,
                error = %message,
                "Job failed, scheduling a retry"
            );

            context.set_parameter(keys::RETRY_COUNT, retry_attempt.to_string());
            context.set_candidate_state(State::from(scheduled).with_reason(format!(
                "Retry attempt {retry_attempt} of {max_attempts}: {message}"
            )));
            return Ok(());
        }

        match self.on_attempts_exceeded {
            AttemptsExceededAction::Fail => {
                tracing::error!(
                    job.id = %context.job_id(),
                    retry.max_attempts = max_attempts,
                    error = %message,
                    "Job failed after exhausting its retry attempts"
                );
            }
            AttemptsExceededAction::Delete => {
                tracing::warn!(
                    job.id = %context.job_id(),
                    retry.max_attempts = max_attempts,
                    error = %message,
                    "Job failed after exhausting its retry attempts, deleting it"
                );
                context.set_candidate_state(
                    State::from(DeletedState::new())
                        .with_reason("Exceeded the maximum number of retry attempts."),
                );
            }
        }

        Ok(())
    }
}
