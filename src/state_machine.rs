//! Moves a job from one state to another.
//!
//! A state change runs in two phases:
//!
//! 1. **Election.** Election filters see the candidate state and may replace
//!    it. Nothing is written while filters decide, so any number of them can
//!    redirect the job without side effects.
//! 2. **Application.** One write transaction receives, in order: the states
//!    traversed during election, parameter writes queued by election filters,
//!    `on_state_unapplied` filters, the old state's unapply handlers, the new
//!    state itself, the new state's apply handlers, `on_state_applied`
//!    filters, and either an expiration (final states) or a persist. Then it's
//!    committed once, so readers see the new state together with every side
//!    effect of entering it.
//!
//! If anything in either phase fails, the change falls back to applying a
//! [`FailedState`] carrying the error, using the handlers only, and reports
//! `false`. A failure during that fallback is returned as an error.
//!
//! # Example
//!
//! ```rust
//! use std::{collections::BTreeMap, time::Duration};
//!
//! use afoot::{
//!     state::{EnqueuedState, StateContext},
//!     storage::{InMemoryStorage, StorageConnection},
//!     Job, StateMachine,
//! };
//! use jiff::Timestamp;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = InMemoryStorage::new();
//! let job = Job::new("send", json!([]));
//! let job_id = storage
//!     .create_expired_job(&job, &BTreeMap::new(), Timestamp::now(), Duration::from_secs(3600))
//!     .await?;
//!
//! let state_machine = StateMachine::builder().build();
//! let context = StateContext::new(job_id.clone(), Some(job), &storage);
//! let changed = state_machine
//!     .change_state(&context, EnqueuedState::default().into(), None)
//!     .await?;
//!
//! assert!(changed);
//! assert_eq!(storage.state_of(&job_id).as_deref(), Some("Enqueued"));
//! # Ok(())
//! # }
//! ```

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tracing::instrument;

use crate::{
    state::{
        ApplyStateContext, ApplyStateFilter, ElectStateContext, ElectStateFilter, Election,
        FailedState, State, StateContext, StateFilters, StateHandlerCollection,
    },
    storage::{self, StorageConnection, WriteTransaction},
    BoxError, JobId,
};

/// A type alias for state machine results.
pub type Result<T = bool> = std::result::Result<T, Error>;

/// State machine errors.
///
/// Failures of the requested change itself never surface here: they move
/// the job to Failed instead. These are the failures that remain.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by storage, including a failed commit of the Failed
    /// fallback.
    #[error(transparent)]
    Storage(#[from] storage::Error),

    /// A state handler failed while moving the job to Failed.
    #[error("State handler failed while moving job {job_id} to the Failed state: {source}")]
    Fallback {
        /// The job being changed.
        job_id: JobId,

        /// The handler's error.
        #[source]
        source: BoxError,
    },
}

enum ApplyError {
    Handler(BoxError),
    Storage(storage::Error),
}

impl ApplyError {
    fn into_failed_state(self) -> FailedState {
        match self {
            ApplyError::Handler(err) => FailedState::from_boxed(err),
            ApplyError::Storage(err) => FailedState::new(err),
        }
    }
}

/// Runs state changes through election filters, handlers and apply filters.
///
/// Cloning is cheap; clones share their handlers and filters.
#[derive(Debug, Clone)]
pub struct StateMachine {
    handlers: Arc<StateHandlerCollection>,
    filters: Arc<StateFilters>,
    job_expiration_timeout: Duration,
    job_lock_timeout: Duration,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl StateMachine {
    /// Create a new builder.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// How long [`try_to_change_state`](Self::try_to_change_state) waits for a
    /// job's lock.
    pub fn job_lock_timeout(&self) -> Duration {
        self.job_lock_timeout
    }

    /// Moves the job of `context` to `candidate_state`, or to whatever
    /// election filters replace it with.
    ///
    /// `from_state` is the name of the job's current state. Returns `true`
    /// when the elected state was applied and `false` when the change fell
    /// back to the Failed state.
    #[instrument(
        skip(self, context, candidate_state, from_state),
        fields(
            job.id = %context.job_id(),
            state.from = from_state,
            state.candidate = candidate_state.name()
        ),
        err
    )]
    pub async fn change_state(
        &self,
        context: &StateContext<'_>,
        candidate_state: State,
        from_state: Option<&str>,
    ) -> Result {
        let candidate_name = candidate_state.name().to_string();

        let outcome = match self.elect(context, candidate_state, from_state) {
            Ok(election) => {
                let apply_context = ApplyStateContext::new(
                    context,
                    election.state,
                    from_state,
                    self.job_expiration_timeout,
                );
                self.apply(
                    &apply_context,
                    &election.traversed_states,
                    &election.parameters,
                    true,
                )
                .await
            }
            Err(err) => Err(ApplyError::Handler(err)),
        };

        let Err(err) = outcome else {
            return Ok(true);
        };

        let failed = err.into_failed_state();
        tracing::error!(
            state.candidate = %candidate_name,
            error = %failed.details(),
            "State change failed, moving the job to the Failed state"
        );

        let failed = State::from(failed).with_reason(format!(
            "An error occurred while changing the state to '{candidate_name}'"
        ));
        let apply_context =
            ApplyStateContext::new(context, failed, from_state, self.job_expiration_timeout);
        match self
            .apply(&apply_context, &[], &BTreeMap::new(), false)
            .await
        {
            Ok(()) => Ok(false),
            Err(ApplyError::Handler(source)) => Err(Error::Fallback {
                job_id: context.job_id().clone(),
                source,
            }),
            Err(ApplyError::Storage(err)) => Err(err.into()),
        }
    }

    /// Changes the state of a stored job under its lock, provided the job
    /// currently is in one of `from_states` (any state when `None`).
    ///
    /// Returns `false` without changing anything if the job doesn't exist or
    /// isn't in an expected state. A job whose invocation can't be loaded is
    /// moved to Failed instead, and `false` is returned.
    #[instrument(
        skip(self, connection, job_id, to_state),
        fields(job.id = %job_id, state.to = to_state.name()),
        err
    )]
    pub async fn try_to_change_state(
        &self,
        connection: &dyn StorageConnection,
        job_id: &JobId,
        to_state: State,
        from_states: Option<&[&str]>,
    ) -> Result {
        let _lock = connection
            .acquire_job_lock(job_id, self.job_lock_timeout)
            .await?;

        let Some(data) = connection.get_job_data(job_id).await? else {
            tracing::debug!("Job not found, leaving its state alone");
            return Ok(false);
        };

        if let Some(from_states) = from_states {
            let expected = data.state_name.as_deref().is_some_and(|current| {
                from_states
                    .iter()
                    .any(|state| state.eq_ignore_ascii_case(current))
            });
            if !expected {
                tracing::debug!(
                    state.current = data.state_name.as_deref(),
                    "Job is not in an expected state, leaving its state alone"
                );
                return Ok(false);
            }
        }

        match data.job {
            Ok(job) => {
                let context = StateContext::new(job_id.clone(), Some(job), connection)
                    .with_parameters(data.parameters);
                self.change_state(&context, to_state, data.state_name.as_deref())
                    .await
            }
            Err(load_error) => {
                let context = StateContext::new(job_id.clone(), None, connection)
                    .with_parameters(data.parameters);
                let failed = State::from(FailedState::new(load_error)).with_reason(format!(
                    "Can not change the state to '{}': target method was not found.",
                    to_state.name()
                ));
                self.change_state(&context, failed, data.state_name.as_deref())
                    .await?;
                Ok(false)
            }
        }
    }

    fn elect(
        &self,
        context: &StateContext<'_>,
        candidate_state: State,
        from_state: Option<&str>,
    ) -> std::result::Result<Election, BoxError> {
        let mut election = ElectStateContext::new(context, candidate_state, from_state);
        for filter in self.filters.elect_filters() {
            filter.on_state_election(&mut election)?;
        }
        Ok(election.into_election())
    }

    async fn apply(
        &self,
        context: &ApplyStateContext<'_>,
        traversed_states: &[State],
        parameters: &BTreeMap<String, String>,
        with_filters: bool,
    ) -> std::result::Result<(), ApplyError> {
        let apply_filters: &[Arc<dyn ApplyStateFilter>] = if with_filters {
            self.filters.apply_filters()
        } else {
            &[]
        };

        let mut transaction = context.connection().create_write_transaction();
        self.queue_application(
            context,
            traversed_states,
            parameters,
            apply_filters,
            transaction.as_mut(),
        )
        .map_err(ApplyError::Handler)?;

        let err = match transaction.commit().await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if err.is_ambiguous() && self.already_applied(context).await {
            tracing::warn!(
                error = %err,
                "Commit outcome unknown, but the job already is in the elected state"
            );
            return Ok(());
        }

        Err(ApplyError::Storage(err))
    }

    fn queue_application(
        &self,
        context: &ApplyStateContext<'_>,
        traversed_states: &[State],
        parameters: &BTreeMap<String, String>,
        apply_filters: &[Arc<dyn ApplyStateFilter>],
        transaction: &mut dyn WriteTransaction,
    ) -> std::result::Result<(), BoxError> {
        let job_id = context.job_id();
        let new_state = context.new_state();

        for state in traversed_states {
            transaction.add_job_state(job_id, state);
        }
        for (name, value) in parameters {
            transaction.set_job_parameter(job_id, name, value);
        }

        for filter in apply_filters {
            filter.on_state_unapplied(context, transaction)?;
        }
        for handler in self.handlers.get_handlers(context.old_state_name()) {
            handler.unapply(context, transaction)?;
        }

        transaction.set_job_state(job_id, new_state);

        for handler in self.handlers.get_handlers(Some(new_state.name())) {
            handler.apply(context, transaction)?;
        }
        for filter in apply_filters {
            filter.on_state_applied(context, transaction)?;
        }

        if new_state.is_final() {
            transaction.expire_job(job_id, context.job_expiration_timeout());
        } else {
            transaction.persist_job(job_id);
        }

        Ok(())
    }

    async fn already_applied(&self, context: &ApplyStateContext<'_>) -> bool {
        matches!(
            context.connection().get_job_data(context.job_id()).await,
            Ok(Some(data)) if data
                .state_name
                .as_deref()
                .is_some_and(|name| context.new_state().is(name))
        )
    }
}

/// Builder for [`StateMachine`].
#[derive(Debug)]
pub struct Builder {
    handlers: StateHandlerCollection,
    filters: StateFilters,
    job_expiration_timeout: Duration,
    job_lock_timeout: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            handlers: StateHandlerCollection::with_defaults(),
            filters: StateFilters::default(),
            job_expiration_timeout: Duration::from_secs(24 * 60 * 60),
            job_lock_timeout: Duration::from_secs(15),
        }
    }
}

impl Builder {
    /// Replaces the state handlers.
    ///
    /// Default value is [`StateHandlerCollection::with_defaults`].
    pub fn handlers(mut self, handlers: StateHandlerCollection) -> Self {
        self.handlers = handlers;
        self
    }

    /// Replaces the filters.
    ///
    /// Default value is no filters.
    pub fn filters(mut self, filters: StateFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Appends an election filter.
    pub fn elect_filter(mut self, filter: Arc<dyn ElectStateFilter>) -> Self {
        self.filters = self.filters.with_elect_filter(filter);
        self
    }

    /// Appends an apply filter.
    pub fn apply_filter(mut self, filter: Arc<dyn ApplyStateFilter>) -> Self {
        self.filters = self.filters.with_apply_filter(filter);
        self
    }

    /// Sets how long jobs in a final state are kept.
    ///
    /// Default value is one day.
    pub fn job_expiration_timeout(mut self, timeout: Duration) -> Self {
        self.job_expiration_timeout = timeout;
        self
    }

    /// Sets how long to wait for a job's lock.
    ///
    /// Default value is 15 seconds.
    pub fn job_lock_timeout(mut self, timeout: Duration) -> Self {
        self.job_lock_timeout = timeout;
        self
    }

    /// Builds the `StateMachine` with the configured parameters.
    pub fn build(self) -> StateMachine {
        StateMachine {
            handlers: Arc::new(self.handlers),
            filters: Arc::new(self.filters),
            job_expiration_timeout: self.job_expiration_timeout,
            job_lock_timeout: self.job_lock_timeout,
        }
    }
}
