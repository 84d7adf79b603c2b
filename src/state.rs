//! States are the named points of a job's lifecycle.
//!
//! Every state has a name, a flag saying whether reaching it finishes the job
//! (final states make the job expire instead of being persisted), an optional
//! human-readable reason, and a property map which storage persists alongside
//! the job's state history.
//!
//! The built-in states form a closed set, modelled by [`State`]. Applications
//! can add their own states without touching the state machine by
//! implementing [`CustomState`] and wrapping it in [`State::Custom`]; handlers
//! for them are registered by name with a
//! [`StateHandlerCollection`](crate::state::StateHandlerCollection).
//!
//! ```text
//!               ┌────────────┐
//!   create ───▶ │  Enqueued  │ ◀──────────── Scheduled / Awaiting
//!               └─────┬──────┘
//!                     ▼
//!               ┌────────────┐
//!               │ Processing │
//!               └─────┬──────┘
//!          ┌──────────┴──────────┐
//!          ▼                     ▼
//!   ┌────────────┐        ┌────────────┐   retry   ┌───────────┐
//!   │ Succeeded  │        │   Failed   │ ────────▶ │ Scheduled │
//!   └────────────┘        └─────┬──────┘           └───────────┘
//!                               ▼
//!                         ┌────────────┐
//!                         │  Deleted   │
//!                         └────────────┘
//! ```

use std::{collections::BTreeMap, error::Error as StdError, fmt, sync::Arc};

use jiff::{Span, Timestamp};
use serde_json::Value;

pub use self::{
    context::{ApplyStateContext, ElectStateContext, StateContext},
    filter::{
        ApplyStateFilter, AttemptsExceededAction, AutomaticRetry, ElectStateFilter, StateFilters,
    },
    handler::{StateHandler, StateHandlerCollection},
};
pub(crate) use self::context::Election;
use crate::{job::DEFAULT_QUEUE, BoxError, JobId};

mod context;
mod filter;
mod handler;

/// Persisted properties of a state.
pub type StateData = BTreeMap<String, String>;

/// Errors raised when the engine is wired up with invalid arguments.
///
/// These are never retried: they indicate a programming error at setup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// A job identifier was empty.
    #[error("Job identifiers must not be empty")]
    EmptyJobId,

    /// A state handler reported an empty state name.
    #[error("State handlers must name the state they handle")]
    EmptyStateName,

    /// A queue name contained characters other than lowercase letters, digits,
    /// underscores and dashes.
    #[error("Queue name `{0}` must consist of lowercase letters, digits, underscores or dashes")]
    InvalidQueueName(String),

    /// A server was configured without workers.
    #[error("A server needs at least one worker")]
    NoWorkers,
}

/// A state defined outside this crate.
pub trait CustomState: fmt::Debug + Send + Sync {
    /// The state's name, which handlers are keyed by.
    fn name(&self) -> &str;

    /// Whether reaching this state finishes the job.
    fn is_final(&self) -> bool {
        false
    }

    /// A human-readable explanation of the transition.
    fn reason(&self) -> Option<&str> {
        None
    }

    /// Properties persisted with the state.
    fn serialize_data(&self) -> StateData;
}

/// A job state.
#[derive(Debug, Clone)]
pub enum State {
    /// Waiting on a queue for a worker.
    Enqueued(EnqueuedState),

    /// Waiting for a point in time before it's enqueued.
    Scheduled(ScheduledState),

    /// Being performed by a worker.
    Processing(ProcessingState),

    /// Performed without error. Final.
    Succeeded(SucceededState),

    /// Performing it, or changing its state, raised an error.
    Failed(FailedState),

    /// Removed on request. Final.
    Deleted(DeletedState),

    /// Waiting on another job to finish.
    Awaiting(AwaitingState),

    /// A state defined by the application.
    Custom(Arc<dyn CustomState>),
}

impl State {
    /// The state's name.
    pub fn name(&self) -> &str {
        match self {
            State::Enqueued(_) => EnqueuedState::NAME,
            State::Scheduled(_) => ScheduledState::NAME,
            State::Processing(_) => ProcessingState::NAME,
            State::Succeeded(_) => SucceededState::NAME,
            State::Failed(_) => FailedState::NAME,
            State::Deleted(_) => DeletedState::NAME,
            State::Awaiting(_) => AwaitingState::NAME,
            State::Custom(custom) => custom.name(),
        }
    }

    /// Whether the job expires once it reaches this state.
    pub fn is_final(&self) -> bool {
        match self {
            State::Succeeded(_) | State::Deleted(_) => true,
            State::Custom(custom) => custom.is_final(),
            _ => false,
        }
    }

    /// The reason attached to the transition, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            State::Enqueued(s) => s.reason.as_deref(),
            State::Scheduled(s) => s.reason.as_deref(),
            State::Processing(s) => s.reason.as_deref(),
            State::Succeeded(s) => s.reason.as_deref(),
            State::Failed(s) => s.reason.as_deref(),
            State::Deleted(s) => s.reason.as_deref(),
            State::Awaiting(s) => s.reason.as_deref(),
            State::Custom(custom) => custom.reason(),
        }
    }

    /// Attaches a reason to a built-in state.
    ///
    /// Custom states report their own reason, so this leaves them unchanged.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        let reason = Some(reason.into());
        match &mut self {
            State::Enqueued(s) => s.reason = reason,
            State::Scheduled(s) => s.reason = reason,
            State::Processing(s) => s.reason = reason,
            State::Succeeded(s) => s.reason = reason,
            State::Failed(s) => s.reason = reason,
            State::Deleted(s) => s.reason = reason,
            State::Awaiting(s) => s.reason = reason,
            State::Custom(_) => {}
        }
        self
    }

    /// Properties persisted with the state.
    pub fn serialize_data(&self) -> StateData {
        match self {
            State::Enqueued(s) => s.serialize_data(),
            State::Scheduled(s) => s.serialize_data(),
            State::Processing(s) => s.serialize_data(),
            State::Succeeded(s) => s.serialize_data(),
            State::Failed(s) => s.serialize_data(),
            State::Deleted(s) => s.serialize_data(),
            State::Awaiting(s) => s.serialize_data(),
            State::Custom(custom) => custom.serialize_data(),
        }
    }

    /// Case-insensitive comparison against a state name.
    pub fn is(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name)
    }
}

impl From<EnqueuedState> for State {
    fn from(state: EnqueuedState) -> Self {
        State::Enqueued(state)
    }
}

impl From<ScheduledState> for State {
    fn from(state: ScheduledState) -> Self {
        State::Scheduled(state)
    }
}

impl From<ProcessingState> for State {
    fn from(state: ProcessingState) -> Self {
        State::Processing(state)
    }
}

impl From<SucceededState> for State {
    fn from(state: SucceededState) -> Self {
        State::Succeeded(state)
    }
}

impl From<FailedState> for State {
    fn from(state: FailedState) -> Self {
        State::Failed(state)
    }
}

impl From<DeletedState> for State {
    fn from(state: DeletedState) -> Self {
        State::Deleted(state)
    }
}

impl From<AwaitingState> for State {
    fn from(state: AwaitingState) -> Self {
        State::Awaiting(state)
    }
}

fn data<const N: usize>(entries: [(&str, String); N]) -> StateData {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// The job sits on a queue, waiting for a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuedState {
    queue: String,
    enqueued_at: Timestamp,
    reason: Option<String>,
}

impl EnqueuedState {
    /// Name of the state.
    pub const NAME: &'static str = "Enqueued";

    /// Creates an enqueued state targeting the named queue.
    pub fn new(queue: impl Into<String>) -> Result<Self, ConfigurationError> {
        let queue = queue.into();
        let valid = !queue.is_empty()
            && queue
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid {
            return Err(ConfigurationError::InvalidQueueName(queue));
        }

        Ok(Self {
            queue,
            enqueued_at: Timestamp::now(),
            reason: None,
        })
    }

    /// The queue the job is placed on.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// When the job was enqueued.
    pub fn enqueued_at(&self) -> Timestamp {
        self.enqueued_at
    }

    fn serialize_data(&self) -> StateData {
        data([
            ("EnqueuedAt", self.enqueued_at.to_string()),
            ("Queue", self.queue.clone()),
        ])
    }
}

impl Default for EnqueuedState {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            enqueued_at: Timestamp::now(),
            reason: None,
        }
    }
}

/// The job waits for a point in time before it's enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledState {
    enqueue_at: Timestamp,
    scheduled_at: Timestamp,
    reason: Option<String>,
}

impl ScheduledState {
    /// Name of the state.
    pub const NAME: &'static str = "Scheduled";

    /// Creates a scheduled state which becomes due at `enqueue_at`.
    pub fn new(enqueue_at: Timestamp) -> Self {
        Self {
            enqueue_at,
            scheduled_at: Timestamp::now(),
            reason: None,
        }
    }

    /// Creates a scheduled state which becomes due after `delay`.
    pub fn after(delay: Span) -> Result<Self, jiff::Error> {
        Ok(Self::new(Timestamp::now().checked_add(delay)?))
    }

    /// When the job becomes due.
    pub fn enqueue_at(&self) -> Timestamp {
        self.enqueue_at
    }

    fn serialize_data(&self) -> StateData {
        data([
            ("EnqueueAt", self.enqueue_at.to_string()),
            ("ScheduledAt", self.scheduled_at.to_string()),
        ])
    }
}

/// A worker is performing the job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingState {
    server_id: String,
    worker_id: String,
    started_at: Timestamp,
    reason: Option<String>,
}

impl ProcessingState {
    /// Name of the state.
    pub const NAME: &'static str = "Processing";

    /// Creates a processing state owned by the given server and worker.
    pub fn new(server_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            worker_id: worker_id.into(),
            started_at: Timestamp::now(),
            reason: None,
        }
    }

    /// The server performing the job.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// The worker performing the job.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn serialize_data(&self) -> StateData {
        data([
            ("StartedAt", self.started_at.to_string()),
            ("ServerId", self.server_id.clone()),
            ("WorkerId", self.worker_id.clone()),
        ])
    }
}

/// The job was performed without error.
#[derive(Debug, Clone, PartialEq)]
pub struct SucceededState {
    result: Option<Value>,
    latency_ms: u64,
    duration_ms: u64,
    succeeded_at: Timestamp,
    reason: Option<String>,
}

impl SucceededState {
    /// Name of the state.
    pub const NAME: &'static str = "Succeeded";

    /// Creates a succeeded state.
    ///
    /// `latency_ms` measures how long the job waited before it was performed,
    /// and `duration_ms` how long performing it took.
    pub fn new(result: Option<Value>, latency_ms: u64, duration_ms: u64) -> Self {
        Self {
            result,
            latency_ms,
            duration_ms,
            succeeded_at: Timestamp::now(),
            reason: None,
        }
    }

    /// The value the job produced, if any.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    fn serialize_data(&self) -> StateData {
        let mut data = data([
            ("SucceededAt", self.succeeded_at.to_string()),
            ("PerformanceDuration", self.duration_ms.to_string()),
            ("Latency", self.latency_ms.to_string()),
        ]);
        if let Some(result) = &self.result {
            data.insert("Result".to_string(), result.to_string());
        }
        data
    }
}

/// Performing the job, or changing its state, raised an error.
#[derive(Debug, Clone)]
pub struct FailedState {
    error: Arc<dyn StdError + Send + Sync>,
    failed_at: Timestamp,
    reason: Option<String>,
}

impl FailedState {
    /// Name of the state.
    pub const NAME: &'static str = "Failed";

    /// Creates a failed state carrying `error`.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::from_shared(Arc::new(error))
    }

    /// Creates a failed state from a boxed error.
    pub fn from_boxed(error: BoxError) -> Self {
        Self::from_shared(Arc::from(error))
    }

    /// Creates a failed state from an error that's already shared.
    pub fn from_shared(error: Arc<dyn StdError + Send + Sync>) -> Self {
        Self {
            error,
            failed_at: Timestamp::now(),
            reason: None,
        }
    }

    /// The error that caused the failure.
    pub fn error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.error
    }

    /// When the failure happened.
    pub fn failed_at(&self) -> Timestamp {
        self.failed_at
    }

    /// The error message followed by the messages of its sources.
    pub fn details(&self) -> String {
        let mut details = self.error.to_string();
        let mut source = self.error.source();
        while let Some(err) = source {
            details.push_str("\nCaused by: ");
            details.push_str(&err.to_string());
            source = err.source();
        }
        details
    }

    fn serialize_data(&self) -> StateData {
        data([
            ("FailedAt", self.failed_at.to_string()),
            ("ExceptionMessage", self.error.to_string()),
            ("ExceptionDetails", self.details()),
        ])
    }
}

/// The job was removed on request.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedState {
    deleted_at: Timestamp,
    reason: Option<String>,
}

impl DeletedState {
    /// Name of the state.
    pub const NAME: &'static str = "Deleted";

    /// Creates a deleted state.
    pub fn new() -> Self {
        Self {
            deleted_at: Timestamp::now(),
            reason: None,
        }
    }

    fn serialize_data(&self) -> StateData {
        data([("DeletedAt", self.deleted_at.to_string())])
    }
}

impl Default for DeletedState {
    fn default() -> Self {
        Self::new()
    }
}

/// The job waits for its parent job before moving to its next state.
#[derive(Debug, Clone)]
pub struct AwaitingState {
    parent_id: JobId,
    next_state: Box<State>,
    reason: Option<String>,
}

impl AwaitingState {
    /// Name of the state.
    pub const NAME: &'static str = "Awaiting";

    /// Creates an awaiting state which continues with `next_state` once the
    /// parent job finishes.
    pub fn new(parent_id: JobId, next_state: State) -> Self {
        Self {
            parent_id,
            next_state: Box::new(next_state),
            reason: None,
        }
    }

    /// The job this one waits on.
    pub fn parent_id(&self) -> &JobId {
        &self.parent_id
    }

    /// The state the job moves to once its parent finishes.
    pub fn next_state(&self) -> &State {
        &self.next_state
    }

    fn serialize_data(&self) -> StateData {
        data([
            ("ParentId", self.parent_id.to_string()),
            ("NextState", self.next_state.name().to_string()),
        ])
    }
}
