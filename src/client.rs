//! Clients create jobs and move them around from the outside.
//!
//! Creating a job is two steps: storage first receives the job without a
//! state, set to expire shortly, and then the state machine moves it into
//! its initial state. Entering a non-final state persists the job; if the
//! process dies between both steps the half-created job simply expires.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use afoot::{storage::InMemoryStorage, Client, Job};
//! use jiff::ToSpan;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = InMemoryStorage::new();
//! let client = Client::new(Arc::new(storage.clone()));
//!
//! let now = client.enqueue(Job::new("send-welcome-email", json!([42]))).await?;
//! let later = client
//!     .schedule(Job::new("send-reminder", json!([42])), 1.hour())
//!     .await?;
//!
//! assert_eq!(storage.state_of(&now).as_deref(), Some("Enqueued"));
//! assert_eq!(storage.state_of(&later).as_deref(), Some("Scheduled"));
//! # Ok(())
//! # }
//! ```

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use jiff::{Span, Timestamp};
use tracing::instrument;

use crate::{
    job::{Job, DEFAULT_QUEUE},
    state::{
        ConfigurationError, DeletedState, EnqueuedState, ScheduledState, State, StateContext,
    },
    state_machine::{self, StateMachine},
    storage::{self, JobStorage},
    JobId,
};

/// How long a created job lives before its initial state persists it.
const CREATED_JOB_EXPIRATION: Duration = Duration::from_secs(60 * 60);

/// A type alias for client results.
pub type Result<T = JobId> = std::result::Result<T, Error>;

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by storage.
    #[error(transparent)]
    Storage(#[from] storage::Error),

    /// Error returned by the state machine.
    #[error(transparent)]
    StateMachine(#[from] state_machine::Error),

    /// The job or state was configured with invalid values.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Error returned by the `jiff` crate.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),
}

/// Creates jobs and changes their states.
///
/// Cloning is cheap; clones share storage and the state machine.
#[derive(Clone)]
pub struct Client {
    storage: Arc<dyn JobStorage>,
    state_machine: StateMachine,
}

impl Client {
    /// Creates a client over `storage` using the default state machine.
    pub fn new(storage: Arc<dyn JobStorage>) -> Self {
        Self {
            storage,
            state_machine: StateMachine::default(),
        }
    }

    /// Uses the given state machine for every state change.
    ///
    /// Default value is [`StateMachine::default`].
    pub fn with_state_machine(mut self, state_machine: StateMachine) -> Self {
        self.state_machine = state_machine;
        self
    }

    /// The state machine state changes go through.
    pub fn state_machine(&self) -> &StateMachine {
        &self.state_machine
    }

    /// Creates a job in the given initial state.
    ///
    /// The job is created even if entering `state` fails; it then starts out
    /// in the Failed state.
    #[instrument(
        skip(self, job, state),
        fields(
            job.method = job.method(),
            state = state.name(),
            job.id = tracing::field::Empty
        ),
        err
    )]
    pub async fn create(&self, job: Job, state: State) -> Result {
        let connection = self.storage.connection().await?;
        let job_id = connection
            .create_expired_job(
                &job,
                &BTreeMap::new(),
                Timestamp::now(),
                CREATED_JOB_EXPIRATION,
            )
            .await?;
        tracing::Span::current().record("job.id", job_id.as_str());

        let context = StateContext::new(job_id.clone(), Some(job), &*connection);
        if !self.state_machine.change_state(&context, state, None).await? {
            tracing::warn!("Job was created in the Failed state");
        }

        Ok(job_id)
    }

    /// Creates a job waiting on its queue.
    pub async fn enqueue(&self, job: Job) -> Result {
        let state = EnqueuedState::new(job.queue())?;
        self.create(job, state.into()).await
    }

    /// Creates a job which is enqueued once `delay` has passed.
    pub async fn schedule(&self, job: Job, delay: Span) -> Result {
        let state = ScheduledState::after(delay)?;
        self.create(job, state.into()).await
    }

    /// Creates a job which is enqueued at `enqueue_at`.
    pub async fn schedule_at(&self, job: Job, enqueue_at: Timestamp) -> Result {
        self.create(job, ScheduledState::new(enqueue_at).into())
            .await
    }

    /// Moves a job to `state`, provided it's currently in one of
    /// `from_states` (any state when `None`).
    ///
    /// Returns whether the state was changed.
    pub async fn change_state(
        &self,
        job_id: &JobId,
        state: State,
        from_states: Option<&[&str]>,
    ) -> Result<bool> {
        let connection = self.storage.connection().await?;
        let changed = self
            .state_machine
            .try_to_change_state(&*connection, job_id, state, from_states)
            .await?;
        Ok(changed)
    }

    /// Moves a job to the Deleted state, whatever state it's in.
    pub async fn delete(&self, job_id: &JobId) -> Result<bool> {
        self.change_state(job_id, DeletedState::new().into(), None)
            .await
    }

    /// Puts a job back on its queue, whatever state it's in.
    pub async fn requeue(&self, job_id: &JobId) -> Result<bool> {
        let connection = self.storage.connection().await?;
        let Some(data) = connection.get_job_data(job_id).await? else {
            return Ok(false);
        };

        let queue = data
            .job
            .as_ref()
            .map(Job::queue)
            .unwrap_or(DEFAULT_QUEUE);
        let state = EnqueuedState::new(queue)?;

        let changed = self
            .state_machine
            .try_to_change_state(&*connection, job_id, state.into(), None)
            .await?;
        Ok(changed)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state_machine", &self.state_machine)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use jiff::ToSpan;
    use serde_json::json;

    use super::*;
    use crate::storage::{keys, InMemoryStorage};

    fn client() -> (InMemoryStorage, Client) {
        let storage = InMemoryStorage::new();
        let client = Client::new(Arc::new(storage.clone()));
        (storage, client)
    }

    #[tokio::test]
    async fn enqueue_places_job_on_its_queue() -> Result<()> {
        let (storage, client) = client();

        let job_id = client
            .enqueue(Job::new("send", json!([])).on_queue("mail"))
            .await?;

        assert_eq!(storage.state_of(&job_id).as_deref(), Some("Enqueued"));
        assert_eq!(storage.pending("mail"), [job_id.clone()]);
        assert!(!storage.is_expiring(&job_id));
        Ok(())
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_queue_names() {
        let (_, client) = client();

        let err = client
            .enqueue(Job::new("send", json!([])).on_queue("Not Valid"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigurationError::InvalidQueueName(_))
        ));
    }

    #[tokio::test]
    async fn schedule_adds_job_to_schedule() -> Result<()> {
        let (storage, client) = client();

        let job_id = client
            .schedule(Job::new("send", json!([])), 10.minutes())
            .await?;

        assert_eq!(storage.state_of(&job_id).as_deref(), Some("Scheduled"));
        assert_eq!(storage.set_members(keys::SCHEDULE), [job_id.to_string()]);
        assert!(storage.pending(DEFAULT_QUEUE).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_expires_job() -> Result<()> {
        let (storage, client) = client();
        let job_id = client
            .schedule(Job::new("send", json!([])), 10.minutes())
            .await?;

        assert!(client.delete(&job_id).await?);

        assert_eq!(storage.state_of(&job_id).as_deref(), Some("Deleted"));
        assert!(storage.is_expiring(&job_id));
        assert!(storage.set_members(keys::SCHEDULE).is_empty());
        assert_eq!(storage.counter(keys::STATS_DELETED), 1);
        Ok(())
    }

    #[tokio::test]
    async fn requeue_uses_the_jobs_queue() -> Result<()> {
        let (storage, client) = client();
        let job_id = client
            .schedule(Job::new("send", json!([])).on_queue("mail"), 1.hour())
            .await?;

        assert!(client.requeue(&job_id).await?);

        assert_eq!(storage.state_of(&job_id).as_deref(), Some("Enqueued"));
        assert_eq!(storage.pending("mail"), [job_id]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_jobs_are_left_alone() -> Result<()> {
        let (_, client) = client();
        let job_id = JobId::generate();

        assert!(!client.delete(&job_id).await?);
        assert!(!client.requeue(&job_id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn change_state_respects_from_states() -> Result<()> {
        let (storage, client) = client();
        let job_id = client.enqueue(Job::new("send", json!([]))).await?;

        let changed = client
            .change_state(&job_id, DeletedState::new().into(), Some(&["Processing"]))
            .await?;
        assert!(!changed);
        assert_eq!(storage.state_of(&job_id).as_deref(), Some("Enqueued"));

        let changed = client
            .change_state(&job_id, DeletedState::new().into(), Some(&["enqueued"]))
            .await?;
        assert!(changed);
        assert_eq!(storage.state_of(&job_id).as_deref(), Some("Deleted"));
        Ok(())
    }
}
