//! Enqueues scheduled jobs once they're due.
//!
//! Scheduled jobs sit in the `schedule` sorted set, scored by the second they
//! become due. Each pass of the [`DelayedJobScheduler`] takes the lowest
//! scored due member, moves its job from Scheduled to Enqueued on the job's
//! own queue, and repeats until nothing is due. Members whose job vanished or
//! left the Scheduled state in the meantime are dropped from the set.
//!
//! Moving the job goes through
//! [`StateMachine::try_to_change_state`](crate::StateMachine::try_to_change_state),
//! so several schedulers may poll the same storage: the per-job lock and the
//! Scheduled precondition make sure each job is enqueued once.

use std::time::Duration;

use jiff::Timestamp;
use tracing::instrument;

use crate::{
    job::{Job, DEFAULT_QUEUE},
    state::{EnqueuedState, FailedState, ScheduledState, State},
    state_machine::{self, StateMachine},
    storage::{self, keys, JobStorage, StorageConnection},
    JobId,
};

/// A type alias for scheduler results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by storage.
    #[error(transparent)]
    Storage(#[from] storage::Error),

    /// Error returned by the state machine.
    #[error(transparent)]
    StateMachine(#[from] state_machine::Error),
}

/// Moves due Scheduled jobs to Enqueued.
#[derive(Debug, Clone)]
pub struct DelayedJobScheduler {
    state_machine: StateMachine,
    poll_interval: Duration,
}

impl DelayedJobScheduler {
    /// Creates a scheduler changing states with `state_machine`.
    pub fn new(state_machine: StateMachine) -> Self {
        Self {
            state_machine,
            poll_interval: Duration::from_secs(15),
        }
    }

    /// Sets how long to wait between passes.
    ///
    /// Default value is 15 seconds.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Runs one pass over `storage`, then waits for the poll interval.
    ///
    /// Meant to be the callback of a
    /// [`BackgroundExecution`](crate::execution::BackgroundExecution).
    pub async fn run_once(&self, storage: &dyn JobStorage) -> Result {
        let connection = storage.connection().await?;
        self.enqueue_due_jobs(&*connection).await?;
        tokio::time::sleep(self.poll_interval).await;
        Ok(())
    }

    /// Enqueues every job that's due, returning how many were enqueued.
    #[instrument(skip_all, fields(enqueued = tracing::field::Empty), err)]
    pub async fn enqueue_due_jobs(&self, connection: &dyn StorageConnection) -> Result<usize> {
        let mut enqueued = 0;

        loop {
            let now = Timestamp::now().as_second() as f64;
            let Some(member) = connection
                .first_by_lowest_score_from_set(keys::SCHEDULE, f64::MIN, now)
                .await?
            else {
                break;
            };

            let Ok(job_id) = JobId::try_from(member.as_str()) else {
                self.forget(connection, &member).await?;
                continue;
            };

            match self.enqueue(connection, &job_id).await? {
                Some(true) => enqueued += 1,
                // Leaving Scheduled already removed the member, and an
                // election filter may have scheduled the job again.
                Some(false) => {}
                // Whatever happened to the job, it's not waiting on the
                // schedule anymore.
                None => self.forget(connection, &member).await?,
            }
        }

        tracing::Span::current().record("enqueued", enqueued);
        if enqueued > 0 {
            tracing::info!(enqueued, "Enqueued due scheduled jobs");
        }
        Ok(enqueued)
    }

    /// Moves the job out of Scheduled. Returns `None` when nothing changed,
    /// otherwise whether Enqueued was requested.
    async fn enqueue(
        &self,
        connection: &dyn StorageConnection,
        job_id: &JobId,
    ) -> Result<Option<bool>> {
        let Some(data) = connection.get_job_data(job_id).await? else {
            tracing::debug!(job.id = %job_id, "Scheduled job no longer exists");
            return Ok(None);
        };

        let queue = data.job.as_ref().map(Job::queue).unwrap_or(DEFAULT_QUEUE);
        let state: State = match EnqueuedState::new(queue) {
            Ok(state) => State::from(state).with_reason("Triggered by the delayed job scheduler"),
            Err(err) => State::from(FailedState::new(err))
                .with_reason("Can not enqueue the scheduled job: its queue name is invalid"),
        };
        let is_enqueue = matches!(state, State::Enqueued(_));

        let changed = self
            .state_machine
            .try_to_change_state(connection, job_id, state, Some(&[ScheduledState::NAME]))
            .await?;
        Ok(changed.then_some(is_enqueue))
    }

    async fn forget(&self, connection: &dyn StorageConnection, member: &str) -> Result {
        let mut transaction = connection.create_write_transaction();
        transaction.remove_from_set(keys::SCHEDULE, member);
        transaction.commit().await?;
        Ok(())
    }
}
