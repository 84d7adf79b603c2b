//! The storage contract the engine is written against.
//!
//! Storage is an external collaborator: the engine never assumes a schema,
//! only the operations below. Connections read job data, hand out per-job
//! locks and fetch queued jobs; write transactions buffer state changes and
//! their side effects until a single commit.
//!
//! # Reliable fetch
//!
//! Fetching is checkpointed and at-least-once. [`StorageConnection::fetch_next_job`]
//! moves a job id from its pending queue to an in-flight list, stamps it with
//! the time it was fetched, and hands back a [`FetchedJob`]. The handle is
//! resolved exactly one of two ways:
//!
//! - [`FetchedJob::remove_from_queue`] once the job reached its next state, or
//! - [`FetchedJob::requeue`] to give it back.
//!
//! Dropping the handle without doing either requeues the job. A watchdog
//! (see [`FetchedJobsWatcher`](crate::watcher::FetchedJobsWatcher)) calls
//! [`StorageConnection::requeue_timed_out_jobs`] so entries abandoned by a
//! crashed process are eventually retried elsewhere.
//!
//! [`InMemoryStorage`] is a complete in-process implementation.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use jiff::Timestamp;

pub use self::memory::InMemoryStorage;
use crate::{
    job::{Job, JobLoadError},
    state::State,
    BoxError, JobId,
};

pub mod memory;

/// A type alias for storage results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Well-known keys used by the built-in state handlers.
pub mod keys {
    /// Sorted set of scheduled jobs, scored by their due time in seconds.
    pub const SCHEDULE: &str = "schedule";

    /// Set of jobs awaiting a parent.
    pub const AWAITING: &str = "awaiting";

    /// Set of failed jobs, scored by the time they failed.
    pub const FAILED: &str = "failed";

    /// Counter of succeeded jobs.
    pub const STATS_SUCCEEDED: &str = "stats:succeeded";

    /// Counter of deleted jobs.
    pub const STATS_DELETED: &str = "stats:deleted";

    /// Job parameter counting automatic retries.
    pub const RETRY_COUNT: &str = "RetryCount";
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The per-job lock couldn't be acquired in time.
    #[error("Timed out acquiring the lock for job {0}")]
    LockTimeout(JobId),

    /// The commit didn't report an outcome in time; it may or may not have
    /// been applied.
    #[error("The outcome of the commit is unknown: {0}")]
    AmbiguousCommit(String),

    /// Error encoding a job invocation.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Any other backend failure.
    #[error(transparent)]
    Backend(BoxError),
}

impl Error {
    /// Whether the failed operation may nonetheless have been applied.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Error::AmbiguousCommit(_))
    }
}

/// Everything storage knows about a job.
#[derive(Debug)]
pub struct JobData {
    /// Name of the job's current state, if it has one yet.
    pub state_name: Option<String>,

    /// The decoded invocation, or why it couldn't be decoded.
    pub job: std::result::Result<Job, JobLoadError>,

    /// The job's parameters.
    pub parameters: BTreeMap<String, String>,

    /// When the job was created.
    pub created_at: Timestamp,
}

/// Entry point to a storage backend.
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Opens a connection.
    async fn connection(&self) -> Result<Box<dyn StorageConnection>>;
}

/// A connection to storage.
#[async_trait]
pub trait StorageConnection: Send + Sync {
    /// Starts a transaction which buffers writes until it's committed.
    fn create_write_transaction(&self) -> Box<dyn WriteTransaction>;

    /// Acquires the per-job lock, held until the returned guard is dropped.
    async fn acquire_job_lock(&self, job_id: &JobId, timeout: Duration) -> Result<Box<dyn JobLock>>;

    /// Loads a job; `None` when no such job exists.
    async fn get_job_data(&self, job_id: &JobId) -> Result<Option<JobData>>;

    /// Stores a new job, without a state, which expires unless a state
    /// change persists it.
    async fn create_expired_job(
        &self,
        job: &Job,
        parameters: &BTreeMap<String, String>,
        created_at: Timestamp,
        expire_in: Duration,
    ) -> Result<JobId>;

    /// Fetches the next job from the first non-empty queue, waiting up to
    /// `timeout`. `None` means no work was available.
    async fn fetch_next_job(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Box<dyn FetchedJob>>>;

    /// Returns the lowest-scored member of a sorted set with a score within
    /// `[from, to]`.
    async fn first_by_lowest_score_from_set(
        &self,
        key: &str,
        from: f64,
        to: f64,
    ) -> Result<Option<String>>;

    /// Requeues in-flight jobs fetched more than `invisibility_timeout` ago,
    /// returning how many were requeued.
    async fn requeue_timed_out_jobs(&self, invisibility_timeout: Duration) -> Result<usize>;
}

/// A buffered set of writes applied atomically on commit.
///
/// Dropping a transaction without committing discards it.
#[async_trait]
pub trait WriteTransaction: Send {
    /// Sets the job's current state and appends it to the history.
    fn set_job_state(&mut self, job_id: &JobId, state: &State);

    /// Appends a state to the job's history without making it current.
    fn add_job_state(&mut self, job_id: &JobId, state: &State);

    /// Makes the job expire after `expire_in`.
    fn expire_job(&mut self, job_id: &JobId, expire_in: Duration);

    /// Removes any pending expiration from the job.
    fn persist_job(&mut self, job_id: &JobId);

    /// Sets a job parameter.
    fn set_job_parameter(&mut self, job_id: &JobId, name: &str, value: &str);

    /// Appends the job to a queue.
    fn add_to_queue(&mut self, queue: &str, job_id: &JobId);

    /// Adds a member to a sorted set, replacing its score if present.
    fn add_to_set(&mut self, key: &str, value: &str, score: f64);

    /// Removes a member from a sorted set.
    fn remove_from_set(&mut self, key: &str, value: &str);

    /// Increments a counter.
    fn increment_counter(&mut self, key: &str);

    /// Decrements a counter.
    fn decrement_counter(&mut self, key: &str);

    /// Applies every buffered write.
    async fn commit(self: Box<Self>) -> Result;
}

/// A held per-job lock. Released on drop.
pub trait JobLock: Send {}

/// A job taken off a queue and not yet resolved.
///
/// Dropping the handle without resolving it requeues the job.
#[async_trait]
pub trait FetchedJob: Send {
    /// The fetched job's identifier.
    fn job_id(&self) -> &JobId;

    /// The queue the job was fetched from.
    fn queue(&self) -> &str;

    /// Removes the job from the in-flight list for good.
    async fn remove_from_queue(self: Box<Self>) -> Result;

    /// Puts the job back on its queue.
    async fn requeue(self: Box<Self>) -> Result;
}
