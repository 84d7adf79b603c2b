//! Workers take jobs off queues and perform them.
//!
//! Until a worker fetches it, a job waits on its queue in the Enqueued
//! state. Processing a job goes through these steps:
//!
//! 1. Fetch the next job from the configured queues. The job now sits on the
//!    in-flight list of storage.
//! 2. Move it to Processing. A job that isn't Enqueued (or already
//!    Processing, after a crash) anymore is removed from the queue and left
//!    alone.
//! 3. Perform it: resolve its method through the [`TaskRegistry`], run
//!    [`PerformFilter`]s around the task and show task errors to
//!    [`ExceptionFilter`]s.
//! 4. Move it to Succeeded, recording latency and duration, or to Failed
//!    carrying the error. Election filters such as
//!    [`AutomaticRetry`](crate::state::AutomaticRetry) may redirect a failure
//!    to a retry.
//! 5. Remove it from the in-flight list.
//!
//! Anything that goes wrong before the last step leaves the fetched handle
//! unresolved, which puts the job back on its queue.
//!
//! # Running workers
//!
//! A single worker is driven by calling [`Worker::process_next_job`]; a
//! [`WorkerPool`] runs many of them, each in its own self-healing loop:
//!
//! ```rust
//! use std::{sync::Arc, time::Duration};
//!
//! use afoot::{
//!     execution::ExecutionOptions,
//!     storage::InMemoryStorage,
//!     task::{Result as TaskResult, TaskRegistry},
//!     worker::{Worker, WorkerPool},
//!     Client, Job, StateMachine, Task,
//! };
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Greet;
//!
//! impl Task for Greet {
//!     const NAME: &'static str = "greet";
//!
//!     type Input = String;
//!
//!     async fn execute(&self, name: Self::Input) -> TaskResult {
//!         println!("Hello, {name}!");
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = InMemoryStorage::new();
//! let client = Client::new(Arc::new(storage.clone()));
//! let job_id = client.enqueue(Job::new("greet", json!("ferris"))).await?;
//!
//! let mut tasks = TaskRegistry::default();
//! tasks.register(Greet);
//! let worker = Worker::new(StateMachine::default(), tasks);
//!
//! let stop = CancellationToken::new();
//! let pool = WorkerPool::start(
//!     &tokio::runtime::Handle::current(),
//!     Arc::new(storage.clone()),
//!     worker,
//!     4,
//!     ExecutionOptions::default(),
//!     &stop,
//! )?;
//!
//! while storage.state_of(&job_id).as_deref() != Some("Succeeded") {
//!     tokio::time::sleep(Duration::from_millis(10)).await;
//! }
//!
//! stop.cancel();
//! assert!(pool.wait_async(Duration::from_secs(5)).await);
//! # Ok(())
//! # }
//! ```

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::FutureExt;
use jiff::Timestamp;
use tokio::{runtime::Handle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use ulid::Ulid;
use uuid::Uuid;

use crate::{
    dispatcher::{self, BackgroundDispatcherAsync},
    execution::{ExecutionOptions, Health},
    job::{Job, DEFAULT_QUEUE},
    state::{EnqueuedState, FailedState, ProcessingState, State, SucceededState},
    state_machine::{self, StateMachine},
    storage::{self, JobStorage, StorageConnection},
    task::{Error as TaskError, Result as TaskResult, TaskRegistry},
    BoxError, JobId,
};

/// A type alias for worker results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Worker errors.
///
/// Job failures aren't among them: those move the job to Failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by storage.
    #[error(transparent)]
    Storage(#[from] storage::Error),

    /// Error returned by the state machine.
    #[error(transparent)]
    StateMachine(#[from] state_machine::Error),

    /// Error returned while starting the pool's dispatcher.
    #[error(transparent)]
    Dispatcher(#[from] dispatcher::Error),
}

/// What perform and exception filters get to know about a job.
#[derive(Debug, Clone, Copy)]
pub struct PerformContext<'a> {
    job_id: &'a JobId,
    job: &'a Job,
}

impl<'a> PerformContext<'a> {
    /// The job's identifier.
    pub fn job_id(&self) -> &'a JobId {
        self.job_id
    }

    /// The job being performed.
    pub fn job(&self) -> &'a Job {
        self.job
    }
}

/// Runs around the task of every performed job.
///
/// `on_performing` runs in registration order before the task and
/// `on_performed` in reverse order after it. An error from either fails the
/// job; an error from `on_performing` also keeps the task from running.
pub trait PerformFilter: Send + Sync {
    /// Called before the task runs.
    fn on_performing(&self, _context: &PerformContext<'_>) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called after the task ran, with its outcome.
    fn on_performed(
        &self,
        _context: &PerformContext<'_>,
        _outcome: &TaskResult,
    ) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

/// Observes errors returned by tasks.
pub trait ExceptionFilter: Send + Sync {
    /// Called when the task of a job returned an error.
    fn on_exception(&self, context: &PerformContext<'_>, error: &TaskError);
}

#[derive(Clone, Default)]
struct PerformFilters {
    perform: Vec<Arc<dyn PerformFilter>>,
    exception: Vec<Arc<dyn ExceptionFilter>>,
}

/// Fetches jobs and performs them.
///
/// Cloning is cheap; clones share their tasks and filters.
#[derive(Clone)]
pub struct Worker {
    state_machine: StateMachine,
    tasks: Arc<TaskRegistry>,
    filters: Arc<PerformFilters>,
    queues: Arc<[String]>,
    fetch_timeout: Duration,
    server_id: String,
    worker_id: String,
}

impl Worker {
    /// Creates a worker performing jobs with the given tasks.
    pub fn new(state_machine: StateMachine, tasks: TaskRegistry) -> Self {
        Self {
            state_machine,
            tasks: Arc::new(tasks),
            filters: Arc::default(),
            queues: Arc::from([DEFAULT_QUEUE.to_string()]),
            fetch_timeout: Duration::from_secs(5),
            server_id: Ulid::new().to_string(),
            worker_id: Uuid::new_v4().to_string(),
        }
    }

    /// Sets the queues jobs are fetched from, in priority order.
    ///
    /// Default value is `["default"]`.
    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Sets how long a fetch waits for a job before giving up.
    ///
    /// Default value is 5 seconds.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the server id recorded in the Processing state.
    ///
    /// Default value is a random ULID.
    pub fn server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    /// Sets the worker id recorded in the Processing state.
    ///
    /// Default value is a random UUID.
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Adds a filter running around every task.
    pub fn perform_filter(mut self, filter: Arc<dyn PerformFilter>) -> Self {
        Arc::make_mut(&mut self.filters).perform.push(filter);
        self
    }

    /// Adds a filter observing task errors.
    pub fn exception_filter(mut self, filter: Arc<dyn ExceptionFilter>) -> Self {
        Arc::make_mut(&mut self.filters).exception.push(filter);
        self
    }

    /// Fetches the next job and processes it.
    ///
    /// Returns the fetched job's id, or `None` when no job arrived within the
    /// fetch timeout.
    pub async fn process_next_job(
        &self,
        connection: &dyn StorageConnection,
    ) -> Result<Option<JobId>> {
        self.process_next_job_with(connection, |_| {}).await
    }

    #[instrument(
        skip_all,
        fields(worker.id = %self.worker_id, job.id = tracing::field::Empty),
        err
    )]
    async fn process_next_job_with<F>(
        &self,
        connection: &dyn StorageConnection,
        on_fetched: F,
    ) -> Result<Option<JobId>>
    where
        F: FnOnce(&JobId) + Send,
    {
        let Some(fetched) = connection
            .fetch_next_job(&self.queues, self.fetch_timeout)
            .await?
        else {
            return Ok(None);
        };

        let job_id = fetched.job_id().clone();
        tracing::Span::current().record("job.id", job_id.as_str());
        on_fetched(&job_id);

        let processing = ProcessingState::new(&self.server_id, &self.worker_id);
        let started = self
            .state_machine
            .try_to_change_state(
                connection,
                &job_id,
                processing.into(),
                Some(&[EnqueuedState::NAME, ProcessingState::NAME]),
            )
            .await?;
        if !started {
            tracing::debug!("Job can't be processed anymore, removing it from the queue");
            fetched.remove_from_queue().await?;
            return Ok(Some(job_id));
        }

        // A job whose invocation couldn't be loaded was moved to Failed while
        // trying to start it, so only a vanished job ends up here.
        let Some(data) = connection.get_job_data(&job_id).await? else {
            fetched.remove_from_queue().await?;
            return Ok(Some(job_id));
        };
        let Ok(job) = data.job else {
            fetched.remove_from_queue().await?;
            return Ok(Some(job_id));
        };

        let latency = Timestamp::now().duration_since(data.created_at);
        let started_at = Instant::now();
        let outcome = self.perform(&job_id, &job).await;
        let duration = started_at.elapsed();

        let next_state: State = match outcome {
            Ok(()) => SucceededState::new(
                None,
                u64::try_from(latency.as_millis()).unwrap_or_default(),
                u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            )
            .into(),
            Err(err) => State::from(FailedState::from_boxed(err))
                .with_reason("An exception occurred during performance of the job."),
        };

        self.state_machine
            .try_to_change_state(
                connection,
                &job_id,
                next_state,
                Some(&[ProcessingState::NAME]),
            )
            .await?;
        fetched.remove_from_queue().await?;

        Ok(Some(job_id))
    }

    async fn perform(&self, job_id: &JobId, job: &Job) -> std::result::Result<(), BoxError> {
        let context = PerformContext { job_id, job };

        for filter in &self.filters.perform {
            filter.on_performing(&context)?;
        }

        let outcome = self.tasks.execute(job.method(), job.args().clone()).await;

        if let Err(err) = &outcome {
            tracing::error!(
                err = %err,
                job.method = job.method(),
                "Task execution encountered an error"
            );
            for filter in &self.filters.exception {
                filter.on_exception(&context, err);
            }
        }

        for filter in self.filters.perform.iter().rev() {
            filter.on_performed(&context, &outcome)?;
        }

        outcome.map_err(Into::into)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("queues", &self.queues)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("server_id", &self.server_id)
            .field("worker_id", &self.worker_id)
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

/// What a slot of a [`WorkerPool`] is doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    /// Waiting for a job.
    Idle,

    /// Processing the given job.
    Busy(JobId),

    /// The slot's loop crashed. Dead slots are never reused.
    Dead,
}

#[derive(Debug)]
struct Slots(Vec<Mutex<SlotStatus>>);

impl Slots {
    fn new(count: usize) -> Self {
        Self((0..count).map(|_| Mutex::new(SlotStatus::Idle)).collect())
    }

    fn status(&self, slot: usize) -> MutexGuard<'_, SlotStatus> {
        self.0[slot].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, slot: usize, status: SlotStatus) {
        let mut current = self.status(slot);
        if *current != SlotStatus::Dead {
            *current = status;
        }
    }
}

/// Returns a slot to idle once its job is done, however that happened.
struct SlotGuard<'a> {
    slots: &'a Slots,
    slot: usize,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots.set(self.slot, SlotStatus::Idle);
    }
}

/// A fixed number of workers, each running in its own execution loop.
///
/// Storage errors in a slot are retried by its loop with back-off. A slot
/// whose job panics is marked [`SlotStatus::Dead`] and stays dead; the other
/// slots keep processing jobs.
pub struct WorkerPool {
    dispatcher: BackgroundDispatcherAsync,
    slots: Arc<Slots>,
}

impl WorkerPool {
    /// Starts `count` workers on `handle`, each a clone of `worker` with its
    /// own worker id, until `stop_token` is cancelled.
    pub fn start(
        handle: &Handle,
        storage: Arc<dyn JobStorage>,
        worker: Worker,
        count: usize,
        options: ExecutionOptions,
        stop_token: &CancellationToken,
    ) -> Result<Self> {
        let slots = Arc::new(Slots::new(count));
        let workers: Arc<[Worker]> = (0..count)
            .map(|slot| {
                let worker_id = format!("{}:{slot}", worker.worker_id);
                worker.clone().worker_id(worker_id)
            })
            .collect();

        let dispatcher = BackgroundDispatcherAsync::start(
            handle,
            count,
            count,
            options,
            stop_token,
            {
                let slots = slots.clone();
                move |slot, _context| {
                    let storage = storage.clone();
                    let workers = workers.clone();
                    let slots = slots.clone();
                    async move {
                        let connection = storage.connection().await?;
                        let _guard = SlotGuard {
                            slots: &slots,
                            slot,
                        };

                        let processing = workers[slot]
                            .process_next_job_with(&*connection, |job_id| {
                                slots.set(slot, SlotStatus::Busy(job_id.clone()))
                            });
                        match AssertUnwindSafe(processing).catch_unwind().await {
                            Ok(result) => result.map(|_| ()),
                            Err(payload) => {
                                slots.set(slot, SlotStatus::Dead);
                                panic::resume_unwind(payload)
                            }
                        }
                    }
                }
            },
        )?;

        Ok(Self { dispatcher, slots })
    }

    /// Status of every slot.
    pub fn slots(&self) -> Vec<SlotStatus> {
        let crashed = self.dispatcher.crashed_units();
        (0..self.slots.0.len())
            .map(|slot| {
                if crashed.contains(&slot) {
                    SlotStatus::Dead
                } else {
                    self.slots.status(slot).clone()
                }
            })
            .collect()
    }

    /// Slots waiting for a job.
    pub fn free_slots(&self) -> Vec<usize> {
        self.slots_where(|status| *status == SlotStatus::Idle)
    }

    /// Slots processing a job.
    pub fn busy_slots(&self) -> Vec<usize> {
        self.slots_where(|status| matches!(status, SlotStatus::Busy(_)))
    }

    /// Slots whose loop crashed.
    pub fn dead_slots(&self) -> Vec<usize> {
        self.slots_where(|status| *status == SlotStatus::Dead)
    }

    fn slots_where(&self, predicate: impl Fn(&SlotStatus) -> bool) -> Vec<usize> {
        self.slots()
            .iter()
            .enumerate()
            .filter(|(_, status)| predicate(status))
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Health of each slot's loop.
    pub fn health(&self) -> Vec<Health> {
        self.dispatcher.health()
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.0.len()
    }

    /// Whether the pool has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.0.is_empty()
    }

    /// Asks every slot to stop once its current job is done or dropped.
    pub fn stop(&self) {
        self.dispatcher.stop();
    }

    /// Waits until every slot stopped or `timeout` elapsed. Returns whether
    /// every slot stopped.
    pub async fn wait_async(&self, timeout: Duration) -> bool {
        self.dispatcher.wait_async(timeout).await
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("slots", &self.slots())
            .finish()
    }
}
