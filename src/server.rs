//! Servers run everything that processes jobs in the background.
//!
//! A [`Server`] wires storage, a state machine and the registered tasks into
//! three kinds of background loops, all stopped by one shutdown token:
//!
//! - a [`WorkerPool`] performing enqueued jobs,
//! - a [`DelayedJobScheduler`] enqueueing scheduled jobs once they're due,
//! - a [`FetchedJobsWatcher`] requeueing jobs abandoned by crashed workers.
//!
//! Each loop is a [`BackgroundExecution`](crate::execution::BackgroundExecution),
//! so storage outages are retried with back-off instead of stopping the
//! server.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use afoot::{storage::InMemoryStorage, task::Result as TaskResult, Job, Server, Task};
//! use serde_json::json;
//!
//! struct Cleanup;
//!
//! impl Task for Cleanup {
//!     const NAME: &'static str = "cleanup";
//!
//!     type Input = ();
//!
//!     async fn execute(&self, _input: Self::Input) -> TaskResult {
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = InMemoryStorage::new();
//! let server = Server::builder(Arc::new(storage.clone()))
//!     .task(Cleanup)
//!     .worker_count(2)
//!     .build()?;
//!
//! let handle = server.start()?;
//! server.client().enqueue(Job::new("cleanup", json!(null))).await?;
//!
//! // Later, stop the loops and wait for them to finish.
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::{fmt, sync::Arc, time::Duration};

use tokio::runtime::{Handle, TryCurrentError};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use ulid::Ulid;

use crate::{
    dispatcher::{self, BackgroundDispatcherAsync},
    execution::ExecutionOptions,
    job::DEFAULT_QUEUE,
    scheduler::DelayedJobScheduler,
    state::{ConfigurationError, EnqueuedState},
    state_machine::StateMachine,
    storage::JobStorage,
    task::{Task, TaskRegistry},
    watcher::FetchedJobsWatcher,
    worker::{self, ExceptionFilter, PerformFilter, Worker, WorkerPool},
    Client,
};

/// A type alias for server results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server was configured with invalid values.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Error returned while starting the worker pool.
    #[error(transparent)]
    Worker(#[from] worker::Error),

    /// Error returned while starting a dispatcher.
    #[error(transparent)]
    Dispatcher(#[from] dispatcher::Error),

    /// The server was started outside of a Tokio runtime.
    #[error(transparent)]
    Runtime(#[from] TryCurrentError),

    /// Some loops were still running when the shutdown timeout passed.
    #[error("Background loops didn't stop within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Processes jobs in the background.
pub struct Server {
    id: String,
    storage: Arc<dyn JobStorage>,
    state_machine: StateMachine,
    worker: Worker,
    worker_count: usize,
    queues: Vec<String>,
    scheduler: DelayedJobScheduler,
    watcher: FetchedJobsWatcher,
    execution_options: ExecutionOptions,
    shutdown_timeout: Duration,
}

impl Server {
    /// Create a new builder over `storage`.
    pub fn builder(storage: Arc<dyn JobStorage>) -> Builder {
        Builder::new(storage)
    }

    /// The server's identifier, recorded with every job it processes.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of workers the pool runs.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queues jobs are fetched from, in priority order.
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// How long [`ServerHandle::shutdown`] waits for the loops to stop.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// A client creating jobs in this server's storage, sharing its state
    /// machine.
    pub fn client(&self) -> Client {
        Client::new(self.storage.clone()).with_state_machine(self.state_machine.clone())
    }

    /// Starts the worker pool, scheduler and watcher on the current Tokio
    /// runtime.
    ///
    /// Use [`ServerHandle::shutdown`] for graceful stop.
    #[instrument(skip(self), fields(server.id = %self.id), err)]
    pub fn start(&self) -> Result<ServerHandle> {
        let handle = Handle::try_current()?;
        let shutdown_token = CancellationToken::new();

        let pool = WorkerPool::start(
            &handle,
            self.storage.clone(),
            self.worker.clone(),
            self.worker_count,
            self.execution_options.renamed("worker"),
            &shutdown_token,
        )?;

        let scheduler = BackgroundDispatcherAsync::start(
            &handle,
            1,
            1,
            self.execution_options.renamed("delayed-job-scheduler"),
            &shutdown_token,
            {
                let storage = self.storage.clone();
                let scheduler = self.scheduler.clone();
                move |_, _| {
                    let storage = storage.clone();
                    let scheduler = scheduler.clone();
                    async move { scheduler.run_once(&*storage).await }
                }
            },
        )?;

        let watcher = BackgroundDispatcherAsync::start(
            &handle,
            1,
            1,
            self.execution_options.renamed("fetched-jobs-watcher"),
            &shutdown_token,
            {
                let storage = self.storage.clone();
                let watcher = self.watcher.clone();
                move |_, _| {
                    let storage = storage.clone();
                    let watcher = watcher.clone();
                    async move { watcher.run_once(&*storage).await }
                }
            },
        )?;

        tracing::info!(
            workers = self.worker_count,
            queues = ?self.queues,
            "Server started"
        );

        Ok(ServerHandle {
            id: self.id.clone(),
            pool,
            scheduler,
            watcher,
            shutdown_token,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("worker_count", &self.worker_count)
            .field("queues", &self.queues)
            .field("worker", &self.worker)
            .field("scheduler", &self.scheduler)
            .field("watcher", &self.watcher)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

/// Handle returned by [`Server::start`].
pub struct ServerHandle {
    id: String,
    pool: WorkerPool,
    scheduler: BackgroundDispatcherAsync,
    watcher: BackgroundDispatcherAsync,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    /// The running server's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The worker pool, to inspect its slots.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Token cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    /// Signals every loop to stop and waits for them to terminate, up to
    /// the shutdown timeout.
    ///
    /// Jobs still being performed are dropped and go back on their queue.
    #[instrument(skip(self), fields(server.id = %self.id), err)]
    pub async fn shutdown(self) -> Result {
        self.shutdown_token.cancel();

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let remaining = || deadline.saturating_duration_since(tokio::time::Instant::now());

        let stopped = self.pool.wait_async(remaining()).await
            && self.scheduler.wait_async(remaining()).await
            && self.watcher.wait_async(remaining()).await;
        if !stopped {
            tracing::warn!(timeout = ?self.shutdown_timeout, "Server didn't stop in time");
            return Err(Error::ShutdownTimeout(self.shutdown_timeout));
        }

        tracing::info!("Server stopped");
        Ok(())
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("stopping", &self.shutdown_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Server`].
pub struct Builder {
    storage: Arc<dyn JobStorage>,
    state_machine: StateMachine,
    tasks: TaskRegistry,
    perform_filters: Vec<Arc<dyn PerformFilter>>,
    exception_filters: Vec<Arc<dyn ExceptionFilter>>,
    id: Option<String>,
    worker_count: usize,
    queues: Vec<String>,
    fetch_timeout: Duration,
    schedule_poll_interval: Duration,
    invisibility_timeout: Duration,
    watcher_interval: Duration,
    shutdown_timeout: Duration,
    execution_options: ExecutionOptions,
}

impl Builder {
    fn new(storage: Arc<dyn JobStorage>) -> Self {
        Self {
            storage,
            state_machine: StateMachine::default(),
            tasks: TaskRegistry::default(),
            perform_filters: Vec::new(),
            exception_filters: Vec::new(),
            id: None,
            worker_count: (num_cpus::get() * 5).min(20),
            queues: vec![DEFAULT_QUEUE.to_string()],
            fetch_timeout: Duration::from_secs(5),
            schedule_poll_interval: Duration::from_secs(15),
            invisibility_timeout: Duration::from_secs(30 * 60),
            watcher_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(15),
            execution_options: ExecutionOptions::default(),
        }
    }

    /// Sets the state machine every state change goes through.
    ///
    /// Default value is [`StateMachine::default`].
    pub fn state_machine(mut self, state_machine: StateMachine) -> Self {
        self.state_machine = state_machine;
        self
    }

    /// Registers a task jobs can invoke.
    pub fn task<T: Task>(mut self, task: T) -> Self {
        self.tasks.register(task);
        self
    }

    /// Adds a filter running around every task.
    pub fn perform_filter(mut self, filter: Arc<dyn PerformFilter>) -> Self {
        self.perform_filters.push(filter);
        self
    }

    /// Adds a filter observing task errors.
    pub fn exception_filter(mut self, filter: Arc<dyn ExceptionFilter>) -> Self {
        self.exception_filters.push(filter);
        self
    }

    /// Sets the server's identifier.
    ///
    /// Default value is a random ULID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the number of workers.
    ///
    /// Default value is five per CPU, at most 20.
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
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

    /// Sets how long a worker waits for a job before fetching again.
    ///
    /// Default value is 5 seconds.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets how often the scheduler looks for due jobs.
    ///
    /// Default value is 15 seconds.
    pub fn schedule_poll_interval(mut self, interval: Duration) -> Self {
        self.schedule_poll_interval = interval;
        self
    }

    /// Sets how long a fetched job may stay unresolved before the watcher
    /// requeues it.
    ///
    /// Default value is 30 minutes.
    pub fn invisibility_timeout(mut self, timeout: Duration) -> Self {
        self.invisibility_timeout = timeout;
        self
    }

    /// Sets how often the watcher looks for abandoned jobs.
    ///
    /// Default value is 1 minute.
    pub fn watcher_interval(mut self, interval: Duration) -> Self {
        self.watcher_interval = interval;
        self
    }

    /// Sets how long shutdown waits for the loops to stop.
    ///
    /// Default value is 15 seconds.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the options of every background loop.
    ///
    /// Default value is [`ExecutionOptions::default`].
    pub fn execution_options(mut self, options: ExecutionOptions) -> Self {
        self.execution_options = options;
        self
    }

    /// Builds the server, validating its configuration.
    pub fn build(self) -> Result<Server> {
        if self.worker_count == 0 {
            return Err(ConfigurationError::NoWorkers.into());
        }
        if self.queues.is_empty() {
            return Err(ConfigurationError::InvalidQueueName(String::new()).into());
        }
        for queue in &self.queues {
            EnqueuedState::new(queue.as_str())?;
        }

        let id = self.id.unwrap_or_else(|| Ulid::new().to_string());
        let mut worker = Worker::new(self.state_machine.clone(), self.tasks)
            .queues(self.queues.iter().cloned())
            .fetch_timeout(self.fetch_timeout)
            .server_id(id.clone());
        for filter in self.perform_filters {
            worker = worker.perform_filter(filter);
        }
        for filter in self.exception_filters {
            worker = worker.exception_filter(filter);
        }

        Ok(Server {
            id,
            storage: self.storage,
            scheduler: DelayedJobScheduler::new(self.state_machine.clone())
                .poll_interval(self.schedule_poll_interval),
            watcher: FetchedJobsWatcher::new()
                .invisibility_timeout(self.invisibility_timeout)
                .check_interval(self.watcher_interval),
            state_machine: self.state_machine,
            worker,
            worker_count: self.worker_count,
            queues: self.queues,
            execution_options: self.execution_options,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use jiff::{Timestamp, ToSpan};
    use serde_json::json;

    use super::*;
    use crate::{
        storage::{InMemoryStorage, StorageConnection},
        task::Result as TaskResult,
        BoxError, Job, JobId,
    };

    #[derive(Clone, Default)]
    struct Count(Arc<AtomicUsize>);

    impl Task for Count {
        const NAME: &'static str = "count";

        type Input = ();

        async fn execute(&self, _input: Self::Input) -> TaskResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Hang;

    impl Task for Hang {
        const NAME: &'static str = "hang";

        type Input = ();

        async fn execute(&self, _input: Self::Input) -> TaskResult {
            std::future::pending().await
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn state_is(storage: &InMemoryStorage, job_id: &JobId, state: &str) -> bool {
        storage.state_of(job_id).as_deref() == Some(state)
    }

    #[test]
    fn builder_defaults() -> Result {
        let server = Server::builder(Arc::new(InMemoryStorage::new())).build()?;

        assert_eq!(server.worker_count(), (num_cpus::get() * 5).min(20));
        assert_eq!(server.queues(), [DEFAULT_QUEUE]);
        assert_eq!(server.shutdown_timeout(), Duration::from_secs(15));
        assert!(Ulid::from_string(server.id()).is_ok());
        Ok(())
    }

    #[test]
    fn builder_rejects_invalid_configuration() {
        let storage: Arc<dyn JobStorage> = Arc::new(InMemoryStorage::new());

        let err = Server::builder(storage.clone())
            .worker_count(0)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigurationError::NoWorkers)
        ));

        let err = Server::builder(storage.clone())
            .queues(["default", "Mail"])
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigurationError::InvalidQueueName(queue)) if queue == "Mail"
        ));

        let err = Server::builder(storage)
            .queues(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn start_requires_a_runtime() -> Result {
        let server = Server::builder(Arc::new(InMemoryStorage::new())).build()?;
        assert!(matches!(server.start().unwrap_err(), Error::Runtime(_)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn processes_enqueued_and_scheduled_jobs() -> std::result::Result<(), BoxError> {
        let storage = InMemoryStorage::new();
        let count = Count::default();
        let server = Server::builder(Arc::new(storage.clone()))
            .task(count.clone())
            .worker_count(3)
            .fetch_timeout(Duration::from_millis(50))
            .schedule_poll_interval(Duration::from_millis(20))
            .id("server-1")
            .build()?;
        let client = server.client();

        let handle = server.start()?;
        assert_eq!(handle.pool().len(), 3);

        let enqueued = client.enqueue(Job::new("count", json!(null))).await?;
        let scheduled = client
            .schedule_at(
                Job::new("count", json!(null)),
                Timestamp::now().checked_sub(1.second())?,
            )
            .await?;

        assert!(eventually(|| state_is(&storage, &enqueued, "Succeeded")).await);
        assert!(eventually(|| state_is(&storage, &scheduled, "Succeeded")).await);
        assert_eq!(count.0.load(Ordering::SeqCst), 2);

        let processing = &storage.history(&enqueued)[1];
        assert_eq!(
            processing.data.get("ServerId").map(String::as_str),
            Some("server-1")
        );

        handle.shutdown().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_jobs_are_picked_up_again() -> std::result::Result<(), BoxError> {
        let storage = InMemoryStorage::new();
        let count = Count::default();
        let server = Server::builder(Arc::new(storage.clone()))
            .task(count.clone())
            .worker_count(1)
            .queues(["elsewhere"])
            .fetch_timeout(Duration::from_millis(50))
            .invisibility_timeout(Duration::from_millis(100))
            .watcher_interval(Duration::from_millis(20))
            .build()?;
        let client = server.client();

        // A worker of another process fetches the job, then dies without a
        // trace.
        let job_id = client
            .enqueue(Job::new("count", json!(null)).on_queue("elsewhere"))
            .await?;
        let fetched = storage
            .fetch_next_job(&["elsewhere".to_string()], Duration::ZERO)
            .await?
            .ok_or("nothing fetched")?;
        std::mem::forget(fetched);

        let handle = server.start()?;
        assert!(eventually(|| state_is(&storage, &job_id, "Succeeded")).await);
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert_eq!(storage.in_flight_count(), 0);

        handle.shutdown().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_requeues_jobs_in_progress() -> std::result::Result<(), BoxError> {
        let storage = InMemoryStorage::new();
        let server = Server::builder(Arc::new(storage.clone()))
            .task(Hang)
            .worker_count(1)
            .fetch_timeout(Duration::from_millis(50))
            .build()?;
        let client = server.client();

        let handle = server.start()?;
        let job_id = client.enqueue(Job::new("hang", json!(null))).await?;
        assert!(eventually(|| state_is(&storage, &job_id, "Processing")).await);

        handle.shutdown().await?;

        assert_eq!(storage.pending(DEFAULT_QUEUE), [job_id]);
        assert_eq!(storage.in_flight_count(), 0);
        Ok(())
    }
}
