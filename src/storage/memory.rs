//! An in-process implementation of the storage contract.
//!
//! Everything lives behind one mutex and is lost when the process exits, so
//! this is meant for tests and for embedding the engine where durability
//! doesn't matter. It implements the whole contract, including the reliable
//! fetch protocol: fetched jobs sit on an in-flight list stamped with their
//! fetch time until they're removed or requeued, and handles dropped without
//! being resolved put their job back.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use jiff::Timestamp;
use serde_json::Value;
use tokio::{
    sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard},
    time::Instant,
};

use crate::{
    job::Job,
    state::{State, StateData},
    storage::{
        Error, FetchedJob, JobData, JobLock, JobStorage, Result, StorageConnection,
        WriteTransaction,
    },
    JobId,
};

/// A state as recorded in a job's history.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    /// Name of the state.
    pub name: String,

    /// Reason attached to the transition.
    pub reason: Option<String>,

    /// The state's persisted properties.
    pub data: StateData,

    /// When the record was written.
    pub created_at: Timestamp,
}

impl StateRecord {
    fn new(state: &State) -> Self {
        Self {
            name: state.name().to_string(),
            reason: state.reason().map(str::to_string),
            data: state.serialize_data(),
            created_at: Timestamp::now(),
        }
    }
}

#[derive(Debug)]
struct StoredJob {
    invocation: Value,
    state: Option<String>,
    history: Vec<StateRecord>,
    parameters: BTreeMap<String, String>,
    created_at: Timestamp,
    expire_at: Option<Instant>,
}

impl StoredJob {
    fn is_expired(&self, now: Instant) -> bool {
        self.expire_at.is_some_and(|expire_at| expire_at <= now)
    }
}

#[derive(Debug)]
struct InFlight {
    token: u64,
    job_id: JobId,
    queue: String,
    fetched_at: Instant,
}

#[derive(Debug, Default)]
struct Data {
    jobs: HashMap<JobId, StoredJob>,
    queues: HashMap<String, VecDeque<JobId>>,
    in_flight: Vec<InFlight>,
    sets: HashMap<String, HashMap<String, f64>>,
    counters: HashMap<String, i64>,
    next_token: u64,
}

impl Data {
    fn enqueue(&mut self, queue: &str, job_id: JobId) {
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(job_id);
    }

    fn take_in_flight(&mut self, token: u64) -> Option<InFlight> {
        let position = self.in_flight.iter().position(|entry| entry.token == token)?;
        Some(self.in_flight.swap_remove(position))
    }
}

#[derive(Debug, Default)]
struct Inner {
    data: Mutex<Data>,
    job_locks: Mutex<HashMap<JobId, Arc<AsyncMutex<()>>>>,
    queued: Notify,
}

impl Inner {
    // Critical sections never panic midway, so a poisoned lock still guards
    // consistent data.
    fn data(&self) -> MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn requeue(&self, token: u64) -> bool {
        let requeued = {
            let mut data = self.data();
            match data.take_in_flight(token) {
                Some(entry) => {
                    data.enqueue(&entry.queue, entry.job_id);
                    true
                }
                None => false,
            }
        };
        if requeued {
            self.queued.notify_waiters();
        }
        requeued
    }
}

/// Storage kept in process memory.
///
/// Cloning is cheap and every clone shares the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<Inner>,
}

impl InMemoryStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// The name of the job's current state.
    pub fn state_of(&self, job_id: &JobId) -> Option<String> {
        let data = self.inner.data();
        data.jobs.get(job_id).and_then(|job| job.state.clone())
    }

    /// The job's state history, oldest first.
    pub fn history(&self, job_id: &JobId) -> Vec<StateRecord> {
        let data = self.inner.data();
        data.jobs
            .get(job_id)
            .map(|job| job.history.clone())
            .unwrap_or_default()
    }

    /// A job parameter.
    pub fn parameter(&self, job_id: &JobId, name: &str) -> Option<String> {
        let data = self.inner.data();
        data.jobs
            .get(job_id)
            .and_then(|job| job.parameters.get(name).cloned())
    }

    /// Whether the job has a pending expiration.
    pub fn is_expiring(&self, job_id: &JobId) -> bool {
        let data = self.inner.data();
        data.jobs
            .get(job_id)
            .is_some_and(|job| job.expire_at.is_some())
    }

    /// Job ids waiting on a queue, in fetch order.
    pub fn pending(&self, queue: &str) -> Vec<JobId> {
        let data = self.inner.data();
        data.queues
            .get(queue)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of fetched jobs not yet resolved.
    pub fn in_flight_count(&self) -> usize {
        self.inner.data().in_flight.len()
    }

    /// Members of a sorted set, lowest score first.
    pub fn set_members(&self, key: &str) -> Vec<String> {
        let data = self.inner.data();
        let mut members = data
            .sets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect::<Vec<_>>())
            .unwrap_or_default();
        members.sort_by(|(a_member, a_score), (b_member, b_score)| {
            a_score.total_cmp(b_score).then_with(|| a_member.cmp(b_member))
        });
        members.into_iter().map(|(member, _)| member).collect()
    }

    /// Current value of a counter.
    pub fn counter(&self, key: &str) -> i64 {
        let data = self.inner.data();
        data.counters.get(key).copied().unwrap_or_default()
    }

    /// Stores a job with an arbitrary invocation, bypassing encoding.
    #[cfg(test)]
    pub(crate) fn insert_raw_job(&self, invocation: Value, state: Option<&str>) -> JobId {
        let job_id = JobId::generate();
        self.inner.data().jobs.insert(
            job_id.clone(),
            StoredJob {
                invocation,
                state: state.map(str::to_string),
                history: Vec::new(),
                parameters: BTreeMap::new(),
                created_at: Timestamp::now(),
                expire_at: None,
            },
        );
        job_id
    }
}

#[async_trait]
impl JobStorage for InMemoryStorage {
    async fn connection(&self) -> Result<Box<dyn StorageConnection>> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl StorageConnection for InMemoryStorage {
    fn create_write_transaction(&self) -> Box<dyn WriteTransaction> {
        Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            commands: Vec::new(),
        })
    }

    async fn acquire_job_lock(
        &self,
        job_id: &JobId,
        timeout: Duration,
    ) -> Result<Box<dyn JobLock>> {
        let lock = {
            let mut locks = self
                .inner
                .job_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // Drop locks nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(job_id.clone()).or_default().clone()
        };

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(Box::new(MemoryJobLock { _guard: guard })),
            Err(_) => Err(Error::LockTimeout(job_id.clone())),
        }
    }

    async fn get_job_data(&self, job_id: &JobId) -> Result<Option<JobData>> {
        let mut data = self.inner.data();
        let now = Instant::now();
        if data.jobs.get(job_id).is_some_and(|job| job.is_expired(now)) {
            data.jobs.remove(job_id);
        }

        Ok(data.jobs.get(job_id).map(|stored| JobData {
            state_name: stored.state.clone(),
            job: Job::decode(&stored.invocation),
            parameters: stored.parameters.clone(),
            created_at: stored.created_at,
        }))
    }

    async fn create_expired_job(
        &self,
        job: &Job,
        parameters: &BTreeMap<String, String>,
        created_at: Timestamp,
        expire_in: Duration,
    ) -> Result<JobId> {
        let invocation = job.encode()?;
        let job_id = JobId::generate();
        self.inner.data().jobs.insert(
            job_id.clone(),
            StoredJob {
                invocation,
                state: None,
                history: Vec::new(),
                parameters: parameters.clone(),
                created_at,
                expire_at: Instant::now().checked_add(expire_in),
            },
        );
        Ok(job_id)
    }

    async fn fetch_next_job(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Box<dyn FetchedJob>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.queued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(fetched) = self.try_fetch(queues) {
                return Ok(Some(Box::new(fetched)));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn first_by_lowest_score_from_set(
        &self,
        key: &str,
        from: f64,
        to: f64,
    ) -> Result<Option<String>> {
        let data = self.inner.data();
        let first = data.sets.get(key).and_then(|set| {
            set.iter()
                .filter(|(_, score)| (from..=to).contains(*score))
                .min_by(|(a_member, a_score), (b_member, b_score)| {
                    a_score.total_cmp(b_score).then_with(|| a_member.cmp(b_member))
                })
                .map(|(member, _)| member.clone())
        });
        Ok(first)
    }

    async fn requeue_timed_out_jobs(&self, invisibility_timeout: Duration) -> Result<usize> {
        let requeued = {
            let mut data = self.inner.data();
            let now = Instant::now();
            let (timed_out, in_flight): (Vec<_>, Vec<_>) = std::mem::take(&mut data.in_flight)
                .into_iter()
                .partition(|entry| now.duration_since(entry.fetched_at) > invisibility_timeout);
            data.in_flight = in_flight;

            let count = timed_out.len();
            for entry in timed_out {
                data.enqueue(&entry.queue, entry.job_id);
            }
            count
        };

        if requeued > 0 {
            self.inner.queued.notify_waiters();
        }
        Ok(requeued)
    }
}

impl InMemoryStorage {
    fn try_fetch(&self, queues: &[String]) -> Option<MemoryFetchedJob> {
        let mut data = self.inner.data();
        for queue in queues {
            let Some(job_id) = data.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
                continue;
            };

            data.next_token += 1;
            let token = data.next_token;
            data.in_flight.push(InFlight {
                token,
                job_id: job_id.clone(),
                queue: queue.clone(),
                fetched_at: Instant::now(),
            });

            return Some(MemoryFetchedJob {
                inner: self.inner.clone(),
                token,
                job_id,
                queue: queue.clone(),
                resolved: false,
            });
        }
        None
    }
}

struct MemoryJobLock {
    _guard: OwnedMutexGuard<()>,
}

impl JobLock for MemoryJobLock {}

struct MemoryFetchedJob {
    inner: Arc<Inner>,
    token: u64,
    job_id: JobId,
    queue: String,
    resolved: bool,
}

#[async_trait]
impl FetchedJob for MemoryFetchedJob {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn remove_from_queue(mut self: Box<Self>) -> Result {
        self.resolved = true;
        self.inner.data().take_in_flight(self.token);
        Ok(())
    }

    async fn requeue(mut self: Box<Self>) -> Result {
        self.resolved = true;
        self.inner.requeue(self.token);
        Ok(())
    }
}

impl Drop for MemoryFetchedJob {
    fn drop(&mut self) {
        if !self.resolved && self.inner.requeue(self.token) {
            tracing::debug!(
                job.id = %self.job_id,
                queue = %self.queue,
                "Requeued a fetched job released without being resolved"
            );
        }
    }
}

enum Command {
    SetJobState(JobId, StateRecord),
    AddJobState(JobId, StateRecord),
    ExpireJob(JobId, Duration),
    PersistJob(JobId),
    SetJobParameter(JobId, String, String),
    AddToQueue(String, JobId),
    AddToSet(String, String, f64),
    RemoveFromSet(String, String),
    IncrementCounter(String),
    DecrementCounter(String),
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    commands: Vec<Command>,
}

#[async_trait]
impl WriteTransaction for MemoryTransaction {
    fn set_job_state(&mut self, job_id: &JobId, state: &State) {
        self.commands
            .push(Command::SetJobState(job_id.clone(), StateRecord::new(state)));
    }

    fn add_job_state(&mut self, job_id: &JobId, state: &State) {
        self.commands
            .push(Command::AddJobState(job_id.clone(), StateRecord::new(state)));
    }

    fn expire_job(&mut self, job_id: &JobId, expire_in: Duration) {
        self.commands
            .push(Command::ExpireJob(job_id.clone(), expire_in));
    }

    fn persist_job(&mut self, job_id: &JobId) {
        self.commands.push(Command::PersistJob(job_id.clone()));
    }

    fn set_job_parameter(&mut self, job_id: &JobId, name: &str, value: &str) {
        self.commands.push(Command::SetJobParameter(
            job_id.clone(),
            name.to_string(),
            value.to_string(),
        ));
    }

    fn add_to_queue(&mut self, queue: &str, job_id: &JobId) {
        self.commands
            .push(Command::AddToQueue(queue.to_string(), job_id.clone()));
    }

    fn add_to_set(&mut self, key: &str, value: &str, score: f64) {
        self.commands
            .push(Command::AddToSet(key.to_string(), value.to_string(), score));
    }

    fn remove_from_set(&mut self, key: &str, value: &str) {
        self.commands
            .push(Command::RemoveFromSet(key.to_string(), value.to_string()));
    }

    fn increment_counter(&mut self, key: &str) {
        self.commands.push(Command::IncrementCounter(key.to_string()));
    }

    fn decrement_counter(&mut self, key: &str) {
        self.commands.push(Command::DecrementCounter(key.to_string()));
    }

    async fn commit(self: Box<Self>) -> Result {
        let MemoryTransaction { inner, commands } = *self;
        let mut queued = false;
        {
            let mut data = inner.data();
            let now = Instant::now();
            for command in commands {
                match command {
                    Command::SetJobState(job_id, record) => {
                        if let Some(job) = data.jobs.get_mut(&job_id) {
                            job.state = Some(record.name.clone());
                            job.history.push(record);
                        }
                    }
                    Command::AddJobState(job_id, record) => {
                        if let Some(job) = data.jobs.get_mut(&job_id) {
                            job.history.push(record);
                        }
                    }
                    Command::ExpireJob(job_id, expire_in) => {
                        if let Some(job) = data.jobs.get_mut(&job_id) {
                            job.expire_at = now.checked_add(expire_in);
                        }
                    }
                    Command::PersistJob(job_id) => {
                        if let Some(job) = data.jobs.get_mut(&job_id) {
                            job.expire_at = None;
                        }
                    }
                    Command::SetJobParameter(job_id, name, value) => {
                        if let Some(job) = data.jobs.get_mut(&job_id) {
                            job.parameters.insert(name, value);
                        }
                    }
                    Command::AddToQueue(queue, job_id) => {
                        data.enqueue(&queue, job_id);
                        queued = true;
                    }
                    Command::AddToSet(key, value, score) => {
                        data.sets.entry(key).or_default().insert(value, score);
                    }
                    Command::RemoveFromSet(key, value) => {
                        if let Some(set) = data.sets.get_mut(&key) {
                            set.remove(&value);
                        }
                    }
                    Command::IncrementCounter(key) => {
                        *data.counters.entry(key).or_default() += 1;
                    }
                    Command::DecrementCounter(key) => {
                        *data.counters.entry(key).or_default() -= 1;
                    }
                }
            }
        }

        if queued {
            inner.queued.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::state::EnqueuedState;

    async fn enqueued_job(storage: &InMemoryStorage, queue: &str) -> Result<JobId> {
        let job_id = storage
            .create_expired_job(
                &Job::new("send", json!([])),
                &BTreeMap::new(),
                Timestamp::now(),
                Duration::from_secs(3600),
            )
            .await?;
        let mut transaction = storage.create_write_transaction();
        transaction.set_job_state(&job_id, &EnqueuedState::default().into());
        transaction.add_to_queue(queue, &job_id);
        transaction.persist_job(&job_id);
        transaction.commit().await?;
        Ok(job_id)
    }

    #[tokio::test]
    async fn dropped_fetch_handle_requeues_job() -> Result {
        let storage = InMemoryStorage::new();
        let job_id = enqueued_job(&storage, "default").await?;
        let queues = vec!["default".to_string()];

        let fetched = storage
            .fetch_next_job(&queues, Duration::from_millis(10))
            .await?
            .expect("job should be fetched");
        assert_eq!(fetched.job_id(), &job_id);
        assert!(storage.pending("default").is_empty());
        assert_eq!(storage.in_flight_count(), 1);

        drop(fetched);

        assert_eq!(storage.pending("default"), vec![job_id.clone()]);
        assert_eq!(storage.in_flight_count(), 0);

        let fetched = storage
            .fetch_next_job(&queues, Duration::from_millis(10))
            .await?
            .expect("job should be fetched again");
        assert_eq!(fetched.job_id(), &job_id);
        fetched.remove_from_queue().await?;
        Ok(())
    }

    #[tokio::test]
    async fn removed_jobs_are_gone_from_both_lists() -> Result {
        let storage = InMemoryStorage::new();
        enqueued_job(&storage, "default").await?;

        let fetched = storage
            .fetch_next_job(&["default".to_string()], Duration::from_millis(10))
            .await?
            .expect("job should be fetched");
        fetched.remove_from_queue().await?;

        assert!(storage.pending("default").is_empty());
        assert_eq!(storage.in_flight_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn fetch_honors_queue_order() -> Result {
        let storage = InMemoryStorage::new();
        let low = enqueued_job(&storage, "low").await?;
        let critical = enqueued_job(&storage, "critical").await?;
        let queues = vec!["critical".to_string(), "low".to_string()];

        let first = storage
            .fetch_next_job(&queues, Duration::from_millis(10))
            .await?
            .expect("job should be fetched");
        assert_eq!(first.job_id(), &critical);
        assert_eq!(first.queue(), "critical");

        let second = storage
            .fetch_next_job(&queues, Duration::from_millis(10))
            .await?
            .expect("job should be fetched");
        assert_eq!(second.job_id(), &low);

        first.remove_from_queue().await?;
        second.remove_from_queue().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_times_out_on_empty_queues() -> Result {
        let storage = InMemoryStorage::new();
        let fetched = storage
            .fetch_next_job(&["default".to_string()], Duration::from_secs(5))
            .await?;
        assert!(fetched.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn fetch_wakes_up_on_new_work() -> Result {
        let storage = InMemoryStorage::new();
        let fetcher = {
            let storage = storage.clone();
            tokio::spawn(async move {
                storage
                    .fetch_next_job(&["default".to_string()], Duration::from_secs(30))
                    .await
                    .map(|fetched| fetched.map(|f| f.job_id().clone()))
            })
        };

        tokio::task::yield_now().await;
        let job_id = enqueued_job(&storage, "default").await?;

        let fetched = fetcher.await.expect("fetcher should not panic")?;
        assert_eq!(fetched, Some(job_id));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_fetches_are_requeued_after_timeout() -> Result {
        let storage = InMemoryStorage::new();
        let job_id = enqueued_job(&storage, "default").await?;

        let fetched = storage
            .fetch_next_job(&["default".to_string()], Duration::from_secs(1))
            .await?
            .expect("job should be fetched");
        // A crashed process never runs the handle's drop.
        std::mem::forget(fetched);

        let timeout = Duration::from_secs(30 * 60);
        assert_eq!(storage.requeue_timed_out_jobs(timeout).await?, 0);

        tokio::time::advance(timeout + Duration::from_secs(1)).await;
        assert_eq!(storage.requeue_timed_out_jobs(timeout).await?, 1);
        assert_eq!(storage.pending("default"), vec![job_id]);
        assert_eq!(storage.in_flight_count(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn job_lock_times_out_while_held() -> Result {
        let storage = InMemoryStorage::new();
        let job_id = JobId::try_from("1").unwrap();

        let held = storage
            .acquire_job_lock(&job_id, Duration::from_secs(1))
            .await?;
        let err = storage
            .acquire_job_lock(&job_id, Duration::from_secs(1))
            .await
            .err()
            .expect("lock should be contended");
        assert!(matches!(err, Error::LockTimeout(id) if id == job_id));

        drop(held);
        storage
            .acquire_job_lock(&job_id, Duration::from_secs(1))
            .await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn created_jobs_expire_unless_persisted() -> Result {
        let storage = InMemoryStorage::new();
        let expiring = storage
            .create_expired_job(
                &Job::new("send", json!([])),
                &BTreeMap::new(),
                Timestamp::now(),
                Duration::from_secs(3600),
            )
            .await?;
        let persisted = enqueued_job(&storage, "default").await?;
        assert!(storage.is_expiring(&expiring));
        assert!(!storage.is_expiring(&persisted));

        tokio::time::advance(Duration::from_secs(3601)).await;

        assert!(storage.get_job_data(&expiring).await?.is_none());
        assert!(storage.get_job_data(&persisted).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn uncommitted_transactions_are_discarded() -> Result {
        let storage = InMemoryStorage::new();
        let job_id = enqueued_job(&storage, "default").await?;

        let mut transaction = storage.create_write_transaction();
        transaction.increment_counter("stats:succeeded");
        transaction.set_job_parameter(&job_id, "RetryCount", "1");
        drop(transaction);

        assert_eq!(storage.counter("stats:succeeded"), 0);
        assert_eq!(storage.parameter(&job_id, "RetryCount"), None);
        Ok(())
    }

    #[tokio::test]
    async fn lowest_score_within_range_wins() -> Result {
        let storage = InMemoryStorage::new();
        let mut transaction = storage.create_write_transaction();
        transaction.add_to_set("schedule", "late", 30.0);
        transaction.add_to_set("schedule", "early", 10.0);
        transaction.add_to_set("schedule", "middle", 20.0);
        transaction.commit().await?;

        let first = storage
            .first_by_lowest_score_from_set("schedule", 0.0, 25.0)
            .await?;
        assert_eq!(first.as_deref(), Some("early"));

        let first = storage
            .first_by_lowest_score_from_set("schedule", 15.0, 25.0)
            .await?;
        assert_eq!(first.as_deref(), Some("middle"));

        let none = storage
            .first_by_lowest_score_from_set("schedule", 0.0, 5.0)
            .await?;
        assert!(none.is_none());

        assert_eq!(storage.set_members("schedule"), ["early", "middle", "late"]);
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_invocations_surface_as_load_errors() -> Result {
        let storage = InMemoryStorage::new();
        let job_id = storage.insert_raw_job(json!({ "args": [] }), Some("Enqueued"));

        let data = storage
            .get_job_data(&job_id)
            .await?
            .expect("job should exist");
        assert_eq!(data.state_name.as_deref(), Some("Enqueued"));
        assert!(data.job.is_err());
        Ok(())
    }
}
