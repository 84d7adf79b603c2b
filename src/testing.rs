//! Recording doubles of the storage traits.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use jiff::Timestamp;

use crate::{
    job::{Job, JobLoadError},
    state::State,
    storage::{
        Error, FetchedJob, JobData, JobLock, Result, StorageConnection, WriteTransaction,
    },
    JobId,
};

/// How the next commit behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitOutcome {
    Applied,
    AmbiguousApplied,
    AmbiguousLost,
    Rejected,
}

#[derive(Debug, Default)]
struct RecordedJob {
    state: Option<String>,
    job: Option<Job>,
    parameters: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Shared {
    journal: Vec<String>,
    jobs: HashMap<JobId, RecordedJob>,
    outcomes: VecDeque<CommitOutcome>,
    transactions: usize,
    locks: usize,
}

/// A connection journaling every committed transaction call.
#[derive(Debug, Default)]
pub(crate) struct RecordingConnection {
    shared: Arc<Mutex<Shared>>,
}

impl RecordingConnection {
    pub(crate) fn insert_job(&self, id: &str, state: Option<&str>, job: Option<Job>) -> JobId {
        let job_id = JobId::try_from(id).unwrap();
        self.shared.lock().unwrap().jobs.insert(
            job_id.clone(),
            RecordedJob {
                state: state.map(str::to_string),
                job,
                parameters: BTreeMap::new(),
            },
        );
        job_id
    }

    pub(crate) fn push_commit_outcome(&self, outcome: CommitOutcome) {
        self.shared.lock().unwrap().outcomes.push_back(outcome);
    }

    pub(crate) fn journal(&self) -> Vec<String> {
        self.shared.lock().unwrap().journal.clone()
    }

    pub(crate) fn transactions(&self) -> usize {
        self.shared.lock().unwrap().transactions
    }

    pub(crate) fn locks(&self) -> usize {
        self.shared.lock().unwrap().locks
    }

    pub(crate) fn state_of(&self, job_id: &JobId) -> Option<String> {
        let shared = self.shared.lock().unwrap();
        shared.jobs.get(job_id).and_then(|job| job.state.clone())
    }

    pub(crate) fn parameter(&self, job_id: &JobId, name: &str) -> Option<String> {
        let shared = self.shared.lock().unwrap();
        shared
            .jobs
            .get(job_id)
            .and_then(|job| job.parameters.get(name).cloned())
    }
}

struct RecordingLock;

impl JobLock for RecordingLock {}

#[async_trait]
impl StorageConnection for RecordingConnection {
    fn create_write_transaction(&self) -> Box<dyn WriteTransaction> {
        self.shared.lock().unwrap().transactions += 1;
        Box::new(RecordingTransaction {
            shared: Some(self.shared.clone()),
            ops: Vec::new(),
            effects: Vec::new(),
        })
    }

    async fn acquire_job_lock(
        &self,
        _job_id: &JobId,
        _timeout: Duration,
    ) -> Result<Box<dyn JobLock>> {
        self.shared.lock().unwrap().locks += 1;
        Ok(Box::new(RecordingLock))
    }

    async fn get_job_data(&self, job_id: &JobId) -> Result<Option<JobData>> {
        let shared = self.shared.lock().unwrap();
        Ok(shared.jobs.get(job_id).map(|recorded| JobData {
            state_name: recorded.state.clone(),
            job: recorded.job.clone().ok_or(JobLoadError::MissingMethod),
            parameters: recorded.parameters.clone(),
            created_at: Timestamp::now(),
        }))
    }

    async fn create_expired_job(
        &self,
        job: &Job,
        parameters: &BTreeMap<String, String>,
        _created_at: Timestamp,
        _expire_in: Duration,
    ) -> Result<JobId> {
        let job_id = JobId::generate();
        self.shared.lock().unwrap().jobs.insert(
            job_id.clone(),
            RecordedJob {
                state: None,
                job: Some(job.clone()),
                parameters: parameters.clone(),
            },
        );
        Ok(job_id)
    }

    async fn fetch_next_job(
        &self,
        _queues: &[String],
        _timeout: Duration,
    ) -> Result<Option<Box<dyn FetchedJob>>> {
        Ok(None)
    }

    async fn first_by_lowest_score_from_set(
        &self,
        _key: &str,
        _from: f64,
        _to: f64,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    async fn requeue_timed_out_jobs(&self, _invisibility_timeout: Duration) -> Result<usize> {
        Ok(0)
    }
}

enum Effect {
    State(JobId, String),
    Parameter(JobId, String, String),
}

/// A transaction recording its calls; committed calls land in the journal.
pub(crate) struct RecordingTransaction {
    shared: Option<Arc<Mutex<Shared>>>,
    ops: Vec<String>,
    effects: Vec<Effect>,
}

impl RecordingTransaction {
    /// A transaction not attached to any connection.
    pub(crate) fn detached() -> Self {
        Self {
            shared: None,
            ops: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub(crate) fn ops(&self) -> &[String] {
        &self.ops
    }
}

#[async_trait]
impl WriteTransaction for RecordingTransaction {
    fn set_job_state(&mut self, job_id: &JobId, state: &State) {
        self.ops.push(format!("SetJobState({})", state.name()));
        self.effects
            .push(Effect::State(job_id.clone(), state.name().to_string()));
    }

    fn add_job_state(&mut self, _job_id: &JobId, state: &State) {
        self.ops.push(format!("AddJobState({})", state.name()));
    }

    fn expire_job(&mut self, _job_id: &JobId, _expire_in: Duration) {
        self.ops.push("ExpireJob".to_string());
    }

    fn persist_job(&mut self, _job_id: &JobId) {
        self.ops.push("PersistJob".to_string());
    }

    fn set_job_parameter(&mut self, job_id: &JobId, name: &str, value: &str) {
        self.ops.push(format!("SetJobParameter({name}={value})"));
        self.effects.push(Effect::Parameter(
            job_id.clone(),
            name.to_string(),
            value.to_string(),
        ));
    }

    fn add_to_queue(&mut self, queue: &str, _job_id: &JobId) {
        self.ops.push(format!("AddToQueue({queue})"));
    }

    fn add_to_set(&mut self, key: &str, _value: &str, _score: f64) {
        self.ops.push(format!("AddToSet({key})"));
    }

    fn remove_from_set(&mut self, key: &str, _value: &str) {
        self.ops.push(format!("RemoveFromSet({key})"));
    }

    fn increment_counter(&mut self, key: &str) {
        self.ops.push(format!("IncrementCounter({key})"));
    }

    fn decrement_counter(&mut self, key: &str) {
        self.ops.push(format!("DecrementCounter({key})"));
    }

    async fn commit(self: Box<Self>) -> Result {
        let RecordingTransaction {
            shared,
            ops,
            effects,
        } = *self;
        let Some(shared) = shared else {
            return Ok(());
        };
        let mut shared = shared.lock().unwrap();

        let outcome = shared
            .outcomes
            .pop_front()
            .unwrap_or(CommitOutcome::Applied);
        if outcome == CommitOutcome::Rejected {
            return Err(Error::Backend("commit rejected".into()));
        }
        if outcome == CommitOutcome::AmbiguousLost {
            return Err(Error::AmbiguousCommit("connection reset".to_string()));
        }

        shared.journal.extend(ops);
        shared.journal.push("Commit".to_string());
        for effect in effects {
            match effect {
                Effect::State(job_id, name) => {
                    shared.jobs.entry(job_id).or_default().state = Some(name);
                }
                Effect::Parameter(job_id, name, value) => {
                    shared
                        .jobs
                        .entry(job_id)
                        .or_default()
                        .parameters
                        .insert(name, value);
                }
            }
        }

        if outcome == CommitOutcome::AmbiguousApplied {
            return Err(Error::AmbiguousCommit("connection reset".to_string()));
        }
        Ok(())
    }
}
