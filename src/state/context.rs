use std::{collections::BTreeMap, time::Duration};

use crate::{job::Job, state::State, storage::StorageConnection, JobId};

/// What a single state change is about: the job and the connection it's
/// changed through.
///
/// Created per state change and never persisted.
pub struct StateContext<'a> {
    job_id: JobId,
    job: Option<Job>,
    parameters: BTreeMap<String, String>,
    connection: &'a dyn StorageConnection,
}

impl<'a> StateContext<'a> {
    /// Creates a context for the given job.
    ///
    /// `job` is `None` when the stored invocation couldn't be decoded.
    pub fn new(job_id: JobId, job: Option<Job>, connection: &'a dyn StorageConnection) -> Self {
        Self {
            job_id,
            job,
            parameters: BTreeMap::new(),
            connection,
        }
    }

    /// Provides the job parameters loaded alongside the job.
    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    /// The job's identifier.
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// The job's invocation, when it could be loaded.
    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    /// Job parameters as they were when the job was loaded.
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// The storage connection the change goes through.
    pub fn connection(&self) -> &'a dyn StorageConnection {
        self.connection
    }
}

impl std::fmt::Debug for StateContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateContext")
            .field("job_id", &self.job_id)
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}

/// Context handed to election filters.
///
/// The candidate state is the only thing that decides where the job goes.
/// Filters may replace it but never clear it; every replaced candidate is
/// kept and later appended to the job's history.
///
/// Election doesn't touch storage. Parameter writes requested here are queued
/// and written by the application transaction.
#[derive(Debug)]
pub struct ElectStateContext<'a> {
    context: &'a StateContext<'a>,
    candidate_state: State,
    current_state_name: Option<String>,
    traversed_states: Vec<State>,
    pending_parameters: BTreeMap<String, String>,
}

impl<'a> ElectStateContext<'a> {
    pub(crate) fn new(
        context: &'a StateContext<'a>,
        candidate_state: State,
        current_state_name: Option<&str>,
    ) -> Self {
        Self {
            context,
            candidate_state,
            current_state_name: current_state_name.map(str::to_string),
            traversed_states: Vec::new(),
            pending_parameters: BTreeMap::new(),
        }
    }

    /// The job's identifier.
    pub fn job_id(&self) -> &JobId {
        self.context.job_id()
    }

    /// The job's invocation, when it could be loaded.
    pub fn job(&self) -> Option<&Job> {
        self.context.job()
    }

    /// The state currently proposed as the destination.
    pub fn candidate_state(&self) -> &State {
        &self.candidate_state
    }

    /// Replaces the candidate state.
    pub fn set_candidate_state(&mut self, state: State) {
        let previous = std::mem::replace(&mut self.candidate_state, state);
        self.traversed_states.push(previous);
    }

    /// The name of the state the job is in now.
    pub fn current_state_name(&self) -> Option<&str> {
        self.current_state_name.as_deref()
    }

    /// Candidates that were replaced during this election, oldest first.
    pub fn traversed_states(&self) -> &[State] {
        &self.traversed_states
    }

    /// Reads a job parameter, including writes queued during this election.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.pending_parameters
            .get(name)
            .or_else(|| self.context.parameters().get(name))
            .map(String::as_str)
    }

    /// Queues a job parameter write for the application transaction.
    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.pending_parameters.insert(name.into(), value.into());
    }

    pub(crate) fn into_election(self) -> Election {
        Election {
            state: self.candidate_state,
            traversed_states: self.traversed_states,
            parameters: self.pending_parameters,
        }
    }
}

/// The outcome of an election.
#[derive(Debug)]
pub(crate) struct Election {
    pub(crate) state: State,
    pub(crate) traversed_states: Vec<State>,
    pub(crate) parameters: BTreeMap<String, String>,
}

/// Context handed to state handlers and apply filters.
///
/// Built once election has finished; the new state is the committed decision
/// and can't change anymore.
#[derive(Debug)]
pub struct ApplyStateContext<'a> {
    context: &'a StateContext<'a>,
    new_state: State,
    old_state_name: Option<String>,
    job_expiration_timeout: Duration,
}

impl<'a> ApplyStateContext<'a> {
    /// Creates a context applying `new_state` to the job of `context`.
    pub fn new(
        context: &'a StateContext<'a>,
        new_state: State,
        old_state_name: Option<&str>,
        job_expiration_timeout: Duration,
    ) -> Self {
        Self {
            context,
            new_state,
            old_state_name: old_state_name.map(str::to_string),
            job_expiration_timeout,
        }
    }

    /// The job's identifier.
    pub fn job_id(&self) -> &JobId {
        self.context.job_id()
    }

    /// The job's invocation, when it could be loaded.
    pub fn job(&self) -> Option<&Job> {
        self.context.job()
    }

    /// The storage connection the change goes through.
    pub fn connection(&self) -> &'a dyn StorageConnection {
        self.context.connection()
    }

    /// Job parameters as they were when the job was loaded.
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        self.context.parameters()
    }

    /// The elected state.
    pub fn new_state(&self) -> &State {
        &self.new_state
    }

    /// The name of the state the job leaves.
    pub fn old_state_name(&self) -> Option<&str> {
        self.old_state_name.as_deref()
    }

    /// How long a job in a final state is kept before it expires.
    pub fn job_expiration_timeout(&self) -> Duration {
        self.job_expiration_timeout
    }
}
