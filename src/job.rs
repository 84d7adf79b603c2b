//! Jobs describe a unit of work: which method to invoke and with what
//! arguments.
//!
//! A [`Job`] is an immutable value. It is owned by the caller until it's handed
//! to storage via [`Client::create`](crate::Client::create); from then on it's
//! referenced everywhere by its [`JobId`].
//!
//! Arguments are kept as opaque JSON. The typed side of an invocation lives in
//! [`Task`](crate::Task) implementations, which are resolved by name when a
//! worker performs the job.
//!
//! # Example
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use afoot::{task::Result as TaskResult, Job, Task};
//!
//! #[derive(Deserialize, Serialize)]
//! struct WelcomeEmail {
//!     user_id: i32,
//! }
//!
//! struct SendWelcomeEmail;
//!
//! impl Task for SendWelcomeEmail {
//!     const NAME: &'static str = "send-welcome-email";
//!
//!     type Input = WelcomeEmail;
//!
//!     async fn execute(&self, _input: Self::Input) -> TaskResult {
//!         Ok(())
//!     }
//! }
//!
//! let job = Job::for_task::<SendWelcomeEmail>(&WelcomeEmail { user_id: 42 })?;
//! assert_eq!(job.method(), "send-welcome-email");
//! # Ok::<(), serde_json::Error>(())
//! ```

use std::{fmt, ops::Deref};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{state::ConfigurationError, Task};

/// Name of the queue jobs are placed on when they don't name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Unique identifier of a job.
///
/// Identifiers are assigned by storage when a job is created. They're opaque,
/// non-empty strings; storage implementations may choose any format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Generates a new random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().as_hyphenated().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JobId {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(ConfigurationError::EmptyJobId);
        }

        Ok(Self(value))
    }
}

impl TryFrom<&str> for JobId {
    type Error = ConfigurationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl Deref for JobId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An invocation of a named method with JSON arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    method: String,
    args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    queue: Option<String>,
}

impl Job {
    /// Creates a job invoking `method` with the given arguments.
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            method: method.into(),
            args,
            queue: None,
        }
    }

    /// Creates a job for the task `T` from its typed input.
    pub fn for_task<T: Task>(input: &T::Input) -> Result<Self, serde_json::Error> {
        Ok(Self::new(T::NAME, serde_json::to_value(input)?))
    }

    /// Routes the job to the named queue instead of the default one.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// The name of the method this job invokes.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The arguments passed to the method.
    pub fn args(&self) -> &Value {
        &self.args
    }

    /// The queue this job is routed to.
    pub fn queue(&self) -> &str {
        self.queue.as_deref().unwrap_or(DEFAULT_QUEUE)
    }

    /// Encodes the invocation into its stored representation.
    pub fn encode(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Decodes an invocation previously produced by [`Job::encode`].
    ///
    /// Storage calls this when loading a job. A failure doesn't mean the job
    /// is gone: it's surfaced on [`JobData`](crate::storage::JobData) so the
    /// state machine can move the job to Failed.
    pub fn decode(value: &Value) -> Result<Self, JobLoadError> {
        let job: Job = serde_json::from_value(value.clone())?;
        if job.method.is_empty() {
            return Err(JobLoadError::MissingMethod);
        }

        Ok(job)
    }
}

/// Errors produced while decoding a stored invocation.
#[derive(Debug, thiserror::Error)]
pub enum JobLoadError {
    /// The stored invocation isn't valid for this version of the code.
    #[error("Could not decode the job invocation: {0}")]
    Decode(#[from] serde_json::Error),

    /// The stored invocation names no method.
    #[error("The job invocation does not name a method")]
    MissingMethod,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn job_id_rejects_empty_values() {
        assert!(JobId::try_from("").is_err());
        assert!(JobId::try_from("   ").is_err());
        assert_eq!(JobId::try_from("1").unwrap().as_str(), "1");
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(JobId::generate(), JobId::generate());
    }

    #[test]
    fn job_routes_to_default_queue() {
        let job = Job::new("send", json!([1, 2]));
        assert_eq!(job.queue(), DEFAULT_QUEUE);

        let job = job.on_queue("critical");
        assert_eq!(job.queue(), "critical");
    }

    #[test]
    fn decode_reports_malformed_invocations() {
        let err = Job::decode(&json!({ "args": [] })).unwrap_err();
        assert!(matches!(err, JobLoadError::Decode(_)));

        let err = Job::decode(&json!({ "method": "", "args": [] })).unwrap_err();
        assert!(matches!(err, JobLoadError::MissingMethod));
    }

    #[test]
    fn decode_accepts_encoded_jobs() -> Result<(), Box<dyn std::error::Error>> {
        let job = Job::new("send", json!({ "to": "ferris" })).on_queue("mail");
        assert_eq!(Job::decode(&job.encode()?)?, job);
        Ok(())
    }
}
