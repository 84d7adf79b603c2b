//! Tasks are the typed implementations behind job methods.
//!
//! A [`Job`](crate::Job) only names a method and carries JSON arguments. When
//! a worker performs the job, it resolves the method through a
//! [`TaskRegistry`] to the [`Task`] registered under that name, decodes the
//! arguments into the task's input type, and awaits its execute routine.
//!
//! # Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use afoot::{task::{Error as TaskError, TaskRegistry}, Task};
//!
//! #[derive(Debug, Deserialize, Serialize)]
//! struct Resize {
//!     image_key: String,
//!     width: u32,
//! }
//!
//! struct ResizeImage;
//!
//! impl Task for ResizeImage {
//!     const NAME: &'static str = "resize-image";
//!
//!     type Input = Resize;
//!
//!     async fn execute(&self, input: Self::Input) -> Result<(), TaskError> {
//!         println!("Resizing {} to {}px", input.image_key, input.width);
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = TaskRegistry::default();
//! registry.register(ResizeImage);
//! assert!(registry.contains("resize-image"));
//! ```

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

pub use self::retry_policy::{Builder as RetryPolicyBuilder, RetryPolicy};

mod retry_policy;

/// A type alias for task execution results.
pub type Result = std::result::Result<(), Error>;

/// Task errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `serde_json` crate when decoding task input.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// No task is registered under the job's method name.
    #[error("No task registered for method `{0}`")]
    NotRegistered(String),

    /// Error indicating the task failed; the job moves to the Failed state.
    #[error("{0}")]
    Generic(String),
}

/// A task which defines an input type and a function that is executed using
/// that type.
pub trait Task: Send + Sync + 'static {
    /// Stable method name jobs use to refer to this task.
    const NAME: &'static str;

    /// Type used by the executor.
    ///
    /// This is the structured form of a job's arguments.
    type Input: DeserializeOwned + Serialize + Send + 'static;

    /// Executes the task with the provided input.
    ///
    /// Returning an error moves the job to the Failed state, where election
    /// filters such as [`AutomaticRetry`](crate::state::AutomaticRetry) may
    /// redirect it to a retry.
    fn execute(&self, input: Self::Input) -> impl Future<Output = Result> + Send;
}

type ExecuteFuture<'a> = Pin<Box<dyn Future<Output = Result> + Send + 'a>>;

trait TaskHandler: Send + Sync {
    fn execute_json(&self, args: Value) -> ExecuteFuture<'_>;
}

struct RegisteredTask<T: Task> {
    inner: T,
}

impl<T: Task> TaskHandler for RegisteredTask<T> {
    fn execute_json(&self, args: Value) -> ExecuteFuture<'_> {
        Box::pin(async move {
            let input: T::Input = serde_json::from_value(args)?;
            self.inner.execute(input).await
        })
    }
}

/// Method table resolving job methods to registered tasks.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Registers a task under its [`Task::NAME`].
    ///
    /// Registering another task with the same name replaces the previous one.
    pub fn register<T: Task>(&mut self, task: T) -> &mut Self {
        self.handlers.insert(
            T::NAME.to_string(),
            Arc::new(RegisteredTask { inner: task }),
        );
        self
    }

    /// Returns true when a task is registered for `method`.
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Returns true if no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Decodes `args` and executes the task registered for `method`.
    pub async fn execute(&self, method: &str, args: Value) -> Result {
        let Some(handler) = self.handlers.get(method).cloned() else {
            return Err(Error::NotRegistered(method.to_string()));
        };

        handler.execute_json(args).await
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize, Serialize)]
    struct Message {
        message: String,
    }

    struct PrintTask;

    impl Task for PrintTask {
        const NAME: &'static str = "print";

        type Input = Message;

        async fn execute(&self, input: Self::Input) -> Result {
            if input.message == "fail" {
                return Err(Error::Generic("Task failed".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn execute_registered_task() {
        let mut registry = TaskRegistry::default();
        registry.register(PrintTask);

        let result = registry
            .execute("print", json!({ "message": "Hello, World!" }))
            .await;
        assert!(result.is_ok());

        let result = registry.execute("print", json!({ "message": "fail" })).await;
        assert!(matches!(result, Err(Error::Generic(_))));
    }

    #[tokio::test]
    async fn execute_with_malformed_input() {
        let mut registry = TaskRegistry::default();
        registry.register(PrintTask);

        let result = registry.execute("print", json!([1, 2, 3])).await;
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn execute_unknown_method() {
        let registry = TaskRegistry::default();
        assert!(registry.is_empty());

        let result = registry.execute("missing", json!(null)).await;
        assert!(matches!(result, Err(Error::NotRegistered(method)) if method == "missing"));
    }
}
