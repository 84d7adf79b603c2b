//! # Afoot
//!
//! 🏃 Self-healing background jobs driven by a transactional state machine.
//!
//! # Overview
//!
//! **Afoot** is a framework for running background jobs in Rust. Every job
//! moves through a lifecycle of named states (Enqueued, Processing,
//! Succeeded, Failed, and so on), and every move goes through one state
//! machine: filters decide where the job goes, handlers apply the side
//! effects of leaving the old state and entering the new one, and all of it
//! is committed to storage in a single transaction.
//!
//! Key Features:
//!
//! - **Transactional State Changes**: A job's new state and every side effect
//!   of entering it (queue insertion, schedule sets, counters) are committed
//!   together, so no reader ever sees one without the other.
//! - **Failures Become States**: Errors raised by tasks, filters or handlers
//!   move the job to Failed, carrying the error, instead of escaping to the
//!   caller.
//! - **Automatic Retries**: The [`AutomaticRetry`](state::AutomaticRetry)
//!   filter turns failures into delayed retries with exponential back-off.
//! - **Self-Healing Loops**: Workers, the scheduler and the watcher run in
//!   [`BackgroundExecution`](execution::BackgroundExecution) loops which
//!   retry infrastructure errors with back-off and throttle their logs.
//! - **Reliable Fetching**: Fetched jobs are checkpointed and requeued when
//!   their worker goes away, so jobs are performed at least once.
//! - **Pluggable Storage**: Storage is a set of traits;
//!   [`InMemoryStorage`](storage::InMemoryStorage) implements all of them.
//!
//! # Example
//!
//! ```rust
//! use std::{sync::Arc, time::Duration};
//!
//! use afoot::{storage::InMemoryStorage, task::Result as TaskResult, Job, Server, Task};
//! use serde::{Deserialize, Serialize};
//!
//! // This is the input we'll provide to the job when we enqueue it.
//! #[derive(Deserialize, Serialize)]
//! struct WelcomeEmail {
//!     user_id: i32,
//!     email: String,
//!     name: String,
//! }
//!
//! struct SendWelcomeEmail;
//!
//! impl Task for SendWelcomeEmail {
//!     const NAME: &'static str = "send-welcome-email";
//!
//!     type Input = WelcomeEmail;
//!
//!     async fn execute(&self, input: Self::Input) -> TaskResult {
//!         // Simulate sending an email.
//!         println!(
//!             "Sending welcome email to {} <{}> (user_id: {})",
//!             input.name, input.email, input.user_id
//!         );
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = InMemoryStorage::new();
//! let server = Server::builder(Arc::new(storage.clone()))
//!     .task(SendWelcomeEmail)
//!     .build()?;
//!
//! // Start processing enqueued jobs.
//! let handle = server.start()?;
//!
//! let job = Job::for_task::<SendWelcomeEmail>(&WelcomeEmail {
//!     user_id: 42,
//!     email: "ferris@example.com".to_string(),
//!     name: "Ferris".to_string(),
//! })?;
//! let job_id = server.client().enqueue(job).await?;
//!
//! while storage.state_of(&job_id).as_deref() != Some("Succeeded") {
//!     tokio::time::sleep(Duration::from_millis(10)).await;
//! }
//!
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Concepts
//!
//! - [Jobs](#jobs) name a method and carry its arguments.
//! - [Tasks](#tasks) implement methods.
//! - [States](#states) are the points of a job's lifecycle.
//! - [The state machine](#the-state-machine) moves jobs between states.
//! - [Workers](#workers) perform enqueued jobs.
//! - [Servers](#servers) run workers and their helpers in the background.
//!
//! ## Jobs
//!
//! A job is an invocation: a method name, JSON arguments and a queue. Once
//! created it's referred to by its [`JobId`].
//!
//! See [`job`] for more details about jobs.
//!
//! ## Tasks
//!
//! Tasks are the typed implementations behind job methods, registered by
//! name with a [`TaskRegistry`](task::TaskRegistry).
//!
//! See [`task`] for more details about tasks.
//!
//! ## States
//!
//! Built-in states cover the usual lifecycle and applications can add their
//! own. Handlers registered per state name apply and undo the side effects
//! of being in a state.
//!
//! See [`state`] for more details about states.
//!
//! ## The state machine
//!
//! [`StateMachine`] runs a state change through election filters, handlers
//! and apply filters in one transaction, falling back to Failed when any of
//! them errors.
//!
//! See [`state_machine`] for more details.
//!
//! ## Workers
//!
//! Workers fetch jobs from queues, move them to Processing, perform their
//! task and move them to Succeeded or Failed.
//!
//! See [`worker`] for more details about workers.
//!
//! ## Servers
//!
//! A [`Server`] runs a pool of workers along with the scheduler of delayed
//! jobs and the watcher of abandoned ones, all under one shutdown token.
//!
//! See [`server`] for more details about servers.

#![warn(clippy::all, nonstandard_style, future_incompatible, missing_docs)]

pub use crate::{
    client::Client,
    execution::{BackgroundExecution, ExecutionOptions, Health},
    job::{Job, JobId},
    server::{Server, ServerHandle},
    state::State,
    state_machine::StateMachine,
    task::Task,
    worker::{Worker, WorkerPool},
};

pub mod client;
pub mod dispatcher;
pub mod execution;
pub mod job;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod state_machine;
pub mod storage;
pub mod task;
pub mod watcher;
pub mod worker;

#[cfg(test)]
mod testing;

/// Errors returned by user-supplied handlers, filters and tasks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
