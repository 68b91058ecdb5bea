// src/execution/mod.rs

//! Live tracking of submitted jobs.
//!
//! - [`job_request`] is the user's submission.
//! - [`job_execution`] is one attempt at walking the job's graph.
//! - [`task_execution`] records each task visited during that walk.
//! - [`context`] holds the named values tasks pass to each other.

pub mod context;
pub mod job_execution;
pub mod job_request;
pub mod task_execution;

pub use context::{ContextEntry, ContextMap};
pub use job_execution::JobExecution;
pub use job_request::JobRequest;
pub use task_execution::{TaskExecution, TaskOutcome};
