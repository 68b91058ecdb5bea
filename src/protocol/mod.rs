// src/protocol/mod.rs

//! Messages exchanged between the scheduler and ants.
//!
//! Requests and responses travel as JSON. When a shared secret is configured
//! the JSON is sealed with AES-256-GCM (see [`crypto`]).

pub mod crypto;
pub mod executor_options;
pub mod task_request;
pub mod task_response;

pub use executor_options::{ExecutorOptions, Volumes};
pub use task_request::{task_key, TaskAction, TaskRequest, VariableValue};
pub use task_response::{TaskResponse, Timings};
