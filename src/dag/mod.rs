// src/dag/mod.rs

//! Job graph model.
//!
//! - [`task_definition`] describes one node and its exit-code edges.
//! - [`job_definition`] owns the ordered task list, YAML loading and
//!   next-task resolution.
//! - [`validate`] enforces the structural rules (single root and sink,
//!   known targets, no cycles).
//! - [`dynamic`] renders a task's templated fragment for a specific run.
//! - [`graph`] is an adjacency view used for diagnostics.
//! - [`diagram`] renders Mermaid flowcharts.

pub mod diagram;
pub mod dynamic;
pub mod graph;
pub mod job_definition;
pub mod task_definition;
pub mod validate;

pub use graph::{Edge, TaskGraph};
pub use job_definition::{JobDefinition, NextTask};
pub use task_definition::{ExitTarget, TaskDefinition};
