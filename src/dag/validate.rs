// src/dag/validate.rs

//! Structural validation of a [`JobDefinition`].
//!
//! Checks run in a fixed order so a malformed graph always reports the same
//! problem first:
//! 1. every task validates on its own and task types are unique
//! 2. every edge target is non-empty and names a defined task
//! 3. exactly one root exists and every other task is reachable
//! 4. exactly one sink exists
//! 5. the graph has no cycles

use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::job_definition::JobDefinition;
use crate::dag::task_definition::ExitTarget;
use crate::errors::{FormicaryError, Result};

impl JobDefinition {
    pub fn validate(&self) -> Result<()> {
        if self.job_type.trim().is_empty() {
            return Err(FormicaryError::Validation(
                "job_type is not specified".to_string(),
            ));
        }
        if self.tasks().is_empty() {
            return Err(FormicaryError::Validation(format!(
                "job '{}' has no tasks",
                self.job_type
            )));
        }
        validate_tasks(self)?;
        validate_edge_targets(self)?;
        validate_reachability(self)?;
        validate_single_sink(self)?;
        validate_acyclic(self)?;
        Ok(())
    }
}

fn validate_tasks(job: &JobDefinition) -> Result<()> {
    let mut seen = HashSet::new();
    for task in job.tasks() {
        task.validate()?;
        if !seen.insert(task.task_type.as_str()) {
            return Err(FormicaryError::Validation(format!(
                "duplicate tasks of type {}",
                task.task_type
            )));
        }
    }
    Ok(())
}

fn validate_edge_targets(job: &JobDefinition) -> Result<()> {
    for task in job.tasks() {
        for (code, target) in task.on_exit_code.iter() {
            let ExitTarget::Task(name) = target else {
                continue;
            };
            if name.is_empty() {
                return Err(FormicaryError::Validation(format!(
                    "task '{}' has empty target for exit code {}",
                    task.task_type, code
                )));
            }
            if job.get_task(name).is_none() {
                return Err(FormicaryError::TaskNotFound(format!(
                    "task '{}' refers to '{}' for exit code {} but it's not defined",
                    task.task_type, name, code
                )));
            }
        }
        for fork in task.await_forked_tasks.iter() {
            if job.get_task(fork).is_none() {
                return Err(FormicaryError::TaskNotFound(format!(
                    "task '{}' awaits forked task '{}' but it's not defined",
                    task.task_type, fork
                )));
            }
        }
    }
    Ok(())
}

fn validate_reachability(job: &JobDefinition) -> Result<()> {
    let first = job.get_first_task()?;
    let targets = job.target_task_types();
    if let Some(orphan) = job
        .tasks()
        .iter()
        .find(|t| t.task_type != first.task_type && !targets.contains(t.task_type.as_str()))
    {
        return Err(FormicaryError::Validation(format!(
            "task '{}' is not reachable from '{}'",
            orphan.task_type, first.task_type
        )));
    }
    Ok(())
}

fn validate_single_sink(job: &JobDefinition) -> Result<()> {
    let sinks: Vec<&str> = job
        .tasks()
        .iter()
        .filter(|t| !t.has_next())
        .map(|t| t.task_type.as_str())
        .collect();
    match sinks.len() {
        0 => Err(FormicaryError::Validation(format!(
            "no leaf task found in job '{}'",
            job.job_type
        ))),
        1 => Ok(()),
        _ => Err(FormicaryError::Validation(format!(
            "multiple leaf tasks found in job '{}': {}",
            job.job_type,
            sinks.join(", ")
        ))),
    }
}

fn validate_acyclic(job: &JobDefinition) -> Result<()> {
    // Edge direction: task -> next task.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for task in job.tasks() {
        graph.add_node(task.task_type.as_str());
        for next in task.next_task_types() {
            graph.add_edge(task.task_type.as_str(), next, ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(FormicaryError::DagCycle(format!(
            "cycle detected in job '{}' involving task '{}'",
            job.job_type,
            cycle.node_id()
        ))),
    }
}
