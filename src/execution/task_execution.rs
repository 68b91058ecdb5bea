// src/execution/task_execution.rs

//! Runtime record of one task of a job execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dag::TaskDefinition;
use crate::errors::{FormicaryError, Result};
use crate::execution::context::{ContextEntry, ContextMap};
use crate::types::{RequestState, TaskMethod};

/// What an attempt produced, applied with [`TaskExecution::finish`].
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub state: RequestState,
    pub exit_code: Option<String>,
    pub exit_message: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub failed_command: Option<String>,
    pub cost_factor: f64,
    pub count_services: u32,
    pub stdout: Vec<String>,
    pub artifacts: Vec<String>,
    pub contexts: Vec<(String, Value)>,
}

impl TaskOutcome {
    pub fn completed() -> Self {
        Self {
            state: RequestState::Completed,
            ..Default::default()
        }
    }

    pub fn failed(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            state: RequestState::Failed,
            error_code: Some(error_code.into()),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn cancelled(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            state: RequestState::Cancelled,
            ..Self::failed(error_code, message)
        }
    }

    pub fn with_exit_code(mut self, exit_code: impl Into<String>) -> Self {
        self.exit_code = Some(exit_code.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub job_execution_id: Uuid,
    pub task_type: String,
    pub method: TaskMethod,
    pub task_state: RequestState,
    pub allow_failure: bool,
    pub task_order: usize,
    pub exit_code: Option<String>,
    pub exit_message: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub failed_command: Option<String>,
    pub ant_id: Option<String>,
    pub ant_host: Option<String>,
    pub retried: u32,
    pub cost_factor: f64,
    pub count_services: u32,
    /// Cost of earlier attempts of this task.
    pub previous_cost_secs: i64,
    pub stdout: Vec<String>,
    pub artifacts: Vec<String>,
    contexts: ContextMap,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskExecution {
    pub fn new(job_execution_id: Uuid, task: &TaskDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_execution_id,
            task_type: task.task_type.clone(),
            method: task.method,
            task_state: RequestState::Ready,
            allow_failure: task.allow_failure,
            task_order: 0,
            exit_code: None,
            exit_message: None,
            error_code: None,
            error_message: None,
            failed_command: None,
            ant_id: None,
            ant_host: None,
            retried: 0,
            cost_factor: 0.0,
            count_services: 0,
            previous_cost_secs: 0,
            stdout: Vec::new(),
            artifacts: Vec::new(),
            contexts: ContextMap::new(),
            started_at: now,
            ended_at: None,
            updated_at: now,
        }
    }

    pub fn set_state(&mut self, next: RequestState) -> Result<()> {
        if self.task_state == next {
            return Ok(());
        }
        if !self.task_state.can_transition_to(next) {
            return Err(FormicaryError::Validation(format!(
                "task {} cannot move from {} to {}",
                self.task_type, self.task_state, next
            )));
        }
        self.task_state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record that the request was handed to an ant.
    pub fn mark_executing(&mut self, ant_id: &str) -> Result<()> {
        self.set_state(RequestState::Executing)?;
        self.ant_id = Some(ant_id.to_string());
        Ok(())
    }

    /// Apply the outcome of the current attempt. A terminal task is never
    /// mutated again.
    pub fn finish(&mut self, outcome: TaskOutcome) -> Result<()> {
        if self.task_state.is_terminal() {
            return Err(FormicaryError::Validation(format!(
                "task {} is already {}",
                self.task_type, self.task_state
            )));
        }
        if !outcome.state.is_terminal() {
            return Err(FormicaryError::Validation(format!(
                "task {} cannot finish as {}",
                self.task_type, outcome.state
            )));
        }
        if self.task_state.is_waiting() && outcome.state == RequestState::Completed {
            self.set_state(RequestState::Executing)?;
        }
        self.set_state(outcome.state)?;

        self.exit_code = outcome.exit_code;
        self.exit_message = outcome.exit_message;
        self.error_code = outcome.error_code;
        self.error_message = outcome.error_message;
        self.failed_command = outcome.failed_command;
        self.cost_factor = outcome.cost_factor;
        self.count_services = outcome.count_services;
        self.stdout = outcome.stdout;
        self.artifacts = outcome.artifacts;
        for (name, value) in outcome.contexts {
            self.contexts.add(name, value, false);
        }
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Start the next attempt of a failed or cancelled task.
    pub fn begin_retry(&mut self) -> Result<()> {
        if !self.task_state.can_restart() {
            return Err(FormicaryError::Validation(format!(
                "task {} cannot be retried from {}",
                self.task_type, self.task_state
            )));
        }
        self.previous_cost_secs = self.execution_cost_secs();
        self.set_state(RequestState::Pending)?;
        self.set_state(RequestState::Ready)?;
        self.retried += 1;
        self.clear_attempt();
        Ok(())
    }

    /// Replace this record with a fresh attempt, keeping its order and the
    /// cost of what already ran. Used when the walk visits the task again.
    pub(crate) fn reset(&mut self, task: &TaskDefinition) {
        let previous = self.execution_cost_secs();
        let order = self.task_order;
        *self = TaskExecution::new(self.job_execution_id, task);
        self.task_order = order;
        self.previous_cost_secs = previous;
    }

    fn clear_attempt(&mut self) {
        let now = Utc::now();
        self.exit_code = None;
        self.exit_message = None;
        self.error_code = None;
        self.error_message = None;
        self.failed_command = None;
        self.ant_id = None;
        self.ant_host = None;
        self.stdout.clear();
        self.started_at = now;
        self.ended_at = None;
        self.updated_at = now;
    }

    pub fn completed(&self) -> bool {
        self.task_state.completed()
    }

    pub fn failed(&self) -> bool {
        self.task_state.failed()
    }

    pub fn is_terminal(&self) -> bool {
        self.task_state.is_terminal()
    }

    pub fn can_restart(&self) -> bool {
        self.task_state.can_restart()
    }

    pub fn can_cancel(&self) -> bool {
        self.task_state.can_cancel()
    }

    fn effective_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.ended_at {
            Some(end) if self.task_state != RequestState::Executing => end,
            _ => now,
        }
    }

    pub fn elapsed_secs_at(&self, now: DateTime<Utc>) -> i64 {
        (self.effective_end(now) - self.started_at).num_seconds().max(0)
    }

    /// `max(elapsed * cost_factor, elapsed)` plus earlier attempts; with no
    /// cost factor every service container is billed like the task itself.
    pub fn execution_cost_secs_at(&self, now: DateTime<Utc>) -> i64 {
        let elapsed = self.elapsed_secs_at(now);
        let scaled = (elapsed as f64 * self.cost_factor) as i64;
        let cost = scaled.max(elapsed) + self.previous_cost_secs;
        if self.cost_factor == 0.0 {
            return cost + i64::from(self.count_services) * cost;
        }
        cost.max(0)
    }

    pub fn execution_cost_secs(&self) -> i64 {
        self.execution_cost_secs_at(Utc::now())
    }

    pub fn add_context(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.contexts.add(name, value, false);
    }

    pub fn get_context(&self, name: &str) -> Option<&ContextEntry> {
        self.contexts.get(name)
    }

    pub fn delete_context(&mut self, name: &str) -> Option<ContextEntry> {
        self.contexts.delete(name)
    }

    pub fn contexts(&self) -> &ContextMap {
        &self.contexts
    }
}
