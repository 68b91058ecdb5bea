// src/execution/job_execution.rs

//! Runtime instance of one job request attempt.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dag::TaskDefinition;
use crate::errors::{FormicaryError, Result};
use crate::execution::context::{ContextEntry, ContextMap};
use crate::execution::job_request::JobRequest;
use crate::execution::task_execution::TaskExecution;
use crate::types::{RequestState, TaskMethod};

/// Tasks actually run for a request, in visit order, plus the job-wide
/// context.
///
/// `tasks` is the source of truth and `index` (task type -> position) is
/// rebuilt after every insertion or removal. There is at most one record
/// per task type; visiting a type again resets that record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: Uuid,
    pub job_request_id: Uuid,
    pub job_type: String,
    pub job_version: u32,
    pub job_state: RequestState,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    tasks: Vec<TaskExecution>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    contexts: ContextMap,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobExecution {
    pub fn new(request: &JobRequest, job_version: u32) -> Self {
        let now = Utc::now();
        let mut contexts = ContextMap::new();
        for (name, value) in request.params.iter() {
            contexts.add(name.clone(), value.clone(), false);
        }
        Self {
            id: Uuid::new_v4(),
            job_request_id: request.id,
            job_type: request.job_type.clone(),
            job_version,
            job_state: RequestState::Ready,
            error_code: None,
            error_message: None,
            tasks: Vec::new(),
            index: HashMap::new(),
            contexts,
            started_at: now,
            ended_at: None,
            updated_at: now,
        }
    }

    fn reindex(&mut self) {
        self.index = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.task_type.clone(), i))
            .collect();
    }

    /// Add a task run, or reset the existing run of the same type.
    pub fn add_task(&mut self, task: &TaskDefinition) -> &mut TaskExecution {
        let idx = match self.index.get(&task.task_type) {
            Some(&i) => {
                self.tasks[i].reset(task);
                i
            }
            None => {
                let order = self.tasks.iter().map(|t| t.task_order).max().unwrap_or(0) + 1;
                let mut exec = TaskExecution::new(self.id, task);
                exec.task_order = order;
                self.tasks.push(exec);
                self.reindex();
                self.tasks.len() - 1
            }
        };
        self.updated_at = Utc::now();
        &mut self.tasks[idx]
    }

    pub fn delete_task(&mut self, task_type: &str) -> bool {
        match self.index.get(task_type) {
            Some(&i) => {
                self.tasks.remove(i);
                self.reindex();
                true
            }
            None => false,
        }
    }

    pub fn get_task(&self, task_type: &str) -> Option<&TaskExecution> {
        self.index.get(task_type).map(|&i| &self.tasks[i])
    }

    pub fn get_task_mut(&mut self, task_type: &str) -> Option<&mut TaskExecution> {
        self.index.get(task_type).map(|&i| &mut self.tasks[i])
    }

    pub fn get_task_by_id(&self, id: Uuid) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn tasks(&self) -> &[TaskExecution] {
        &self.tasks
    }

    /// Most recently added task.
    pub fn get_last_task(&self) -> Option<&TaskExecution> {
        self.tasks.last()
    }

    /// Terminal task with the highest visit order.
    pub fn get_last_executed_task(&self) -> Option<&TaskExecution> {
        self.tasks
            .iter()
            .filter(|t| t.is_terminal())
            .max_by_key(|t| t.task_order)
    }

    /// First failed task that is not allowed to fail, in visit order.
    pub fn get_failed_task_error(&self) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| !t.allow_failure && t.failed())
    }

    pub fn set_state(&mut self, next: RequestState) -> Result<()> {
        if self.job_state == next {
            return Ok(());
        }
        if !self.job_state.can_transition_to(next) {
            return Err(FormicaryError::Validation(format!(
                "job execution {} cannot move from {} to {}",
                self.id, self.job_state, next
            )));
        }
        self.job_state = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.ended_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// End the execution in a terminal state with an optional error.
    pub fn finish(
        &mut self,
        state: RequestState,
        error_code: Option<String>,
        error_message: Option<String>,
    ) -> Result<()> {
        if state == RequestState::Completed && self.job_state.is_waiting() {
            self.set_state(RequestState::Executing)?;
        }
        self.set_state(state)?;
        self.error_code = error_code;
        self.error_message = error_message;
        Ok(())
    }

    /// Drop every task run and restart from scratch.
    pub fn hard_reset(&mut self) -> Result<()> {
        if self.job_state.is_terminal() {
            self.set_state(RequestState::Pending)?;
            self.set_state(RequestState::Ready)?;
        }
        self.tasks.clear();
        self.index.clear();
        self.error_code = None;
        self.error_message = None;
        self.ended_at = None;
        Ok(())
    }

    /// Reopen a terminal execution so the walk can continue from a failed task.
    pub fn reopen(&mut self) -> Result<()> {
        if self.job_state.is_terminal() {
            self.set_state(RequestState::Pending)?;
            self.set_state(RequestState::Ready)?;
        }
        self.error_code = None;
        self.error_message = None;
        self.ended_at = None;
        Ok(())
    }

    pub fn completed(&self) -> bool {
        self.job_state.completed()
    }

    pub fn failed(&self) -> bool {
        self.job_state.failed()
    }

    pub fn can_restart(&self) -> bool {
        self.job_state.can_restart()
    }

    pub fn can_cancel(&self) -> bool {
        self.job_state.can_cancel()
    }

    pub fn elapsed_secs_at(&self, now: DateTime<Utc>) -> i64 {
        let end = match self.ended_at {
            Some(end) if self.job_state != RequestState::Executing => end,
            _ => now,
        };
        (end - self.started_at).num_seconds().max(0)
    }

    /// Billed seconds: the larger of wall-clock time and the summed task
    /// costs.
    pub fn execution_cost_secs_at(&self, now: DateTime<Utc>) -> i64 {
        let wall = self.elapsed_secs_at(now);
        let tasks: i64 = self
            .tasks
            .iter()
            .map(|t| t.execution_cost_secs_at(now))
            .sum();
        wall.max(tasks)
    }

    pub fn execution_cost_secs(&self) -> i64 {
        self.execution_cost_secs_at(Utc::now())
    }

    /// Mean cost factor of the tasks run so far.
    pub fn cost_factor(&self) -> f64 {
        if self.tasks.is_empty() {
            return 0.0;
        }
        self.tasks.iter().map(|t| t.cost_factor).sum::<f64>() / self.tasks.len() as f64
    }

    pub fn methods(&self) -> BTreeSet<TaskMethod> {
        self.tasks.iter().map(|t| t.method).collect()
    }

    pub fn stdout(&self) -> Vec<String> {
        self.tasks.iter().flat_map(|t| t.stdout.iter().cloned()).collect()
    }

    pub fn add_context(&mut self, name: impl Into<String>, value: impl Into<Value>, secret: bool) {
        self.contexts.add(name, value, secret);
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
