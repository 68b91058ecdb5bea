// src/dag/task_definition.rs

//! A single node of a job DAG.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{FormicaryError, Result};
use crate::types::error_code::{ERR_FATAL, ERR_RESTART_JOB, ERR_RESTART_TASK};
use crate::types::{RequestState, TaskMethod};

pub const MAX_TASK_TYPE_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Treat an explicit YAML `null` like a missing key.
///
/// Templated lines are stripped before structural parsing, which can leave
/// keys such as `script:` without a value.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Target of an `on_exit_code` edge.
///
/// Reserved labels are matched case-sensitively in upper case, so a task
/// named `completed` is still a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExitTarget {
    Task(String),
    /// The job fails hard; no retries.
    Fatal,
    /// Follow this task's own `COMPLETED` edge.
    Completed,
    /// Follow this task's own `FAILED` edge.
    Failed,
    /// Run the same task again.
    Executing,
    RestartJob,
    RestartTask,
    /// Fail the task with this error code.
    ErrorCode(String),
}

impl ExitTarget {
    pub fn task_name(&self) -> Option<&str> {
        match self {
            ExitTarget::Task(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_reserved(&self) -> bool {
        !matches!(self, ExitTarget::Task(_))
    }
}

impl From<String> for ExitTarget {
    fn from(raw: String) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "FATAL" => ExitTarget::Fatal,
            "COMPLETED" => ExitTarget::Completed,
            "FAILED" => ExitTarget::Failed,
            "EXECUTING" => ExitTarget::Executing,
            "RESTART_JOB" => ExitTarget::RestartJob,
            "RESTART_TASK" => ExitTarget::RestartTask,
            code if code.starts_with("ERR_") => ExitTarget::ErrorCode(code.to_string()),
            name => ExitTarget::Task(name.to_string()),
        }
    }
}

impl From<&str> for ExitTarget {
    fn from(raw: &str) -> Self {
        ExitTarget::from(raw.to_string())
    }
}

impl From<ExitTarget> for String {
    fn from(target: ExitTarget) -> Self {
        target.to_string()
    }
}

impl fmt::Display for ExitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitTarget::Task(name) => f.write_str(name),
            ExitTarget::Fatal => f.write_str("FATAL"),
            ExitTarget::Completed => f.write_str("COMPLETED"),
            ExitTarget::Failed => f.write_str("FAILED"),
            ExitTarget::Executing => f.write_str("EXECUTING"),
            ExitTarget::RestartJob => f.write_str("RESTART_JOB"),
            ExitTarget::RestartTask => f.write_str("RESTART_TASK"),
            ExitTarget::ErrorCode(code) => f.write_str(code),
        }
    }
}

/// Definition of one task in a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_type: String,
    #[serde(default)]
    pub method: TaskMethod,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub always_run: bool,
    #[serde(
        default,
        with = "crate::types::duration::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: u32,
    #[serde(
        default,
        with = "crate::types::duration::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub delay_between_retries: Option<Duration>,
    /// Exit code or state label (upper-cased on load) -> next step.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "BTreeMap::is_empty")]
    pub on_exit_code: BTreeMap<String, ExitTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_completed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failed: Option<String>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, serde_json::Value>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub before_script: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub script: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub after_script: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Rendered per run; a value of `true` skips the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except: Option<String>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_job_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_job_version: Option<String>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub await_forked_tasks: Vec<String>,
    #[serde(skip)]
    pub task_order: usize,
}

impl TaskDefinition {
    pub fn new(task_type: impl Into<String>, method: TaskMethod) -> Self {
        Self {
            task_type: task_type.into(),
            method,
            ..Default::default()
        }
    }

    /// Normalise a freshly parsed task.
    ///
    /// - exit-code keys are upper-cased
    /// - tags are lower-cased
    /// - `on_completed` / `on_failed` are folded into `on_exit_code`
    /// - an `allow_failure` task without a `FAILED` edge follows its
    ///   `COMPLETED` edge on failure
    pub fn after_load(&mut self) {
        let edges = std::mem::take(&mut self.on_exit_code);
        self.on_exit_code = edges
            .into_iter()
            .map(|(code, target)| (code.trim().to_uppercase(), target))
            .collect();

        for tag in self.tags.iter_mut() {
            *tag = tag.trim().to_lowercase();
        }

        if let Some(next) = self.on_completed.as_deref().filter(|s| !s.trim().is_empty()) {
            self.on_exit_code
                .insert(RequestState::Completed.to_string(), ExitTarget::from(next));
        }
        if let Some(next) = self.on_failed.as_deref().filter(|s| !s.trim().is_empty()) {
            self.on_exit_code
                .insert(RequestState::Failed.to_string(), ExitTarget::from(next));
        }

        if self.allow_failure {
            let failed = RequestState::Failed.to_string();
            if !self.on_exit_code.contains_key(&failed) {
                if let Some(target) = self.on_exit_code.get(RequestState::Completed.as_str()).cloned() {
                    self.on_exit_code.insert(failed, target);
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_type.trim().is_empty() {
            return Err(FormicaryError::Validation(
                "task_type is not specified".to_string(),
            ));
        }
        if self.task_type.len() > MAX_TASK_TYPE_LEN {
            return Err(FormicaryError::Validation(format!(
                "task_type '{}' is too long (max {MAX_TASK_TYPE_LEN})",
                self.task_type
            )));
        }
        if self.description.len() > MAX_DESCRIPTION_LEN {
            return Err(FormicaryError::Validation(format!(
                "description of task '{}' is too long (max {MAX_DESCRIPTION_LEN})",
                self.task_type
            )));
        }
        if self.method == TaskMethod::ForkJob
            && self.fork_job_type.as_deref().is_none_or(|t| t.trim().is_empty())
        {
            return Err(FormicaryError::Validation(format!(
                "fork_job_type is not specified for task '{}'",
                self.task_type
            )));
        }
        if self.method == TaskMethod::AwaitForkedJob && self.await_forked_tasks.is_empty() {
            return Err(FormicaryError::Validation(format!(
                "await_forked_tasks is not specified for task '{}'",
                self.task_type
            )));
        }
        Ok(())
    }

    /// Whether the task has any outgoing edge.
    pub fn has_next(&self) -> bool {
        !self.on_exit_code.is_empty()
    }

    /// Task names this task can hand over to.
    pub fn next_task_types(&self) -> impl Iterator<Item = &str> {
        self.on_exit_code.values().filter_map(ExitTarget::task_name)
    }

    /// Whether the rendered `except` flag says the task should be skipped.
    pub fn is_excepted(&self) -> bool {
        self.except
            .as_deref()
            .is_some_and(|e| e.trim().eq_ignore_ascii_case("true"))
    }

    /// Delay before the next attempt; a random 1-2s when not configured.
    pub fn delay_between_retries(&self) -> Duration {
        match self.delay_between_retries {
            Some(delay) if !delay.is_zero() => delay,
            _ => Duration::from_millis(rand::thread_rng().gen_range(1000..=2000)),
        }
    }

    /// Reported state and error code implied by an exit code whose edge is
    /// a reserved label, e.g. `on_exit_code: { "3": RESTART_JOB }`.
    pub fn override_status_and_error_code(
        &self,
        exit_code: &str,
    ) -> Option<(RequestState, Option<String>)> {
        let target = self.on_exit_code.get(&exit_code.trim().to_uppercase())?;
        match target {
            ExitTarget::Fatal => Some((RequestState::Failed, Some(ERR_FATAL.to_string()))),
            ExitTarget::Failed => Some((RequestState::Failed, None)),
            ExitTarget::Completed => Some((RequestState::Completed, None)),
            ExitTarget::Executing => Some((RequestState::Executing, None)),
            ExitTarget::RestartJob => {
                Some((RequestState::Failed, Some(ERR_RESTART_JOB.to_string())))
            }
            ExitTarget::RestartTask => {
                Some((RequestState::Failed, Some(ERR_RESTART_TASK.to_string())))
            }
            ExitTarget::ErrorCode(code) => Some((RequestState::Failed, Some(code.clone()))),
            ExitTarget::Task(_) => None,
        }
    }

    /// Exit code mapped to `FATAL`.
    pub fn is_fatal_exit(&self, exit_code: &str) -> bool {
        matches!(
            self.on_exit_code.get(&exit_code.trim().to_uppercase()),
            Some(ExitTarget::Fatal)
        )
    }

    /// Variables with secret-looking names masked for logging.
    pub fn masked_variables(&self) -> BTreeMap<String, String> {
        self.variables
            .iter()
            .map(|(k, v)| {
                let lower = k.to_lowercase();
                let masked = if lower.contains("secret")
                    || lower.contains("password")
                    || lower.contains("token")
                {
                    "****".to_string()
                } else {
                    v.to_string()
                };
                (k.clone(), masked)
            })
            .collect()
    }
}
