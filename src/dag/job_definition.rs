// src/dag/job_definition.rs

//! Job definition: an ordered arena of [`TaskDefinition`]s plus a name index,
//! and the next-task resolution used to walk it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::task_definition::{ExitTarget, TaskDefinition, null_as_default};
use crate::errors::{FormicaryError, Result};
use crate::types::{RequestState, TaskMethod};

/// Largest accepted YAML source.
pub const MAX_DEFINITION_BYTES: usize = 256 * 1024;

/// Result of [`JobDefinition::next_task`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NextTask<'a> {
    /// Run this task next (may be the same task for `EXECUTING`).
    Task(&'a TaskDefinition),
    /// The exit code mapped to `FATAL`: the job fails hard.
    Fatal,
    /// No outgoing edge matched; the walk ends here.
    None,
}

impl<'a> NextTask<'a> {
    pub fn task(&self) -> Option<&'a TaskDefinition> {
        match self {
            NextTask::Task(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawJobDefinition {
    job_type: String,
    #[serde(default)]
    version: u32,
    #[serde(default)]
    description: String,
    #[serde(default, with = "crate::types::duration::optional")]
    timeout: Option<Duration>,
    #[serde(default)]
    retry: u32,
    #[serde(default)]
    hard_reset_after_retries: u32,
    #[serde(default, with = "crate::types::duration::optional")]
    delay_between_retries: Option<Duration>,
    #[serde(default, deserialize_with = "null_as_default")]
    tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    variables: BTreeMap<String, serde_json::Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    tasks: Vec<TaskDefinition>,
}

/// A versioned DAG of tasks.
///
/// `tasks` is the source of truth; `index` maps task type to position and
/// is rebuilt after every mutation. Once loaded a definition is treated as
/// immutable and shared behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawJobDefinition")]
pub struct JobDefinition {
    pub job_type: String,
    pub version: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(with = "crate::types::duration::optional", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    pub retry: u32,
    pub hard_reset_after_retries: u32,
    #[serde(with = "crate::types::duration::optional", skip_serializing_if = "Option::is_none")]
    pub delay_between_retries: Option<Duration>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, serde_json::Value>,
    tasks: Vec<TaskDefinition>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    #[serde(skip)]
    raw_yaml: String,
}

impl From<RawJobDefinition> for JobDefinition {
    fn from(raw: RawJobDefinition) -> Self {
        let mut job = JobDefinition {
            job_type: raw.job_type,
            version: raw.version,
            description: raw.description,
            timeout: raw.timeout,
            retry: raw.retry,
            hard_reset_after_retries: raw.hard_reset_after_retries,
            delay_between_retries: raw.delay_between_retries,
            tags: raw.tags,
            variables: raw.variables,
            tasks: raw.tasks,
            index: HashMap::new(),
            raw_yaml: String::new(),
        };
        for task in job.tasks.iter_mut() {
            task.after_load();
        }
        job.reindex();
        job
    }
}

impl JobDefinition {
    pub fn new(job_type: impl Into<String>) -> Self {
        JobDefinition::from(RawJobDefinition {
            job_type: job_type.into(),
            ..Default::default()
        })
    }

    /// Parse and validate a YAML definition.
    ///
    /// Sources containing template markers are parsed structurally with the
    /// templated lines removed; the full source is kept for
    /// [`JobDefinition::dynamic_task`].
    pub fn from_yaml(source: &str) -> Result<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Err(FormicaryError::Validation("no input specified".to_string()));
        }
        if source.len() > MAX_DEFINITION_BYTES {
            return Err(FormicaryError::Validation(format!(
                "job definition is too big ({} bytes, max {MAX_DEFINITION_BYTES})",
                source.len()
            )));
        }

        let job_type_re = Regex::new(r"(?m)^\s*job_type:\s*\S+").map_err(anyhow::Error::from)?;
        if !job_type_re.is_match(source) {
            return Err(FormicaryError::Validation(
                "failed to find job_type in job definition".to_string(),
            ));
        }

        let mut job: JobDefinition = if uses_template(source) {
            serde_yaml::from_str(&strip_template_lines(source))?
        } else {
            serde_yaml::from_str(source)?
        };
        job.raw_yaml = source.to_string();
        job.validate()?;

        debug!(job_type = %job.job_type, tasks = job.tasks.len(), "loaded job definition");
        Ok(job)
    }

    /// Add a task, rejecting a duplicate task type.
    pub fn add_task(&mut self, mut task: TaskDefinition) -> Result<()> {
        if self.index.contains_key(&task.task_type) {
            return Err(FormicaryError::Validation(format!(
                "duplicate tasks of type {}",
                task.task_type
            )));
        }
        task.after_load();
        self.tasks.push(task);
        self.reindex();
        Ok(())
    }

    pub fn remove_task(&mut self, task_type: &str) -> Option<TaskDefinition> {
        let idx = *self.index.get(task_type)?;
        let removed = self.tasks.remove(idx);
        self.reindex();
        Some(removed)
    }

    /// Rebuild task order and the name index from the task list.
    ///
    /// On duplicate names the first task wins; validation reports the rest.
    fn reindex(&mut self) {
        self.index.clear();
        for (i, task) in self.tasks.iter_mut().enumerate() {
            task.task_order = i;
            self.index.entry(task.task_type.clone()).or_insert(i);
        }
    }

    pub fn tasks(&self) -> &[TaskDefinition] {
        &self.tasks
    }

    pub fn get_task(&self, task_type: &str) -> Option<&TaskDefinition> {
        self.index.get(task_type).map(|&i| &self.tasks[i])
    }

    pub fn raw_yaml(&self) -> &str {
        &self.raw_yaml
    }

    pub fn uses_template(&self) -> bool {
        uses_template(&self.raw_yaml)
    }

    /// All task types that appear as an edge target.
    pub(crate) fn target_task_types(&self) -> HashSet<&str> {
        self.tasks
            .iter()
            .flat_map(|t| t.next_task_types())
            .collect()
    }

    /// The unique root: not targeted by any edge, and either the only task
    /// or one with outgoing edges.
    pub fn get_first_task(&self) -> Result<&TaskDefinition> {
        let targets = self.target_task_types();
        self.tasks
            .iter()
            .find(|t| {
                !targets.contains(t.task_type.as_str()) && (self.tasks.len() == 1 || t.has_next())
            })
            .ok_or_else(|| FormicaryError::Validation("no first task found".to_string()))
    }

    /// The unique sink: the task without outgoing edges.
    pub fn get_last_task(&self) -> Option<&TaskDefinition> {
        let mut sinks = self.tasks.iter().filter(|t| !t.has_next());
        match (sinks.next(), sinks.next()) {
            (Some(last), None) => Some(last),
            _ => None,
        }
    }

    /// Tasks that must run during wind-down, in definition order.
    pub fn get_last_always_run_tasks(&self) -> Vec<&TaskDefinition> {
        self.tasks.iter().filter(|t| t.always_run).collect()
    }

    pub fn methods(&self) -> BTreeSet<TaskMethod> {
        self.tasks.iter().map(|t| t.method).collect()
    }

    pub fn delay_between_retries(&self) -> Duration {
        match self.delay_between_retries {
            Some(delay) if !delay.is_zero() => delay,
            _ => Duration::from_millis(rand::thread_rng().gen_range(1000..=2000)),
        }
    }

    /// Resolve what runs after `task` finished with `status` / `exit_code`.
    ///
    /// Order:
    /// 1. the literal exit code (a `COMPLETED`/`FAILED` target follows that
    ///    label's own edge, `EXECUTING` repeats the task, `FATAL` aborts)
    /// 2. the status label
    /// 3. the `COMPLETED` edge of an `allow_failure` task
    /// 4. nothing
    pub fn next_task(
        &self,
        task: &TaskDefinition,
        status: RequestState,
        exit_code: Option<&str>,
    ) -> Result<NextTask<'_>> {
        if !task.has_next() {
            return Ok(NextTask::None);
        }

        let code = exit_code
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty());
        if let Some(target) = code.as_deref().and_then(|c| task.on_exit_code.get(c)) {
            match target {
                ExitTarget::Task(name) => return self.resolve(task, name),
                ExitTarget::Fatal => return Ok(NextTask::Fatal),
                ExitTarget::Executing => return self.resolve(task, &task.task_type),
                ExitTarget::Completed | ExitTarget::Failed => {
                    let label = if *target == ExitTarget::Completed {
                        RequestState::Completed
                    } else {
                        RequestState::Failed
                    };
                    if let Some(ExitTarget::Task(name)) = task.on_exit_code.get(label.as_str()) {
                        return self.resolve(task, name);
                    }
                }
                ExitTarget::RestartJob | ExitTarget::RestartTask | ExitTarget::ErrorCode(_) => {}
            }
        }

        match task.on_exit_code.get(status.as_str()) {
            Some(ExitTarget::Task(name)) => return self.resolve(task, name),
            Some(ExitTarget::Fatal) => return Ok(NextTask::Fatal),
            _ => {}
        }

        if task.allow_failure {
            if let Some(ExitTarget::Task(name)) =
                task.on_exit_code.get(RequestState::Completed.as_str())
            {
                return self.resolve(task, name);
            }
        }

        debug!(
            task_type = %task.task_type,
            %status,
            exit_code = ?exit_code,
            "no next task matched"
        );
        Ok(NextTask::None)
    }

    fn resolve(&self, from: &TaskDefinition, name: &str) -> Result<NextTask<'_>> {
        self.get_task(name).map(NextTask::Task).ok_or_else(|| {
            FormicaryError::TaskNotFound(format!(
                "task '{}' refers to '{}' on-exit but it's not defined",
                from.task_type, name
            ))
        })
    }
}

pub(crate) fn uses_template(source: &str) -> bool {
    source.contains("{{") && source.contains("}}")
}

/// Drop every line carrying a template expression so the structure can be
/// parsed without rendering.
pub(crate) fn strip_template_lines(source: &str) -> String {
    source
        .lines()
        .filter(|line| !(line.contains("{{") && line.contains("}}")))
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
