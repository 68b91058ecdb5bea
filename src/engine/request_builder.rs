// src/engine/request_builder.rs

//! Materialise the [`TaskRequest`] sent to an ant for one task attempt.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::dag::{JobDefinition, TaskDefinition};
use crate::execution::{JobExecution, JobRequest};
use crate::protocol::{ExecutorOptions, TaskAction, TaskRequest, VariableValue};

/// Template data for rendering a dynamic task: job context (which starts
/// with the request parameters) plus the retry counters.
pub fn template_vars(
    request: &JobRequest,
    execution: &JobExecution,
    task_retry: u32,
) -> BTreeMap<String, Value> {
    let mut vars: BTreeMap<String, Value> = request.params.clone();
    for entry in execution.contexts().iter() {
        vars.insert(entry.name.clone(), entry.value.clone());
    }
    vars.insert("JobRetry".into(), Value::from(request.retried));
    vars.insert("TaskRetry".into(), Value::from(task_retry));
    vars
}

/// Inputs for one dispatch.
#[derive(Debug)]
pub struct TaskRequestParts<'a> {
    pub request: &'a JobRequest,
    pub execution: &'a JobExecution,
    pub definition: &'a JobDefinition,
    pub task: &'a TaskDefinition,
    pub opts: ExecutorOptions,
    pub task_retry: u32,
    pub timeout: Duration,
    pub co_relation_id: String,
    pub response_topic: &'a str,
}

pub fn build_task_request(parts: TaskRequestParts<'_>) -> TaskRequest {
    let TaskRequestParts {
        request,
        execution,
        definition,
        task,
        opts,
        task_retry,
        timeout,
        co_relation_id,
        response_topic,
    } = parts;

    let mut variables = BTreeMap::new();
    for (name, value) in definition.variables.iter().chain(task.variables.iter()) {
        variables.insert(name.clone(), VariableValue::new(value.clone(), false));
    }
    for entry in execution.contexts().iter() {
        variables.insert(
            entry.name.clone(),
            VariableValue::new(entry.value.clone(), entry.secret),
        );
    }

    let task_execution_id = execution
        .get_task(&task.task_type)
        .map(|t| t.id)
        .unwrap_or_default();

    let mut tags = definition.tags.clone();
    for tag in &task.tags {
        if !tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            tags.push(tag.clone());
        }
    }

    TaskRequest {
        user_id: request.user_id.clone(),
        organization_id: request.organization_id.clone(),
        job_definition_id: format!("{}:{}", definition.job_type, definition.version),
        job_request_id: request.id,
        job_type: definition.job_type.clone(),
        job_type_version: definition.version.to_string(),
        job_execution_id: execution.id,
        task_execution_id,
        task_type: task.task_type.clone(),
        co_relation_id,
        platform: request.platform.clone(),
        action: TaskAction::Execute,
        job_retry: request.retried,
        task_retry,
        allow_failure: task.allow_failure,
        tags,
        before_script: task.before_script.clone(),
        script: task.script.clone(),
        after_script: task.after_script.clone(),
        timeout,
        variables,
        executor_opts: opts,
        response_topic: response_topic.to_string(),
    }
}
