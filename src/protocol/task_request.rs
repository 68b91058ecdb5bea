// src/protocol/task_request.rs

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{FormicaryError, Result};
use crate::protocol::crypto;
use crate::protocol::executor_options::ExecutorOptions;

/// What the receiving ant should do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskAction {
    #[default]
    Execute,
    Cancel,
    TerminateContainer,
    ListContainers,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Execute => "EXECUTE",
            TaskAction::Cancel => "CANCEL",
            TaskAction::TerminateContainer => "TERMINATE_CONTAINER",
            TaskAction::ListContainers => "LIST_CONTAINERS",
        }
    }

    fn targets_task(&self) -> bool {
        matches!(self, TaskAction::Execute | TaskAction::Cancel)
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableValue {
    pub value: Value,
    #[serde(default)]
    pub secret: bool,
}

impl VariableValue {
    pub fn new(value: impl Into<Value>, secret: bool) -> Self {
        Self {
            value: value.into(),
            secret,
        }
    }
}

/// Fully materialised task sent from the scheduler to an ant.
///
/// A request is never changed after it was sent; a retry builds a new one
/// with the incremented retry counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub job_definition_id: String,
    pub job_request_id: Uuid,
    pub job_type: String,
    #[serde(default)]
    pub job_type_version: String,
    pub job_execution_id: Uuid,
    pub task_execution_id: Uuid,
    pub task_type: String,
    /// Echoed back in the response to match it to this attempt.
    pub co_relation_id: String,
    #[serde(default)]
    pub platform: String,
    pub action: TaskAction,
    #[serde(default)]
    pub job_retry: u32,
    #[serde(default)]
    pub task_retry: u32,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub before_script: Vec<String>,
    #[serde(default)]
    pub script: Vec<String>,
    #[serde(default)]
    pub after_script: Vec<String>,
    pub timeout: Duration,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableValue>,
    pub executor_opts: ExecutorOptions,
    /// Topic the ant replies on.
    #[serde(default)]
    pub response_topic: String,
}

impl TaskRequest {
    /// Key identifying the task within its job request.
    pub fn key(&self) -> String {
        task_key(self.job_request_id, &self.task_type)
    }

    /// Copy of this request that asks the ant to cancel it.
    pub fn to_cancel(&self) -> TaskRequest {
        TaskRequest {
            action: TaskAction::Cancel,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.action.targets_task() {
            return Ok(());
        }
        if self.job_request_id.is_nil() {
            return Err(invalid("job_request_id is not specified"));
        }
        if self.job_execution_id.is_nil() {
            return Err(invalid("job_execution_id is not specified"));
        }
        if self.task_execution_id.is_nil() {
            return Err(invalid("task_execution_id is not specified"));
        }
        if self.job_type.trim().is_empty() {
            return Err(invalid("job_type is not specified"));
        }
        if self.task_type.trim().is_empty() {
            return Err(invalid("task_type is not specified"));
        }
        if self.executor_opts.method.requires_script() && self.script.is_empty() {
            return Err(invalid(&format!(
                "script is not specified for {} task '{}'",
                self.executor_opts.method, self.task_type
            )));
        }
        self.executor_opts.validate()
    }

    /// JSON, sealed with AES-256-GCM when `secret` is non-empty.
    pub fn marshal(&self, secret: &str) -> Result<Vec<u8>> {
        self.validate()?;
        let json = serde_json::to_vec(self)?;
        if secret.is_empty() {
            return Ok(json);
        }
        crypto::seal(secret, &json)
    }

    pub fn unmarshal(secret: &str, payload: &[u8]) -> Result<Self> {
        let req: TaskRequest = if secret.is_empty() {
            serde_json::from_slice(payload)?
        } else {
            serde_json::from_slice(&crypto::open(secret, payload)?)?
        };
        req.validate()?;
        Ok(req)
    }
}

pub fn task_key(job_request_id: Uuid, task_type: &str) -> String {
    format!("{job_request_id}-{task_type}")
}

fn invalid(msg: &str) -> FormicaryError {
    FormicaryError::Protocol(format!("invalid task request: {msg}"))
}
