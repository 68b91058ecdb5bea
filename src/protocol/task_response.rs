// src/protocol/task_response.rs

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{FormicaryError, Result};
use crate::protocol::crypto;
use crate::protocol::task_request::TaskRequest;
use crate::types::RequestState;

/// Per-stage timestamps recorded by the ant while running a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pod_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pre_script_finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependent_artifacts_downloaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub script_finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub post_script_finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifacts_uploaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pod_shutdown_at: Option<DateTime<Utc>>,
}

fn between(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Duration {
    match (from, to) {
        (Some(from), Some(to)) => to.signed_duration_since(from).to_std().unwrap_or_default(),
        _ => Duration::ZERO,
    }
}

impl Timings {
    pub fn received(now: DateTime<Utc>) -> Self {
        Self {
            received_at: Some(now),
            ..Self::default()
        }
    }

    pub fn pod_startup(&self) -> Duration {
        between(self.received_at, self.pod_started_at)
    }

    pub fn pre_script(&self) -> Duration {
        between(self.pod_started_at, self.pre_script_finished_at)
    }

    pub fn dependent_artifacts(&self) -> Duration {
        between(self.pre_script_finished_at, self.dependent_artifacts_downloaded_at)
    }

    pub fn script(&self) -> Duration {
        between(
            self.dependent_artifacts_downloaded_at
                .or(self.pre_script_finished_at),
            self.script_finished_at,
        )
    }

    pub fn post_script(&self) -> Duration {
        between(self.script_finished_at, self.post_script_finished_at)
    }

    pub fn artifacts_upload(&self) -> Duration {
        between(self.post_script_finished_at, self.artifacts_uploaded_at)
    }

    pub fn pod_shutdown(&self) -> Duration {
        between(
            self.artifacts_uploaded_at.or(self.post_script_finished_at),
            self.pod_shutdown_at,
        )
    }
}

impl fmt::Display for Timings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "startup={:?} pre={:?} deps={:?} script={:?} post={:?} upload={:?} shutdown={:?}",
            self.pod_startup(),
            self.pre_script(),
            self.dependent_artifacts(),
            self.script(),
            self.post_script(),
            self.artifacts_upload(),
            self.pod_shutdown()
        )
    }
}

/// Outcome of a task, sent from the ant back to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub job_request_id: Uuid,
    pub task_execution_id: Uuid,
    pub job_type: String,
    #[serde(default)]
    pub job_type_version: String,
    pub task_type: String,
    pub co_relation_id: String,
    pub status: RequestState,
    #[serde(default)]
    pub ant_id: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub exit_code: String,
    #[serde(default)]
    pub exit_message: String,
    #[serde(default)]
    pub failed_command: String,
    #[serde(default)]
    pub task_context: BTreeMap<String, Value>,
    #[serde(default)]
    pub job_context: BTreeMap<String, Value>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub cost_factor: f64,
    #[serde(default)]
    pub timings: Timings,
}

impl TaskResponse {
    /// Response skeleton for `req`, in state `EXECUTING`.
    pub fn new(req: &TaskRequest) -> Self {
        Self {
            job_request_id: req.job_request_id,
            task_execution_id: req.task_execution_id,
            job_type: req.job_type.clone(),
            job_type_version: req.job_type_version.clone(),
            task_type: req.task_type.clone(),
            co_relation_id: req.co_relation_id.clone(),
            status: RequestState::Executing,
            ant_id: String::new(),
            host: String::new(),
            namespace: String::new(),
            tags: req.tags.clone(),
            error_message: String::new(),
            error_code: String::new(),
            exit_code: String::new(),
            exit_message: String::new(),
            failed_command: String::new(),
            task_context: BTreeMap::new(),
            job_context: BTreeMap::new(),
            artifacts: Vec::new(),
            warnings: Vec::new(),
            stdout: Vec::new(),
            cost_factor: req.executor_opts.cost_factor,
            timings: Timings::received(Utc::now()),
        }
    }

    pub fn add_context(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.task_context.insert(name.into(), value.into());
    }

    pub fn add_job_context(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.job_context.insert(name.into(), value.into());
    }

    /// Record an error raised while running the task.
    ///
    /// The first fatal error fails the response and becomes its error
    /// message; later ones and non-fatal ones are kept as warnings.
    pub fn additional_error(&mut self, message: &str, fatal: bool) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }
        if fatal && self.status != RequestState::Failed {
            self.error_message = message.to_string();
            self.status = RequestState::Failed;
        } else {
            self.warnings.push(message.to_string());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_execution_id.is_nil() {
            return Err(invalid("task_execution_id is not specified"));
        }
        if self.job_type.trim().is_empty() {
            return Err(invalid("job_type is not specified"));
        }
        if self.task_type.trim().is_empty() {
            return Err(invalid("task_type is not specified"));
        }
        Ok(())
    }

    pub fn marshal(&self, secret: &str) -> Result<Vec<u8>> {
        self.validate()?;
        let json = serde_json::to_vec(self)?;
        if secret.is_empty() {
            return Ok(json);
        }
        crypto::seal(secret, &json)
    }

    pub fn unmarshal(secret: &str, payload: &[u8]) -> Result<Self> {
        let res: TaskResponse = if secret.is_empty() {
            serde_json::from_slice(payload)?
        } else {
            serde_json::from_slice(&crypto::open(secret, payload)?)?
        };
        res.validate()?;
        Ok(res)
    }
}

fn invalid(msg: &str) -> FormicaryError {
    FormicaryError::Protocol(format!("invalid task response: {msg}"))
}
