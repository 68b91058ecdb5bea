// src/execution/job_request.rs

//! A user's request to run one job definition.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{FormicaryError, Result};
use crate::types::RequestState;

pub const MIN_PRIORITY: i32 = -1000;
pub const MAX_PRIORITY: i32 = 1000;

/// Submitted intent to run a job. Its state is only moved by the engine
/// while it walks the matching execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: Uuid,
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_version: Option<u32>,
    #[serde(default)]
    pub job_group: String,
    #[serde(default)]
    pub job_priority: i32,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: String,
    /// Set on jobs forked by a `FORK_JOB` task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_type: Option<String>,
    #[serde(default)]
    pub job_state: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_execution_id: Option<Uuid>,
    #[serde(default)]
    pub retried: u32,
    #[serde(default)]
    pub schedule_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl JobRequest {
    pub fn new(job_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            job_version: None,
            job_group: String::new(),
            job_priority: 0,
            platform: String::new(),
            user_id: String::new(),
            organization_id: String::new(),
            parent_id: None,
            parent_task_type: None,
            job_state: RequestState::Pending,
            job_execution_id: None,
            retried: 0,
            schedule_attempts: 0,
            error_code: None,
            error_message: None,
            params: BTreeMap::new(),
            scheduled_at: now,
            created_at: now,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.job_priority = priority;
        self
    }

    /// Request for a child job forked by `parent`'s task `task_type`.
    pub fn fork(parent: &JobRequest, job_type: impl Into<String>, task_type: &str) -> Self {
        let mut child = JobRequest::new(job_type);
        child.parent_id = Some(parent.id);
        child.parent_task_type = Some(task_type.to_string());
        child.job_group = parent.job_group.clone();
        child.job_priority = parent.job_priority;
        child.platform = parent.platform.clone();
        child.user_id = parent.user_id.clone();
        child.organization_id = parent.organization_id.clone();
        child.params = parent.params.clone();
        child
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_type.trim().is_empty() {
            return Err(FormicaryError::Validation(
                "job_type is not specified in job request".to_string(),
            ));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.job_priority) {
            return Err(FormicaryError::Validation(format!(
                "job priority {} is outside {MIN_PRIORITY}..={MAX_PRIORITY}",
                self.job_priority
            )));
        }
        Ok(())
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn set_state(&mut self, next: RequestState) -> Result<()> {
        if self.job_state == next {
            return Ok(());
        }
        if !self.job_state.can_transition_to(next) {
            return Err(FormicaryError::Validation(format!(
                "job request {} cannot move from {} to {}",
                self.id, self.job_state, next
            )));
        }
        self.job_state = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.job_state.is_terminal()
    }
}
