// src/resource/registration.rs

//! What an ant announces about itself, and the bindings the allocator
//! hands out against it.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{FormicaryError, Result};
use crate::types::{RequestState, TaskMethod};

/// One ant bound to one job request for one or more task types.
///
/// A task type is `READY` while only reserved and `EXECUTING` once the
/// request was handed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntAllocation {
    pub job_request_id: Uuid,
    pub task_types: BTreeMap<String, RequestState>,
    pub ant_id: String,
    pub ant_topic: String,
    pub allocated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AntAllocation {
    pub fn new(ant_id: &str, ant_topic: &str, job_request_id: Uuid, task_type: &str) -> Self {
        let now = Utc::now();
        let mut task_types = BTreeMap::new();
        task_types.insert(task_type.to_string(), RequestState::Ready);
        Self {
            job_request_id,
            task_types,
            ant_id: ant_id.to_string(),
            ant_topic: ant_topic.to_string(),
            allocated_at: now,
            updated_at: now,
        }
    }

    /// Number of task types currently bound.
    pub fn load(&self) -> usize {
        self.task_types.len()
    }
}

/// Heartbeat payload of a live ant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntRegistration {
    pub ant_id: String,
    pub ant_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    #[serde(default)]
    pub max_capacity: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub methods: Vec<TaskMethod>,
    #[serde(default)]
    pub current_load: u32,
    #[serde(default)]
    pub total_executed: u64,
    #[serde(default)]
    pub allocations: BTreeMap<Uuid, AntAllocation>,
    pub created_at: DateTime<Utc>,
    pub ant_started_at: DateTime<Utc>,
    /// When the scheduler last heard from the ant; set on receipt.
    #[serde(skip, default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl AntRegistration {
    pub fn new(ant_id: impl Into<String>, methods: Vec<TaskMethod>, max_capacity: u32) -> Self {
        let ant_id = ant_id.into();
        let now = Utc::now();
        Self {
            ant_topic: format!("ant-{ant_id}"),
            ant_id,
            encryption_key: None,
            max_capacity,
            tags: Vec::new(),
            methods,
            current_load: 0,
            total_executed: 0,
            allocations: BTreeMap::new(),
            created_at: now,
            ant_started_at: now,
            received_at: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ant_id.trim().is_empty() {
            return Err(FormicaryError::Validation(
                "ant_id is not specified for registration".to_string(),
            ));
        }
        if self.ant_topic.trim().is_empty() {
            return Err(FormicaryError::Validation(format!(
                "ant_topic is not specified for registration of {}",
                self.ant_id
            )));
        }
        if self.methods.is_empty() {
            return Err(FormicaryError::Validation(format!(
                "methods is not specified for registration of {}",
                self.ant_id
            )));
        }
        Ok(())
    }

    /// Capacity used for scheduling; an undeclared capacity counts as one.
    pub fn capacity(&self) -> u32 {
        self.max_capacity.max(1)
    }

    /// The ant runs `method` and carries every tag in `tags`.
    pub fn supports(&self, method: TaskMethod, tags: &[String]) -> bool {
        self.methods.contains(&method)
            && tags
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .all(|t| self.tags.iter().any(|own| own.eq_ignore_ascii_case(t)))
    }

    pub fn is_alive(&self, now: DateTime<Utc>, liveness: Duration) -> bool {
        let age = now.signed_duration_since(self.received_at);
        age.to_std().map(|age| age <= liveness).unwrap_or(true)
    }

    pub fn key(&self) -> String {
        let mut key = self.ant_id.clone();
        for tag in &self.tags {
            key.push_str(tag);
            key.push(':');
        }
        for method in &self.methods {
            key.push_str(method.as_str());
            key.push(':');
        }
        key
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    pub fn unmarshal(payload: &[u8]) -> Result<Self> {
        let registration: AntRegistration = serde_json::from_slice(payload)?;
        registration.validate()?;
        Ok(registration)
    }
}

/// Short-lived claim on one ant for one task, issued by
/// [`ResourceManager::reserve`](crate::resource::ResourceManager::reserve).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntReservation {
    pub job_request_id: Uuid,
    pub task_type: String,
    pub ant_id: String,
    pub ant_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    pub allocated_at: DateTime<Utc>,
    /// Load of the chosen ant including this reservation.
    pub current_load: u32,
    /// Outstanding bindings across every ant able to run this method/tags
    /// combination, including this one.
    pub total_reservations: u32,
}

impl AntReservation {
    pub fn validate(&self) -> Result<()> {
        if self.ant_id.is_empty() {
            return Err(FormicaryError::Validation(
                "ant_id is not specified for ant reservation".to_string(),
            ));
        }
        if self.ant_topic.is_empty() {
            return Err(FormicaryError::Validation(
                "ant_topic is not specified for ant reservation".to_string(),
            ));
        }
        Ok(())
    }
}
