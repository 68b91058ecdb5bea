// src/engine/mod.rs

//! Job orchestration engine.
//!
//! The engine walks each submitted job through its task graph:
//! - reserve an ant for the next task and dispatch its request
//! - consume the ant's response and resolve the next task
//! - retry failed tasks or whole jobs, time out stuck ones
//! - run `always_run` tasks while a job winds down
//!
//! The pure state machine lives in [`core`]; it consumes [`RuntimeEvent`]s
//! and returns [`CoreCommand`]s. The async shell that owns channels, timers
//! and the dispatch backend is [`runtime`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::dag::JobDefinition;
use crate::execution::JobRequest;
use crate::resource::AntRegistration;

/// What a delayed `RetryDue` event should retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Run the failed task again.
    Task,
    /// Try again to reserve an ant for a task that was never handed over.
    Redispatch,
    /// Restart the job.
    Job,
}

/// Engine limits and defaults.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub max_task_timeout: Duration,
    pub max_job_timeout: Duration,
    pub default_task_timeout: Duration,
    pub ants_unavailable_delay: Duration,
    /// Dispatch is delayed while the matching ant pool holds more
    /// reservations than this. Zero disables the check.
    pub saturation_backoff: u32,
    /// Stop the runtime once no job is active.
    pub exit_when_idle: bool,
    /// Fallback key for responses of ants without their own key.
    pub shared_secret: String,
    pub response_topic: String,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_task_timeout: Duration::from_secs(60 * 60),
            max_job_timeout: Duration::from_secs(6 * 60 * 60),
            default_task_timeout: Duration::from_secs(5 * 60),
            ants_unavailable_delay: Duration::from_secs(5),
            saturation_backoff: 0,
            exit_when_idle: true,
            shared_secret: String::new(),
            response_topic: "formicary-task-responses".to_string(),
        }
    }
}

impl RuntimeOptions {
    pub fn task_timeout(&self, declared: Option<Duration>) -> Duration {
        declared
            .filter(|t| !t.is_zero())
            .unwrap_or(self.default_task_timeout)
            .min(self.max_task_timeout)
    }

    pub fn job_timeout(&self, declared: Option<Duration>) -> Duration {
        declared
            .filter(|t| !t.is_zero())
            .unwrap_or(self.max_job_timeout)
            .min(self.max_job_timeout)
    }
}

/// Events flowing into the engine from ants, timers and the user.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    SubmitJob {
        request: JobRequest,
        definition: Arc<JobDefinition>,
    },
    AntHeartbeat(AntRegistration),
    /// The backend handed the request to the transport.
    TaskDispatched {
        request_id: Uuid,
        co_relation_id: String,
    },
    DispatchFailed {
        request_id: Uuid,
        co_relation_id: String,
        reason: String,
    },
    /// Raw, possibly sealed, response published by `ant_id`.
    ResponseReceived { ant_id: String, payload: Vec<u8> },
    TaskTimedOut {
        request_id: Uuid,
        co_relation_id: String,
    },
    JobTimedOut { request_id: Uuid },
    RetryDue {
        request_id: Uuid,
        seq: u64,
        kind: RetryKind,
    },
    CancelJob { request_id: Uuid },
    /// Periodic liveness sweep of ants and reservations.
    ReapTick { now: DateTime<Utc> },
    ShutdownRequested,
}

pub mod core;
pub mod event_handlers;
pub mod lifecycle;
pub mod request_builder;
pub mod runtime;

pub use core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep, JobReport};
pub use lifecycle::ProcessLifecycle;
pub use runtime::{RunSummary, Runtime};
