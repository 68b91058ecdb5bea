// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! [`CoreRuntime`] consumes [`RuntimeEvent`]s and produces:
//! - an updated set of job runs
//! - a list of [`CoreCommand`]s describing what the IO shell should do next
//!
//! The async shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels
//! - handing dispatch/cancel requests to the backend
//! - turning `ScheduleTimer` commands into delayed events
//!
//! The core has no channels, no Tokio types and performs no IO, so whole
//! job walks can be unit tested by feeding it events.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use uuid::Uuid;

use crate::dag::{JobDefinition, TaskDefinition};
use crate::engine::event_handlers::{CoreCommand, CoreStep};
use crate::engine::{RuntimeEvent, RuntimeOptions};
use crate::execution::{JobExecution, JobRequest};
use crate::protocol::{ExecutorOptions, TaskRequest};
use crate::resource::{AntReservation, ResourceManager};
use crate::types::{ErrorClassifier, RequestState};

/// A request handed to the backend and not yet answered.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub task: Box<TaskDefinition>,
    pub request: Box<TaskRequest>,
    pub reservation: AntReservation,
}

impl InFlight {
    pub fn co_relation_id(&self) -> &str {
        &self.request.co_relation_id
    }
}

/// What the single active position of a job walk is doing.
#[derive(Debug, Default)]
pub(crate) enum Slot {
    #[default]
    Idle,
    /// Rendered task waiting for an ant with spare capacity.
    Reserving {
        task: Box<TaskDefinition>,
        opts: Box<ExecutorOptions>,
    },
    InFlight(InFlight),
    /// `AWAIT_FORKED_JOB` task waiting for its child jobs.
    Awaiting { task_type: String },
    RetryWait { task_type: String },
    JobRetryWait { task_type: String },
}

#[derive(Debug)]
pub(crate) enum Phase {
    Walking,
    /// The outcome is decided; remaining `always_run` tasks are run one by
    /// one before the job is finalised.
    WindingDown {
        state: RequestState,
        error_code: Option<String>,
        error_message: Option<String>,
        queue: VecDeque<String>,
    },
}

#[derive(Debug)]
pub(crate) struct JobRun {
    pub request: JobRequest,
    pub definition: Arc<JobDefinition>,
    pub execution: JobExecution,
    pub phase: Phase,
    pub slot: Slot,
    /// Bumped whenever the slot changes so stale retry timers are ignored.
    pub seq: u64,
    pub dispatches: u64,
    /// Fork task type -> child job requests it started.
    pub forked: BTreeMap<String, Vec<Uuid>>,
}

impl JobRun {
    pub fn new(request: JobRequest, definition: Arc<JobDefinition>, execution: JobExecution) -> Self {
        Self {
            request,
            definition,
            execution,
            phase: Phase::Walking,
            slot: Slot::Idle,
            seq: 0,
            dispatches: 0,
            forked: BTreeMap::new(),
        }
    }

    pub fn is_walking(&self) -> bool {
        matches!(self.phase, Phase::Walking)
    }
}

/// Pure core runtime state.
///
/// Owns every active job run, the catalog of known job definitions (for
/// forked jobs) and a handle to the shared [`ResourceManager`].
#[derive(Debug)]
pub struct CoreRuntime {
    pub(crate) options: RuntimeOptions,
    pub(crate) resources: Arc<ResourceManager>,
    pub(crate) classifier: ErrorClassifier,
    pub(crate) definitions: HashMap<String, Arc<JobDefinition>>,
    pub(crate) jobs: HashMap<Uuid, JobRun>,
    /// Final states of forked jobs whose parent is still active.
    pub(crate) finished: HashMap<Uuid, RequestState>,
    submitted: usize,
}

impl CoreRuntime {
    pub fn new(
        options: RuntimeOptions,
        resources: Arc<ResourceManager>,
        classifier: ErrorClassifier,
    ) -> Self {
        Self {
            options,
            resources,
            classifier,
            definitions: HashMap::new(),
            jobs: HashMap::new(),
            finished: HashMap::new(),
            submitted: 0,
        }
    }

    /// Make a definition available to `FORK_JOB` tasks.
    pub fn register_definition(&mut self, definition: Arc<JobDefinition>) {
        self.definitions
            .insert(definition.job_type.clone(), definition);
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// No job is active.
    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn active_jobs(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.jobs.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Execution of an active job.
    pub fn execution(&self, request_id: Uuid) -> Option<&JobExecution> {
        self.jobs.get(&request_id).map(|run| &run.execution)
    }

    /// Final state of a forked job, kept until its parent finishes.
    pub fn finished_state(&self, request_id: Uuid) -> Option<RequestState> {
        self.finished.get(&request_id).copied()
    }

    pub(crate) fn record_finished(&mut self, request: &JobRequest, state: RequestState) {
        if request
            .parent_id
            .is_some_and(|parent| self.jobs.contains_key(&parent))
        {
            self.finished.insert(request.id, state);
        }
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        let mut commands = Vec::new();
        let mut keep_running = true;

        match event {
            RuntimeEvent::SubmitJob {
                request,
                definition,
            } => {
                self.submitted += 1;
                self.register_definition(definition.clone());
                self.start_job(request, definition, &mut commands);
            }
            RuntimeEvent::AntHeartbeat(registration) => {
                self.handle_heartbeat(registration, &mut commands)
            }
            RuntimeEvent::TaskDispatched {
                request_id,
                co_relation_id,
            } => self.handle_dispatched(request_id, &co_relation_id),
            RuntimeEvent::DispatchFailed {
                request_id,
                co_relation_id,
                reason,
            } => self.handle_dispatch_failed(request_id, &co_relation_id, &reason, &mut commands),
            RuntimeEvent::ResponseReceived { ant_id, payload } => {
                self.handle_response(&ant_id, &payload, &mut commands)
            }
            RuntimeEvent::TaskTimedOut {
                request_id,
                co_relation_id,
            } => self.handle_task_timeout(request_id, &co_relation_id, &mut commands),
            RuntimeEvent::JobTimedOut { request_id } => {
                self.handle_job_timeout(request_id, &mut commands)
            }
            RuntimeEvent::RetryDue {
                request_id,
                seq,
                kind,
            } => self.handle_retry(request_id, seq, kind, &mut commands),
            RuntimeEvent::CancelJob { request_id } => {
                self.handle_cancel(request_id, &mut commands)
            }
            RuntimeEvent::ReapTick { now } => self.handle_reap(now, &mut commands),
            RuntimeEvent::ShutdownRequested => {
                self.handle_shutdown(&mut commands);
                keep_running = false;
            }
        }

        if keep_running && self.options.exit_when_idle && self.submitted > 0 && self.is_idle() {
            commands.push(CoreCommand::RequestExit);
            keep_running = false;
        }

        CoreStep {
            commands,
            keep_running,
        }
    }
}
