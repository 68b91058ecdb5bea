// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.
//!
//! Every job walk has at most one active position (its [`Slot`]). A task
//! is rendered, an ant is reserved, the request is dispatched and the walk
//! only moves on once the matching terminal response arrived, the task
//! timed out or the job was aborted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dag::{JobDefinition, NextTask, TaskDefinition};
use crate::engine::core::{CoreRuntime, InFlight, JobRun, Phase, Slot};
use crate::engine::request_builder::{build_task_request, template_vars, TaskRequestParts};
use crate::engine::{RetryKind, RuntimeEvent};
use crate::errors::FormicaryError;
use crate::execution::{JobExecution, JobRequest, TaskOutcome};
use crate::protocol::{task_key, ExecutorOptions, TaskRequest, TaskResponse};
use crate::resource::{AntRegistration, AntReservation};
use crate::types::error_code::{
    ERR_ANTS_UNAVAILABLE, ERR_FATAL, ERR_INVALID_NEXT_TASK, ERR_JOB_CANCELLED, ERR_JOB_EXECUTE,
    ERR_JOB_TIMED_OUT, ERR_TASK_EXECUTE, ERR_TASK_TIMED_OUT, ERR_VALIDATION,
};
use crate::types::{ErrorCodeAction, RequestState, TaskMethod};

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Hand the request to the ant holding `reservation`.
    Dispatch {
        request: Box<TaskRequest>,
        reservation: AntReservation,
    },
    /// Ask the ant to stop a request it may still be running.
    Cancel {
        request: Box<TaskRequest>,
        reservation: AntReservation,
    },
    /// Feed `event` back into the core after `delay`.
    ScheduleTimer {
        delay: Duration,
        event: Box<RuntimeEvent>,
    },
    JobFinished(Box<JobReport>),
    /// Request that the process exits (no job left with `exit_when_idle`).
    RequestExit,
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

/// Final request and execution of a finished job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub request: JobRequest,
    pub execution: JobExecution,
}

impl JobReport {
    pub fn state(&self) -> RequestState {
        self.execution.job_state
    }

    /// Task types in the order they were first visited.
    pub fn executed_tasks(&self) -> Vec<&str> {
        let mut tasks: Vec<_> = self.execution.tasks().iter().collect();
        tasks.sort_by_key(|t| t.task_order);
        tasks.into_iter().map(|t| t.task_type.as_str()).collect()
    }
}

fn schedule_retry(run: &mut JobRun, kind: RetryKind, delay: Duration, out: &mut Vec<CoreCommand>) {
    run.seq += 1;
    out.push(CoreCommand::ScheduleTimer {
        delay,
        event: Box::new(RuntimeEvent::RetryDue {
            request_id: run.request.id,
            seq: run.seq,
            kind,
        }),
    });
}

fn outcome_from_response(task: &TaskDefinition, response: TaskResponse) -> TaskOutcome {
    let mut state = response.status;
    let mut error_code = Some(response.error_code).filter(|c| !c.is_empty());
    if !response.exit_code.is_empty() {
        if let Some((overridden, code)) = task.override_status_and_error_code(&response.exit_code) {
            if overridden.is_terminal() {
                state = overridden;
            }
            if code.is_some() {
                error_code = code;
            }
        }
    }

    let (error_code, error_message) = if state.completed() {
        (None, None)
    } else {
        let message = Some(response.error_message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("task exited with code '{}'", response.exit_code));
        (error_code, Some(message))
    };

    TaskOutcome {
        state,
        exit_code: Some(response.exit_code).filter(|c| !c.is_empty()),
        exit_message: Some(response.exit_message).filter(|m| !m.is_empty()),
        error_code,
        error_message,
        failed_command: Some(response.failed_command).filter(|c| !c.is_empty()),
        cost_factor: response.cost_factor,
        count_services: 0,
        stdout: response.stdout,
        artifacts: response.artifacts,
        contexts: response.task_context.into_iter().collect(),
    }
}

impl CoreRuntime {
    pub(crate) fn start_job(
        &mut self,
        mut request: JobRequest,
        definition: Arc<JobDefinition>,
        out: &mut Vec<CoreCommand>,
    ) {
        let request_id = request.id;
        let mut execution = JobExecution::new(&request, definition.version);
        request.job_execution_id = Some(execution.id);

        let started = request
            .validate()
            .and_then(|_| request.set_state(RequestState::Ready))
            .and_then(|_| request.set_state(RequestState::Executing))
            .and_then(|_| execution.set_state(RequestState::Executing));
        if let Err(err) = started {
            warn!(request_id = %request_id, error = %err, "rejecting job request");
            self.reject(request, execution, err.to_string(), out);
            return;
        }

        info!(
            request_id = %request_id,
            job_type = %definition.job_type,
            parent = ?request.parent_id,
            "starting job"
        );
        out.push(CoreCommand::ScheduleTimer {
            delay: self.options.job_timeout(definition.timeout),
            event: Box::new(RuntimeEvent::JobTimedOut { request_id }),
        });

        let first = definition.get_first_task().map(|t| t.task_type.clone());
        self.jobs
            .insert(request_id, JobRun::new(request, definition, execution));
        match first {
            Ok(task_type) => self.schedule_task(request_id, &task_type, false, out),
            Err(err) => self.fail_job(request_id, ERR_VALIDATION, err.to_string(), out),
        }
    }

    fn reject(
        &mut self,
        mut request: JobRequest,
        mut execution: JobExecution,
        message: String,
        out: &mut Vec<CoreCommand>,
    ) {
        let code = Some(ERR_VALIDATION.to_string());
        if let Err(err) = execution.finish(RequestState::Failed, code.clone(), Some(message.clone())) {
            debug!(error = %err, "execution of rejected job not finished cleanly");
        }
        request.job_state = RequestState::Failed;
        request.error_code = code;
        request.error_message = Some(message);
        self.record_finished(&request, RequestState::Failed);
        out.push(CoreCommand::JobFinished(Box::new(JobReport { request, execution })));
    }

    /// Visit `task_type`: render it, then dispatch, fork or await it.
    ///
    /// With `retry` the existing task record (already moved back to `READY`)
    /// is kept; otherwise the record is created or reset.
    pub(crate) fn schedule_task(
        &mut self,
        request_id: Uuid,
        task_type: &str,
        retry: bool,
        out: &mut Vec<CoreCommand>,
    ) {
        let Some(run) = self.jobs.get_mut(&request_id) else {
            return;
        };
        let definition = run.definition.clone();
        let Some(stored) = definition.get_task(task_type) else {
            self.fail_job(
                request_id,
                ERR_INVALID_NEXT_TASK,
                format!("task '{task_type}' is not defined"),
                out,
            );
            return;
        };
        if !retry {
            run.execution.add_task(stored);
        }
        let task_retry = run
            .execution
            .get_task(task_type)
            .map(|t| t.retried)
            .unwrap_or(0);
        let vars = template_vars(&run.request, &run.execution, task_retry);

        let (task, opts) = match definition.dynamic_task(task_type, &vars) {
            Ok(rendered) => rendered,
            Err(err) => {
                let message = format!("failed to render task '{task_type}': {err}");
                warn!(request_id = %request_id, task_type, error = %err, "failed to render task");
                if let Some(exec) = run.execution.get_task_mut(task_type) {
                    if let Err(err) = exec.finish(TaskOutcome::failed(ERR_VALIDATION, message.clone())) {
                        debug!(task_type, error = %err, "could not fail task record");
                    }
                }
                if run.is_walking() {
                    self.fail_job(request_id, ERR_VALIDATION, message, out);
                } else {
                    self.continue_wind_down(request_id, out);
                }
                return;
            }
        };

        if task.is_excepted() {
            info!(request_id = %request_id, task_type, "skipping excepted task");
            let mut outcome = TaskOutcome::completed();
            outcome.exit_message = Some("skipped".to_string());
            self.complete_task(request_id, task_type, outcome, out);
            return;
        }

        match task.method {
            TaskMethod::ForkJob => self.fork_job(request_id, task, opts, out),
            TaskMethod::AwaitForkedJob => {
                if let Some(exec) = run.execution.get_task_mut(task_type) {
                    if let Err(err) = exec.set_state(RequestState::Executing) {
                        debug!(task_type, error = %err, "await task not marked executing");
                    }
                }
                run.slot = Slot::Awaiting {
                    task_type: task_type.to_string(),
                };
                run.seq += 1;
                self.check_await(request_id, out);
            }
            _ => self.dispatch(request_id, Box::new(task), Box::new(opts), out),
        }
    }

    /// Reserve an ant and emit the dispatch for a rendered task.
    pub(crate) fn dispatch(
        &mut self,
        request_id: Uuid,
        task: Box<TaskDefinition>,
        opts: Box<ExecutorOptions>,
        out: &mut Vec<CoreCommand>,
    ) {
        let Some(run) = self.jobs.get_mut(&request_id) else {
            return;
        };
        run.dispatches += 1;
        let co_relation_id = format!(
            "{}-{}",
            task_key(request_id, &task.task_type),
            run.dispatches
        );
        let task_retry = run
            .execution
            .get_task(&task.task_type)
            .map(|t| t.retried)
            .unwrap_or(0);
        let timeout = self.options.task_timeout(task.timeout);
        let request = build_task_request(TaskRequestParts {
            request: &run.request,
            execution: &run.execution,
            definition: &run.definition,
            task: &task,
            opts: (*opts).clone(),
            task_retry,
            timeout,
            co_relation_id: co_relation_id.clone(),
            response_topic: &self.options.response_topic,
        });

        let reservation =
            match self
                .resources
                .reserve(request_id, &task.task_type, task.method, &request.tags)
            {
                Ok(reservation) => reservation,
                Err(err) if err.is_retryable() || matches!(err, FormicaryError::AlreadyAllocated(_)) => {
                    run.request.schedule_attempts += 1;
                    warn!(
                        request_id = %request_id,
                        task_type = %task.task_type,
                        attempts = run.request.schedule_attempts,
                        error = %err,
                        "no ant available; will retry"
                    );
                    run.slot = Slot::Reserving { task, opts };
                    schedule_retry(run, RetryKind::Redispatch, self.options.ants_unavailable_delay, out);
                    return;
                }
                Err(err) => {
                    let task_type = task.task_type.clone();
                    self.complete_task(
                        request_id,
                        &task_type,
                        TaskOutcome::failed(ERR_ANTS_UNAVAILABLE, err.to_string()),
                        out,
                    );
                    return;
                }
            };

        let saturation = self.options.saturation_backoff;
        if saturation > 0 && reservation.total_reservations > saturation {
            self.resources.release(&reservation);
            debug!(
                request_id = %request_id,
                task_type = %task.task_type,
                total_reservations = reservation.total_reservations,
                "ant pool saturated; delaying dispatch"
            );
            run.slot = Slot::Reserving { task, opts };
            schedule_retry(run, RetryKind::Redispatch, self.options.ants_unavailable_delay, out);
            return;
        }

        debug!(
            request_id = %request_id,
            task_type = %task.task_type,
            ant_id = %reservation.ant_id,
            co_relation_id = %co_relation_id,
            variables = ?task.masked_variables(),
            "dispatching task"
        );
        out.push(CoreCommand::Dispatch {
            request: Box::new(request.clone()),
            reservation: reservation.clone(),
        });
        out.push(CoreCommand::ScheduleTimer {
            delay: timeout,
            event: Box::new(RuntimeEvent::TaskTimedOut {
                request_id,
                co_relation_id,
            }),
        });
        run.slot = Slot::InFlight(InFlight {
            task,
            request: Box::new(request),
            reservation,
        });
        run.seq += 1;
    }

    fn fork_job(
        &mut self,
        request_id: Uuid,
        task: TaskDefinition,
        opts: ExecutorOptions,
        out: &mut Vec<CoreCommand>,
    ) {
        let Some(run) = self.jobs.get_mut(&request_id) else {
            return;
        };
        let child_type = opts.fork_job_type.clone().unwrap_or_default();
        let Some(child_definition) = self.definitions.get(&child_type).cloned() else {
            self.complete_task(
                request_id,
                &task.task_type,
                TaskOutcome::failed(
                    ERR_VALIDATION,
                    format!("job definition '{child_type}' to fork is not known"),
                ),
                out,
            );
            return;
        };

        let child = JobRequest::fork(&run.request, child_type.as_str(), &task.task_type);
        let child_id = child.id;
        run.forked
            .entry(task.task_type.clone())
            .or_default()
            .push(child_id);
        info!(
            request_id = %request_id,
            task_type = %task.task_type,
            child = %child_id,
            child_type = %child_type,
            "forking job"
        );

        let mut outcome = TaskOutcome::completed();
        outcome
            .contexts
            .push(("ForkedJobId".to_string(), Value::from(child_id.to_string())));
        self.start_job(child, child_definition, out);
        self.complete_task(request_id, &task.task_type, outcome, out);
    }

    /// Complete an awaiting task once every awaited child job is terminal.
    pub(crate) fn check_await(&mut self, request_id: Uuid, out: &mut Vec<CoreCommand>) {
        let Some(run) = self.jobs.get(&request_id) else {
            return;
        };
        let Slot::Awaiting { task_type } = &run.slot else {
            return;
        };
        let task_type = task_type.clone();
        let children: Vec<Uuid> = run
            .definition
            .get_task(&task_type)
            .map(|t| {
                t.await_forked_tasks
                    .iter()
                    .filter_map(|fork| run.forked.get(fork))
                    .flatten()
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        let mut failed = Vec::new();
        for child in &children {
            match self.finished.get(child) {
                None => {
                    debug!(request_id = %request_id, child = %child, "still waiting for forked job");
                    return;
                }
                Some(state) if !state.completed() => failed.push(child.to_string()),
                Some(_) => {}
            }
        }

        let outcome = if failed.is_empty() {
            TaskOutcome::completed()
        } else {
            TaskOutcome::failed(
                ERR_JOB_EXECUTE,
                format!("forked jobs failed: {}", failed.join(", ")),
            )
        };
        self.complete_task(request_id, &task_type, outcome, out);
    }

    /// Record the outcome of the active task and decide what happens next.
    pub(crate) fn complete_task(
        &mut self,
        request_id: Uuid,
        task_type: &str,
        outcome: TaskOutcome,
        out: &mut Vec<CoreCommand>,
    ) {
        let Some(run) = self.jobs.get_mut(&request_id) else {
            return;
        };
        run.slot = Slot::Idle;
        run.seq += 1;

        let state = outcome.state;
        let exit_code = outcome.exit_code.clone();
        let error_code = outcome.error_code.clone();
        let message = outcome.error_message.clone().unwrap_or_default();
        let retried = match run.execution.get_task_mut(task_type) {
            Some(exec) => {
                if let Err(err) = exec.finish(outcome) {
                    warn!(request_id = %request_id, task_type, error = %err, "could not record task outcome");
                }
                exec.retried
            }
            None => 0,
        };
        info!(
            request_id = %request_id,
            task_type,
            state = %state,
            exit_code = ?exit_code,
            "task finished"
        );

        if !run.is_walking() {
            self.continue_wind_down(request_id, out);
            return;
        }

        let definition = run.definition.clone();
        let Some(task) = definition.get_task(task_type) else {
            self.fail_job(
                request_id,
                ERR_INVALID_NEXT_TASK,
                format!("task '{task_type}' is not defined"),
                out,
            );
            return;
        };

        if state.completed() || task.allow_failure {
            if !state.completed() {
                warn!(request_id = %request_id, task_type, "task failed but allows failure; continuing");
            }
            self.advance(request_id, &definition, task, state, exit_code.as_deref(), out);
            return;
        }

        let mut classification =
            self.classifier
                .classify(task_type, exit_code.as_deref(), error_code.as_deref(), &message);
        if exit_code.as_deref().is_some_and(|c| task.is_fatal_exit(c)) {
            classification.action = ErrorCodeAction::HardFailure;
        }
        if let Some(exec) = run.execution.get_task_mut(task_type) {
            if exec.error_code.is_none() {
                exec.error_code = Some(classification.error_code.clone());
            }
        }
        let job_retries_left = run.request.retried < definition.retry;
        let job_delay = definition.delay_between_retries();

        match classification.action {
            ErrorCodeAction::HardFailure | ErrorCodeAction::SuspendJob => {}
            ErrorCodeAction::RetryTask if retried < task.retry => {
                let delay = task.delay_between_retries();
                info!(
                    request_id = %request_id,
                    task_type,
                    attempt = retried + 1,
                    delay = ?delay,
                    "retrying task"
                );
                run.slot = Slot::RetryWait {
                    task_type: task_type.to_string(),
                };
                schedule_retry(run, RetryKind::Task, delay, out);
                return;
            }
            ErrorCodeAction::RetryJob => {
                if job_retries_left {
                    info!(request_id = %request_id, task_type, delay = ?job_delay, "retrying job");
                    run.slot = Slot::JobRetryWait {
                        task_type: task_type.to_string(),
                    };
                    schedule_retry(run, RetryKind::Job, job_delay, out);
                    return;
                }
            }
            ErrorCodeAction::RetryTask => {
                match definition.next_task(task, RequestState::Failed, exit_code.as_deref()) {
                    Ok(NextTask::Task(next)) => {
                        self.schedule_task(request_id, &next.task_type, false, out);
                        return;
                    }
                    Ok(NextTask::Fatal) => {
                        self.fail_job(request_id, ERR_FATAL, message, out);
                        return;
                    }
                    Ok(NextTask::None) | Err(_) => {}
                }
                if job_retries_left {
                    if let Some(run) = self.jobs.get_mut(&request_id) {
                        info!(request_id = %request_id, task_type, delay = ?job_delay, "retrying job");
                        run.slot = Slot::JobRetryWait {
                            task_type: task_type.to_string(),
                        };
                        schedule_retry(run, RetryKind::Job, job_delay, out);
                    }
                    return;
                }
            }
        }

        let message = if message.is_empty() {
            format!("task '{task_type}' failed")
        } else {
            message
        };
        self.fail_job(request_id, &classification.error_code, message, out);
    }

    fn advance(
        &mut self,
        request_id: Uuid,
        definition: &JobDefinition,
        task: &TaskDefinition,
        state: RequestState,
        exit_code: Option<&str>,
        out: &mut Vec<CoreCommand>,
    ) {
        match definition.next_task(task, state, exit_code) {
            Ok(NextTask::Task(next)) => self.schedule_task(request_id, &next.task_type, false, out),
            Ok(NextTask::Fatal) => self.fail_job(
                request_id,
                ERR_FATAL,
                format!("task '{}' exited with a fatal code", task.task_type),
                out,
            ),
            Ok(NextTask::None) => self.finish_walk(request_id, out),
            Err(err) => self.fail_job(request_id, ERR_INVALID_NEXT_TASK, err.to_string(), out),
        }
    }

    /// The walk reached a task without successor. The job failed if any
    /// task that may not fail did.
    fn finish_walk(&mut self, request_id: Uuid, out: &mut Vec<CoreCommand>) {
        let Some(run) = self.jobs.get(&request_id) else {
            return;
        };
        let failure = run.execution.get_failed_task_error().map(|t| {
            (
                t.error_code.clone().unwrap_or_else(|| ERR_TASK_EXECUTE.to_string()),
                t.error_message
                    .clone()
                    .unwrap_or_else(|| format!("task '{}' failed", t.task_type)),
            )
        });
        match failure {
            Some((code, message)) => {
                self.begin_wind_down(request_id, RequestState::Failed, Some(code), Some(message), None, out)
            }
            None => self.begin_wind_down(request_id, RequestState::Completed, None, None, None, out),
        }
    }

    pub(crate) fn fail_job(
        &mut self,
        request_id: Uuid,
        error_code: &str,
        message: String,
        out: &mut Vec<CoreCommand>,
    ) {
        self.begin_wind_down(
            request_id,
            RequestState::Failed,
            Some(error_code.to_string()),
            Some(message),
            None,
            out,
        );
    }

    /// Queue every always-run task not yet run to completion and start
    /// running them. `interrupted` names an always-run task stopped by the
    /// abort that started the wind-down; it is run again.
    fn begin_wind_down(
        &mut self,
        request_id: Uuid,
        state: RequestState,
        error_code: Option<String>,
        error_message: Option<String>,
        interrupted: Option<String>,
        out: &mut Vec<CoreCommand>,
    ) {
        let Some(run) = self.jobs.get_mut(&request_id) else {
            return;
        };
        if !run.is_walking() {
            return;
        }
        let queue: VecDeque<String> = run
            .definition
            .tasks()
            .iter()
            .filter(|t| t.always_run)
            .filter(|t| {
                interrupted.as_deref() == Some(t.task_type.as_str())
                    || run
                        .execution
                        .get_task(&t.task_type)
                        .is_none_or(|exec| !exec.is_terminal())
            })
            .map(|t| t.task_type.clone())
            .collect();

        if state.completed() {
            info!(request_id = %request_id, always_run = queue.len(), "job walk completed");
        } else {
            warn!(
                request_id = %request_id,
                state = %state,
                error_code = ?error_code,
                error = ?error_message,
                always_run = queue.len(),
                "job stopping"
            );
        }
        run.phase = Phase::WindingDown {
            state,
            error_code,
            error_message,
            queue,
        };
        self.continue_wind_down(request_id, out);
    }

    fn continue_wind_down(&mut self, request_id: Uuid, out: &mut Vec<CoreCommand>) {
        let Some(run) = self.jobs.get_mut(&request_id) else {
            return;
        };
        let Phase::WindingDown { queue, .. } = &mut run.phase else {
            return;
        };
        match queue.pop_front() {
            Some(task_type) => {
                debug!(request_id = %request_id, task_type = %task_type, "running always_run task");
                self.schedule_task(request_id, &task_type, false, out);
            }
            None => self.finalize(request_id, out),
        }
    }

    fn finalize(&mut self, request_id: Uuid, out: &mut Vec<CoreCommand>) {
        let Some(mut run) = self.jobs.remove(&request_id) else {
            return;
        };
        let (state, error_code, error_message) = match &run.phase {
            Phase::WindingDown {
                state,
                error_code,
                error_message,
                ..
            } => (*state, error_code.clone(), error_message.clone()),
            Phase::Walking => (RequestState::Completed, None, None),
        };

        if let Err(err) = run
            .execution
            .finish(state, error_code.clone(), error_message.clone())
        {
            warn!(request_id = %request_id, error = %err, "could not finish job execution");
        }
        if let Err(err) = run.request.set_state(state) {
            warn!(request_id = %request_id, error = %err, "could not finish job request");
        }
        run.request.error_code = error_code;
        run.request.error_message = error_message;

        let released = self.resources.release_job(request_id);
        self.record_finished(&run.request, state);
        for child in run.forked.values().flatten() {
            self.finished.remove(child);
        }
        info!(
            request_id = %request_id,
            job_type = %run.request.job_type,
            state = %state,
            released,
            cost_secs = run.execution.execution_cost_secs(),
            "job finished"
        );

        let children: Vec<Uuid> = run
            .forked
            .values()
            .flatten()
            .copied()
            .filter(|child| self.jobs.contains_key(child))
            .collect();
        let parent = run.request.parent_id;
        out.push(CoreCommand::JobFinished(Box::new(JobReport {
            request: run.request,
            execution: run.execution,
        })));

        if !state.completed() {
            for child in children {
                self.abort_job(
                    child,
                    RequestState::Cancelled,
                    ERR_JOB_CANCELLED,
                    "parent job stopped".to_string(),
                    out,
                );
            }
        }
        if let Some(parent) = parent {
            self.check_await(parent, out);
        }
    }

    /// Stop the active position of a job and wind it down. A job already
    /// winding down is finalised right away.
    fn abort_job(
        &mut self,
        request_id: Uuid,
        state: RequestState,
        error_code: &str,
        message: String,
        out: &mut Vec<CoreCommand>,
    ) {
        let Some(run) = self.jobs.get_mut(&request_id) else {
            return;
        };
        run.seq += 1;
        let active = match std::mem::take(&mut run.slot) {
            Slot::InFlight(flight) => {
                out.push(CoreCommand::Cancel {
                    request: Box::new(flight.request.to_cancel()),
                    reservation: flight.reservation.clone(),
                });
                self.resources.release(&flight.reservation);
                Some(flight.task.task_type.clone())
            }
            Slot::Reserving { task, .. } => Some(task.task_type.clone()),
            Slot::Awaiting { task_type } => Some(task_type),
            Slot::RetryWait { .. } | Slot::JobRetryWait { .. } | Slot::Idle => None,
        };
        let mut interrupted = None;
        if let Some(task_type) = active {
            if let Some(exec) = run.execution.get_task_mut(&task_type) {
                if !exec.is_terminal() {
                    if let Err(err) = exec.finish(TaskOutcome::cancelled(error_code, message.clone())) {
                        debug!(task_type = %task_type, error = %err, "could not cancel task record");
                    }
                }
            }
            if run.definition.get_task(&task_type).is_some_and(|t| t.always_run) {
                interrupted = Some(task_type);
            }
        }

        match &mut run.phase {
            Phase::Walking => self.begin_wind_down(
                request_id,
                state,
                Some(error_code.to_string()),
                Some(message),
                interrupted,
                out,
            ),
            Phase::WindingDown {
                state: final_state,
                error_code: final_code,
                error_message: final_message,
                queue,
            } => {
                queue.clear();
                if final_state.completed() {
                    *final_state = state;
                    *final_code = Some(error_code.to_string());
                    *final_message = Some(message);
                }
                self.finalize(request_id, out);
            }
        }
    }

    pub(crate) fn handle_heartbeat(&mut self, registration: AntRegistration, out: &mut Vec<CoreCommand>) {
        let ant_id = registration.ant_id.clone();
        if let Err(err) = self.resources.register(registration) {
            warn!(ant_id = %ant_id, error = %err, "rejected ant registration");
            return;
        }
        let mut waiting: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|(_, run)| matches!(run.slot, Slot::Reserving { .. }))
            .map(|(id, _)| *id)
            .collect();
        waiting.sort();
        for request_id in waiting {
            self.redispatch(request_id, out);
        }
    }

    fn redispatch(&mut self, request_id: Uuid, out: &mut Vec<CoreCommand>) {
        let Some(run) = self.jobs.get_mut(&request_id) else {
            return;
        };
        match std::mem::take(&mut run.slot) {
            Slot::Reserving { task, opts } => {
                run.seq += 1;
                self.dispatch(request_id, task, opts, out);
            }
            other => run.slot = other,
        }
    }

    pub(crate) fn handle_dispatched(&mut self, request_id: Uuid, co_relation_id: &str) {
        let Some(run) = self.jobs.get_mut(&request_id) else {
            return;
        };
        let Slot::InFlight(flight) = &run.slot else {
            return;
        };
        if flight.co_relation_id() != co_relation_id {
            debug!(request_id = %request_id, co_relation_id, "dispatch ack for an older attempt");
            return;
        }
        if let Err(err) = self.resources.confirm(&flight.reservation) {
            warn!(request_id = %request_id, error = %err, "dispatched task lost its reservation");
        }
        let ant_id = flight.reservation.ant_id.clone();
        let task_type = flight.task.task_type.clone();
        if let Some(exec) = run.execution.get_task_mut(&task_type) {
            if let Err(err) = exec.mark_executing(&ant_id) {
                debug!(task_type = %task_type, error = %err, "task not marked executing");
            }
        }
    }

    pub(crate) fn handle_dispatch_failed(
        &mut self,
        request_id: Uuid,
        co_relation_id: &str,
        reason: &str,
        out: &mut Vec<CoreCommand>,
    ) {
        let Some(run) = self.jobs.get_mut(&request_id) else {
            return;
        };
        match std::mem::take(&mut run.slot) {
            Slot::InFlight(flight) if flight.co_relation_id() == co_relation_id => {
                self.resources.release(&flight.reservation);
                warn!(
                    request_id = %request_id,
                    task_type = %flight.task.task_type,
                    ant_id = %flight.reservation.ant_id,
                    reason,
                    "dispatch failed; will retry"
                );
                let InFlight { task, request, .. } = flight;
                run.slot = Slot::Reserving {
                    task,
                    opts: Box::new(request.executor_opts),
                };
                schedule_retry(run, RetryKind::Redispatch, self.options.ants_unavailable_delay, out);
            }
            other => run.slot = other,
        }
    }

    pub(crate) fn handle_response(&mut self, ant_id: &str, payload: &[u8], out: &mut Vec<CoreCommand>) {
        let secret = self
            .resources
            .registration(ant_id)
            .and_then(|r| r.encryption_key)
            .unwrap_or_else(|| self.options.shared_secret.clone());
        let response = match TaskResponse::unmarshal(&secret, payload) {
            Ok(response) => response,
            Err(err) => {
                warn!(ant_id, error = %err, "dropping undecodable task response");
                return;
            }
        };

        let request_id = response.job_request_id;
        let Some(run) = self.jobs.get_mut(&request_id) else {
            debug!(request_id = %request_id, "response for a job that is not active");
            return;
        };
        let current = matches!(
            &run.slot,
            Slot::InFlight(flight) if flight.co_relation_id() == response.co_relation_id
        );
        if !current {
            debug!(
                request_id = %request_id,
                co_relation_id = %response.co_relation_id,
                status = %response.status,
                "ignoring stale task response"
            );
            return;
        }

        if !response.status.is_terminal() {
            if let Some(exec) = run.execution.get_task_mut(&response.task_type) {
                exec.ant_host = Some(response.host.clone());
                if let Err(err) = exec.mark_executing(&response.ant_id) {
                    debug!(error = %err, "progress for task that is not running");
                }
            }
            return;
        }

        let Slot::InFlight(flight) = std::mem::take(&mut run.slot) else {
            return;
        };
        self.resources.release(&flight.reservation);
        for (name, value) in &response.job_context {
            run.execution.add_context(name.clone(), value.clone(), false);
        }
        if !response.warnings.is_empty() {
            warn!(
                request_id = %request_id,
                task_type = %flight.task.task_type,
                warnings = ?response.warnings,
                "task reported warnings"
            );
        }
        if let Some(exec) = run.execution.get_task_mut(&flight.task.task_type) {
            exec.ant_host = Some(response.host.clone()).filter(|h| !h.is_empty());
            if exec.ant_id.is_none() {
                exec.ant_id = Some(response.ant_id.clone());
            }
        }
        debug!(
            request_id = %request_id,
            task_type = %flight.task.task_type,
            timings = %response.timings,
            "task response received"
        );

        let task_type = flight.task.task_type.clone();
        let outcome = outcome_from_response(&flight.task, response);
        self.complete_task(request_id, &task_type, outcome, out);
    }

    pub(crate) fn handle_task_timeout(
        &mut self,
        request_id: Uuid,
        co_relation_id: &str,
        out: &mut Vec<CoreCommand>,
    ) {
        let Some(run) = self.jobs.get_mut(&request_id) else {
            return;
        };
        match std::mem::take(&mut run.slot) {
            Slot::InFlight(flight) if flight.co_relation_id() == co_relation_id => {
                warn!(
                    request_id = %request_id,
                    task_type = %flight.task.task_type,
                    ant_id = %flight.reservation.ant_id,
                    timeout = ?flight.request.timeout,
                    "task timed out; cancelling"
                );
                out.push(CoreCommand::Cancel {
                    request: Box::new(flight.request.to_cancel()),
                    reservation: flight.reservation.clone(),
                });
                self.resources.release(&flight.reservation);
                let message = format!("task timed out after {:?}", flight.request.timeout);
                let task_type = flight.task.task_type.clone();
                self.complete_task(
                    request_id,
                    &task_type,
                    TaskOutcome::failed(ERR_TASK_TIMED_OUT, message),
                    out,
                );
            }
            other => run.slot = other,
        }
    }

    pub(crate) fn handle_job_timeout(&mut self, request_id: Uuid, out: &mut Vec<CoreCommand>) {
        let Some(run) = self.jobs.get(&request_id) else {
            return;
        };
        let timeout = self.options.job_timeout(run.definition.timeout);
        self.abort_job(
            request_id,
            RequestState::Failed,
            ERR_JOB_TIMED_OUT,
            format!("job timed out after {timeout:?}"),
            out,
        );
    }

    pub(crate) fn handle_cancel(&mut self, request_id: Uuid, out: &mut Vec<CoreCommand>) {
        match self.jobs.get(&request_id) {
            None => debug!(request_id = %request_id, "cancel for a job that is not active"),
            Some(run) if !run.is_walking() => {
                info!(request_id = %request_id, "job already stopping; running always_run tasks")
            }
            Some(_) => self.abort_job(
                request_id,
                RequestState::Cancelled,
                ERR_JOB_CANCELLED,
                "job cancelled".to_string(),
                out,
            ),
        }
    }

    pub(crate) fn handle_retry(
        &mut self,
        request_id: Uuid,
        seq: u64,
        kind: RetryKind,
        out: &mut Vec<CoreCommand>,
    ) {
        let Some(run) = self.jobs.get_mut(&request_id) else {
            return;
        };
        if run.seq != seq {
            debug!(request_id = %request_id, ?kind, "ignoring stale retry timer");
            return;
        }
        match (kind, std::mem::take(&mut run.slot)) {
            (RetryKind::Redispatch, Slot::Reserving { task, opts }) => {
                self.dispatch(request_id, task, opts, out)
            }
            (RetryKind::Task, Slot::RetryWait { task_type }) => {
                if let Some(exec) = run.execution.get_task_mut(&task_type) {
                    if let Err(err) = exec.begin_retry() {
                        warn!(request_id = %request_id, task_type = %task_type, error = %err, "cannot retry task");
                    }
                }
                self.schedule_task(request_id, &task_type, true, out);
            }
            (RetryKind::Job, Slot::JobRetryWait { task_type }) => {
                self.retry_job(request_id, &task_type, out)
            }
            (_, other) => run.slot = other,
        }
    }

    /// Restart the job, from scratch once `hard_reset_after_retries` is
    /// reached and from the failed task before that.
    fn retry_job(&mut self, request_id: Uuid, task_type: &str, out: &mut Vec<CoreCommand>) {
        let Some(run) = self.jobs.get_mut(&request_id) else {
            return;
        };
        run.request.retried += 1;
        let attempt = run.request.retried;
        let hard_reset_after = run.definition.hard_reset_after_retries;

        if hard_reset_after > 0 && attempt >= hard_reset_after {
            info!(request_id = %request_id, attempt, "hard reset of job execution");
            if let Err(err) = run.execution.hard_reset() {
                warn!(request_id = %request_id, error = %err, "hard reset failed");
            }
            match run.definition.get_first_task().map(|t| t.task_type.clone()) {
                Ok(first) => self.schedule_task(request_id, &first, false, out),
                Err(err) => self.fail_job(request_id, ERR_VALIDATION, err.to_string(), out),
            }
        } else {
            info!(request_id = %request_id, attempt, task_type, "restarting job from failed task");
            self.schedule_task(request_id, task_type, false, out);
        }
    }

    /// Drop dead ants and stale reservations; tasks bound to them are
    /// dispatched again.
    pub(crate) fn handle_reap(&mut self, now: DateTime<Utc>, out: &mut Vec<CoreCommand>) {
        let mut reaped = self.resources.reap_stale_ants(now);
        reaped.extend(self.resources.reap_stale_allocations(now));

        for binding in reaped {
            let request_id = binding.job_request_id;
            let Some(run) = self.jobs.get_mut(&request_id) else {
                continue;
            };
            match std::mem::take(&mut run.slot) {
                Slot::InFlight(flight)
                    if flight.reservation.ant_id == binding.ant_id
                        && flight.task.task_type == binding.task_type =>
                {
                    warn!(
                        request_id = %request_id,
                        task_type = %binding.task_type,
                        ant_id = %binding.ant_id,
                        "ant binding reaped; rescheduling task"
                    );
                    let InFlight { task, request, .. } = flight;
                    run.seq += 1;
                    self.dispatch(request_id, task, Box::new(request.executor_opts), out);
                }
                other => run.slot = other,
            }
        }
    }

    pub(crate) fn handle_shutdown(&mut self, out: &mut Vec<CoreCommand>) {
        info!(active = self.jobs.len(), "shutting down engine");
        for run in self.jobs.values_mut() {
            if let Slot::InFlight(flight) = std::mem::take(&mut run.slot) {
                out.push(CoreCommand::Cancel {
                    request: Box::new(flight.request.to_cancel()),
                    reservation: flight.reservation.clone(),
                });
                self.resources.release(&flight.reservation);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RuntimeOptions;
    use crate::resource::ResourceManager;
    use crate::types::ErrorClassifier;

    const TACO: &str = r#"
job_type: taco-job
tasks:
- task_type: allocate
  method: SHELL
  script: [echo allocate]
  on_completed: check
- task_type: check
  method: SHELL
  script: [echo check]
  on_exit_code:
    monday: manic-monday
    tuesday: taco-tuesday
    wednesday: party
- task_type: manic-monday
  method: SHELL
  script: [echo monday]
  on_completed: deallocate
- task_type: taco-tuesday
  method: SHELL
  script: [echo tuesday]
  on_completed: party
- task_type: party
  method: SHELL
  script: [echo party]
  on_completed: deallocate
- task_type: deallocate
  method: SHELL
  always_run: true
  script: [echo deallocate]
"#;

    const CHAIN: &str = r#"
job_type: chain
tasks:
- task_type: prepare
  method: SHELL
  script: [echo prepare]
  on_completed: build
- task_type: build
  method: SHELL
  retry: 1
  delay_between_retries: 1s
  script: [make]
  on_completed: cleanup
- task_type: cleanup
  method: SHELL
  always_run: true
  script: [echo cleanup]
"#;

    fn core_with_ant() -> CoreRuntime {
        let resources = Arc::new(ResourceManager::new(
            Duration::from_secs(30),
            Duration::from_secs(60),
        ));
        let mut core = CoreRuntime::new(
            RuntimeOptions::default(),
            resources,
            ErrorClassifier::default(),
        );
        let ant = AntRegistration::new("ant-1", vec![TaskMethod::Shell], 4);
        let step = core.step(RuntimeEvent::AntHeartbeat(ant));
        assert!(step.keep_running);
        core
    }

    fn submit(core: &mut CoreRuntime, yaml: &str) -> (Uuid, Vec<CoreCommand>) {
        let definition = Arc::new(JobDefinition::from_yaml(yaml).unwrap());
        let request = JobRequest::new(definition.job_type.clone());
        let id = request.id;
        let step = core.step(RuntimeEvent::SubmitJob {
            request,
            definition,
        });
        (id, step.commands)
    }

    fn dispatched(commands: &[CoreCommand]) -> Option<TaskRequest> {
        commands.iter().find_map(|c| match c {
            CoreCommand::Dispatch { request, .. } => Some((**request).clone()),
            _ => None,
        })
    }

    fn finished(commands: &[CoreCommand]) -> Option<JobReport> {
        commands.iter().find_map(|c| match c {
            CoreCommand::JobFinished(report) => Some((**report).clone()),
            _ => None,
        })
    }

    fn retry_event(commands: &[CoreCommand]) -> Option<RuntimeEvent> {
        commands.iter().find_map(|c| match c {
            CoreCommand::ScheduleTimer { event, .. }
                if matches!(**event, RuntimeEvent::RetryDue { .. }) =>
            {
                Some((**event).clone())
            }
            _ => None,
        })
    }

    fn respond(
        core: &mut CoreRuntime,
        request: &TaskRequest,
        status: RequestState,
        exit_code: &str,
    ) -> Vec<CoreCommand> {
        core.step(RuntimeEvent::TaskDispatched {
            request_id: request.job_request_id,
            co_relation_id: request.co_relation_id.clone(),
        });
        let mut response = TaskResponse::new(request);
        response.ant_id = "ant-1".into();
        response.status = status;
        response.exit_code = exit_code.into();
        let payload = response.marshal("").unwrap();
        core.step(RuntimeEvent::ResponseReceived {
            ant_id: "ant-1".into(),
            payload,
        })
        .commands
    }

    #[test]
    fn taco_tuesday_walk_runs_always_run_sink() {
        let mut core = core_with_ant();
        let (_, mut commands) = submit(&mut core, TACO);
        let mut visited = Vec::new();
        let report = loop {
            if let Some(report) = finished(&commands) {
                break report;
            }
            let request = dispatched(&commands).expect("next dispatch");
            visited.push(request.task_type.clone());
            let exit = if request.task_type == "check" { "tuesday" } else { "0" };
            commands = respond(&mut core, &request, RequestState::Completed, exit);
        };

        assert_eq!(
            visited,
            vec!["allocate", "check", "taco-tuesday", "party", "deallocate"]
        );
        assert_eq!(report.state(), RequestState::Completed);
        assert_eq!(report.executed_tasks(), visited);
        assert!(core.is_idle());
        assert_eq!(core.resources().total_bindings(), 0);
    }

    #[test]
    fn failed_task_retries_then_winds_down() {
        let mut core = core_with_ant();
        let (id, commands) = submit(&mut core, CHAIN);
        let prepare = dispatched(&commands).unwrap();
        let commands = respond(&mut core, &prepare, RequestState::Completed, "0");

        let build = dispatched(&commands).unwrap();
        assert_eq!(build.task_type, "build");
        let commands = respond(&mut core, &build, RequestState::Failed, "2");
        let retry = retry_event(&commands).expect("task retry timer");
        let commands = core.step(retry).commands;

        let again = dispatched(&commands).unwrap();
        assert_eq!(again.task_type, "build");
        assert_eq!(again.task_retry, 1);
        assert_ne!(again.co_relation_id, build.co_relation_id);

        let commands = respond(&mut core, &again, RequestState::Failed, "2");
        let cleanup = dispatched(&commands).expect("always_run task during wind-down");
        assert_eq!(cleanup.task_type, "cleanup");
        let commands = respond(&mut core, &cleanup, RequestState::Completed, "0");

        let report = finished(&commands).unwrap();
        assert_eq!(report.request.id, id);
        assert_eq!(report.state(), RequestState::Failed);
        assert_eq!(report.execution.error_code.as_deref(), Some(ERR_TASK_EXECUTE));
        assert_eq!(report.executed_tasks(), vec!["prepare", "build", "cleanup"]);
    }

    #[test]
    fn stale_and_garbage_responses_are_ignored() {
        let mut core = core_with_ant();
        let (id, commands) = submit(&mut core, CHAIN);
        let mut prepare = dispatched(&commands).unwrap();

        let step = core.step(RuntimeEvent::ResponseReceived {
            ant_id: "ant-1".into(),
            payload: b"not json".to_vec(),
        });
        assert!(step.commands.is_empty());

        prepare.co_relation_id = "someone-else".into();
        let commands = respond(&mut core, &prepare, RequestState::Completed, "0");
        assert!(commands.is_empty());
        assert!(core.execution(id).is_some());
    }

    #[test]
    fn missing_ant_retries_after_heartbeat() {
        let resources = Arc::new(ResourceManager::new(
            Duration::from_secs(30),
            Duration::from_secs(60),
        ));
        let mut core = CoreRuntime::new(
            RuntimeOptions::default(),
            resources,
            ErrorClassifier::default(),
        );
        let (_, commands) = submit(&mut core, CHAIN);
        assert!(dispatched(&commands).is_none());
        let timer = retry_event(&commands).expect("redispatch timer");

        let ant = AntRegistration::new("ant-1", vec![TaskMethod::Shell], 1);
        let commands = core.step(RuntimeEvent::AntHeartbeat(ant)).commands;
        assert_eq!(dispatched(&commands).unwrap().task_type, "prepare");

        // the heartbeat already dispatched; the old timer is stale
        assert!(core.step(timer).commands.is_empty());
    }

    #[test]
    fn cancel_stops_in_flight_task_and_runs_always_run() {
        let mut core = core_with_ant();
        let (id, commands) = submit(&mut core, CHAIN);
        let prepare = dispatched(&commands).unwrap();
        core.step(RuntimeEvent::TaskDispatched {
            request_id: id,
            co_relation_id: prepare.co_relation_id.clone(),
        });

        let commands = core.step(RuntimeEvent::CancelJob { request_id: id }).commands;
        assert!(commands.iter().any(|c| matches!(
            c,
            CoreCommand::Cancel { request, .. } if request.action == crate::protocol::TaskAction::Cancel
        )));
        let cleanup = dispatched(&commands).unwrap();
        assert_eq!(cleanup.task_type, "cleanup");

        let commands = respond(&mut core, &cleanup, RequestState::Completed, "0");
        let report = finished(&commands).unwrap();
        assert_eq!(report.state(), RequestState::Cancelled);
        assert_eq!(
            report.execution.get_task("prepare").unwrap().task_state,
            RequestState::Cancelled
        );
    }

    #[test]
    fn cancel_during_always_run_task_runs_it_again() {
        let mut core = core_with_ant();
        let (id, commands) = submit(&mut core, CHAIN);
        let prepare = dispatched(&commands).unwrap();
        let commands = respond(&mut core, &prepare, RequestState::Completed, "0");
        let build = dispatched(&commands).unwrap();
        let commands = respond(&mut core, &build, RequestState::Completed, "0");
        let cleanup = dispatched(&commands).unwrap();
        assert_eq!(cleanup.task_type, "cleanup");
        core.step(RuntimeEvent::TaskDispatched {
            request_id: id,
            co_relation_id: cleanup.co_relation_id.clone(),
        });

        let commands = core.step(RuntimeEvent::CancelJob { request_id: id }).commands;
        assert!(commands.iter().any(|c| matches!(c, CoreCommand::Cancel { .. })));
        assert!(finished(&commands).is_none());
        let again = dispatched(&commands).expect("always_run task dispatched again");
        assert_eq!(again.task_type, "cleanup");
        assert_ne!(again.co_relation_id, cleanup.co_relation_id);

        let commands = respond(&mut core, &again, RequestState::Completed, "0");
        let report = finished(&commands).unwrap();
        assert_eq!(report.state(), RequestState::Cancelled);
        assert_eq!(
            report.execution.get_task("cleanup").unwrap().task_state,
            RequestState::Completed
        );
        assert_eq!(core.resources().total_bindings(), 0);
    }

    #[test]
    fn render_failure_fails_job_even_when_failure_is_allowed() {
        let yaml = r#"
job_type: broken-template
tasks:
- task_type: a
  method: SHELL
  allow_failure: true
  script:
    {{#if Flag}}
    - echo flagged
  on_completed: b
  on_failed: c
- task_type: b
  method: SHELL
  script: [echo b]
  on_completed: c
- task_type: c
  method: SHELL
  script: [echo c]
"#;
        let mut core = core_with_ant();
        let (_, commands) = submit(&mut core, yaml);

        assert!(dispatched(&commands).is_none());
        let report = finished(&commands).expect("job finished after render failure");
        assert_eq!(report.state(), RequestState::Failed);
        assert_eq!(report.execution.error_code.as_deref(), Some(ERR_VALIDATION));
        let a = report.execution.get_task("a").unwrap();
        assert_eq!(a.task_state, RequestState::Failed);
        assert!(report.execution.get_task("c").is_none());
    }

    #[test]
    fn task_timeout_cancels_and_counts_as_failure() {
        let mut core = core_with_ant();
        let (id, commands) = submit(&mut core, CHAIN);
        let prepare = dispatched(&commands).unwrap();

        let commands = core
            .step(RuntimeEvent::TaskTimedOut {
                request_id: id,
                co_relation_id: prepare.co_relation_id.clone(),
            })
            .commands;
        assert!(commands.iter().any(|c| matches!(c, CoreCommand::Cancel { .. })));

        let cleanup = dispatched(&commands).unwrap();
        let commands = respond(&mut core, &cleanup, RequestState::Completed, "0");
        let report = finished(&commands).unwrap();
        assert_eq!(report.state(), RequestState::Failed);
        assert_eq!(
            report.execution.get_task("prepare").unwrap().error_code.as_deref(),
            Some(ERR_TASK_TIMED_OUT)
        );
    }

    #[test]
    fn job_retry_resets_after_threshold() {
        let yaml = r#"
job_type: flaky
retry: 2
hard_reset_after_retries: 2
tasks:
- task_type: first
  method: SHELL
  script: [echo one]
  on_completed: second
- task_type: second
  method: SHELL
  script: [echo two]
  on_exit_code:
    "3": RESTART_JOB
"#;
        let mut core = core_with_ant();
        let (_, commands) = submit(&mut core, yaml);
        let first = dispatched(&commands).unwrap();
        let commands = respond(&mut core, &first, RequestState::Completed, "0");
        let second = dispatched(&commands).unwrap();

        // first job retry restarts from the failed task
        let commands = respond(&mut core, &second, RequestState::Failed, "3");
        let commands = core.step(retry_event(&commands).unwrap()).commands;
        let second = dispatched(&commands).unwrap();
        assert_eq!(second.task_type, "second");
        assert_eq!(second.job_retry, 1);

        // second job retry resets the whole walk
        let commands = respond(&mut core, &second, RequestState::Failed, "3");
        let commands = core.step(retry_event(&commands).unwrap()).commands;
        let restarted = dispatched(&commands).unwrap();
        assert_eq!(restarted.task_type, "first");
        assert_eq!(restarted.job_retry, 2);
    }

    #[test]
    fn fork_and_await_join_child_job() {
        let child = r#"
job_type: child-job
tasks:
- task_type: work
  method: SHELL
  script: [echo work]
"#;
        let parent = r#"
job_type: parent-job
tasks:
- task_type: fork
  method: FORK_JOB
  fork_job_type: child-job
  on_completed: wait
- task_type: wait
  method: AWAIT_FORKED_JOB
  await_forked_tasks: [fork]
  on_completed: done
- task_type: done
  method: SHELL
  script: [echo done]
"#;
        let mut core = core_with_ant();
        core.register_definition(Arc::new(JobDefinition::from_yaml(child).unwrap()));
        let (parent_id, commands) = submit(&mut core, parent);

        let work = dispatched(&commands).expect("child task dispatched");
        assert_eq!(work.job_type, "child-job");
        assert_eq!(core.active_jobs().len(), 2);

        let commands = respond(&mut core, &work, RequestState::Completed, "0");
        let child_report = commands
            .iter()
            .find_map(|c| match c {
                CoreCommand::JobFinished(r) if r.request.parent_id == Some(parent_id) => {
                    Some(r.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(child_report.state(), RequestState::Completed);
        let child_id = child_report.request.id;
        assert_eq!(core.finished_state(child_id), Some(RequestState::Completed));

        let done = dispatched(&commands).expect("parent resumes after join");
        assert_eq!(done.task_type, "done");
        let commands = respond(&mut core, &done, RequestState::Completed, "0");
        let report = finished(&commands).unwrap();
        assert_eq!(report.state(), RequestState::Completed);
        assert_eq!(report.executed_tasks(), vec!["fork", "wait", "done"]);
        assert_eq!(core.finished_state(child_id), None);
        assert_eq!(core.finished_state(parent_id), None);
    }

    #[test]
    fn exit_when_idle_requests_exit_after_last_job() {
        let mut core = core_with_ant();
        let yaml = "job_type: one\ntasks:\n- task_type: only\n  method: SHELL\n  script: [echo ok]\n";
        let (_, commands) = submit(&mut core, yaml);
        let only = dispatched(&commands).unwrap();
        core.step(RuntimeEvent::TaskDispatched {
            request_id: only.job_request_id,
            co_relation_id: only.co_relation_id.clone(),
        });
        let mut response = TaskResponse::new(&only);
        response.status = RequestState::Completed;
        let step = core.step(RuntimeEvent::ResponseReceived {
            ant_id: "ant-1".into(),
            payload: response.marshal("").unwrap(),
        });
        assert!(!step.keep_running);
        assert!(matches!(step.commands.last(), Some(CoreCommand::RequestExit)));
    }
}
