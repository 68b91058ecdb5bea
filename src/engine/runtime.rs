// src/engine/runtime.rs

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::Result;
use crate::exec::DispatchBackend;

use super::core::CoreRuntime;
use super::{CoreCommand, JobReport, RuntimeEvent};

/// Jobs that finished while the runtime was running, in finish order.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub jobs: Vec<JobReport>,
}

impl RunSummary {
    pub fn job(&self, request_id: Uuid) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.request.id == request_id)
    }

    pub fn all_completed(&self) -> bool {
        self.jobs.iter().all(|j| j.state().completed())
    }
}

/// Drives the job walks in response to `RuntimeEvent`s and hands task
/// requests to a `DispatchBackend`.
///
/// This is a pure IO shell around `CoreRuntime`, which contains all the
/// runtime semantics. This struct handles async IO: reading events from
/// channels, dispatching requests and turning timers into delayed events.
pub struct Runtime<B: DispatchBackend> {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    /// Used by timers to feed events back into the loop.
    event_tx: mpsc::Sender<RuntimeEvent>,
    backend: B,
    /// Dispatch results, handled before the next channel event.
    followups: VecDeque<RuntimeEvent>,
    summary: RunSummary,
}

impl<B: DispatchBackend> fmt::Debug for Runtime<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("followups", &self.followups.len())
            .finish_non_exhaustive()
    }
}

impl<B: DispatchBackend> Runtime<B> {
    pub fn new(
        core: CoreRuntime,
        event_tx: mpsc::Sender<RuntimeEvent>,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        backend: B,
    ) -> Self {
        Self {
            core,
            event_rx,
            event_tx,
            backend,
            followups: VecDeque::new(),
            summary: RunSummary::default(),
        }
    }

    /// Main event loop.
    ///
    /// - Consumes `RuntimeEvent`s from `event_rx` plus a periodic reap tick
    ///   at half the ant liveness timeout.
    /// - Feeds them into the core runtime.
    /// - Executes commands returned by the core (dispatch, cancel, timers).
    pub async fn run(mut self) -> Result<RunSummary> {
        info!("formicary runtime started");

        let period = (self.core.resources().liveness_timeout() / 2).max(Duration::from_millis(100));
        let mut reaper = time::interval(period);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        reaper.tick().await;

        loop {
            let event = match self.followups.pop_front() {
                Some(event) => event,
                None => tokio::select! {
                    event = self.event_rx.recv() => match event {
                        Some(e) => e,
                        None => {
                            info!("runtime event channel closed; exiting");
                            break;
                        }
                    },
                    _ = reaper.tick() => RuntimeEvent::ReapTick { now: Utc::now() },
                },
            };

            debug!(?event, "runtime received event");
            let step = self.core.step(event);

            for command in step.commands {
                self.execute_command(command).await;
            }

            if !step.keep_running {
                info!("core requested exit; stopping runtime");
                break;
            }
        }

        info!(jobs = self.summary.jobs.len(), "runtime exiting");
        Ok(self.summary)
    }

    async fn execute_command(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::Dispatch {
                request,
                reservation,
            } => {
                let request_id = request.job_request_id;
                let co_relation_id = request.co_relation_id.clone();
                match self.backend.dispatch(*request, reservation).await {
                    Ok(()) => self.followups.push_back(RuntimeEvent::TaskDispatched {
                        request_id,
                        co_relation_id,
                    }),
                    Err(err) => {
                        warn!(request_id = %request_id, error = %err, "dispatch failed");
                        self.followups.push_back(RuntimeEvent::DispatchFailed {
                            request_id,
                            co_relation_id,
                            reason: err.to_string(),
                        });
                    }
                }
            }
            CoreCommand::Cancel {
                request,
                reservation,
            } => {
                let request_id = request.job_request_id;
                if let Err(err) = self.backend.cancel(*request, reservation).await {
                    warn!(request_id = %request_id, error = %err, "cancel request could not be delivered");
                }
            }
            CoreCommand::ScheduleTimer { delay, event } => {
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    time::sleep(delay).await;
                    if tx.send(*event).await.is_err() {
                        debug!("runtime stopped before timer fired");
                    }
                });
            }
            CoreCommand::JobFinished(report) => {
                info!(
                    request_id = %report.request.id,
                    job_type = %report.request.job_type,
                    state = %report.state(),
                    tasks = ?report.executed_tasks(),
                    "job report"
                );
                self.summary.jobs.push(*report);
            }
            CoreCommand::RequestExit => {
                // keep_running is already false; nothing else to do.
                info!("core issued RequestExit command");
            }
        }
    }
}
