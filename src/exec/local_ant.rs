// src/exec/local_ant.rs

//! Embedded SHELL ant.
//!
//! A `LocalAnt` subscribes to its own topic, runs every `EXECUTE` request in
//! its own Tokio task and publishes a sealed [`TaskResponse`] on the
//! request's response topic. Per request key there is never more than one
//! live process at the same time:
//!
//! - a duplicate `EXECUTE` for a running request is ignored, unless that
//!   run is already being cancelled
//! - `CANCEL` kills the running process; no response is sent for it
//!
//! Heartbeats carrying the current load and the running tasks as
//! allocations are published on the registration topic until the lifecycle
//! shuts down.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::exec::transport::{Message, Transport};
use crate::protocol::{TaskAction, TaskRequest, TaskResponse};
use crate::resource::{AntAllocation, AntRegistration};
use crate::types::RequestState;
use crate::types::error_code::ERR_ANT_EXECUTION_FAILED;

/// Internal handle for a currently-running request.
///
/// - `cancel` is used to ask the runner to kill its process.
/// - `handle` is the Tokio task that is actually running the script.
struct ActiveTask {
    job_request_id: Uuid,
    task_type: String,
    co_relation_id: String,
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

/// Everything a runner needs to publish its response.
#[derive(Clone)]
struct ResponseSink {
    ant_id: String,
    host: String,
    secret: String,
    transport: Arc<dyn Transport>,
}

pub struct LocalAnt {
    registration: AntRegistration,
    transport: Arc<dyn Transport>,
    secret: String,
    registration_topic: String,
    heartbeat_interval: Duration,
}

impl LocalAnt {
    /// `secret` is used when the registration carries no key of its own.
    pub fn new(
        registration: AntRegistration,
        transport: Arc<dyn Transport>,
        secret: impl Into<String>,
        registration_topic: impl Into<String>,
        heartbeat_interval: Duration,
    ) -> Self {
        let secret = registration
            .encryption_key
            .clone()
            .unwrap_or_else(|| secret.into());
        Self {
            registration,
            transport,
            secret,
            registration_topic: registration_topic.into(),
            heartbeat_interval,
        }
    }

    pub fn ant_id(&self) -> &str {
        &self.registration.ant_id
    }

    /// Spawn the ant loop. It stops when `shutdown` turns `true`, killing
    /// whatever is still running.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        // Subscribe before returning so no request published afterwards is lost.
        let requests = self.transport.subscribe(&self.registration.ant_topic);
        tokio::spawn(self.run(requests, shutdown))
    }

    async fn run(self, mut requests: mpsc::Receiver<Message>, mut shutdown: watch::Receiver<bool>) {
        info!(ant_id = %self.registration.ant_id, topic = %self.registration.ant_topic, "local ant started");

        let sink = ResponseSink {
            ant_id: self.registration.ant_id.clone(),
            host: host_name(),
            secret: self.secret.clone(),
            transport: self.transport.clone(),
        };
        // (request key, co_relation_id) of finished runners
        let (done_tx, mut done_rx) = mpsc::channel::<(String, String)>(32);
        let mut active: HashMap<String, ActiveTask> = HashMap::new();
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => self.send_heartbeat(&active).await,
                message = requests.recv() => match message {
                    Some(message) => self.handle_message(message, &mut active, &sink, &done_tx),
                    None => break,
                },
                Some((key, co_relation_id)) = done_rx.recv() => {
                    if active.get(&key).is_some_and(|t| t.co_relation_id == co_relation_id) {
                        active.remove(&key);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for (key, mut task) in active.drain() {
            if let Some(cancel) = task.cancel.take() {
                if cancel.send(()).is_err() {
                    debug!(key = %key, "task already finished while stopping");
                }
            }
        }
        info!(ant_id = %self.registration.ant_id, "local ant finished");
    }

    async fn send_heartbeat(&self, active: &HashMap<String, ActiveTask>) {
        let mut registration = self.registration.clone();
        registration.current_load = active.len() as u32;
        registration.received_at = Utc::now();
        for task in active.values() {
            let alloc = registration
                .allocations
                .entry(task.job_request_id)
                .or_insert_with(|| {
                    AntAllocation::new(
                        &self.registration.ant_id,
                        &self.registration.ant_topic,
                        task.job_request_id,
                        &task.task_type,
                    )
                });
            alloc
                .task_types
                .insert(task.task_type.clone(), RequestState::Executing);
        }
        let payload = match registration.marshal() {
            Ok(payload) => payload,
            Err(err) => {
                error!(ant_id = %registration.ant_id, error = %err, "cannot encode heartbeat");
                return;
            }
        };
        let message = Message {
            key: registration.ant_id.clone(),
            payload,
        };
        if let Err(err) = self.transport.publish(&self.registration_topic, message).await {
            debug!(ant_id = %registration.ant_id, error = %err, "heartbeat not delivered");
        }
    }

    fn handle_message(
        &self,
        message: Message,
        active: &mut HashMap<String, ActiveTask>,
        sink: &ResponseSink,
        done_tx: &mpsc::Sender<(String, String)>,
    ) {
        let request = match TaskRequest::unmarshal(&self.secret, &message.payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(ant_id = %self.registration.ant_id, key = %message.key, error = %err, "dropping undecodable request");
                return;
            }
        };
        let key = request.key();

        match request.action {
            TaskAction::Cancel => match active.get_mut(&key).and_then(|t| t.cancel.take()) {
                Some(cancel) => {
                    info!(key = %key, "cancellation requested for running task; killing process");
                    if cancel.send(()).is_err() {
                        debug!(key = %key, "task already finished while cancelling");
                    }
                }
                None => debug!(key = %key, "cancel for a task that is not running"),
            },
            TaskAction::Execute => {
                // A run whose cancel was already sent is on its way out.
                if active
                    .get(&key)
                    .is_some_and(|t| t.cancel.is_some() && !t.handle.is_finished())
                {
                    warn!(key = %key, co_relation_id = %request.co_relation_id, "task already running; ignoring duplicate request");
                    return;
                }
                let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
                let sink = sink.clone();
                let done_tx = done_tx.clone();
                let co_relation_id = request.co_relation_id.clone();
                let job_request_id = request.job_request_id;
                let task_type = request.task_type.clone();
                let done = (key.clone(), co_relation_id.clone());
                let handle = tokio::spawn(async move {
                    run_request(request, sink, cancel_rx).await;
                    if done_tx.send(done).await.is_err() {
                        debug!("ant loop stopped before task finished");
                    }
                });
                active.insert(
                    key,
                    ActiveTask {
                        job_request_id,
                        task_type,
                        co_relation_id,
                        cancel: Some(cancel_tx),
                        handle,
                    },
                );
            }
            other => debug!(key = %key, action = ?other, "action not supported by local ant"),
        }
    }
}

fn host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

enum PhaseResult {
    Exited(i32),
    Cancelled,
}

/// Run one request and publish its response. A cancelled request gets no
/// response.
async fn run_request(request: TaskRequest, sink: ResponseSink, mut cancel_rx: oneshot::Receiver<()>) {
    let mut response = TaskResponse::new(&request);
    response.ant_id = sink.ant_id.clone();
    response.host = sink.host.clone();

    match execute(&request, &mut response, &mut cancel_rx).await {
        Ok(true) => {}
        Ok(false) => {
            info!(task_type = %request.task_type, co_relation_id = %request.co_relation_id, "task cancelled");
            return;
        }
        Err(err) => {
            error!(task_type = %request.task_type, error = %err, "task execution error");
            response.error_code = ERR_ANT_EXECUTION_FAILED.to_string();
            response.additional_error(&format!("{err:#}"), true);
        }
    }
    response.timings.pod_shutdown_at = Some(Utc::now());

    if let Err(err) = publish_response(&sink, &request, &response).await {
        error!(task_type = %request.task_type, error = %err, "failed to publish task response");
    }
}

async fn publish_response(sink: &ResponseSink, request: &TaskRequest, response: &TaskResponse) -> Result<()> {
    let payload = response
        .marshal(&sink.secret)
        .context("encoding task response")?;
    sink.transport
        .publish(
            &request.response_topic,
            Message {
                key: sink.ant_id.clone(),
                payload,
            },
        )
        .await
        .with_context(|| format!("publishing response on '{}'", request.response_topic))
}

/// Run `before_script`, `script` and `after_script`. Returns `false` when
/// the request was cancelled.
async fn execute(
    request: &TaskRequest,
    response: &mut TaskResponse,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> Result<bool> {
    info!(
        task_type = %request.task_type,
        co_relation_id = %request.co_relation_id,
        "starting task process"
    );
    response.timings.pod_started_at = Some(Utc::now());

    let mut failure: Option<(&str, i32)> = None;

    match run_phase(request, "before_script", &request.before_script, cancel_rx, response).await? {
        PhaseResult::Cancelled => return Ok(false),
        PhaseResult::Exited(0) => {}
        PhaseResult::Exited(code) => failure = Some(("before_script", code)),
    }
    response.timings.pre_script_finished_at = Some(Utc::now());

    if failure.is_none() {
        match run_phase(request, "script", &request.script, cancel_rx, response).await? {
            PhaseResult::Cancelled => return Ok(false),
            PhaseResult::Exited(0) => {}
            PhaseResult::Exited(code) => failure = Some(("script", code)),
        }
    }
    response.timings.script_finished_at = Some(Utc::now());

    match run_phase(request, "after_script", &request.after_script, cancel_rx, response).await? {
        PhaseResult::Cancelled => return Ok(false),
        PhaseResult::Exited(0) => {}
        PhaseResult::Exited(code) => {
            response.additional_error(&format!("after_script exited with code {code}"), false)
        }
    }
    response.timings.post_script_finished_at = Some(Utc::now());

    match failure {
        None => {
            response.status = RequestState::Completed;
            response.exit_code = "0".to_string();
        }
        Some((phase, code)) => {
            response.status = RequestState::Failed;
            response.exit_code = code.to_string();
            response.failed_command = phase.to_string();
            response.error_message = format!("{phase} exited with code {code}");
        }
    }
    info!(
        task_type = %request.task_type,
        status = %response.status,
        exit_code = %response.exit_code,
        "task process exited"
    );
    Ok(true)
}

fn env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn run_phase(
    request: &TaskRequest,
    phase: &str,
    commands: &[String],
    cancel_rx: &mut oneshot::Receiver<()>,
    response: &mut TaskResponse,
) -> Result<PhaseResult> {
    if commands.is_empty() {
        return Ok(PhaseResult::Exited(0));
    }
    let script = format!("set -e\n{}", commands.join("\n"));

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&script);
    for (name, variable) in &request.variables {
        cmd.env(name, env_value(&variable.value));
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {phase} of task '{}'", request.task_type))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_task = tokio::spawn(async move {
        let mut captured = Vec::new();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                captured.push(line);
            }
        }
        captured
    });

    // Always consume stderr so buffers don't fill; log at debug.
    if let Some(stderr) = stderr {
        let task_type = request.task_type.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task_type = %task_type, "stderr: {}", line);
            }
        });
    }

    tokio::select! {
        status = child.wait() => {
            let status = status
                .with_context(|| format!("waiting for {phase} of task '{}'", request.task_type))?;
            match stdout_task.await {
                Ok(lines) => response.stdout.extend(lines),
                Err(err) => response.additional_error(&format!("stdout capture failed: {err}"), false),
            }
            Ok(PhaseResult::Exited(status.code().unwrap_or(-1)))
        }
        cancel = &mut *cancel_rx => {
            if cancel.is_err() {
                debug!(task_type = %request.task_type, "cancel channel closed; stopping process");
            }
            if let Err(e) = child.kill().await {
                warn!(task_type = %request.task_type, error = %e, "failed to kill child process on cancellation");
            }
            Ok(PhaseResult::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::transport::ChannelTransport;
    use crate::protocol::{ExecutorOptions, VariableValue};
    use crate::types::TaskMethod;

    fn request(script: &[&str]) -> TaskRequest {
        TaskRequest {
            user_id: String::new(),
            organization_id: String::new(),
            job_definition_id: "build:1".into(),
            job_request_id: Uuid::new_v4(),
            job_type: "build".into(),
            job_type_version: "1".into(),
            job_execution_id: Uuid::new_v4(),
            task_execution_id: Uuid::new_v4(),
            task_type: "compile".into(),
            co_relation_id: "c-1".into(),
            platform: String::new(),
            action: TaskAction::Execute,
            job_retry: 0,
            task_retry: 0,
            allow_failure: false,
            tags: Vec::new(),
            before_script: Vec::new(),
            script: script.iter().map(|s| s.to_string()).collect(),
            after_script: Vec::new(),
            timeout: Duration::from_secs(30),
            variables: [(
                "GREETING".to_string(),
                VariableValue::new(Value::from("hello"), false),
            )]
            .into_iter()
            .collect(),
            executor_opts: ExecutorOptions::new("compile", TaskMethod::Shell),
            response_topic: "responses".into(),
        }
    }

    async fn run(req: &TaskRequest) -> (bool, TaskResponse) {
        let (_tx, mut rx) = oneshot::channel();
        let mut response = TaskResponse::new(req);
        let finished = execute(req, &mut response, &mut rx).await.unwrap();
        (finished, response)
    }

    #[tokio::test]
    async fn script_output_and_variables_are_captured() {
        let req = request(&["echo $GREETING"]);
        let (finished, response) = run(&req).await;
        assert!(finished);
        assert_eq!(response.status, RequestState::Completed);
        assert_eq!(response.exit_code, "0");
        assert_eq!(response.stdout, vec!["hello".to_string()]);
        assert!(response.timings.script_finished_at.is_some());
    }

    #[tokio::test]
    async fn failing_script_reports_exit_code() {
        let req = request(&["echo before", "exit 3", "echo never"]);
        let (_, response) = run(&req).await;
        assert_eq!(response.status, RequestState::Failed);
        assert_eq!(response.exit_code, "3");
        assert_eq!(response.failed_command, "script");
        assert_eq!(response.stdout, vec!["before".to_string()]);
    }

    #[tokio::test]
    async fn cancel_kills_running_process() {
        let req = request(&["sleep 30"]);
        let (tx, mut rx) = oneshot::channel();
        let mut response = TaskResponse::new(&req);
        let run = tokio::spawn(async move { execute(&req, &mut response, &mut rx).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cancelled task should stop quickly")
            .unwrap();
        assert!(!finished);
    }

    #[tokio::test]
    async fn ant_answers_on_response_topic() {
        let transport: Arc<dyn Transport> = Arc::new(ChannelTransport::default());
        let mut responses = transport.subscribe("responses");
        let mut heartbeats = transport.subscribe("registrations");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registration = AntRegistration::new("local-1", vec![TaskMethod::Shell], 2);
        let ant = LocalAnt::new(
            registration,
            transport.clone(),
            "secret",
            "registrations",
            Duration::from_secs(60),
        );
        let handle = ant.spawn(shutdown_rx);

        let beat = heartbeats.recv().await.unwrap();
        assert_eq!(beat.key, "local-1");

        let req = request(&["echo hi"]);
        let payload = req.marshal("secret").unwrap();
        transport
            .publish(
                "ant-local-1",
                Message {
                    key: req.key(),
                    payload,
                },
            )
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), responses.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.key, "local-1");
        let response = TaskResponse::unmarshal("secret", &message.payload).unwrap();
        assert_eq!(response.status, RequestState::Completed);
        assert_eq!(response.co_relation_id, "c-1");
        assert_eq!(response.ant_id, "local-1");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn heartbeat_reports_running_tasks() {
        let transport: Arc<dyn Transport> = Arc::new(ChannelTransport::default());
        let _responses = transport.subscribe("responses");
        let mut heartbeats = transport.subscribe("registrations");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registration = AntRegistration::new("local-1", vec![TaskMethod::Shell], 2);
        let ant = LocalAnt::new(
            registration,
            transport.clone(),
            "",
            "registrations",
            Duration::from_millis(50),
        );
        let handle = ant.spawn(shutdown_rx);

        let req = request(&["sleep 5"]);
        transport
            .publish(
                "ant-local-1",
                Message {
                    key: req.key(),
                    payload: req.marshal("").unwrap(),
                },
            )
            .await
            .unwrap();

        let reported = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let beat = heartbeats.recv().await.unwrap();
                let registration = AntRegistration::unmarshal(&beat.payload).unwrap();
                if let Some(alloc) = registration.allocations.get(&req.job_request_id) {
                    return (registration.current_load, alloc.clone());
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(reported.0, 1);
        assert_eq!(reported.1.task_types.get("compile"), Some(&RequestState::Executing));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
