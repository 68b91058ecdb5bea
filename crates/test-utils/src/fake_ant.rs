use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use formicary::engine::RuntimeEvent;
use formicary::errors::{FormicaryError, Result};
use formicary::exec::DispatchBackend;
use formicary::protocol::{TaskAction, TaskRequest, TaskResponse};
use formicary::resource::AntReservation;
use formicary::types::RequestState;

/// What the fake ant answers for one dispatched request.
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    Complete,
    /// Complete with a custom exit code, for `on_exit_code` routing.
    Exit(String),
    /// Complete and export a job context value.
    CompleteWithContext(String, String),
    Fail {
        exit_code: String,
        error_code: String,
        message: String,
    },
    /// Never answer; the engine has to time the task out.
    Hang,
    /// Refuse the hand-over.
    Reject,
}

impl FakeOutcome {
    pub fn fail(exit_code: &str) -> Self {
        FakeOutcome::Fail {
            exit_code: exit_code.to_string(),
            error_code: String::new(),
            message: format!("exit status {exit_code}"),
        }
    }

    pub fn fail_with_code(exit_code: &str, error_code: &str) -> Self {
        FakeOutcome::Fail {
            exit_code: exit_code.to_string(),
            error_code: error_code.to_string(),
            message: format!("failed with {error_code}"),
        }
    }
}

/// A fake dispatch backend that:
/// - records every `(task_type, action)` it receives
/// - answers each `EXECUTE` with the next scripted [`FakeOutcome`] for the
///   task type (or `Complete` when nothing is scripted), sealed the way a
///   real ant would and fed back as `ResponseReceived`.
pub struct FakeAntBackend {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    shared_secret: String,
    scripts: HashMap<String, VecDeque<FakeOutcome>>,
    log: Arc<Mutex<Vec<(String, TaskAction)>>>,
}

impl FakeAntBackend {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            runtime_tx,
            shared_secret: String::new(),
            scripts: HashMap::new(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_secret(mut self, secret: &str) -> Self {
        self.shared_secret = secret.to_string();
        self
    }

    /// Queue outcomes for consecutive executions of `task_type`.
    pub fn script(mut self, task_type: &str, outcomes: Vec<FakeOutcome>) -> Self {
        self.scripts
            .entry(task_type.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Shared log of received requests, readable after the backend moved
    /// into the runtime.
    pub fn log(&self) -> Arc<Mutex<Vec<(String, TaskAction)>>> {
        Arc::clone(&self.log)
    }

    fn record(&self, request: &TaskRequest) {
        self.log
            .lock()
            .push((request.task_type.clone(), request.action));
    }

    fn respond(
        &self,
        request: &TaskRequest,
        reservation: &AntReservation,
        outcome: FakeOutcome,
    ) -> Result<Option<Vec<u8>>> {
        let mut response = TaskResponse::new(request);
        response.ant_id = reservation.ant_id.clone();
        response.host = "fake-host".to_string();
        match outcome {
            FakeOutcome::Complete => {
                response.status = RequestState::Completed;
                response.exit_code = "0".to_string();
            }
            FakeOutcome::Exit(exit_code) => {
                response.status = RequestState::Completed;
                response.exit_code = exit_code;
            }
            FakeOutcome::CompleteWithContext(name, value) => {
                response.status = RequestState::Completed;
                response.exit_code = "0".to_string();
                response.add_job_context(name, value);
            }
            FakeOutcome::Fail {
                exit_code,
                error_code,
                message,
            } => {
                response.status = RequestState::Failed;
                response.exit_code = exit_code;
                response.error_code = error_code;
                response.error_message = message;
            }
            FakeOutcome::Hang => return Ok(None),
            FakeOutcome::Reject => {
                return Err(FormicaryError::Protocol(format!(
                    "fake ant rejected {}",
                    request.task_type
                )));
            }
        }
        let secret = reservation
            .encryption_key
            .as_deref()
            .unwrap_or(&self.shared_secret);
        response.marshal(secret).map(Some)
    }
}

impl DispatchBackend for FakeAntBackend {
    fn dispatch(
        &mut self,
        request: TaskRequest,
        reservation: AntReservation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.record(&request);
            let outcome = self
                .scripts
                .get_mut(&request.task_type)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(FakeOutcome::Complete);

            if let Some(payload) = self.respond(&request, &reservation, outcome)? {
                // Answer from a separate task so a full channel cannot block
                // the runtime that is awaiting this dispatch.
                let tx = self.runtime_tx.clone();
                let ant_id = reservation.ant_id.clone();
                tokio::spawn(async move {
                    let _ = tx
                        .send(RuntimeEvent::ResponseReceived { ant_id, payload })
                        .await;
                });
            }
            Ok(())
        })
    }

    fn cancel(
        &mut self,
        request: TaskRequest,
        _reservation: AntReservation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.record(&request);
            Ok(())
        })
    }
}
