// tests/common/mod.rs
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use formicary::dag::JobDefinition;
use formicary::engine::{CoreRuntime, RunSummary, Runtime, RuntimeEvent, RuntimeOptions};
use formicary::execution::JobRequest;
use formicary::protocol::TaskAction;
use formicary::resource::ResourceManager;
use formicary::types::ErrorClassifier;
pub use formicary_test_utils::{
    AntRegistrationBuilder, FakeAntBackend, FakeOutcome, JobDefinitionBuilder,
    TaskDefinitionBuilder, init_tracing, with_timeout,
};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// The classic branching job: `check` routes on its exit code and
/// `deallocate` always runs.
pub const TACO_YAML: &str = r#"
job_type: taco-job
description: Taco tuesday
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
    FAILED: FATAL
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

pub const CHILD_YAML: &str = r#"
job_type: child-job
tasks:
- task_type: work
  method: SHELL
  script: [echo work]
"#;

pub const PARENT_YAML: &str = r#"
job_type: parent-job
tasks:
- task_type: fork
  method: FORK_JOB
  fork_job_type: child-job
  on_completed: wait
- task_type: wait
  method: AWAIT_FORKED_JOB
  await_forked_tasks: [fork]
  on_completed: report
- task_type: report
  method: SHELL
  script: [echo report]
"#;

/// Engine options with short backoffs so retries finish quickly.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        ants_unavailable_delay: Duration::from_millis(50),
        ..RuntimeOptions::default()
    }
}

pub type DispatchLog = Arc<Mutex<Vec<(String, TaskAction)>>>;

/// Result of [`run_with_fake_ant`].
pub struct FakeRun {
    pub summary: RunSummary,
    pub request_id: Uuid,
    pub log: DispatchLog,
}

impl FakeRun {
    pub fn executed(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|(_, action)| *action == TaskAction::Execute)
            .map(|(task, _)| task.clone())
            .collect()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|(_, action)| *action == TaskAction::Cancel)
            .map(|(task, _)| task.clone())
            .collect()
    }
}

/// Run the first of `definitions` to completion against one scripted fake
/// ant. The remaining definitions are available to `FORK_JOB` tasks.
pub async fn run_with_fake_ant<F>(
    definitions: Vec<JobDefinition>,
    options: RuntimeOptions,
    script: F,
) -> FakeRun
where
    F: FnOnce(FakeAntBackend) -> FakeAntBackend,
{
    init_tracing();

    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);
    let resources = Arc::new(ResourceManager::new(
        Duration::from_secs(30),
        Duration::from_secs(60),
    ));
    resources
        .register(AntRegistrationBuilder::new("fake-1").capacity(4).build())
        .unwrap();

    let backend = script(FakeAntBackend::new(rt_tx.clone()).with_secret(&options.shared_secret));
    let log = backend.log();

    let definitions: Vec<Arc<JobDefinition>> = definitions.into_iter().map(Arc::new).collect();
    let mut core = CoreRuntime::new(options, resources, ErrorClassifier::default());
    for definition in &definitions {
        core.register_definition(Arc::clone(definition));
    }

    let request = JobRequest::new(definitions[0].job_type.clone());
    let request_id = request.id;
    rt_tx
        .send(RuntimeEvent::SubmitJob {
            request,
            definition: Arc::clone(&definitions[0]),
        })
        .await
        .unwrap();

    let runtime = Runtime::new(core, rt_tx, rt_rx, backend);
    let summary = with_timeout(runtime.run()).await.unwrap();

    FakeRun {
        summary,
        request_id,
        log,
    }
}

pub fn yaml(source: &str) -> JobDefinition {
    JobDefinition::from_yaml(source).unwrap()
}
