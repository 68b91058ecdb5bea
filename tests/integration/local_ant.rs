// tests/integration/local_ant.rs

use std::sync::Arc;

use formicary::config::ConfigFile;
use formicary::execute_job;
use formicary::execution::JobRequest;
use formicary::types::RequestState;

use crate::common::{TestResult, init_tracing, with_timeout, yaml};

const SHELL_JOB: &str = r#"
job_type: local-shell
tasks:
- task_type: write
  method: SHELL
  variables:
    GREETING: hello
  script:
    - echo "$GREETING" > "$WORKDIR/greeting.txt"
  on_completed: probe
- task_type: probe
  method: SHELL
  allow_failure: true
  script:
    - grep -q hello "$WORKDIR/greeting.txt"
    - exit 3
  on_exit_code:
    "3": recover
- task_type: recover
  method: SHELL
  script:
    - touch "$WORKDIR/recovered"
  on_completed: cleanup
- task_type: cleanup
  method: SHELL
  always_run: true
  script:
    - touch "$WORKDIR/cleaned"
"#;

#[tokio::test]
async fn shell_job_runs_on_embedded_ant() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let definition = Arc::new(yaml(SHELL_JOB));
    let request = JobRequest::new("local-shell")
        .with_param("WORKDIR", dir.path().display().to_string());
    let request_id = request.id;

    let summary = with_timeout(execute_job(
        &ConfigFile::default(),
        definition,
        Vec::new(),
        request,
    ))
    .await?;

    let report = summary.job(request_id).ok_or("job missing")?;
    assert_eq!(report.state(), RequestState::Completed);
    assert_eq!(
        report.executed_tasks(),
        vec!["write", "probe", "recover", "cleanup"]
    );
    let probe = report.execution.get_task("probe").ok_or("probe missing")?;
    assert_eq!(probe.exit_code.as_deref(), Some("3"));
    assert_eq!(probe.ant_id.as_deref(), Some("local-1"));

    assert_eq!(
        std::fs::read_to_string(dir.path().join("greeting.txt"))?.trim(),
        "hello"
    );
    assert!(dir.path().join("recovered").exists());
    assert!(dir.path().join("cleaned").exists());
    Ok(())
}

#[tokio::test]
async fn timed_out_process_is_killed_and_cleanup_runs() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let source = r#"
job_type: stuck
tasks:
- task_type: hang
  method: SHELL
  timeout: 300ms
  script:
    - sleep 30
  on_completed: cleanup
- task_type: cleanup
  method: SHELL
  always_run: true
  script:
    - touch "$WORKDIR/cleaned"
"#;
    let request =
        JobRequest::new("stuck").with_param("WORKDIR", dir.path().display().to_string());
    let request_id = request.id;

    let summary = with_timeout(execute_job(
        &ConfigFile::default(),
        Arc::new(yaml(source)),
        Vec::new(),
        request,
    ))
    .await?;

    let report = summary.job(request_id).ok_or("job missing")?;
    assert_eq!(report.state(), RequestState::Failed);
    assert!(dir.path().join("cleaned").exists());
    Ok(())
}
