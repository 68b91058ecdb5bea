// tests/integration/config_files.rs

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use formicary::config::{ConfigFile, load_and_validate, load_or_default};
use formicary::errors::FormicaryError;
use formicary::execute_job;
use formicary::execution::JobRequest;
use formicary::types::RequestState;

use crate::common::{TestResult, init_tracing, with_timeout, yaml};

fn write_toml(dir: &tempfile::TempDir, contents: &str) -> std::io::Result<std::path::PathBuf> {
    let path = dir.path().join("Formicary.toml");
    let mut file = std::fs::File::create(&path)?;
    file.write_all(contents.as_bytes())?;
    Ok(path)
}

#[tokio::test]
async fn sealed_run_with_custom_ants() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = write_toml(
        &dir,
        r#"
[scheduler]
ant_liveness_timeout = "3s"
ants_unavailable_delay = "100ms"
response_topic = "responses"
registration_topic = "registrations"

[encryption]
shared_secret = "integration-secret"

[[ants]]
ant_id = "shared-key"
max_capacity = 1

[[ants]]
ant_id = "own-key"
max_capacity = 1
encryption_key = "ant-specific"
"#,
    )?;
    let cfg = load_and_validate(&path)?;
    assert_eq!(cfg.ants.len(), 2);
    assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(1));

    let source = r#"
job_type: sealed
tasks:
- task_type: one
  method: SHELL
  script: [echo one]
  on_completed: two
- task_type: two
  method: SHELL
  script: [echo two]
"#;
    let request = JobRequest::new("sealed");
    let request_id = request.id;
    let summary =
        with_timeout(execute_job(&cfg, Arc::new(yaml(source)), Vec::new(), request)).await?;

    let report = summary.job(request_id).ok_or("job missing")?;
    assert_eq!(report.state(), RequestState::Completed);
    for task in report.execution.tasks() {
        let ant = task.ant_id.as_deref().ok_or("ant not recorded")?;
        assert!(ant == "shared-key" || ant == "own-key", "unexpected ant {ant}");
    }
    Ok(())
}

#[test]
fn invalid_files_report_config_errors() -> TestResult {
    let dir = tempfile::tempdir()?;

    let path = write_toml(&dir, "[[ants]]\nant_id = \"x\"\nmax_capacity = 0\n")?;
    assert!(matches!(
        load_and_validate(&path),
        Err(FormicaryError::ConfigError(_))
    ));

    let path = write_toml(&dir, "[scheduler]\nmax_task_timeout = \"soon\"\n")?;
    assert!(matches!(
        load_and_validate(&path),
        Err(FormicaryError::TomlError(_))
    ));
    Ok(())
}

#[test]
fn missing_file_means_defaults() -> TestResult {
    let dir = tempfile::tempdir()?;
    let cfg = load_or_default(dir.path().join("absent.toml"))?;
    let defaults = ConfigFile::default();
    assert_eq!(cfg.scheduler, defaults.scheduler);
    assert_eq!(cfg.ants.len(), 1);
    Ok(())
}
