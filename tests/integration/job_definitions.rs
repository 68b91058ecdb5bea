// tests/integration/job_definitions.rs

use std::io::Write;

use formicary::errors::FormicaryError;
use formicary::load_definition;

use crate::common::{JobDefinitionBuilder, TACO_YAML, TaskDefinitionBuilder, TestResult};

#[test]
fn definition_file_loads_and_renders() -> TestResult {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(TACO_YAML.as_bytes())?;

    let job = load_definition(file.path())?;
    assert_eq!(job.job_type, "taco-job");
    assert_eq!(job.get_first_task()?.task_type, "allocate");
    assert_eq!(job.get_last_task().map(|t| t.task_type.as_str()), Some("deallocate"));
    let always: Vec<&str> = job
        .get_last_always_run_tasks()
        .iter()
        .map(|t| t.task_type.as_str())
        .collect();
    assert_eq!(always, vec!["deallocate"]);

    let diagram = job.mermaid(None)?;
    assert!(diagram.starts_with("flowchart TD"));
    assert!(diagram.contains("taco_tuesday"));
    Ok(())
}

#[test]
fn unreadable_or_invalid_files_are_reported() -> TestResult {
    let dir = tempfile::tempdir()?;
    let err = load_definition(&dir.path().join("missing.yaml")).unwrap_err();
    assert!(format!("{err:#}").contains("missing.yaml"));

    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(b"tasks: []\n")?;
    let err = load_definition(file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("job_type"));
    Ok(())
}

#[test]
fn cycles_are_rejected() {
    let job = JobDefinitionBuilder::new("loop")
        .task(TaskDefinitionBuilder::shell("a").on_completed("b").build())
        .task(TaskDefinitionBuilder::shell("b").on_completed("c").build())
        .task(
            TaskDefinitionBuilder::shell("c")
                .on_exit("1", "b")
                .on_completed("d")
                .build(),
        )
        .task(TaskDefinitionBuilder::shell("d").build())
        .build_unchecked();

    assert!(matches!(job.validate(), Err(FormicaryError::DagCycle(_))));
}

#[test]
fn unknown_target_and_multiple_sinks_are_rejected() {
    let unknown = JobDefinitionBuilder::new("unknown")
        .task(TaskDefinitionBuilder::shell("a").on_completed("nope").build())
        .build_unchecked();
    assert!(matches!(
        unknown.validate(),
        Err(FormicaryError::TaskNotFound(_))
    ));

    let two_sinks = JobDefinitionBuilder::new("fork-in-road")
        .task(
            TaskDefinitionBuilder::shell("a")
                .on_exit("1", "left")
                .on_completed("right")
                .build(),
        )
        .task(TaskDefinitionBuilder::shell("left").build())
        .task(TaskDefinitionBuilder::shell("right").build())
        .build_unchecked();
    match two_sinks.validate() {
        Err(FormicaryError::Validation(msg)) => assert!(msg.contains("multiple leaf tasks")),
        other => panic!("expected validation error, got {other:?}"),
    }
}
