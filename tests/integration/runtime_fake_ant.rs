// tests/integration/runtime_fake_ant.rs

use std::time::Duration;

use formicary::engine::RuntimeOptions;
use formicary::types::RequestState;
use formicary::types::error_code::ERR_TASK_TIMED_OUT;

use crate::common::{
    CHILD_YAML, FakeOutcome, JobDefinitionBuilder, PARENT_YAML, TACO_YAML, TaskDefinitionBuilder,
    TestResult, fast_options, run_with_fake_ant, yaml,
};

#[tokio::test]
async fn taco_tuesday_follows_exit_code_branch() -> TestResult {
    let run = run_with_fake_ant(vec![yaml(TACO_YAML)], fast_options(), |ant| {
        ant.script("check", vec![FakeOutcome::Exit("tuesday".into())])
    })
    .await;

    let expected = vec!["allocate", "check", "taco-tuesday", "party", "deallocate"];
    assert_eq!(run.executed(), expected);

    let report = run.summary.job(run.request_id).ok_or("job missing from summary")?;
    assert_eq!(report.state(), RequestState::Completed);
    assert_eq!(report.executed_tasks(), expected);
    assert!(run.summary.all_completed());
    Ok(())
}

#[tokio::test]
async fn taco_monday_skips_party() -> TestResult {
    let run = run_with_fake_ant(vec![yaml(TACO_YAML)], fast_options(), |ant| {
        ant.script("check", vec![FakeOutcome::Exit("MONDAY".into())])
    })
    .await;

    assert_eq!(
        run.executed(),
        vec!["allocate", "check", "manic-monday", "deallocate"]
    );
    Ok(())
}

#[tokio::test]
async fn fatal_failure_still_runs_always_run_task() -> TestResult {
    let run = run_with_fake_ant(vec![yaml(TACO_YAML)], fast_options(), |ant| {
        ant.script("check", vec![FakeOutcome::fail("1")])
    })
    .await;

    assert_eq!(run.executed(), vec!["allocate", "check", "deallocate"]);
    let report = run.summary.job(run.request_id).ok_or("job missing")?;
    assert_eq!(report.state(), RequestState::Failed);
    let deallocate = report
        .execution
        .get_task("deallocate")
        .ok_or("deallocate not recorded")?;
    assert_eq!(deallocate.task_state, RequestState::Completed);
    Ok(())
}

#[tokio::test]
async fn task_retries_until_it_succeeds() -> TestResult {
    let definition = JobDefinitionBuilder::new("retrying")
        .task(
            TaskDefinitionBuilder::shell("flaky")
                .retry(2)
                .delay_between_retries(Duration::from_millis(20))
                .on_completed("after")
                .build(),
        )
        .task(TaskDefinitionBuilder::shell("after").build())
        .build();

    let run = run_with_fake_ant(vec![definition], fast_options(), |ant| {
        ant.script(
            "flaky",
            vec![FakeOutcome::fail("1"), FakeOutcome::fail("1"), FakeOutcome::Complete],
        )
    })
    .await;

    assert_eq!(run.executed(), vec!["flaky", "flaky", "flaky", "after"]);
    let report = run.summary.job(run.request_id).ok_or("job missing")?;
    assert_eq!(report.state(), RequestState::Completed);
    assert_eq!(report.execution.get_task("flaky").ok_or("flaky")?.retried, 2);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_fail_the_job() -> TestResult {
    let source = r#"
job_type: doomed
tasks:
- task_type: build
  method: SHELL
  retry: 1
  delay_between_retries: 20ms
  script: [make]
"#;
    let run = run_with_fake_ant(vec![yaml(source)], fast_options(), |ant| {
        ant.script("build", vec![FakeOutcome::fail("2"), FakeOutcome::fail("2")])
    })
    .await;

    assert_eq!(run.executed(), vec!["build", "build"]);
    let report = run.summary.job(run.request_id).ok_or("job missing")?;
    assert_eq!(report.state(), RequestState::Failed);
    Ok(())
}

#[tokio::test]
async fn hanging_task_times_out_and_is_cancelled() -> TestResult {
    let source = r#"
job_type: slow
tasks:
- task_type: sleepy
  method: SHELL
  timeout: 100ms
  script: [sleep 60]
"#;
    let run = run_with_fake_ant(vec![yaml(source)], fast_options(), |ant| {
        ant.script("sleepy", vec![FakeOutcome::Hang])
    })
    .await;

    assert_eq!(run.cancelled(), vec!["sleepy"]);
    let report = run.summary.job(run.request_id).ok_or("job missing")?;
    assert_eq!(report.state(), RequestState::Failed);
    let sleepy = report.execution.get_task("sleepy").ok_or("sleepy missing")?;
    assert_eq!(sleepy.error_code.as_deref(), Some(ERR_TASK_TIMED_OUT));
    Ok(())
}

#[tokio::test]
async fn sealed_responses_round_trip_with_shared_secret() -> TestResult {
    let options = RuntimeOptions {
        shared_secret: "topsecret".into(),
        ..fast_options()
    };
    let run = run_with_fake_ant(vec![yaml(TACO_YAML)], options, |ant| {
        ant.script("check", vec![FakeOutcome::Exit("wednesday".into())])
    })
    .await;

    assert_eq!(
        run.executed(),
        vec!["allocate", "check", "party", "deallocate"]
    );
    assert!(run.summary.all_completed());
    Ok(())
}

#[tokio::test]
async fn forked_child_job_is_awaited() -> TestResult {
    let run = run_with_fake_ant(
        vec![yaml(PARENT_YAML), yaml(CHILD_YAML)],
        fast_options(),
        |ant| ant,
    )
    .await;

    assert_eq!(run.executed(), vec!["work", "report"]);
    assert_eq!(run.summary.jobs.len(), 2);

    let parent = run.summary.job(run.request_id).ok_or("parent missing")?;
    assert_eq!(parent.state(), RequestState::Completed);
    assert_eq!(parent.executed_tasks(), vec!["fork", "wait", "report"]);

    let child = run
        .summary
        .jobs
        .iter()
        .find(|j| j.request.parent_id == Some(run.request_id))
        .ok_or("child missing")?;
    assert_eq!(child.state(), RequestState::Completed);
    Ok(())
}

#[tokio::test]
async fn failed_child_fails_the_await() -> TestResult {
    let run = run_with_fake_ant(
        vec![yaml(PARENT_YAML), yaml(CHILD_YAML)],
        fast_options(),
        |ant| ant.script("work", vec![FakeOutcome::fail_with_code("1", "ERR_FATAL")]),
    )
    .await;

    assert_eq!(run.executed(), vec!["work"]);
    let parent = run.summary.job(run.request_id).ok_or("parent missing")?;
    assert_eq!(parent.state(), RequestState::Failed);
    Ok(())
}

#[tokio::test]
async fn job_context_flows_into_later_requests() -> TestResult {
    let source = r#"
job_type: context
tasks:
- task_type: produce
  method: SHELL
  script: [echo produce]
  on_completed: consume
- task_type: consume
  method: SHELL
  script: [echo consume]
"#;
    let run = run_with_fake_ant(vec![yaml(source)], fast_options(), |ant| {
        ant.script(
            "produce",
            vec![FakeOutcome::CompleteWithContext("artifact".into(), "v1.tar".into())],
        )
    })
    .await;

    let report = run.summary.job(run.request_id).ok_or("job missing")?;
    assert_eq!(report.state(), RequestState::Completed);
    let entry = report
        .execution
        .get_context("artifact")
        .ok_or("context not recorded")?;
    assert_eq!(entry.value, serde_json::json!("v1.tar"));
    Ok(())
}
