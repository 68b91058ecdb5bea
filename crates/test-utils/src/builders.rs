#![allow(dead_code)]

use std::time::Duration;

use formicary::dag::{ExitTarget, JobDefinition, TaskDefinition};
use formicary::resource::AntRegistration;
use formicary::types::TaskMethod;

/// Builder for `JobDefinition` to simplify test setup.
pub struct JobDefinitionBuilder {
    job: JobDefinition,
    tasks: Vec<TaskDefinition>,
}

impl JobDefinitionBuilder {
    pub fn new(job_type: &str) -> Self {
        Self {
            job: JobDefinition::new(job_type),
            tasks: Vec::new(),
        }
    }

    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.job.retry = retry;
        self
    }

    pub fn hard_reset_after_retries(mut self, n: u32) -> Self {
        self.job.hard_reset_after_retries = n;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.job.timeout = Some(timeout);
        self
    }

    pub fn delay_between_retries(mut self, delay: Duration) -> Self {
        self.job.delay_between_retries = Some(delay);
        self
    }

    /// Build without validating, for tests of the validator itself.
    pub fn build_unchecked(self) -> JobDefinition {
        let mut job = self.job;
        for task in self.tasks {
            job.add_task(task).expect("duplicate task in builder");
        }
        job
    }

    pub fn build(self) -> JobDefinition {
        let job = self.build_unchecked();
        job.validate().expect("Failed to build valid job from builder");
        job
    }
}

/// Builder for `TaskDefinition`.
pub struct TaskDefinitionBuilder {
    task: TaskDefinition,
}

impl TaskDefinitionBuilder {
    /// A `SHELL` task running `echo <task_type>`.
    pub fn shell(task_type: &str) -> Self {
        let mut task = TaskDefinition::new(task_type, TaskMethod::Shell);
        task.script = vec![format!("echo {task_type}")];
        Self { task }
    }

    pub fn method(mut self, method: TaskMethod) -> Self {
        self.task.method = method;
        self
    }

    pub fn script(mut self, lines: &[&str]) -> Self {
        self.task.script = lines.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn on_completed(mut self, next: &str) -> Self {
        self.task.on_completed = Some(next.to_string());
        self
    }

    pub fn on_failed(mut self, next: &str) -> Self {
        self.task.on_failed = Some(next.to_string());
        self
    }

    pub fn on_exit(mut self, code: &str, target: &str) -> Self {
        self.task
            .on_exit_code
            .insert(code.to_string(), ExitTarget::from(target));
        self
    }

    pub fn always_run(mut self) -> Self {
        self.task.always_run = true;
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.task.allow_failure = true;
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.task.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.task.timeout = Some(timeout);
        self
    }

    pub fn delay_between_retries(mut self, delay: Duration) -> Self {
        self.task.delay_between_retries = Some(delay);
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.task.tags.push(tag.to_string());
        self
    }

    pub fn fork(mut self, job_type: &str) -> Self {
        self.task.method = TaskMethod::ForkJob;
        self.task.fork_job_type = Some(job_type.to_string());
        self.task.script.clear();
        self
    }

    pub fn await_forked(mut self, fork_tasks: &[&str]) -> Self {
        self.task.method = TaskMethod::AwaitForkedJob;
        self.task.await_forked_tasks = fork_tasks.iter().map(|s| s.to_string()).collect();
        self.task.script.clear();
        self
    }

    pub fn build(self) -> TaskDefinition {
        self.task
    }
}

/// Builder for `AntRegistration`.
pub struct AntRegistrationBuilder {
    registration: AntRegistration,
}

impl AntRegistrationBuilder {
    /// A `SHELL` ant with capacity 1.
    pub fn new(ant_id: &str) -> Self {
        Self {
            registration: AntRegistration::new(ant_id, vec![TaskMethod::Shell], 1),
        }
    }

    pub fn methods(mut self, methods: &[TaskMethod]) -> Self {
        self.registration.methods = methods.to_vec();
        self
    }

    pub fn capacity(mut self, max_capacity: u32) -> Self {
        self.registration.max_capacity = max_capacity;
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.registration.tags.push(tag.to_string());
        self
    }

    pub fn encryption_key(mut self, key: &str) -> Self {
        self.registration.encryption_key = Some(key.to_string());
        self
    }

    pub fn build(self) -> AntRegistration {
        self.registration
    }
}
