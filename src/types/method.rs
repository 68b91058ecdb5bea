// src/types/method.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Execution transport an ant uses to run a task.
///
/// A task that does not name a method runs on `KUBERNETES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TaskMethod {
    Shell,
    Docker,
    #[default]
    Kubernetes,
    HttpGet,
    HttpPostForm,
    HttpPostJson,
    HttpPutForm,
    HttpPutJson,
    HttpDelete,
    Websocket,
    ForkJob,
    AwaitForkedJob,
    Messaging,
    ExpireArtifacts,
}

impl TaskMethod {
    pub const ALL: [TaskMethod; 14] = [
        TaskMethod::Shell,
        TaskMethod::Docker,
        TaskMethod::Kubernetes,
        TaskMethod::HttpGet,
        TaskMethod::HttpPostForm,
        TaskMethod::HttpPostJson,
        TaskMethod::HttpPutForm,
        TaskMethod::HttpPutJson,
        TaskMethod::HttpDelete,
        TaskMethod::Websocket,
        TaskMethod::ForkJob,
        TaskMethod::AwaitForkedJob,
        TaskMethod::Messaging,
        TaskMethod::ExpireArtifacts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMethod::Shell => "SHELL",
            TaskMethod::Docker => "DOCKER",
            TaskMethod::Kubernetes => "KUBERNETES",
            TaskMethod::HttpGet => "HTTP_GET",
            TaskMethod::HttpPostForm => "HTTP_POST_FORM",
            TaskMethod::HttpPostJson => "HTTP_POST_JSON",
            TaskMethod::HttpPutForm => "HTTP_PUT_FORM",
            TaskMethod::HttpPutJson => "HTTP_PUT_JSON",
            TaskMethod::HttpDelete => "HTTP_DELETE",
            TaskMethod::Websocket => "WEBSOCKET",
            TaskMethod::ForkJob => "FORK_JOB",
            TaskMethod::AwaitForkedJob => "AWAIT_FORKED_JOB",
            TaskMethod::Messaging => "MESSAGING",
            TaskMethod::ExpireArtifacts => "EXPIRE_ARTIFACTS",
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(
            self,
            TaskMethod::HttpGet
                | TaskMethod::HttpPostForm
                | TaskMethod::HttpPostJson
                | TaskMethod::HttpPutForm
                | TaskMethod::HttpPutJson
                | TaskMethod::HttpDelete
        )
    }

    /// HTTP methods use the script as the request body/url list.
    pub fn requires_script(&self) -> bool {
        self.is_http()
            || matches!(
                self,
                TaskMethod::Shell | TaskMethod::Docker | TaskMethod::Kubernetes
            )
    }

    pub fn supports_cache(&self) -> bool {
        matches!(self, TaskMethod::Docker | TaskMethod::Kubernetes)
    }

    pub fn supports_dependent_artifacts(&self) -> bool {
        matches!(
            self,
            TaskMethod::Shell | TaskMethod::Docker | TaskMethod::Kubernetes
        )
    }

    pub fn supports_capture_stdout(&self) -> bool {
        self.is_http() || *self == TaskMethod::Shell
    }

    /// Methods the scheduler resolves itself instead of dispatching to an ant.
    pub fn is_scheduler_local(&self) -> bool {
        matches!(self, TaskMethod::ForkJob | TaskMethod::AwaitForkedJob)
    }
}

impl fmt::Display for TaskMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        TaskMethod::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == upper)
            .ok_or_else(|| format!("invalid task method: {s}"))
    }
}

impl TryFrom<String> for TaskMethod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskMethod> for String {
    fn from(method: TaskMethod) -> Self {
        method.as_str().to_string()
    }
}
