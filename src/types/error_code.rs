// src/types/error_code.rs

//! Error codes reported by ants/the scheduler and the rules that classify a
//! failed task into an [`ErrorCodeAction`].

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{FormicaryError, Result};

pub const ERR_JOB_EXECUTE: &str = "ERR_JOB_EXECUTE";
pub const ERR_JOB_CANCELLED: &str = "ERR_JOB_CANCELLED";
pub const ERR_JOB_TIMED_OUT: &str = "ERR_JOB_TIMED_OUT";
pub const ERR_ANTS_UNAVAILABLE: &str = "ERR_ANTS_UNAVAILABLE";
pub const ERR_ANT_EXECUTION_FAILED: &str = "ERR_ANT_EXECUTION_FAILED";
pub const ERR_TASK_EXECUTE: &str = "ERR_TASK_EXECUTE";
pub const ERR_TASK_TIMED_OUT: &str = "ERR_TASK_TIMED_OUT";
pub const ERR_INVALID_NEXT_TASK: &str = "ERR_INVALID_NEXT_TASK";
pub const ERR_MARSHALING_FAILED: &str = "ERR_MARSHALING_FAILED";
pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_FATAL: &str = "ERR_FATAL";
pub const ERR_RESTART_JOB: &str = "ERR_RESTART_JOB";
pub const ERR_RESTART_TASK: &str = "ERR_RESTART_TASK";

/// What the scheduler does with a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCodeAction {
    /// Retry the task while its retry budget lasts, then fall back to job retries.
    #[default]
    RetryTask,
    /// Skip task retries and restart the job.
    RetryJob,
    /// Stop the job; no retries.
    HardFailure,
    /// Stop the job without retries; it may be resumed by an operator.
    SuspendJob,
}

impl ErrorCodeAction {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorCodeAction::HardFailure | ErrorCodeAction::SuspendJob)
    }
}

impl fmt::Display for ErrorCodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCodeAction::RetryTask => "RETRY_TASK",
            ErrorCodeAction::RetryJob => "RETRY_JOB",
            ErrorCodeAction::HardFailure => "HARD_FAILURE",
            ErrorCodeAction::SuspendJob => "SUSPEND_JOB",
        };
        f.write_str(s)
    }
}

impl FromStr for ErrorCodeAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RETRY_TASK" => Ok(ErrorCodeAction::RetryTask),
            "RETRY_JOB" => Ok(ErrorCodeAction::RetryJob),
            "HARD_FAILURE" => Ok(ErrorCodeAction::HardFailure),
            "SUSPEND_JOB" => Ok(ErrorCodeAction::SuspendJob),
            other => Err(format!("invalid error-code action: {other}")),
        }
    }
}

/// A configured rule mapping a failure (by message regex and/or exit code)
/// to an error code and action.
///
/// ```toml
/// [[error_codes]]
/// regex = "connection refused"
/// error_code = "ERR_NETWORK"
/// action = "RETRY_TASK"
/// task_type_scope = "fetch"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorCodeRule {
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub exit_code: Option<String>,
    pub error_code: String,
    #[serde(default)]
    pub action: ErrorCodeAction,
    /// Restrict the rule to one task type.
    #[serde(default)]
    pub task_type_scope: Option<String>,
}

impl ErrorCodeRule {
    pub fn validate(&self) -> Result<()> {
        if self.error_code.trim().is_empty() {
            return Err(FormicaryError::ConfigError(
                "error code rule must define error_code".to_string(),
            ));
        }
        if self.regex.is_none() && self.exit_code.is_none() {
            return Err(FormicaryError::ConfigError(format!(
                "error code rule '{}' must define regex or exit_code",
                self.error_code
            )));
        }
        Ok(())
    }
}

/// Outcome of classifying a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub error_code: String,
    pub action: ErrorCodeAction,
}

/// Compiled set of [`ErrorCodeRule`]s.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    rules: Vec<(ErrorCodeRule, Option<Regex>)>,
}

impl ErrorClassifier {
    pub fn new(rules: Vec<ErrorCodeRule>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            rule.validate()?;
            let regex = match rule.regex.as_deref() {
                Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                    FormicaryError::ConfigError(format!(
                        "invalid regex for error code '{}': {e}",
                        rule.error_code
                    ))
                })?),
                None => None,
            };
            compiled.push((rule, regex));
        }
        Ok(Self { rules: compiled })
    }

    /// Classify a failed task.
    ///
    /// A reported `error_code` is kept unless a matching rule overrides it;
    /// the first matching rule wins.
    pub fn classify(
        &self,
        task_type: &str,
        exit_code: Option<&str>,
        error_code: Option<&str>,
        message: &str,
    ) -> Classification {
        for (rule, regex) in &self.rules {
            if let Some(scope) = rule.task_type_scope.as_deref() {
                if scope != task_type {
                    continue;
                }
            }
            let exit_matches = match (rule.exit_code.as_deref(), exit_code) {
                (Some(expected), Some(actual)) => expected.eq_ignore_ascii_case(actual),
                (Some(_), None) => false,
                (None, _) => true,
            };
            let message_matches = regex.as_ref().is_none_or(|re| re.is_match(message));
            if exit_matches && message_matches {
                return Classification {
                    error_code: rule.error_code.clone(),
                    action: rule.action,
                };
            }
        }

        let error_code = error_code
            .filter(|c| !c.is_empty())
            .unwrap_or(ERR_TASK_EXECUTE)
            .to_string();
        let action = default_action_for(&error_code);
        Classification { error_code, action }
    }
}

/// Built-in action for well-known error codes.
pub fn default_action_for(error_code: &str) -> ErrorCodeAction {
    match error_code {
        ERR_FATAL | ERR_VALIDATION | ERR_MARSHALING_FAILED | ERR_JOB_CANCELLED
        | ERR_JOB_TIMED_OUT => ErrorCodeAction::HardFailure,
        ERR_RESTART_JOB => ErrorCodeAction::RetryJob,
        _ => ErrorCodeAction::RetryTask,
    }
}
