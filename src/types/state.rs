// src/types/state.rs

//! Lifecycle states shared by job requests, job executions, task executions
//! and ant allocations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a request, an execution or a task.
///
/// Every state belongs to exactly one [`StateGroup`]:
/// - waiting: `PENDING`, `READY`
/// - running: `STARTED`, `EXECUTING`
/// - terminal: `COMPLETED`, `FAILED`, `CANCELLED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RequestState {
    #[default]
    Pending,
    Ready,
    Started,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

/// Coarse grouping of [`RequestState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateGroup {
    Waiting,
    Running,
    Terminal,
}

impl RequestState {
    pub const ALL: [RequestState; 7] = [
        RequestState::Pending,
        RequestState::Ready,
        RequestState::Started,
        RequestState::Executing,
        RequestState::Completed,
        RequestState::Failed,
        RequestState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "PENDING",
            RequestState::Ready => "READY",
            RequestState::Started => "STARTED",
            RequestState::Executing => "EXECUTING",
            RequestState::Completed => "COMPLETED",
            RequestState::Failed => "FAILED",
            RequestState::Cancelled => "CANCELLED",
        }
    }

    pub fn group(&self) -> StateGroup {
        match self {
            RequestState::Pending | RequestState::Ready => StateGroup::Waiting,
            RequestState::Started | RequestState::Executing => StateGroup::Running,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled => {
                StateGroup::Terminal
            }
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.group() == StateGroup::Waiting
    }

    pub fn is_running(&self) -> bool {
        self.group() == StateGroup::Running
    }

    pub fn is_terminal(&self) -> bool {
        self.group() == StateGroup::Terminal
    }

    /// Still being worked on (waiting or running).
    pub fn is_processing(&self) -> bool {
        !self.is_terminal()
    }

    pub fn completed(&self) -> bool {
        *self == RequestState::Completed
    }

    /// `FAILED` or `CANCELLED`.
    pub fn failed(&self) -> bool {
        matches!(self, RequestState::Failed | RequestState::Cancelled)
    }

    pub fn cancelled(&self) -> bool {
        *self == RequestState::Cancelled
    }

    pub fn can_restart(&self) -> bool {
        self.failed()
    }

    pub fn can_cancel(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// Cancellation is accepted from every non-terminal state; the only way
    /// out of a terminal state is a restart back to `PENDING`.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;

        if next == Cancelled {
            return self.can_cancel();
        }

        match self {
            Failed | Cancelled => next == Pending,
            Pending => matches!(next, Ready | Failed),
            Ready => matches!(next, Started | Executing | Failed | Pending),
            Started => matches!(next, Executing | Completed | Failed),
            Executing => matches!(next, Completed | Failed),
            Completed => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        RequestState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| format!("invalid request state: {s}"))
    }
}

impl TryFrom<String> for RequestState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RequestState> for String {
    fn from(state: RequestState) -> Self {
        state.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_is_in_exactly_one_group() {
        for state in RequestState::ALL {
            let memberships = [state.is_waiting(), state.is_running(), state.is_terminal()]
                .iter()
                .filter(|b| **b)
                .count();
            assert_eq!(memberships, 1, "{state} must belong to one group");
        }
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("completed".parse::<RequestState>(), Ok(RequestState::Completed));
        assert_eq!(" Failed ".parse::<RequestState>(), Ok(RequestState::Failed));
        assert!("DONE".parse::<RequestState>().is_err());
    }

    #[test]
    fn restart_and_cancel_rules() {
        assert!(RequestState::Failed.can_restart());
        assert!(RequestState::Cancelled.can_restart());
        assert!(!RequestState::Completed.can_restart());
        assert!(!RequestState::Executing.can_restart());

        assert!(RequestState::Pending.can_cancel());
        assert!(RequestState::Executing.can_cancel());
        assert!(!RequestState::Completed.can_cancel());
    }

    #[test]
    fn transitions_follow_lifecycle() {
        use RequestState::*;
        assert!(Pending.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Executing));
        assert!(Started.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Completed));
        assert!(Executing.can_transition_to(Cancelled));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Executing.can_transition_to(Ready));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn serde_uses_upper_case_strings() {
        let json = serde_json::to_string(&RequestState::Executing).unwrap();
        assert_eq!(json, "\"EXECUTING\"");
        let back: RequestState = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(back, RequestState::Cancelled);
    }
}
