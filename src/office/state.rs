use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Created with the pool, never started.
    NotStarted,
    /// Process and connection are live, no task running.
    Started,
    /// Exactly one task is executing.
    Busy,
    /// Process is being replaced after a crash, timeout or task limit.
    Restarting,
    /// Explicitly stopped.
    Stopped,
    /// Could not be (re)started within the start budget.
    Failed,
}

impl InstanceState {
    /// Only an idle, connected instance may be handed a task.
    pub fn accepts_tasks(self) -> bool {
        self == InstanceState::Started
    }

    pub fn is_live(self) -> bool {
        matches!(
            self,
            InstanceState::Started | InstanceState::Busy | InstanceState::Restarting
        )
    }

    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (NotStarted, Started)
                | (NotStarted, Failed)
                | (Stopped, Started)
                | (Stopped, Failed)
                | (Failed, Started)
                | (Failed, Failed)
                | (Started, Busy)
                | (Busy, Started)
                | (Started, Restarting)
                | (Busy, Restarting)
                | (Restarting, Started)
                | (Restarting, Failed)
                | (_, Stopped)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::NotStarted => write!(f, "not_started"),
            InstanceState::Started => write!(f, "started"),
            InstanceState::Busy => write!(f, "busy"),
            InstanceState::Restarting => write!(f, "restarting"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Failed => write!(f, "failed"),
        }
    }
}
