// Message types on the command link

use serde::{Deserialize, Serialize};

use crate::dispatch::{DispatchOutcome, Mode};

// Command token from controller/teleop -> runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    ModeChanged,
    Queued,
    Done,
    Ignored,
    Failed,
}

// Acknowledgement runtime -> controller, one per handled token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub token: String,
    pub mode: Mode,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CommandAck {
    pub fn new(token: impl Into<String>, mode: Mode, outcome: &DispatchOutcome) -> Self {
        let (status, detail) = match outcome {
            DispatchOutcome::ModeChanged(_) => (AckStatus::ModeChanged, None),
            DispatchOutcome::Queued(len) => (AckStatus::Queued, Some(format!("{} steps queued", len))),
            DispatchOutcome::Completed { .. } => (AckStatus::Done, None),
            DispatchOutcome::Behavior(end) => (AckStatus::Done, Some(format!("{:?}", end))),
            DispatchOutcome::Ignored => (AckStatus::Ignored, None),
            DispatchOutcome::Failed(e) => (AckStatus::Failed, Some(e.to_string())),
        };
        Self {
            token: token.into(),
            mode,
            status,
            detail,
        }
    }
}

/// Runtime state published every loop tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionState {
    pub mode: Mode,
    /// A command is being executed
    pub busy: bool,
    pub last_token: Option<String>,
    pub handled: u64,
}

impl Default for MotionState {
    fn default() -> Self {
        Self {
            mode: Mode::Waiting,
            busy: false,
            last_token: None,
            handled: 0,
        }
    }
}
