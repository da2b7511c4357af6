// Command Statuses
//
// Per-command outcome recorded by the applier, keyed by command id.

use serde::Serialize;

use crate::log::{CommandId, SequenceNumber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandState {
    Queued,
    Executing,
    Success,
    Error,
}

/// Outcome of a command on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandStatus {
    pub command_id: CommandId,
    pub sequence: SequenceNumber,
    pub state: CommandState,
    pub message: String,
}

impl CommandStatus {
    pub fn queued(command_id: CommandId, sequence: SequenceNumber) -> Self {
        Self::new(command_id, sequence, CommandState::Queued, "Statement written to command log")
    }

    pub fn executing(command_id: CommandId, sequence: SequenceNumber) -> Self {
        Self::new(command_id, sequence, CommandState::Executing, "Executing statement")
    }

    pub fn success(
        command_id: CommandId,
        sequence: SequenceNumber,
        message: impl Into<String>,
    ) -> Self {
        Self::new(command_id, sequence, CommandState::Success, message)
    }

    pub fn error(
        command_id: CommandId,
        sequence: SequenceNumber,
        message: impl Into<String>,
    ) -> Self {
        Self::new(command_id, sequence, CommandState::Error, message)
    }

    fn new(
        command_id: CommandId,
        sequence: SequenceNumber,
        state: CommandState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            command_id,
            sequence,
            state,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, CommandState::Success | CommandState::Error)
    }
}
