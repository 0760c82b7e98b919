//! Commands, completion policies, and the results delivered back to callers.
//!
//! A command is a request to mutate exactly one aggregate. Once it has been
//! dispatched, its outcome eventually comes back as a [`CommandResult`], either
//! decoded from a remote reply or synthesized locally when the reply never
//! arrives.
//!
//! # Example
//!
//! ```
//! use command_reply_core::command::{CommandId, CommandResult, CommandStatus};
//!
//! let result = CommandResult::failed(
//!     CommandId::new("cmd-1"),
//!     "account-42",
//!     "Failed to send the command.",
//! );
//! assert_eq!(result.status, CommandStatus::Failed);
//! assert_eq!(result.result.as_deref(), Some("Failed to send the command."));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type name reported for results whose payload is a plain diagnostic string.
pub const STRING_RESULT_TYPE: &str = "String";

/// Unique identifier of a command.
///
/// This is the primary key of the pending-request registry: at most one
/// caller may wait on a given id at a time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    /// Create a new `CommandId`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the command ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert into the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CommandId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommandId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A request to mutate one aggregate.
///
/// Only the identity of a command matters to reply correlation; payloads and
/// handlers live with the dispatch collaborator.
pub trait Command: Send + Sync {
    /// Unique id of this command.
    fn id(&self) -> &CommandId;

    /// Id of the aggregate the command targets.
    fn aggregate_root_id(&self) -> &str;

    /// Human readable command type, used in diagnostics.
    fn command_type(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// When a caller considers its command finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletionPolicy {
    /// Resolve as soon as the remote command handler reports execution.
    ExecutedOnly,
    /// Resolve once the events produced by the command have been handled
    /// downstream. Failed or no-op executions still resolve immediately.
    WaitForEventHandled,
}

impl fmt::Display for CompletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecutedOnly => write!(f, "executed_only"),
            Self::WaitForEventHandled => write!(f, "wait_for_event_handled"),
        }
    }
}

/// Outcome status of a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
    /// The command executed and produced changes.
    Success,
    /// The command failed, was never sent, or timed out.
    Failed,
    /// The command executed but changed nothing.
    NothingChanged,
}

impl CommandStatus {
    /// Whether no downstream event can follow a result with this status.
    #[must_use]
    pub const fn is_terminal_without_events(self) -> bool {
        matches!(self, Self::Failed | Self::NothingChanged)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::NothingChanged => write!(f, "nothing_changed"),
        }
    }
}

/// The value ultimately delivered to the caller awaiting a command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// Outcome status.
    pub status: CommandStatus,
    /// The command this result belongs to.
    pub command_id: CommandId,
    /// The aggregate the command targeted.
    pub aggregate_root_id: String,
    /// Result payload, or a diagnostic message for local failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Type name of `result`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_type: Option<String>,
}

impl CommandResult {
    /// Create a result with no payload.
    #[must_use]
    pub fn new(
        status: CommandStatus,
        command_id: CommandId,
        aggregate_root_id: impl Into<String>,
    ) -> Self {
        Self {
            status,
            command_id,
            aggregate_root_id: aggregate_root_id.into(),
            result: None,
            result_type: None,
        }
    }

    /// Attach a payload and its type name.
    #[must_use]
    pub fn with_result(mut self, result: impl Into<String>, result_type: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self.result_type = Some(result_type.into());
        self
    }

    /// A locally synthesized failure carrying a diagnostic message.
    #[must_use]
    pub fn failed(
        command_id: CommandId,
        aggregate_root_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(CommandStatus::Failed, command_id, aggregate_root_id)
            .with_result(message, STRING_RESULT_TYPE)
    }

    /// Whether the command succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandResult[status={}, command_id={}, aggregate_root_id={}",
            self.status, self.command_id, self.aggregate_root_id
        )?;
        if let Some(result) = &self.result {
            write!(f, ", result={result}")?;
        }
        write!(f, "]")
    }
}
