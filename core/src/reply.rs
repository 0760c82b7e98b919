//! Inbound reply records and their classification.
//!
//! Replies arrive as self-describing [`RemoteReply`] records carrying a numeric
//! kind discriminator. [`RemoteReply::classify`] turns a record into a typed
//! [`ReplyEnvelope`], rejecting unknown kinds and records whose payload does
//! not match their kind.
//!
//! # Wire Format
//!
//! ```text
//! {"code":1,"commandResult":{"status":"Success","commandId":"c1","aggregateRootId":"a1"}}
//! {"code":2,"eventHandledMessage":{"commandId":"c1","aggregateRootId":"a1","commandResult":"ok"}}
//! ```

use crate::command::{CommandId, CommandResult, CommandStatus, STRING_RESULT_TYPE};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding or classifying a reply record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The record is not a valid reply.
    #[error("Malformed reply record: {0}")]
    Malformed(String),

    /// The record carries a kind discriminator nobody understands.
    #[error("Unknown reply kind: {0}")]
    UnknownKind(i32),

    /// The record's kind is known but its payload is absent.
    #[error("Reply of kind {0} is missing its payload")]
    MissingPayload(ReplyKind),
}

/// Kind discriminator of a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    /// The remote command handler finished executing the command.
    CommandExecuted,
    /// An event produced by the command finished downstream processing.
    EventHandled,
}

impl ReplyKind {
    /// Numeric code used on the wire.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::CommandExecuted => 1,
            Self::EventHandled => 2,
        }
    }

    /// Look up a kind by its wire code.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::CommandExecuted),
            2 => Some(Self::EventHandled),
            _ => None,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CommandExecuted => "command_executed",
            Self::EventHandled => "event_handled",
        }
    }
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification that the events of a command have been handled downstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHandledMessage {
    /// The command whose events were handled.
    pub command_id: CommandId,
    /// The aggregate the command targeted.
    pub aggregate_root_id: String,
    /// Payload produced by the event stage, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_result: Option<String>,
    /// Type name of `command_result`, if the sender supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_type: Option<String>,
}

impl EventHandledMessage {
    /// Build the success result delivered to the waiting caller.
    #[must_use]
    pub fn into_command_result(self) -> CommandResult {
        let result_type = self.command_result.as_ref().map(|_| {
            self.result_type
                .clone()
                .unwrap_or_else(|| STRING_RESULT_TYPE.to_string())
        });
        CommandResult {
            status: CommandStatus::Success,
            command_id: self.command_id,
            aggregate_root_id: self.aggregate_root_id,
            result: self.command_result,
            result_type,
        }
    }
}

/// A decoded, classified reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyEnvelope {
    /// The remote command handler finished.
    Executed(CommandResult),
    /// A downstream event triggered by the command finished processing.
    EventHandled(EventHandledMessage),
}

impl ReplyEnvelope {
    /// Kind of this envelope.
    #[must_use]
    pub const fn kind(&self) -> ReplyKind {
        match self {
            Self::Executed(_) => ReplyKind::CommandExecuted,
            Self::EventHandled(_) => ReplyKind::EventHandled,
        }
    }

    /// The command this reply correlates to.
    #[must_use]
    pub const fn command_id(&self) -> &CommandId {
        match self {
            Self::Executed(result) => &result.command_id,
            Self::EventHandled(message) => &message.command_id,
        }
    }
}

impl From<ReplyEnvelope> for RemoteReply {
    fn from(envelope: ReplyEnvelope) -> Self {
        match envelope {
            ReplyEnvelope::Executed(result) => Self {
                code: ReplyKind::CommandExecuted.code(),
                command_result: Some(result),
                event_handled_message: None,
            },
            ReplyEnvelope::EventHandled(message) => Self {
                code: ReplyKind::EventHandled.code(),
                command_result: None,
                event_handled_message: Some(message),
            },
        }
    }
}

/// One reply record as it travels over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteReply {
    /// Kind discriminator, see [`ReplyKind::code`].
    pub code: i32,
    /// Payload for `CommandExecuted` replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_result: Option<CommandResult>,
    /// Payload for `EventHandled` replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_handled_message: Option<EventHandledMessage>,
}

impl RemoteReply {
    /// Parse a record from its JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if the text is not a reply record.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Render the record as single-line JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Classify the record by kind.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnknownKind`] for an unrecognized discriminator
    /// - [`ProtocolError::MissingPayload`] when the payload for the kind is absent
    pub fn classify(self) -> Result<ReplyEnvelope, ProtocolError> {
        let kind = ReplyKind::from_code(self.code).ok_or(ProtocolError::UnknownKind(self.code))?;
        match kind {
            ReplyKind::CommandExecuted => self
                .command_result
                .map(ReplyEnvelope::Executed)
                .ok_or(ProtocolError::MissingPayload(kind)),
            ReplyKind::EventHandled => self
                .event_handled_message
                .map(ReplyEnvelope::EventHandled)
                .ok_or(ProtocolError::MissingPayload(kind)),
        }
    }
}
