//! # Command Reply Core
//!
//! Core types and collaborator traits for correlating asynchronous command
//! replies with the callers awaiting them.
//!
//! A caller issues a command, the command travels through an external broker
//! to a remote handler, and at some later time a reply comes back over a
//! separate network channel. This crate defines the vocabulary shared by every
//! participant in that round trip:
//!
//! - **Command**: identity of a request to mutate one aggregate ([`command`])
//! - **Completion policy**: when a caller considers its command done
//! - **Reply envelope**: decoded unit of the inbound reply protocol ([`reply`])
//! - **Result handle**: resolve-once slot the caller waits on ([`handle`])
//! - **Collaborators**: command transport and aggregate loading traits
//!   ([`dispatch`], [`aggregate`])
//!
//! The engine that ties these together lives in `command-reply-runtime`.
//!
//! ## Example
//!
//! ```
//! use command_reply_core::command::{CommandId, CommandResult, CommandStatus};
//! use command_reply_core::reply::{RemoteReply, ReplyEnvelope};
//!
//! let reply = RemoteReply::from_json(
//!     r#"{"code":1,"commandResult":{"status":"Success","commandId":"c1","aggregateRootId":"a1"}}"#,
//! )?;
//!
//! match reply.classify()? {
//!     ReplyEnvelope::Executed(result) => assert_eq!(result.status, CommandStatus::Success),
//!     ReplyEnvelope::EventHandled(_) => unreachable!(),
//! }
//! # Ok::<(), command_reply_core::reply::ProtocolError>(())
//! ```

/// Aggregate loading collaborator
pub mod aggregate;

/// Commands, completion policies, and command results
pub mod command;

/// Command transport collaborator
pub mod dispatch;

/// Resolve-once result handles
pub mod handle;

/// Reply records and their classification
pub mod reply;

pub use command::{Command, CommandId, CommandResult, CommandStatus, CompletionPolicy};
pub use handle::ResultHandle;
pub use reply::{EventHandledMessage, ProtocolError, RemoteReply, ReplyEnvelope, ReplyKind};
