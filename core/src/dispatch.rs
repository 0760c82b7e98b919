//! The dispatch collaborator that actually transmits commands.
//!
//! Transports (message brokers, direct RPC) live outside this workspace. The
//! engine only needs to know whether a send succeeded, so that a command which
//! never left the process is failed immediately instead of waiting for its
//! timeout.

use crate::command::Command;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors reported by a [`CommandSender`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The transport refused or failed to deliver the command.
    #[error("Failed to send command {command_id}: {reason}")]
    Transport {
        /// The command that could not be sent
        command_id: String,
        /// Why the transport failed
        reason: String,
    },

    /// The command could not be encoded for the transport.
    #[error("Failed to encode command {command_id}: {reason}")]
    Encoding {
        /// The command that could not be encoded
        command_id: String,
        /// Why encoding failed
        reason: String,
    },
}

/// Sends commands to remote handlers.
///
/// # Dyn Compatibility
///
/// Returns `Pin<Box<dyn Future>>` instead of using `async fn` so that senders
/// can be passed around as `&dyn CommandSender` / `Arc<dyn CommandSender>`.
pub trait CommandSender: Send + Sync {
    /// Transmit a command.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the command could not be handed to the transport.
    fn send<'a>(
        &'a self,
        command: &'a dyn Command,
    ) -> Pin<Box<dyn Future<Output = Result<(), SendError>> + Send + 'a>>;
}
