//! Local failure resolution: timeouts and commands that were never sent.
//!
//! Both paths synthesize a [`CommandStatus::Failed`] result carrying a
//! diagnostic message and resolve the caller's handle with it. Neither retries.
//!
//! [`CommandStatus::Failed`]: command_reply_core::command::CommandStatus::Failed

use crate::metrics as names;
use crate::registry::{EvictionListener, PendingRegistry, PendingRequest};
use chrono::Utc;
use command_reply_core::command::{Command, CommandResult};

/// Diagnostic delivered when no reply arrived in time.
pub const TIMEOUT_MESSAGE: &str = "Wait for command reply timed out.";

/// Diagnostic delivered when the command could never be transmitted.
pub const SEND_FAILED_MESSAGE: &str = "Failed to send the command.";

/// Resolves expired registry entries with a timeout failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeoutResolver;

impl EvictionListener for TimeoutResolver {
    fn on_expired(&self, request: PendingRequest) {
        let waited_ms = (Utc::now() - request.registered_at).num_milliseconds();
        tracing::error!(
            command_id = %request.command_id,
            command_type = %request.command_type,
            aggregate_root_id = %request.aggregate_root_id,
            waited_ms,
            "Wait for command reply timed out"
        );

        let result = CommandResult::failed(
            request.command_id,
            request.aggregate_root_id,
            TIMEOUT_MESSAGE,
        );
        if request.handle.complete(result) {
            metrics::counter!(names::COMMANDS_RESOLVED, "outcome" => "timeout").increment(1);
        }
    }
}

/// Fail a command whose transmission failed, preempting its timeout.
///
/// Returns `true` if a pending entry was found and resolved by this call.
pub fn resolve_send_failure(registry: &PendingRegistry, command: &dyn Command) -> bool {
    let Some(request) = registry.remove(command.id()) else {
        tracing::debug!(
            command_id = %command.id(),
            "Send failure reported for a command that is not pending"
        );
        return false;
    };

    tracing::warn!(
        command_id = %command.id(),
        command_type = %request.command_type,
        aggregate_root_id = %command.aggregate_root_id(),
        "Failed to send command, resolving as failed"
    );

    let result = CommandResult::failed(
        request.command_id,
        command.aggregate_root_id(),
        SEND_FAILED_MESSAGE,
    );
    let resolved = request.handle.complete(result);
    if resolved {
        metrics::counter!(names::COMMANDS_RESOLVED, "outcome" => "send_failed").increment(1);
    }
    resolved
}
