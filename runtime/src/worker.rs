//! Result dispatch workers.
//!
//! Decoded replies are routed by kind onto one of two unbounded FIFO queues.
//! Each queue is drained by its own single-consumer task, so a burst of one
//! kind never starves the other and replies of the same kind resolve in
//! arrival order.
//!
//! ```text
//!                     ┌──► executed queue ──► executed worker ──┐
//!  RemoteReply ─► route                                          ├─► registry ─► ResultHandle
//!                     └──► event queue ─────► event worker ─────┘
//! ```

use crate::metrics as names;
use crate::registry::{ConditionalRemoval, PendingRegistry};
use command_reply_core::command::{CommandResult, CompletionPolicy};
use command_reply_core::reply::{EventHandledMessage, RemoteReply, ReplyEnvelope};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What a worker did with one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The caller's handle was resolved by this reply.
    Resolved,
    /// The entry was removed but its handle had already been resolved.
    AlreadyResolved,
    /// The reply was accepted but the command keeps waiting for its event.
    AwaitingEvent,
    /// No pending entry: the command timed out or was resolved earlier.
    NotPending,
}

/// Apply a `CommandExecuted` reply to the registry.
///
/// `ExecutedOnly` commands resolve immediately. `WaitForEventHandled` commands
/// resolve only when the status rules out any downstream event.
pub fn resolve_executed(registry: &PendingRegistry, result: CommandResult) -> Resolution {
    let status = result.status;
    let removal = registry.remove_if(&result.command_id, |request| {
        request.policy == CompletionPolicy::ExecutedOnly || status.is_terminal_without_events()
    });

    match removal {
        ConditionalRemoval::Absent => {
            tracing::debug!(
                command_id = %result.command_id,
                status = %status,
                "Command executed reply discarded, command is no longer pending"
            );
            metrics::counter!(names::LATE_REPLIES).increment(1);
            Resolution::NotPending
        }
        ConditionalRemoval::Retained => {
            tracing::debug!(
                command_id = %result.command_id,
                "Command executed, waiting for its events to be handled"
            );
            Resolution::AwaitingEvent
        }
        ConditionalRemoval::Removed(request) => {
            let command_id = result.command_id.clone();
            if request.handle.complete(result) {
                tracing::debug!(
                    command_id = %command_id,
                    status = %status,
                    policy = %request.policy,
                    "Command result delivered on execution"
                );
                metrics::counter!(names::COMMANDS_RESOLVED, "outcome" => "executed").increment(1);
                Resolution::Resolved
            } else {
                Resolution::AlreadyResolved
            }
        }
    }
}

/// Apply an `EventHandled` reply to the registry.
///
/// The entry is removed unconditionally and resolved with a success result
/// carrying the event-stage payload.
pub fn resolve_event_handled(registry: &PendingRegistry, message: EventHandledMessage) -> Resolution {
    let Some(request) = registry.remove(&message.command_id) else {
        tracing::debug!(
            command_id = %message.command_id,
            "Event handled reply discarded, command is no longer pending"
        );
        metrics::counter!(names::LATE_REPLIES).increment(1);
        return Resolution::NotPending;
    };

    let result = message.into_command_result();
    let command_id = result.command_id.clone();
    if request.handle.complete(result) {
        tracing::debug!(command_id = %command_id, "Command result delivered on event handled");
        metrics::counter!(names::COMMANDS_RESOLVED, "outcome" => "event_handled").increment(1);
        Resolution::Resolved
    } else {
        Resolution::AlreadyResolved
    }
}

/// Sending side of the two reply queues.
///
/// Cheap to clone; every connection task holds one.
#[derive(Debug, Clone)]
pub struct ReplyRouter {
    executed: mpsc::UnboundedSender<CommandResult>,
    event_handled: mpsc::UnboundedSender<EventHandledMessage>,
}

impl ReplyRouter {
    /// Classify a record and enqueue it for its worker.
    ///
    /// Unknown kinds and records missing their payload are logged and dropped.
    /// Returns `true` if the record was enqueued.
    pub fn route(&self, reply: RemoteReply) -> bool {
        let code = reply.code;
        match reply.classify() {
            Ok(envelope) => self.route_envelope(envelope),
            Err(e) => {
                tracing::warn!(code, error = %e, "Invalid remote reply dropped");
                metrics::counter!(names::REPLIES_REJECTED, "reason" => "protocol").increment(1);
                false
            }
        }
    }

    /// Enqueue an already classified envelope.
    pub fn route_envelope(&self, envelope: ReplyEnvelope) -> bool {
        let kind = envelope.kind();
        let queued = match envelope {
            ReplyEnvelope::Executed(result) => self.executed.send(result).is_ok(),
            ReplyEnvelope::EventHandled(message) => self.event_handled.send(message).is_ok(),
        };

        if queued {
            metrics::counter!(names::REPLIES_RECEIVED, "kind" => kind.as_str()).increment(1);
        } else {
            tracing::warn!(kind = %kind, "Reply worker stopped, reply dropped");
            metrics::counter!(names::REPLIES_REJECTED, "reason" => "stopped").increment(1);
        }
        queued
    }
}

/// Join handles of the two running workers.
#[derive(Debug)]
pub struct WorkerHandles {
    /// Executed-reply worker
    pub executed: JoinHandle<()>,
    /// Event-handled-reply worker
    pub event_handled: JoinHandle<()>,
}

/// Create both queues and spawn their workers.
///
/// Workers stop when `token` is cancelled, after resolving whatever was
/// already queued.
#[must_use]
pub fn spawn_workers(
    registry: &Arc<PendingRegistry>,
    token: &CancellationToken,
) -> (ReplyRouter, WorkerHandles) {
    let (executed_tx, executed_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let executed = {
        let registry = Arc::clone(registry);
        tokio::spawn(run_worker(
            "executed",
            executed_rx,
            token.clone(),
            move |result| {
                resolve_executed(&registry, result);
            },
        ))
    };
    let event_handled = {
        let registry = Arc::clone(registry);
        tokio::spawn(run_worker(
            "event_handled",
            event_rx,
            token.clone(),
            move |message| {
                resolve_event_handled(&registry, message);
            },
        ))
    };

    (
        ReplyRouter {
            executed: executed_tx,
            event_handled: event_tx,
        },
        WorkerHandles {
            executed,
            event_handled,
        },
    )
}

async fn run_worker<T, F>(
    name: &'static str,
    mut queue: mpsc::UnboundedReceiver<T>,
    token: CancellationToken,
    mut handle: F,
) where
    F: FnMut(T),
{
    tracing::debug!(worker = name, "Worker started");
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            item = queue.recv() => match item {
                Some(item) => handle(item),
                None => break,
            },
        }
    }

    // Replies accepted before shutdown still get resolved.
    queue.close();
    let mut drained = 0_usize;
    while let Ok(item) = queue.try_recv() {
        handle(item);
        drained += 1;
    }
    tracing::debug!(worker = name, drained, "Worker stopped");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::registry::PendingRequest;
    use crate::resolver::TimeoutResolver;
    use command_reply_core::command::{CommandId, CommandStatus};
    use command_reply_core::handle::ResultHandle;
    use std::time::Duration;

    fn registry() -> Arc<PendingRegistry> {
        Arc::new(PendingRegistry::new(
            Duration::from_secs(60),
            Arc::new(TimeoutResolver),
        ))
    }

    fn register(registry: &PendingRegistry, id: &str, policy: CompletionPolicy) -> ResultHandle {
        let handle = ResultHandle::new();
        registry
            .register(PendingRequest::new(
                CommandId::new(id),
                "agg-1",
                "TestCommand",
                policy,
                handle.clone(),
            ))
            .unwrap();
        handle
    }

    fn executed(id: &str, status: CommandStatus) -> CommandResult {
        CommandResult::new(status, CommandId::new(id), "agg-1")
    }

    fn event_handled(id: &str, payload: &str) -> EventHandledMessage {
        EventHandledMessage {
            command_id: CommandId::new(id),
            aggregate_root_id: "agg-1".to_string(),
            command_result: Some(payload.to_string()),
            result_type: None,
        }
    }

    #[tokio::test]
    async fn executed_only_resolves_on_success() {
        let registry = registry();
        let handle = register(&registry, "cmd-1", CompletionPolicy::ExecutedOnly);

        let outcome = resolve_executed(&registry, executed("cmd-1", CommandStatus::Success));
        assert_eq!(outcome, Resolution::Resolved);
        assert_eq!(handle.try_result().unwrap().status, CommandStatus::Success);

        // A later event-handled reply finds nothing to change.
        let late = resolve_event_handled(&registry, event_handled("cmd-1", "ok"));
        assert_eq!(late, Resolution::NotPending);
        assert!(handle.try_result().unwrap().result.is_none());
    }

    #[tokio::test]
    async fn wait_for_event_keeps_waiting_after_successful_execution() {
        let registry = registry();
        let handle = register(&registry, "cmd-1", CompletionPolicy::WaitForEventHandled);

        let outcome = resolve_executed(&registry, executed("cmd-1", CommandStatus::Success));
        assert_eq!(outcome, Resolution::AwaitingEvent);
        assert!(!handle.is_completed());

        let outcome = resolve_event_handled(&registry, event_handled("cmd-1", "ok"));
        assert_eq!(outcome, Resolution::Resolved);

        let result = handle.try_result().unwrap();
        assert_eq!(result.status, CommandStatus::Success);
        assert_eq!(result.result.as_deref(), Some("ok"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn wait_for_event_resolves_on_failed_or_nothing_changed() {
        for status in [CommandStatus::Failed, CommandStatus::NothingChanged] {
            let registry = registry();
            let handle = register(&registry, "cmd-1", CompletionPolicy::WaitForEventHandled);

            let outcome = resolve_executed(&registry, executed("cmd-1", status));
            assert_eq!(outcome, Resolution::Resolved);
            assert_eq!(handle.try_result().unwrap().status, status);
            assert!(registry.is_empty());
        }
    }

    #[tokio::test]
    async fn replies_for_unknown_commands_are_discarded() {
        let registry = registry();
        assert_eq!(
            resolve_executed(&registry, executed("ghost", CommandStatus::Success)),
            Resolution::NotPending
        );
        assert_eq!(
            resolve_event_handled(&registry, event_handled("ghost", "ok")),
            Resolution::NotPending
        );
    }

    #[tokio::test]
    async fn entry_with_resolved_handle_reports_already_resolved() {
        let registry = registry();
        let handle = register(&registry, "cmd-1", CompletionPolicy::ExecutedOnly);
        handle.complete(executed("cmd-1", CommandStatus::Failed));

        let outcome = resolve_executed(&registry, executed("cmd-1", CommandStatus::Success));
        assert_eq!(outcome, Resolution::AlreadyResolved);
        assert_eq!(handle.try_result().unwrap().status, CommandStatus::Failed);
    }

    #[tokio::test]
    async fn router_drops_unknown_kinds() {
        let registry = registry();
        let token = CancellationToken::new();
        let handle = register(&registry, "cmd-1", CompletionPolicy::ExecutedOnly);
        let (router, workers) = spawn_workers(&registry, &token);

        let bogus = RemoteReply {
            code: 42,
            command_result: Some(executed("cmd-1", CommandStatus::Success)),
            event_handled_message: None,
        };
        assert!(!router.route(bogus));

        token.cancel();
        workers.executed.await.unwrap();
        workers.event_handled.await.unwrap();
        assert!(!handle.is_completed());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn workers_resolve_queued_replies() {
        let registry = registry();
        let token = CancellationToken::new();
        let first = register(&registry, "cmd-1", CompletionPolicy::ExecutedOnly);
        let second = register(&registry, "cmd-2", CompletionPolicy::WaitForEventHandled);
        let (router, workers) = spawn_workers(&registry, &token);

        assert!(router.route_envelope(ReplyEnvelope::Executed(executed(
            "cmd-1",
            CommandStatus::Success
        ))));
        assert!(router.route_envelope(ReplyEnvelope::EventHandled(event_handled("cmd-2", "done"))));

        assert_eq!(first.wait().await.status, CommandStatus::Success);
        assert_eq!(second.wait().await.result.as_deref(), Some("done"));

        token.cancel();
        workers.executed.await.unwrap();
        workers.event_handled.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_workers_drain_already_queued_replies() {
        let registry = registry();
        let token = CancellationToken::new();
        let handle = register(&registry, "cmd-1", CompletionPolicy::ExecutedOnly);
        let (router, workers) = spawn_workers(&registry, &token);

        // Queue and cancel before the worker gets a chance to run.
        router.route_envelope(ReplyEnvelope::Executed(executed("cmd-1", CommandStatus::Success)));
        token.cancel();
        workers.executed.await.unwrap();
        workers.event_handled.await.unwrap();

        assert!(handle.is_completed());
        assert!(!router.route_envelope(ReplyEnvelope::Executed(executed(
            "cmd-9",
            CommandStatus::Success
        ))));
    }
}
