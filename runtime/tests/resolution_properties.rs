//! Property tests: every registered command resolves at most once, and the
//! first applicable event decides the outcome.

#![allow(clippy::unwrap_used)]

use command_reply_core::command::{CommandId, CommandResult, CommandStatus, CompletionPolicy};
use command_reply_core::handle::ResultHandle;
use command_reply_core::reply::EventHandledMessage;
use command_reply_runtime::registry::{PendingRegistry, PendingRequest};
use command_reply_runtime::resolver::{SEND_FAILED_MESSAGE, TIMEOUT_MESSAGE, TimeoutResolver, resolve_send_failure};
use command_reply_runtime::worker::{Resolution, resolve_event_handled, resolve_executed};
use command_reply_testing::TestCommand;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
enum Event {
    Executed(CommandStatus),
    EventHandled,
    SendFailed,
    Elapse(u64),
}

fn status() -> impl Strategy<Value = CommandStatus> {
    prop_oneof![
        Just(CommandStatus::Success),
        Just(CommandStatus::Failed),
        Just(CommandStatus::NothingChanged),
    ]
}

fn event() -> impl Strategy<Value = Event> {
    prop_oneof![
        status().prop_map(Event::Executed),
        Just(Event::EventHandled),
        Just(Event::SendFailed),
        (1_u64..80).prop_map(Event::Elapse),
    ]
}

fn policy() -> impl Strategy<Value = CompletionPolicy> {
    prop_oneof![
        Just(CompletionPolicy::ExecutedOnly),
        Just(CompletionPolicy::WaitForEventHandled),
    ]
}

/// What the first resolving event should have delivered.
#[derive(Debug, PartialEq, Eq)]
enum Expected {
    Status(CommandStatus),
    Message(&'static str),
}

fn expected_outcome(policy: CompletionPolicy, events: &[Event]) -> Option<Expected> {
    let mut elapsed = 0;
    for event in events {
        match event {
            Event::Executed(status)
                if policy == CompletionPolicy::ExecutedOnly || status.is_terminal_without_events() =>
            {
                return Some(Expected::Status(*status));
            }
            Event::Executed(_) => {}
            Event::EventHandled => return Some(Expected::Status(CommandStatus::Success)),
            Event::SendFailed => return Some(Expected::Message(SEND_FAILED_MESSAGE)),
            Event::Elapse(ms) => {
                elapsed += ms;
                if elapsed >= 100 {
                    return Some(Expected::Message(TIMEOUT_MESSAGE));
                }
            }
        }
    }
    None
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn command_resolves_at_most_once(
        policy in policy(),
        events in prop::collection::vec(event(), 0..12),
    ) {
        let runtime = paused_runtime();
        let (outcome, resolutions, pending) = runtime.block_on(async {
            let registry = PendingRegistry::new(TIMEOUT, Arc::new(TimeoutResolver));
            let handle = ResultHandle::new();
            let command = TestCommand::new("cmd", "agg");
            registry
                .register(PendingRequest::new(
                    CommandId::new("cmd"),
                    "agg",
                    "TestCommand",
                    policy,
                    handle.clone(),
                ))
                .unwrap();

            let mut resolutions = 0;
            for event in &events {
                let resolved = match event {
                    Event::Executed(status) => {
                        resolve_executed(&registry, CommandResult::new(*status, CommandId::new("cmd"), "agg"))
                            == Resolution::Resolved
                    }
                    Event::EventHandled => {
                        resolve_event_handled(
                            &registry,
                            EventHandledMessage {
                                command_id: CommandId::new("cmd"),
                                aggregate_root_id: "agg".to_string(),
                                command_result: None,
                                result_type: None,
                            },
                        ) == Resolution::Resolved
                    }
                    Event::SendFailed => resolve_send_failure(&registry, &command),
                    Event::Elapse(ms) => {
                        tokio::time::advance(Duration::from_millis(*ms)).await;
                        registry.evict_expired() > 0
                    }
                };
                resolutions += usize::from(resolved);
            }

            (handle.try_result(), resolutions, registry.len())
        });

        prop_assert!(resolutions <= 1);
        prop_assert_eq!(pending, usize::from(outcome.is_none()));

        let actual = outcome.map(|result| match result.result.as_deref() {
            Some(TIMEOUT_MESSAGE) => Expected::Message(TIMEOUT_MESSAGE),
            Some(SEND_FAILED_MESSAGE) => Expected::Message(SEND_FAILED_MESSAGE),
            _ => Expected::Status(result.status),
        });
        prop_assert_eq!(actual, expected_outcome(policy, &events));
    }
}
