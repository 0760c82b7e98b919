//! Single-assignment result slot shared between a caller and the engine.
//!
//! A [`ResultHandle`] is created by the caller, registered alongside its
//! command, and resolved by whichever path finishes first: a reply, a timeout,
//! or a send failure. Resolution is enforced to happen at most once by the
//! handle itself; later attempts are silent no-ops.
//!
//! # Example
//!
//! ```
//! use command_reply_core::command::{CommandId, CommandResult};
//! use command_reply_core::handle::ResultHandle;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let handle = ResultHandle::new();
//! let observer = handle.clone();
//!
//! assert!(handle.complete(CommandResult::failed(CommandId::new("c1"), "a1", "first")));
//! assert!(!handle.complete(CommandResult::failed(CommandId::new("c1"), "a1", "second")));
//!
//! let result = observer.wait().await;
//! assert_eq!(result.result.as_deref(), Some("first"));
//! # }
//! ```

use crate::command::CommandResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Resolve-once slot delivering a [`CommandResult`] to any number of observers.
///
/// Cloning is cheap; every clone observes the same slot.
#[derive(Clone)]
pub struct ResultHandle {
    slot: Arc<watch::Sender<Option<CommandResult>>>,
}

impl ResultHandle {
    /// Create an unresolved handle.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { slot: Arc::new(tx) }
    }

    /// Resolve the handle.
    ///
    /// Returns `true` if this call stored the result, `false` if the handle had
    /// already been resolved (the given result is discarded).
    pub fn complete(&self, result: CommandResult) -> bool {
        let mut result = Some(result);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = result.take();
            true
        })
    }

    /// Whether the handle has been resolved.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// The result, if resolved.
    #[must_use]
    pub fn try_result(&self) -> Option<CommandResult> {
        self.slot.borrow().clone()
    }

    /// Wait until the handle is resolved.
    pub async fn wait(&self) -> CommandResult {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            // The sender lives inside `self`, so the channel cannot close while we wait.
            let _ = rx.changed().await;
        }
    }

    /// Wait until the handle is resolved or `timeout` elapses.
    ///
    /// Returns `None` if the timeout elapses first.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<CommandResult> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

impl Default for ResultHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResultHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandle")
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::command::{CommandId, CommandStatus};

    fn result(message: &str) -> CommandResult {
        CommandResult::failed(CommandId::new("cmd"), "agg", message)
    }

    #[test]
    fn first_completion_wins() {
        let handle = ResultHandle::new();
        assert!(!handle.is_completed());

        assert!(handle.complete(result("first")));
        assert!(!handle.complete(result("second")));

        assert_eq!(handle.try_result().unwrap().result.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn waiters_see_the_same_result() {
        let handle = ResultHandle::new();
        let a = handle.clone();
        let b = handle.clone();

        let wait_a = tokio::spawn(async move { a.wait().await });
        let wait_b = tokio::spawn(async move { b.wait().await });
        tokio::task::yield_now().await;

        handle.complete(result("done"));

        assert_eq!(wait_a.await.unwrap(), wait_b.await.unwrap());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_resolved() {
        let handle = ResultHandle::new();
        handle.complete(result("early"));

        let observed = handle.wait().await;
        assert_eq!(observed.status, CommandStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_elapses_on_unresolved_handle() {
        let handle = ResultHandle::new();
        assert!(handle.wait_timeout(Duration::from_millis(50)).await.is_none());
    }

    #[test]
    fn wait_is_pending_until_completed() {
        let handle = ResultHandle::new();
        let mut wait = tokio_test::task::spawn(handle.wait());
        tokio_test::assert_pending!(wait.poll());

        handle.complete(result("done"));
        assert!(wait.is_woken());
        let resolved = tokio_test::assert_ready!(wait.poll());
        assert_eq!(resolved.result.as_deref(), Some("done"));
    }

    #[test]
    fn concurrent_completions_resolve_exactly_once() {
        let handle = ResultHandle::new();
        let winners: usize = std::thread::scope(|scope| {
            let joins: Vec<_> = (0..8)
                .map(|i| {
                    let handle = handle.clone();
                    scope.spawn(move || usize::from(handle.complete(result(&i.to_string()))))
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).sum()
        });

        assert_eq!(winners, 1);
    }
}
