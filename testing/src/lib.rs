//! # Command Reply Testing
//!
//! Test doubles and harnesses for command reply correlation.
//!
//! This crate provides:
//! - [`TestCommand`]: a minimal [`Command`] implementation
//! - [`RecordingCommandSender`]: a [`CommandSender`] that records what it was
//!   asked to send and can be told to fail
//! - [`InMemoryAggregateRepository`]: an [`AggregateRepository`] with
//!   transient-failure injection
//! - [`ReplyHarness`]: a started processor on an ephemeral port plus a
//!   connected [`ReplySender`]
//!
//! ## Example
//!
//! ```no_run
//! use command_reply_core::{CommandResult, CommandStatus, CompletionPolicy};
//! use command_reply_testing::{ReplyHarness, init_tracing};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! init_tracing();
//! let mut harness = ReplyHarness::start(Duration::from_secs(5)).await?;
//! let handle = harness.register("cmd-1", CompletionPolicy::ExecutedOnly)?;
//!
//! harness
//!     .sender()
//!     .send_executed(CommandResult::new(CommandStatus::Success, "cmd-1".into(), "agg-1"))
//!     .await?;
//!
//! assert!(handle.wait().await.is_success());
//! harness.shutdown().await
//! # }
//! ```
//!
//! [`Command`]: command_reply_core::Command
//! [`CommandSender`]: command_reply_core::dispatch::CommandSender
//! [`AggregateRepository`]: command_reply_core::aggregate::AggregateRepository
//! [`ReplySender`]: command_reply_runtime::ReplySender

/// Test doubles for collaborator traits
pub mod mocks {
    use command_reply_core::aggregate::{AggregateRepository, RepositoryError};
    use command_reply_core::command::{Command, CommandId};
    use command_reply_core::dispatch::{CommandSender, SendError};
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    /// Minimal command for tests.
    ///
    /// # Example
    ///
    /// ```
    /// use command_reply_core::Command;
    /// use command_reply_testing::TestCommand;
    ///
    /// let command = TestCommand::new("cmd-1", "acct-1").with_type("Deposit");
    /// assert_eq!(command.id().as_str(), "cmd-1");
    /// assert_eq!(command.command_type(), "Deposit");
    /// ```
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TestCommand {
        id: CommandId,
        aggregate_root_id: String,
        command_type: String,
    }

    impl TestCommand {
        /// Create a command of type `TestCommand`.
        #[must_use]
        pub fn new(id: impl Into<String>, aggregate_root_id: impl Into<String>) -> Self {
            Self {
                id: CommandId::new(id),
                aggregate_root_id: aggregate_root_id.into(),
                command_type: "TestCommand".to_string(),
            }
        }

        /// Override the reported command type.
        #[must_use]
        pub fn with_type(mut self, command_type: impl Into<String>) -> Self {
            self.command_type = command_type.into();
            self
        }
    }

    impl Command for TestCommand {
        fn id(&self) -> &CommandId {
            &self.id
        }

        fn aggregate_root_id(&self) -> &str {
            &self.aggregate_root_id
        }

        fn command_type(&self) -> &str {
            &self.command_type
        }
    }

    type SendHook = Box<dyn Fn(&dyn Command) + Send + Sync>;

    /// A [`CommandSender`] that records every command it is handed.
    ///
    /// An optional hook runs on every successful send, which lets a test act
    /// as the remote handler and reply from inside the dispatch call.
    #[derive(Default)]
    pub struct RecordingCommandSender {
        sent: Mutex<Vec<CommandId>>,
        failure: Option<String>,
        hook: Option<SendHook>,
    }

    impl RecordingCommandSender {
        /// A sender that accepts every command.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// A sender that rejects every command with `reason`.
        #[must_use]
        pub fn failing(reason: impl Into<String>) -> Self {
            Self {
                failure: Some(reason.into()),
                ..Self::default()
            }
        }

        /// Run `hook` after each successful send.
        #[must_use]
        pub fn with_hook<F>(mut self, hook: F) -> Self
        where
            F: Fn(&dyn Command) + Send + Sync + 'static,
        {
            self.hook = Some(Box::new(hook));
            self
        }

        /// Ids of every command handed to this sender, in order, including
        /// ones that failed.
        #[must_use]
        pub fn sent(&self) -> Vec<CommandId> {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl CommandSender for RecordingCommandSender {
        fn send<'a>(
            &'a self,
            command: &'a dyn Command,
        ) -> Pin<Box<dyn Future<Output = Result<(), SendError>> + Send + 'a>> {
            Box::pin(async move {
                self.sent
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(command.id().clone());

                if let Some(reason) = &self.failure {
                    return Err(SendError::Transport {
                        command_id: command.id().to_string(),
                        reason: reason.clone(),
                    });
                }

                if let Some(hook) = &self.hook {
                    hook(command);
                }
                Ok(())
            })
        }
    }

    impl std::fmt::Debug for RecordingCommandSender {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RecordingCommandSender")
                .field("sent", &self.sent())
                .field("failure", &self.failure)
                .field("hook", &self.hook.is_some())
                .finish()
        }
    }

    /// In-memory aggregate store keyed by `(aggregate_type, aggregate_id)`.
    #[derive(Debug)]
    pub struct InMemoryAggregateRepository<A> {
        aggregates: Mutex<HashMap<(String, String), A>>,
        transient_failures: AtomicUsize,
        loads: AtomicUsize,
    }

    impl<A: Clone + Send> InMemoryAggregateRepository<A> {
        /// Create an empty repository.
        #[must_use]
        pub fn new() -> Self {
            Self {
                aggregates: Mutex::new(HashMap::new()),
                transient_failures: AtomicUsize::new(0),
                loads: AtomicUsize::new(0),
            }
        }

        /// Store the latest state of an aggregate.
        pub fn insert(&self, aggregate_type: impl Into<String>, aggregate_id: impl Into<String>, aggregate: A) {
            self.aggregates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((aggregate_type.into(), aggregate_id.into()), aggregate);
        }

        /// Make the next `count` loads fail with [`RepositoryError::Transient`].
        pub fn fail_next(&self, count: usize) {
            self.transient_failures.store(count, Ordering::SeqCst);
        }

        /// Number of `load_latest` calls so far, failed ones included.
        #[must_use]
        pub fn load_count(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    impl<A: Clone + Send> Default for InMemoryAggregateRepository<A> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<A: Clone + Send> AggregateRepository for InMemoryAggregateRepository<A> {
        type Aggregate = A;

        fn load_latest<'a>(
            &'a self,
            aggregate_type: &'a str,
            aggregate_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Option<A>, RepositoryError>> + Send + 'a>> {
            Box::pin(async move {
                self.loads.fetch_add(1, Ordering::SeqCst);

                let failing = self
                    .transient_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(RepositoryError::Transient(format!(
                        "injected failure loading {aggregate_type}/{aggregate_id}"
                    )));
                }

                Ok(self
                    .aggregates
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&(aggregate_type.to_string(), aggregate_id.to_string()))
                    .cloned())
            })
        }
    }
}

/// A started processor wired to a reply client
pub mod harness {
    use anyhow::Context;
    use command_reply_core::command::{CommandId, CompletionPolicy};
    use command_reply_core::handle::ResultHandle;
    use command_reply_runtime::{CommandResultProcessor, ReplyProcessorConfig, ReplySender};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::mocks::TestCommand;

    /// A processor listening on `127.0.0.1:0` and one connected sender.
    #[derive(Debug)]
    pub struct ReplyHarness {
        processor: Arc<CommandResultProcessor>,
        addr: SocketAddr,
        sender: ReplySender,
    }

    impl ReplyHarness {
        /// Start a processor with the given completion timeout.
        ///
        /// # Errors
        ///
        /// Fails if the processor cannot start or the sender cannot connect.
        pub async fn start(completion_timeout: Duration) -> anyhow::Result<Self> {
            let config = ReplyProcessorConfig::builder()
                .bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
                .completion_timeout(completion_timeout)
                .build()?;
            Self::start_with(config).await
        }

        /// Start a processor with a custom configuration.
        ///
        /// Metric descriptions are published to whatever recorder is installed.
        ///
        /// # Errors
        ///
        /// Fails if the processor cannot start or the sender cannot connect.
        pub async fn start_with(config: ReplyProcessorConfig) -> anyhow::Result<Self> {
            command_reply_runtime::metrics::describe_metrics();
            let processor = Arc::new(CommandResultProcessor::new(config)?);
            let addr = processor.start().await.context("starting processor")?;
            let sender = ReplySender::connect(addr)
                .await
                .with_context(|| format!("connecting reply sender to {addr}"))?;
            Ok(Self {
                processor,
                addr,
                sender,
            })
        }

        /// The processor under test.
        #[must_use]
        pub fn processor(&self) -> &Arc<CommandResultProcessor> {
            &self.processor
        }

        /// The address the processor listens on.
        #[must_use]
        pub const fn addr(&self) -> SocketAddr {
            self.addr
        }

        /// The connected sender.
        pub fn sender(&mut self) -> &mut ReplySender {
            &mut self.sender
        }

        /// Open an additional connection to the processor.
        ///
        /// # Errors
        ///
        /// Fails if the connection cannot be established.
        pub async fn connect(&self) -> anyhow::Result<ReplySender> {
            ReplySender::connect(self.addr)
                .await
                .with_context(|| format!("connecting reply sender to {}", self.addr))
        }

        /// Register a [`TestCommand`] on aggregate `agg-1`.
        ///
        /// # Errors
        ///
        /// Fails if `id` is already pending.
        pub fn register(&self, id: &str, policy: CompletionPolicy) -> anyhow::Result<ResultHandle> {
            let handle = ResultHandle::new();
            self.processor.register_processing_command(
                &TestCommand::new(id, "agg-1"),
                policy,
                handle.clone(),
            )?;
            Ok(handle)
        }

        /// Whether `id` is still awaiting a reply.
        #[must_use]
        pub fn is_pending(&self, id: &str) -> bool {
            let id = CommandId::new(id);
            self.processor.registry().lookup(&id).is_some()
        }

        /// Close the sender and shut the processor down.
        ///
        /// # Errors
        ///
        /// Fails if the sender cannot flush or a processor task fails to stop.
        pub async fn shutdown(self) -> anyhow::Result<()> {
            self.sender.close().await?;
            self.processor.shutdown().await?;
            Ok(())
        }
    }
}

/// Install a `tracing` subscriber for tests.
///
/// Honors `RUST_LOG` and defaults to `warn`. Safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub use harness::ReplyHarness;
pub use mocks::{InMemoryAggregateRepository, RecordingCommandSender, TestCommand};

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use command_reply_core::aggregate::{AggregateRepository, RepositoryError};
    use command_reply_core::dispatch::{CommandSender, SendError};

    #[tokio::test]
    async fn recording_sender_records_and_fails_on_request() {
        let ok = RecordingCommandSender::new();
        ok.send(&TestCommand::new("a", "agg")).await.unwrap();
        assert_eq!(ok.sent().len(), 1);

        let failing = RecordingCommandSender::failing("broker down");
        let err = failing.send(&TestCommand::new("b", "agg")).await.unwrap_err();
        assert!(matches!(err, SendError::Transport { ref reason, .. } if reason == "broker down"));
        assert_eq!(failing.sent()[0].as_str(), "b");
    }

    #[tokio::test]
    async fn repository_injects_transient_failures() {
        let repo = InMemoryAggregateRepository::new();
        repo.insert("Account", "acct-1", 42_u32);
        repo.fail_next(2);

        for _ in 0..2 {
            let err = repo.load_latest("Account", "acct-1").await.unwrap_err();
            assert!(err.is_transient());
        }
        assert_eq!(repo.load_latest("Account", "acct-1").await, Ok(Some(42)));
        assert_eq!(repo.load_latest("Account", "missing").await, Ok(None::<u32>));
        assert_eq!(repo.load_count(), 4);

        let other = RepositoryError::Other("corrupt".into());
        assert!(!other.is_transient());
    }
}
