//! The command result processor: lifecycle and public API of the engine.
//!
//! [`CommandResultProcessor`] owns the pending-request registry and its expiry
//! driver for its whole life, and, while started, the reply listener and both
//! result workers.
//!
//! # Lifecycle
//!
//! - `start()` binds the listener and spawns the background tasks. Calling it
//!   again while started is a no-op returning the bound address.
//! - `shutdown()` first stops accepting network input, then lets the workers
//!   resolve whatever was already queued. The bound address is released
//!   before `shutdown()` returns. Commands still pending keep their deadlines
//!   and time out as usual; the expiry driver only stops when the processor
//!   is dropped.
//! - A stopped processor can be started again.
//!
//! # Example
//!
//! ```no_run
//! use command_reply_core::{CompletionPolicy, ResultHandle};
//! use command_reply_runtime::config::ReplyProcessorConfig;
//! use command_reply_runtime::processor::CommandResultProcessor;
//!
//! # async fn example(command: &dyn command_reply_core::Command) -> Result<(), Box<dyn std::error::Error>> {
//! let processor = CommandResultProcessor::new(ReplyProcessorConfig::from_env()?)?;
//! let addr = processor.start().await?;
//! println!("replies expected on {addr}");
//!
//! let handle = ResultHandle::new();
//! processor.register_processing_command(command, CompletionPolicy::ExecutedOnly, handle.clone())?;
//! // ... hand the command to the transport ...
//! let result = handle.wait().await;
//! println!("{result}");
//!
//! processor.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::ReplyProcessorConfig;
use crate::error::{ProcessorError, RegistrationError};
use crate::listener::ReplyListener;
use crate::metrics as names;
use crate::registry::{PendingRegistry, PendingRequest};
use crate::resolver::{TimeoutResolver, resolve_send_failure};
use crate::worker::{ReplyRouter, WorkerHandles, spawn_workers};
use command_reply_core::command::{Command, CommandResult, CompletionPolicy};
use command_reply_core::dispatch::CommandSender;
use command_reply_core::handle::ResultHandle;
use command_reply_core::reply::RemoteReply;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Routing state visible to synchronous callers while started.
#[derive(Debug, Clone)]
struct Active {
    router: ReplyRouter,
    local_addr: SocketAddr,
}

/// Background tasks owned while started.
#[derive(Debug)]
struct Running {
    local_addr: SocketAddr,
    listener_token: CancellationToken,
    worker_token: CancellationToken,
    accept: JoinHandle<()>,
    workers: WorkerHandles,
}

/// Timer task evaluating registry expiry, independent of start/stop.
#[derive(Debug)]
struct ExpiryDriver {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Correlates asynchronous command replies with the callers awaiting them.
pub struct CommandResultProcessor {
    config: ReplyProcessorConfig,
    registry: Arc<PendingRegistry>,
    running: tokio::sync::Mutex<Option<Running>>,
    active: RwLock<Option<Active>>,
    expiry: Mutex<Option<ExpiryDriver>>,
}

impl CommandResultProcessor {
    /// Create a stopped processor.
    ///
    /// The registry exists from the start, so commands may be registered
    /// before `start()`. When called inside a Tokio runtime the expiry driver
    /// is spawned here; otherwise on the first `start()` or registration.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Config`] if the configuration is invalid.
    pub fn new(config: ReplyProcessorConfig) -> Result<Self, ProcessorError> {
        config.validate()?;
        let registry = Arc::new(PendingRegistry::new(
            config.completion_timeout,
            Arc::new(TimeoutResolver),
        ));
        let processor = Self {
            config,
            registry,
            running: tokio::sync::Mutex::new(None),
            active: RwLock::new(None),
            expiry: Mutex::new(None),
        };
        processor.ensure_expiry_driver();
        Ok(processor)
    }

    /// The processor's configuration.
    #[must_use]
    pub const fn config(&self) -> &ReplyProcessorConfig {
        &self.config
    }

    /// Bind the listener and start the workers.
    ///
    /// Idempotent: if already started, returns the bound address without
    /// doing anything else.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Bind`] if the listener cannot bind.
    pub async fn start(&self) -> Result<SocketAddr, ProcessorError> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(running.local_addr);
        }

        let listener = ReplyListener::bind(self.config.bind_addr, self.config.max_record_len)
            .await
            .map_err(|source| ProcessorError::Bind {
                addr: self.config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr();

        self.ensure_expiry_driver();
        let listener_token = CancellationToken::new();
        let worker_token = CancellationToken::new();
        let (router, workers) = spawn_workers(&self.registry, &worker_token);
        let accept = listener.spawn(router.clone(), listener_token.clone());

        *self.active.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Active { router, local_addr });
        *running = Some(Running {
            local_addr,
            listener_token,
            worker_token,
            accept,
            workers,
        });

        tracing::info!(
            bind_addr = %local_addr,
            completion_timeout_ms = self.config.completion_timeout.as_millis(),
            "CommandResultProcessor started"
        );
        Ok(local_addr)
    }

    /// Stop the listener and workers.
    ///
    /// Network input stops first; replies already queued are still resolved.
    /// Commands still pending are not failed here; they resolve through a
    /// later reply injection, a send failure, or their timeout. Calling this on
    /// a stopped processor is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first task failure or [`ProcessorError::ShutdownTimeout`]
    /// if a task did not stop within the configured shutdown timeout. All
    /// tasks are stopped regardless.
    pub async fn shutdown(&self) -> Result<(), ProcessorError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = None;

        tracing::info!("Shutting down CommandResultProcessor");
        let timeout = self.config.shutdown_timeout;
        let mut errors = Vec::new();

        running.listener_token.cancel();
        errors.extend(join_task("listener", running.accept, timeout).await.err());

        running.worker_token.cancel();
        errors.extend(join_task("executed worker", running.workers.executed, timeout).await.err());
        errors.extend(
            join_task("event handled worker", running.workers.event_handled, timeout)
                .await
                .err(),
        );

        tracing::info!(
            pending = self.registry.len(),
            failed_tasks = errors.len(),
            "CommandResultProcessor stopped"
        );
        errors.into_iter().next().map_or(Ok(()), Err)
    }

    /// Whether the processor is started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.active_read().is_some()
    }

    /// The bound listener address, while started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active_read().map(|active| active.local_addr)
    }

    /// Number of commands awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    /// The pending-request registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<PendingRegistry> {
        &self.registry
    }

    /// Track a command whose reply should resolve `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Duplicate`] if a command with the same id
    /// is already being tracked.
    pub fn register_processing_command(
        &self,
        command: &dyn Command,
        policy: CompletionPolicy,
        handle: ResultHandle,
    ) -> Result<(), RegistrationError> {
        self.ensure_expiry_driver();
        let request = PendingRequest::new(
            command.id().clone(),
            command.aggregate_root_id(),
            command.command_type(),
            policy,
            handle,
        );

        if let Err(e) = self.registry.register(request) {
            tracing::error!(
                command_id = %command.id(),
                command_type = %command.command_type(),
                "Duplicate processing command registration"
            );
            return Err(e);
        }

        tracing::debug!(
            command_id = %command.id(),
            aggregate_root_id = %command.aggregate_root_id(),
            policy = %policy,
            "Registered processing command"
        );
        metrics::counter!(names::COMMANDS_REGISTERED).increment(1);
        Ok(())
    }

    /// Report that `command` could not be transmitted.
    ///
    /// The pending entry, if any, is removed and resolved as failed at once.
    /// Returns `true` if an entry was resolved.
    pub fn notify_send_failed(&self, command: &dyn Command) -> bool {
        resolve_send_failure(&self.registry, command)
    }

    /// Route a reply record received outside the listener.
    ///
    /// Runs the same classification the listener applies. Returns `true` if
    /// the record was queued for a worker.
    pub fn process_reply(&self, reply: RemoteReply) -> bool {
        let Some(active) = self.active_read() else {
            tracing::warn!(code = reply.code, "CommandResultProcessor not started, reply dropped");
            metrics::counter!(names::REPLIES_REJECTED, "reason" => "stopped").increment(1);
            return false;
        };
        active.router.route(reply)
    }

    /// Register `command`, send it through `sender`, and wait for its result.
    ///
    /// A send error is reported through [`notify_send_failed`](Self::notify_send_failed)
    /// and surfaces as a failed [`CommandResult`], like any other operational
    /// failure.
    ///
    /// # Errors
    ///
    /// - [`ProcessorError::NotStarted`] if the processor is stopped
    /// - [`ProcessorError::Registration`] if the command id is already tracked
    pub async fn execute(
        &self,
        command: &dyn Command,
        policy: CompletionPolicy,
        sender: &dyn CommandSender,
    ) -> Result<CommandResult, ProcessorError> {
        if !self.is_started() {
            return Err(ProcessorError::NotStarted);
        }

        let handle = ResultHandle::new();
        self.register_processing_command(command, policy, handle.clone())?;

        if let Err(e) = sender.send(command).await {
            tracing::warn!(command_id = %command.id(), error = %e, "Command dispatch failed");
            self.notify_send_failed(command);
        }

        Ok(handle.wait().await)
    }

    fn ensure_expiry_driver(&self) {
        let mut expiry = self.expiry.lock().unwrap_or_else(PoisonError::into_inner);
        // A driver whose runtime went away is replaced.
        if expiry.as_ref().is_some_and(|driver| !driver.task.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let token = CancellationToken::new();
        let task = runtime.spawn(Arc::clone(&self.registry).run_expiry(token.clone()));
        *expiry = Some(ExpiryDriver { token, task });
    }

    fn active_read(&self) -> Option<Active> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for CommandResultProcessor {
    fn drop(&mut self) {
        if let Ok(running) = self.running.try_lock() {
            if let Some(running) = running.as_ref() {
                running.listener_token.cancel();
                running.worker_token.cancel();
            }
        }
        if let Some(driver) = self
            .expiry
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            driver.token.cancel();
        }
    }
}

impl std::fmt::Debug for CommandResultProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandResultProcessor")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr())
            .field("pending", &self.registry.len())
            .finish_non_exhaustive()
    }
}

async fn join_task(
    task: &'static str,
    mut handle: JoinHandle<()>,
    timeout: Duration,
) -> Result<(), ProcessorError> {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::error!(task, error = %e, "Background task failed");
            Err(ProcessorError::Task(e))
        }
        Err(_) => {
            tracing::error!(task, timeout_ms = timeout.as_millis(), "Background task did not stop in time, aborting");
            handle.abort();
            Err(ProcessorError::ShutdownTimeout { task, timeout })
        }
    }
}
