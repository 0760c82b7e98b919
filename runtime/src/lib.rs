//! # Command Reply Runtime
//!
//! The engine that correlates asynchronous command replies with the callers
//! awaiting them.
//!
//! ## Architecture
//!
//! ```text
//!  caller ──register──▶ PendingRegistry ◀──evict── expiry driver
//!    │                      ▲      ▲                    │
//!    │ wait                 │      │                    ▼
//!    ▼                      │      │             TimeoutResolver
//!  ResultHandle ◀──complete─┴──┐   └──────┐
//!                              │          │
//!                     executed worker  event-handled worker
//!                              ▲          ▲
//!                              └─ ReplyRouter ─┘
//!                                     ▲
//!                  ReplyListener (TCP, newline-delimited JSON)
//! ```
//!
//! - **Registry**: pending requests keyed by command id, each with an idle
//!   deadline ([`registry`])
//! - **Listener**: accepts reply connections and frames records ([`listener`], [`codec`])
//! - **Workers**: one queue and one task per reply kind ([`worker`])
//! - **Resolvers**: timeout and send-failure paths ([`resolver`])
//! - **Processor**: lifecycle and public API ([`processor`])
//!
//! ## Example
//!
//! ```no_run
//! use command_reply_runtime::{CommandResultProcessor, ReplyProcessorConfig};
//!
//! # async fn run() -> Result<(), command_reply_runtime::ProcessorError> {
//! let processor = CommandResultProcessor::new(ReplyProcessorConfig::default())?;
//! processor.start().await?;
//! // register commands, wait on their handles ...
//! processor.shutdown().await
//! # }
//! ```

/// Newline-delimited JSON framing for reply records
pub mod codec;

/// Processor configuration
pub mod config;

/// TCP reply listener
pub mod listener;

/// Metric names and descriptions
pub mod metrics;

/// Processor lifecycle and public API
pub mod processor;

/// Pending-request registry with idle expiry
pub mod registry;

/// Timeout and send-failure resolution
pub mod resolver;

/// Reply client
pub mod sender;

/// Result queues and their workers
pub mod worker;

/// Error types for the processor
pub mod error {
    use crate::config::ConfigError;
    use command_reply_core::command::CommandId;
    use std::net::SocketAddr;
    use std::time::Duration;
    use thiserror::Error;

    /// A command could not be tracked.
    #[derive(Error, Debug)]
    pub enum RegistrationError {
        /// A command with the same id is already awaiting a reply.
        ///
        /// The existing entry is left untouched.
        #[error("Duplicate processing command registration, command id: {command_id}, type: {command_type}")]
        Duplicate {
            /// Id that was already pending
            command_id: CommandId,
            /// Type of the rejected command
            command_type: String,
        },
    }

    /// Errors surfaced by [`CommandResultProcessor`](crate::CommandResultProcessor).
    #[derive(Error, Debug)]
    pub enum ProcessorError {
        /// Invalid configuration
        #[error(transparent)]
        Config(#[from] ConfigError),

        /// The reply listener could not bind
        #[error("Failed to bind reply listener on {addr}: {source}")]
        Bind {
            /// Requested address
            addr: SocketAddr,
            /// Underlying I/O error
            #[source]
            source: std::io::Error,
        },

        /// The command could not be registered
        #[error(transparent)]
        Registration(#[from] RegistrationError),

        /// The operation needs a started processor
        #[error("CommandResultProcessor is not started")]
        NotStarted,

        /// A background task did not stop within the shutdown timeout
        #[error("{task} did not stop within {timeout:?}")]
        ShutdownTimeout {
            /// Task name
            task: &'static str,
            /// Configured shutdown timeout
            timeout: Duration,
        },

        /// A background task panicked or was cancelled
        #[error("Background task failed: {0}")]
        Task(#[from] tokio::task::JoinError),
    }
}

pub use config::{ConfigError, ReplyProcessorConfig};
pub use error::{ProcessorError, RegistrationError};
pub use processor::CommandResultProcessor;
pub use sender::ReplySender;
