//! Configuration for the command result processor.
//!
//! # Example
//!
//! ```
//! use command_reply_runtime::config::ReplyProcessorConfig;
//! use std::time::Duration;
//!
//! let config = ReplyProcessorConfig::builder()
//!     .bind_addr("127.0.0.1:0".parse().unwrap())
//!     .completion_timeout(Duration::from_millis(250))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.completion_timeout, Duration::from_millis(250));
//! ```
//!
//! # Environment
//!
//! [`ReplyProcessorConfig::from_env`] reads:
//!
//! - `COMMAND_REPLY_BIND_ADDR` (e.g. `0.0.0.0:2019`), or `COMMAND_REPLY_PORT`
//! - `COMMAND_REPLY_TIMEOUT_MS`
//! - `COMMAND_REPLY_MAX_RECORD_LEN`
//! - `COMMAND_REPLY_SHUTDOWN_TIMEOUT_MS`

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Default port the reply listener binds to.
pub const DEFAULT_PORT: u16 = 2019;

/// Default time a command may wait for its reply.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default maximum length of one reply record.
pub const DEFAULT_MAX_RECORD_LEN: usize = 4 * 1024 * 1024;

/// Default time `shutdown()` waits for each background task.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const ENV_BIND_ADDR: &str = "COMMAND_REPLY_BIND_ADDR";
const ENV_PORT: &str = "COMMAND_REPLY_PORT";
const ENV_TIMEOUT_MS: &str = "COMMAND_REPLY_TIMEOUT_MS";
const ENV_MAX_RECORD_LEN: &str = "COMMAND_REPLY_MAX_RECORD_LEN";
const ENV_SHUTDOWN_TIMEOUT_MS: &str = "COMMAND_REPLY_SHUTDOWN_TIMEOUT_MS";

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable holds a value that cannot be parsed
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidEnvVar {
        /// Variable name
        var: String,
        /// The offending value
        value: String,
        /// Why parsing failed
        reason: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Settings for [`CommandResultProcessor`](crate::processor::CommandResultProcessor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyProcessorConfig {
    /// Address the reply listener binds to. Port `0` picks a free port.
    pub bind_addr: SocketAddr,
    /// How long a registered command waits for its reply before timing out.
    pub completion_timeout: Duration,
    /// Longest accepted reply record, in bytes.
    pub max_record_len: usize,
    /// Upper bound on how long shutdown waits for each background task.
    pub shutdown_timeout: Duration,
}

impl Default for ReplyProcessorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ReplyProcessorConfig {
    /// Create a new builder starting from the defaults.
    #[must_use]
    pub fn builder() -> ReplyProcessorConfigBuilder {
        ReplyProcessorConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load configuration from the process environment.
    ///
    /// Unset variables fall back to the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set but unparsable, or if the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = parse_var(ENV_BIND_ADDR, &value)?;
        } else if let Some(value) = lookup(ENV_PORT) {
            config.bind_addr.set_port(parse_var(ENV_PORT, &value)?);
        }
        if let Some(value) = lookup(ENV_TIMEOUT_MS) {
            config.completion_timeout = Duration::from_millis(parse_var(ENV_TIMEOUT_MS, &value)?);
        }
        if let Some(value) = lookup(ENV_MAX_RECORD_LEN) {
            config.max_record_len = parse_var(ENV_MAX_RECORD_LEN, &value)?;
        }
        if let Some(value) = lookup(ENV_SHUTDOWN_TIMEOUT_MS) {
            config.shutdown_timeout =
                Duration::from_millis(parse_var(ENV_SHUTDOWN_TIMEOUT_MS, &value)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for zero timeouts or record lengths.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.completion_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "completion_timeout must be > 0".to_string(),
            ));
        }
        if self.max_record_len == 0 {
            return Err(ConfigError::Validation(
                "max_record_len must be > 0".to_string(),
            ));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "shutdown_timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnvVar {
        var: var.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Builder for [`ReplyProcessorConfig`].
#[derive(Debug, Clone)]
pub struct ReplyProcessorConfigBuilder {
    config: ReplyProcessorConfig,
}

impl ReplyProcessorConfigBuilder {
    /// Set the listener bind address.
    #[must_use]
    pub const fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set only the listener port, keeping the bind IP.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.bind_addr.set_port(port);
        self
    }

    /// Set how long a command waits for its reply.
    #[must_use]
    pub const fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.config.completion_timeout = timeout;
        self
    }

    /// Set the longest accepted reply record.
    #[must_use]
    pub const fn max_record_len(mut self, len: usize) -> Self {
        self.config.max_record_len = len;
        self
    }

    /// Set how long shutdown waits for each background task.
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Validate and build the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the configuration is invalid.
    pub fn build(self) -> Result<ReplyProcessorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
