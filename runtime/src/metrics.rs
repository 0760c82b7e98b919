//! Metric names and descriptions.
//!
//! The runtime records through the [`metrics`] facade only. Applications pick
//! an exporter (Prometheus, statsd, ...) and install it themselves; call
//! [`describe_metrics`] once after installing it to publish descriptions.
//!
//! # Example
//!
//! ```rust
//! command_reply_runtime::metrics::describe_metrics();
//! ```

use metrics::{describe_counter, describe_gauge};

/// Replies decoded from the network or injected in-process (label `kind`).
pub const REPLIES_RECEIVED: &str = "command_reply.replies.received";

/// Replies dropped before reaching a worker (label `reason`).
pub const REPLIES_REJECTED: &str = "command_reply.replies.rejected";

/// Commands registered for reply tracking.
pub const COMMANDS_REGISTERED: &str = "command_reply.commands.registered";

/// Commands whose handle was resolved (label `outcome`).
pub const COMMANDS_RESOLVED: &str = "command_reply.commands.resolved";

/// Replies that arrived after their command was already resolved.
pub const LATE_REPLIES: &str = "command_reply.commands.late_replies";

/// Commands currently tracked by the registry.
pub const REGISTRY_PENDING: &str = "command_reply.registry.pending";

/// Register all metric descriptions.
pub fn describe_metrics() {
    describe_counter!(
        REPLIES_RECEIVED,
        "Total number of reply records routed to a worker"
    );
    describe_counter!(
        REPLIES_REJECTED,
        "Total number of reply records dropped as protocol errors"
    );
    describe_counter!(
        COMMANDS_REGISTERED,
        "Total number of commands registered for reply tracking"
    );
    describe_counter!(
        COMMANDS_RESOLVED,
        "Total number of commands resolved, by outcome"
    );
    describe_counter!(
        LATE_REPLIES,
        "Total number of replies discarded because the command was already resolved"
    );
    describe_gauge!(
        REGISTRY_PENDING,
        "Number of commands currently awaiting a reply"
    );
}
