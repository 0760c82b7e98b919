//! Pending-request registry with expire-after-write semantics.
//!
//! Every command awaiting a reply is tracked here until it is resolved. Entries
//! expire a fixed duration after insertion; lookups do not refresh them. When
//! an entry expires, the registry hands it to an [`EvictionListener`] exactly
//! once. Entries removed through normal resolution never reach the listener.
//!
//! # Expiry
//!
//! Expiry is evaluated lazily: every registry operation first evicts whatever
//! is overdue. Because an idle system would otherwise never notice a timeout,
//! [`PendingRegistry::run_expiry`] drives a single task that sleeps until the
//! earliest deadline and evaluates expiry then.
//!
//! ```text
//!  register ──► entries + deadline heap ──► remove / remove_if (resolution)
//!                      │
//!                      └── deadline passed ──► EvictionListener::on_expired
//! ```
//!
//! All mutation happens under one coarse lock; listener callbacks run after the
//! lock is released.

use crate::error::RegistrationError;
use crate::metrics as names;
use chrono::{DateTime, Utc};
use command_reply_core::command::{CommandId, CompletionPolicy};
use command_reply_core::handle::ResultHandle;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A command waiting for its reply.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    /// The command being waited on
    pub command_id: CommandId,
    /// Target aggregate, used when synthesizing failure results
    pub aggregate_root_id: String,
    /// Command type name, for diagnostics
    pub command_type: String,
    /// When the caller considers the command done
    pub policy: CompletionPolicy,
    /// Slot the caller is waiting on
    pub handle: ResultHandle,
    /// Wall-clock registration time, for diagnostics
    pub registered_at: DateTime<Utc>,
}

impl PendingRequest {
    /// Create a pending request registered now.
    #[must_use]
    pub fn new(
        command_id: CommandId,
        aggregate_root_id: impl Into<String>,
        command_type: impl Into<String>,
        policy: CompletionPolicy,
        handle: ResultHandle,
    ) -> Self {
        Self {
            command_id,
            aggregate_root_id: aggregate_root_id.into(),
            command_type: command_type.into(),
            policy,
            handle,
            registered_at: Utc::now(),
        }
    }
}

/// Receives entries whose idle duration elapsed without resolution.
pub trait EvictionListener: Send + Sync {
    /// Called exactly once per expired entry, outside the registry lock.
    fn on_expired(&self, request: PendingRequest);
}

/// Outcome of [`PendingRegistry::remove_if`].
#[derive(Debug)]
pub enum ConditionalRemoval {
    /// The predicate held and the entry was removed.
    Removed(PendingRequest),
    /// The entry exists but the predicate did not hold; it stays registered.
    Retained,
    /// No entry for the id (already resolved or expired).
    Absent,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
    at: Instant,
    seq: u64,
    command_id: CommandId,
}

#[derive(Debug)]
struct Entry {
    request: PendingRequest,
    seq: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<CommandId, Entry>,
    // Removal leaves stale deadlines behind; they are skipped by sequence number.
    deadlines: BinaryHeap<Reverse<Deadline>>,
    next_seq: u64,
}

impl RegistryState {
    fn take_expired(&mut self, now: Instant) -> Vec<PendingRequest> {
        let mut expired = Vec::new();
        while let Some(Reverse(next)) = self.deadlines.peek() {
            if next.at > now {
                break;
            }
            let Some(Reverse(deadline)) = self.deadlines.pop() else {
                break;
            };
            let live = self
                .entries
                .get(&deadline.command_id)
                .is_some_and(|entry| entry.seq == deadline.seq);
            if live {
                if let Some(entry) = self.entries.remove(&deadline.command_id) {
                    expired.push(entry.request);
                }
            }
        }
        expired
    }

    fn earliest_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(next)) = self.deadlines.peek() {
            let live = self
                .entries
                .get(&next.command_id)
                .is_some_and(|entry| entry.seq == next.seq);
            if live {
                return Some(next.at);
            }
            self.deadlines.pop();
        }
        None
    }
}

/// Concurrent map from command id to [`PendingRequest`] with automatic expiry.
pub struct PendingRegistry {
    state: Mutex<RegistryState>,
    idle_timeout: Duration,
    listener: Arc<dyn EvictionListener>,
    earliest_changed: Notify,
}

impl PendingRegistry {
    /// Create a registry whose entries expire `idle_timeout` after insertion.
    #[must_use]
    pub fn new(idle_timeout: Duration, listener: Arc<dyn EvictionListener>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            idle_timeout,
            listener,
            earliest_changed: Notify::new(),
        }
    }

    /// Idle duration after which entries expire.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Track a pending request.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Duplicate`] if the command id is already
    /// tracked. The existing entry is left untouched.
    pub fn register(&self, request: PendingRequest) -> Result<(), RegistrationError> {
        let now = Instant::now();
        let (expired, outcome) = {
            let mut state = self.lock();
            let expired = state.take_expired(now);

            let outcome = if state.entries.contains_key(&request.command_id) {
                Err(RegistrationError::Duplicate {
                    command_id: request.command_id.clone(),
                    command_type: request.command_type.clone(),
                })
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                let at = now + self.idle_timeout;
                let becomes_earliest = state.earliest_deadline().is_none_or(|earliest| at < earliest);

                state.deadlines.push(Reverse(Deadline {
                    at,
                    seq,
                    command_id: request.command_id.clone(),
                }));
                state.entries.insert(request.command_id.clone(), Entry { request, seq });

                if becomes_earliest {
                    self.earliest_changed.notify_one();
                }
                Ok(())
            };

            record_pending(state.entries.len());
            (expired, outcome)
        };

        self.notify_expired(expired);
        outcome
    }

    /// Return a copy of the entry without removing it.
    #[must_use]
    pub fn lookup(&self, command_id: &CommandId) -> Option<PendingRequest> {
        let (expired, found) = {
            let mut state = self.lock();
            let expired = state.take_expired(Instant::now());
            let found = state.entries.get(command_id).map(|entry| entry.request.clone());
            record_pending(state.entries.len());
            (expired, found)
        };
        self.notify_expired(expired);
        found
    }

    /// Atomically remove and return the entry, if present.
    pub fn remove(&self, command_id: &CommandId) -> Option<PendingRequest> {
        match self.remove_if(command_id, |_| true) {
            ConditionalRemoval::Removed(request) => Some(request),
            ConditionalRemoval::Retained | ConditionalRemoval::Absent => None,
        }
    }

    /// Atomically remove the entry only if `predicate` holds for it.
    pub fn remove_if<F>(&self, command_id: &CommandId, predicate: F) -> ConditionalRemoval
    where
        F: FnOnce(&PendingRequest) -> bool,
    {
        let (expired, outcome) = {
            let mut state = self.lock();
            let expired = state.take_expired(Instant::now());
            let matched = state
                .entries
                .get(command_id)
                .map(|entry| predicate(&entry.request));
            let outcome = match matched {
                None => ConditionalRemoval::Absent,
                Some(false) => ConditionalRemoval::Retained,
                Some(true) => state
                    .entries
                    .remove(command_id)
                    .map_or(ConditionalRemoval::Absent, |entry| {
                        ConditionalRemoval::Removed(entry.request)
                    }),
            };
            record_pending(state.entries.len());
            (expired, outcome)
        };
        self.notify_expired(expired);
        outcome
    }

    /// Evict every overdue entry now. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let expired = {
            let mut state = self.lock();
            let expired = state.take_expired(Instant::now());
            record_pending(state.entries.len());
            expired
        };
        let count = expired.len();
        self.notify_expired(expired);
        count
    }

    /// Deadline of the entry that will expire next.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().earliest_deadline()
    }

    /// Number of tracked entries, including overdue ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drive expiry until `token` is cancelled.
    ///
    /// Sleeps until the earliest deadline, re-arming whenever a registration
    /// introduces an earlier one.
    pub async fn run_expiry(self: Arc<Self>, token: CancellationToken) {
        tracing::debug!(idle_timeout_ms = self.idle_timeout.as_millis(), "Expiry driver started");
        loop {
            let next = self.next_deadline();
            tokio::select! {
                () = token.cancelled() => break,
                () = self.earliest_changed.notified() => {}
                () = sleep_until_deadline(next) => {
                    self.evict_expired();
                }
            }
        }
        tracing::debug!("Expiry driver stopped");
    }

    fn notify_expired(&self, expired: Vec<PendingRequest>) {
        for request in expired {
            self.listener.on_expired(request);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PendingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRegistry")
            .field("idle_timeout", &self.idle_timeout)
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_pending(len: usize) {
    metrics::gauge!(names::REGISTRY_PENDING).set(len as f64);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        expired: Mutex<Vec<CommandId>>,
    }

    impl RecordingListener {
        fn expired(&self) -> Vec<CommandId> {
            self.expired.lock().unwrap().clone()
        }
    }

    impl EvictionListener for RecordingListener {
        fn on_expired(&self, request: PendingRequest) {
            self.expired.lock().unwrap().push(request.command_id);
        }
    }

    fn registry(timeout_ms: u64) -> (Arc<PendingRegistry>, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        let registry = Arc::new(PendingRegistry::new(
            Duration::from_millis(timeout_ms),
            Arc::clone(&listener) as Arc<dyn EvictionListener>,
        ));
        (registry, listener)
    }

    fn request(id: &str) -> PendingRequest {
        PendingRequest::new(
            CommandId::new(id),
            "agg-1",
            "TestCommand",
            CompletionPolicy::ExecutedOnly,
            ResultHandle::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_registration_is_rejected() {
        let (registry, _) = registry(1000);
        registry.register(request("cmd-1")).unwrap();

        let err = registry.register(request("cmd-1")).unwrap_err();
        assert!(matches!(err, RegistrationError::Duplicate { ref command_id, .. } if command_id.as_str() == "cmd-1"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_does_not_remove() {
        let (registry, _) = registry(1000);
        registry.register(request("cmd-1")).unwrap();

        assert!(registry.lookup(&CommandId::new("cmd-1")).is_some());
        assert!(registry.lookup(&CommandId::new("cmd-1")).is_some());
        assert!(registry.remove(&CommandId::new("cmd-1")).is_some());
        assert!(registry.remove(&CommandId::new("cmd-1")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_idle_timeout_not_before() {
        let (registry, listener) = registry(100);
        registry.register(request("cmd-1")).unwrap();

        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(registry.evict_expired(), 0);
        assert!(listener.expired().is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(registry.evict_expired(), 1);
        assert_eq!(listener.expired(), vec![CommandId::new("cmd-1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn lookups_do_not_refresh_expiry() {
        let (registry, listener) = registry(100);
        registry.register(request("cmd-1")).unwrap();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_millis(30)).await;
            let _ = registry.lookup(&CommandId::new("cmd-1"));
        }

        assert!(registry.is_empty());
        assert_eq!(listener.expired().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_entries_never_reach_the_listener() {
        let (registry, listener) = registry(100);
        registry.register(request("cmd-1")).unwrap();
        registry.remove(&CommandId::new("cmd-1")).unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(registry.evict_expired(), 0);
        assert!(listener.expired().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_evaluated_on_incidental_operations() {
        let (registry, listener) = registry(100);
        registry.register(request("cmd-1")).unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(registry.remove(&CommandId::new("cmd-1")).is_none());
        assert_eq!(listener.expired(), vec![CommandId::new("cmd-1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_id_can_be_registered_again() {
        let (registry, listener) = registry(100);
        registry.register(request("cmd-1")).unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;

        registry.register(request("cmd-1")).unwrap();
        assert_eq!(listener.expired().len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn re_registered_id_keeps_its_own_deadline() {
        let (registry, listener) = registry(100);
        registry.register(request("cmd-1")).unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        registry.remove(&CommandId::new("cmd-1")).unwrap();
        registry.register(request("cmd-1")).unwrap();

        // The first registration's deadline passes; the second one is still live.
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(registry.evict_expired(), 0);
        assert!(listener.expired().is_empty());

        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(registry.evict_expired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_if_retains_when_predicate_fails() {
        let (registry, _) = registry(1000);
        registry.register(request("cmd-1")).unwrap();
        let id = CommandId::new("cmd-1");

        assert!(matches!(registry.remove_if(&id, |_| false), ConditionalRemoval::Retained));
        assert!(matches!(registry.remove_if(&id, |_| true), ConditionalRemoval::Removed(_)));
        assert!(matches!(registry.remove_if(&id, |_| true), ConditionalRemoval::Absent));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_driver_fires_without_other_traffic() {
        let (registry, listener) = registry(100);
        let token = CancellationToken::new();
        let driver = tokio::spawn(Arc::clone(&registry).run_expiry(token.clone()));
        // Let the driver park on an empty registry first.
        tokio::task::yield_now().await;

        let handle = ResultHandle::new();
        registry
            .register(PendingRequest::new(
                CommandId::new("cmd-2"),
                "agg",
                "TestCommand",
                CompletionPolicy::ExecutedOnly,
                handle.clone(),
            ))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(101)).await;
        assert_eq!(listener.expired(), vec![CommandId::new("cmd-2")]);
        assert!(!handle.is_completed(), "registry itself never resolves handles");

        token.cancel();
        driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_driver_handles_successive_deadlines() {
        let listener = Arc::new(RecordingListener::default());
        let registry = Arc::new(PendingRegistry::new(
            Duration::from_millis(100),
            Arc::clone(&listener) as Arc<dyn EvictionListener>,
        ));
        let token = CancellationToken::new();
        let driver = tokio::spawn(Arc::clone(&registry).run_expiry(token.clone()));
        tokio::task::yield_now().await;

        registry.register(request("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.register(request("b")).unwrap();

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert_eq!(listener.expired(), vec![CommandId::new("a")]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.expired(), vec![CommandId::new("a"), CommandId::new("b")]);

        token.cancel();
        driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_register_and_remove_are_consistent() {
        let (registry, listener) = registry(10_000);
        let mut tasks = Vec::new();
        for i in 0..64 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let id = format!("cmd-{i}");
                registry.register(request(&id)).unwrap();
                tokio::task::yield_now().await;
                registry.remove(&CommandId::new(id)).is_some()
            }));
        }

        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert!(registry.is_empty());
        assert!(listener.expired().is_empty());
    }
}
