// src/core/master/recovery_state.rs

//! Per-phase synchronizers for recovery sub-operations.
//!
//! Each phase installs its future into a process-wide map keyed by the
//! sub-operation id, so late callbacks from destination servers can locate
//! it. Callbacks decrement a count and signal; the sub-operation waits on the
//! future with a deadline. The attempt counter lets the replay counter
//! discard replies from abandoned attempts.

use crate::core::TesseraError;
use crate::core::protocol::WireError;
use crate::core::types::{FragmentId, Location};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

/// Tracks outstanding `replay_fragments` requests for one attempt.
pub struct ReplayCounter {
    attempt: u32,
    inner: Mutex<ReplayCounterInner>,
    notify: Notify,
}

struct ReplayCounterInner {
    outstanding: usize,
    success: bool,
    errors: Vec<(FragmentId, WireError)>,
    last_activity: Instant,
}

impl ReplayCounter {
    pub fn new(attempt: u32) -> Arc<Self> {
        Arc::new(Self {
            attempt,
            inner: Mutex::new(ReplayCounterInner {
                outstanding: 0,
                success: true,
                errors: Vec::new(),
                last_activity: Instant::now(),
            }),
            notify: Notify::new(),
        })
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Registers `count` outstanding destinations.
    pub fn add(&self, count: usize) {
        self.inner.lock().outstanding += count;
    }

    /// One destination finished replaying its fragments.
    pub fn complete(
        &self,
        attempt: u32,
        fragment_errors: Vec<(FragmentId, WireError)>,
        success: bool,
    ) {
        if attempt != self.attempt {
            info!(
                "Discarding replay completion for abandoned attempt {} (current {})",
                attempt, self.attempt
            );
            return;
        }
        let mut inner = self.inner.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        inner.success &= success;
        inner.errors.extend(fragment_errors);
        inner.last_activity = Instant::now();
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Marks one destination failed before its request even went out.
    pub fn set_error(&self, fragments: &[FragmentId], error: WireError) {
        let mut inner = self.inner.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        inner.success = false;
        inner
            .errors
            .extend(fragments.iter().map(|f| (*f, error.clone())));
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Periodic heartbeat from a destination still replaying; extends the
    /// wait deadline.
    pub fn heartbeat(&self, attempt: u32) {
        if attempt == self.attempt {
            self.inner.lock().last_activity = Instant::now();
        }
    }

    /// Waits until every destination has reported or the (heartbeat-extended)
    /// timeout elapses. Returns overall success.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        loop {
            let (outstanding, success, deadline) = {
                let inner = self.inner.lock();
                (
                    inner.outstanding,
                    inner.success,
                    inner.last_activity + timeout,
                )
            };
            if outstanding == 0 {
                return success;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                let inner = self.inner.lock();
                if inner.outstanding > 0 && inner.last_activity + timeout <= Instant::now() {
                    warn!(
                        "Commit log replay timed out with {} destinations outstanding",
                        inner.outstanding
                    );
                    return false;
                }
            }
        }
    }
}

/// Tracks outstanding prepare/commit requests. Destinations that already
/// succeeded in an earlier round are not re-registered, so a retried phase
/// only waits for the stragglers.
pub struct StepFuture {
    label: &'static str,
    inner: Mutex<StepFutureInner>,
    notify: Notify,
}

#[derive(Default)]
struct StepFutureInner {
    outstanding: BTreeSet<Location>,
    succeeded: BTreeSet<Location>,
    error: Option<(Location, WireError)>,
}

impl StepFuture {
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            inner: Mutex::new(StepFutureInner::default()),
            notify: Notify::new(),
        })
    }

    pub fn register_locations(&self, locations: impl IntoIterator<Item = Location>) {
        let mut inner = self.inner.lock();
        inner.error = None;
        inner.outstanding.clear();
        for location in locations {
            if !inner.succeeded.contains(&location) {
                inner.outstanding.insert(location);
            }
        }
    }

    pub fn success(&self, location: &Location) {
        let mut inner = self.inner.lock();
        if inner.outstanding.remove(location) {
            inner.succeeded.insert(location.clone());
        } else if !inner.succeeded.contains(location) {
            info!(
                "Response from {} for recovery step {}, but not registered",
                location, self.label
            );
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn failure(&self, location: &Location, error: WireError) {
        let mut inner = self.inner.lock();
        inner.outstanding.remove(location);
        inner.error.get_or_insert((location.clone(), error));
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Waits for every registered location. An error from any location or a
    /// timeout fails the phase.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<(), TesseraError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let inner = self.inner.lock();
                if let Some((location, error)) = &inner.error {
                    warn!(
                        "Recovery step {} failed at {}: {:?}",
                        self.label, location, error
                    );
                    return Err(error.clone().into());
                }
                if inner.outstanding.is_empty() {
                    return Ok(());
                }
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                let inner = self.inner.lock();
                if !inner.outstanding.is_empty() {
                    warn!("Recovery step {} timed out", self.label);
                    return Err(TesseraError::RequestTimeout(format!(
                        "recovery step {}",
                        self.label
                    )));
                }
            }
        }
    }
}

/// Process-wide registry of in-flight recovery synchronizers, keyed by
/// sub-operation id.
#[derive(Default)]
pub struct RecoveryState {
    replay_counters: Mutex<HashMap<u64, Arc<ReplayCounter>>>,
    prepare_futures: Mutex<HashMap<u64, Arc<StepFuture>>>,
    commit_futures: Mutex<HashMap<u64, Arc<StepFuture>>>,
}

impl RecoveryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_replay_counter(&self, op_id: u64, attempt: u32) -> Arc<ReplayCounter> {
        let counter = ReplayCounter::new(attempt);
        self.replay_counters.lock().insert(op_id, counter.clone());
        counter
    }

    pub fn replay_counter(&self, op_id: u64) -> Option<Arc<ReplayCounter>> {
        self.replay_counters.lock().get(&op_id).cloned()
    }

    pub fn erase_replay_counter(&self, op_id: u64) {
        self.replay_counters.lock().remove(&op_id);
    }

    pub fn prepare_future(&self, op_id: u64) -> Arc<StepFuture> {
        self.prepare_futures
            .lock()
            .entry(op_id)
            .or_insert_with(|| StepFuture::new("prepare"))
            .clone()
    }

    pub fn lookup_prepare_future(&self, op_id: u64) -> Option<Arc<StepFuture>> {
        self.prepare_futures.lock().get(&op_id).cloned()
    }

    pub fn erase_prepare_future(&self, op_id: u64) {
        self.prepare_futures.lock().remove(&op_id);
    }

    pub fn commit_future(&self, op_id: u64) -> Arc<StepFuture> {
        self.commit_futures
            .lock()
            .entry(op_id)
            .or_insert_with(|| StepFuture::new("commit"))
            .clone()
    }

    pub fn lookup_commit_future(&self, op_id: u64) -> Option<Arc<StepFuture>> {
        self.commit_futures.lock().get(&op_id).cloned()
    }

    pub fn erase_commit_future(&self, op_id: u64) {
        self.commit_futures.lock().remove(&op_id);
    }
}
