// src/core/queue.rs

//! Shared application work queue with thread-group serialization.
//!
//! All message-driven work (recovery sub-operations, phantom phases,
//! replication fragment workers) is submitted here. Each work item may carry
//! a 64-bit group id; at most one item per group runs at a time while the
//! rest stay queued in FIFO order behind it. This is the mechanism by which
//! a given range is never updated concurrently from two different operations.
//!
//! A second, urgent FIFO is drained strictly before the normal one and is
//! used for connection-teardown cleanups; if no worker is idle when an urgent
//! item arrives a one-shot worker is spawned for it.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// A queued unit of work: a move-only async closure, consumed by execution.
pub struct WorkItem {
    pub group_id: Option<u64>,
    pub deadline: Option<Instant>,
    pub work: BoxFuture<'static, ()>,
}

impl WorkItem {
    pub fn new(work: BoxFuture<'static, ()>) -> Self {
        Self {
            group_id: None,
            deadline: None,
            work,
        }
    }

    pub fn grouped(group_id: u64, work: BoxFuture<'static, ()>) -> Self {
        Self {
            group_id: Some(group_id),
            deadline: None,
            work,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }
}

#[derive(Default)]
struct GroupState {
    running: bool,
    outstanding: usize,
}

struct QueueInner {
    queue: VecDeque<WorkItem>,
    urgent: VecDeque<WorkItem>,
    groups: HashMap<u64, GroupState>,
    workers_total: usize,
    workers_available: usize,
    shutdown: bool,
}

impl QueueInner {
    fn enqueue(&mut self, item: &WorkItem) {
        if let Some(group) = item.group_id {
            self.groups.entry(group).or_default().outstanding += 1;
        }
    }

    fn settle(&mut self, group_id: Option<u64>) {
        if let Some(group) = group_id {
            if let Some(state) = self.groups.get_mut(&group) {
                state.running = false;
                state.outstanding = state.outstanding.saturating_sub(1);
                if state.outstanding == 0 {
                    self.groups.remove(&group);
                }
            }
        }
    }

    /// Pops the next runnable item, skipping groups with a running member and
    /// discarding expired items (their group counters are still settled).
    fn pop_runnable(&mut self) -> Option<WorkItem> {
        for queue_is_urgent in [true, false] {
            let mut idx = 0;
            loop {
                let len = if queue_is_urgent {
                    self.urgent.len()
                } else {
                    self.queue.len()
                };
                if idx >= len {
                    break;
                }
                let is_expired = if queue_is_urgent {
                    self.urgent[idx].expired()
                } else {
                    self.queue[idx].expired()
                };
                if is_expired {
                    let expired = if queue_is_urgent {
                        self.urgent.remove(idx).unwrap()
                    } else {
                        self.queue.remove(idx).unwrap()
                    };
                    debug!("Discarding expired work item (group={:?})", expired.group_id);
                    self.settle(expired.group_id);
                    continue;
                }
                let runnable = match if queue_is_urgent {
                    self.urgent[idx].group_id
                } else {
                    self.queue[idx].group_id
                } {
                    Some(group) => !self.groups.get(&group).is_some_and(|s| s.running),
                    None => true,
                };
                if runnable {
                    let item = if queue_is_urgent {
                        self.urgent.remove(idx).unwrap()
                    } else {
                        self.queue.remove(idx).unwrap()
                    };
                    if let Some(group) = item.group_id {
                        if let Some(state) = self.groups.get_mut(&group) {
                            state.running = true;
                        }
                    }
                    return Some(item);
                }
                idx += 1;
            }
        }
        None
    }
}

struct QueueState {
    inner: Mutex<QueueInner>,
    work_available: Notify,
    quiesced: Notify,
}

/// The shared cooperative work pool.
pub struct ApplicationQueue {
    state: Arc<QueueState>,
}

impl ApplicationQueue {
    pub fn new(workers: usize) -> Arc<Self> {
        let state = Arc::new(QueueState {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                urgent: VecDeque::new(),
                groups: HashMap::new(),
                workers_total: workers,
                workers_available: 0,
                shutdown: false,
            }),
            work_available: Notify::new(),
            quiesced: Notify::new(),
        });
        let queue = Arc::new(Self {
            state: state.clone(),
        });
        for _ in 0..workers {
            tokio::spawn(worker_loop(state.clone(), false));
        }
        queue
    }

    pub fn add(&self, item: WorkItem) {
        let mut inner = self.state.inner.lock();
        if inner.shutdown {
            return;
        }
        inner.enqueue(&item);
        inner.queue.push_back(item);
        drop(inner);
        self.state.work_available.notify_one();
    }

    /// Urgent items jump every normal item; if no worker is idle a one-shot
    /// worker is spawned so teardown work cannot be starved.
    pub fn add_urgent(&self, item: WorkItem) {
        let spawn_one_shot;
        {
            let mut inner = self.state.inner.lock();
            if inner.shutdown {
                return;
            }
            inner.enqueue(&item);
            inner.urgent.push_back(item);
            spawn_one_shot = inner.workers_available == 0;
        }
        if spawn_one_shot {
            tokio::spawn(worker_loop(self.state.clone(), true));
        } else {
            self.state.work_available.notify_one();
        }
    }

    /// Blocks until every worker is idle and both queues are empty.
    pub async fn quiesce(&self) {
        loop {
            // Register interest before checking, so a notification between
            // the check and the wait is not lost.
            let notified = self.state.quiesced.notified();
            {
                let inner = self.state.inner.lock();
                if inner.queue.is_empty()
                    && inner.urgent.is_empty()
                    && inner.workers_available == inner.workers_total
                {
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn shutdown(&self) {
        self.state.inner.lock().shutdown = true;
        self.state.work_available.notify_waiters();
    }
}

async fn worker_loop(state: Arc<QueueState>, one_shot: bool) {
    loop {
        let item = {
            let mut inner = state.inner.lock();
            if inner.shutdown {
                return;
            }
            let item = inner.pop_runnable();
            if item.is_none() {
                if one_shot {
                    return;
                }
                inner.workers_available += 1;
                if inner.workers_available == inner.workers_total {
                    state.quiesced.notify_waiters();
                }
            }
            item
        };

        match item {
            Some(item) => {
                let group_id = item.group_id;
                item.work.await;
                let mut inner = state.inner.lock();
                inner.settle(group_id);
                drop(inner);
                // A finished group member may unblock its successor; the
                // stored permit survives even if no worker is waiting yet.
                state.work_available.notify_one();
            }
            None => {
                state.work_available.notified().await;
                let mut inner = state.inner.lock();
                inner.workers_available = inner.workers_available.saturating_sub(1);
            }
        }
    }
}
