//! Shared delay-queue scheduler for per-account automation tasks.
//!
//! One min-heap keyed by fire instant serves the whole fleet instead of one
//! native timer handle per account. A single driver loop (see
//! [`crate::engine`]) claims due tasks and dispatches them sequentially,
//! which gives strict per-account ordering for free.
//!
//! ## Design
//! - Liveness map keyed by [`TaskKey`] with generation counters; superseded
//!   or cancelled heap entries are discarded lazily when popped.
//! - [`TaskQueue::cancel`] acquires the task's per-account dispatch mutex
//!   before removing liveness, so it waits out any in-flight tick. Once
//!   `cancel` returns, no further callback for that key fires.
//! - Arming an earlier deadline wakes the driver through a `Notify`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedMutexGuard};

/// What kind of work a queued task triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Repeating bandwidth sampling tick (usage monitor).
    UsageSample,
    /// Self-rescheduling one-shot billing deadline (billing scheduler).
    BillingCycle,
}

/// Identity of a scheduled task. At most one live task exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub account_id: String,
    pub kind: TaskKind,
}

impl TaskKey {
    pub fn usage(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            kind: TaskKind::UsageSample,
        }
    }

    pub fn billing(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            kind: TaskKind::BillingCycle,
        }
    }
}

#[derive(Debug, Clone)]
struct HeapEntry {
    fire_at: DateTime<Utc>,
    /// Tie-break so equal deadlines pop in arm order.
    seq: u64,
    /// Must match the liveness map for the entry to still count.
    gen: u64,
    key: TaskKey,
}

// Reverse ordering: BinaryHeap is a max-heap, we want the earliest deadline
// on top.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

#[derive(Debug, Clone, Copy)]
struct LiveTask {
    gen: u64,
    fire_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<HeapEntry>,
    live: HashMap<TaskKey, LiveTask>,
    next_gen: u64,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, key: TaskKey, fire_at: DateTime<Utc>) {
        self.next_gen += 1;
        self.next_seq += 1;
        let gen = self.next_gen;
        self.live.insert(key.clone(), LiveTask { gen, fire_at });
        self.heap.push(HeapEntry {
            fire_at,
            seq: self.next_seq,
            gen,
            key,
        });
    }

    fn is_live(&self, entry: &HeapEntry) -> bool {
        self.live
            .get(&entry.key)
            .is_some_and(|live| live.gen == entry.gen)
    }
}

/// A task claimed from the queue whose fire instant has passed. The claim is
/// provisional until [`TaskQueue::begin_dispatch`] confirms liveness.
#[derive(Debug)]
pub struct DueTask {
    pub key: TaskKey,
    gen: u64,
}

/// Proof that a due task was still live when dispatch began. Holds the
/// account's dispatch mutex for the duration of the tick so `cancel` can
/// synchronize with it.
pub struct DispatchPermit {
    _guard: OwnedMutexGuard<()>,
}

/// Centralized min-heap scheduler shared by all automation components.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    /// Per-account dispatch mutexes (tokio, held across the tick await).
    guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Wakes the driver when a new deadline is armed.
    rearm: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            guards: Mutex::new(HashMap::new()),
            rearm: Notify::new(),
        }
    }

    /// Arm `key` to fire at `fire_at`. Returns `false` (a no-op) if the key
    /// is already armed — the idempotency contract for `start_monitoring`
    /// and `schedule_billing`.
    pub fn arm(&self, key: TaskKey, fire_at: DateTime<Utc>) -> bool {
        {
            let mut state = self.state.lock();
            if state.live.contains_key(&key) {
                return false;
            }
            state.insert(key, fire_at);
        }
        self.rearm.notify_one();
        true
    }

    /// Arm `key`, superseding any existing deadline for it.
    pub fn rearm(&self, key: TaskKey, fire_at: DateTime<Utc>) {
        self.state.lock().insert(key, fire_at);
        self.rearm.notify_one();
    }

    /// Cancel `key`. Waits out any in-flight dispatch of the same account's
    /// tasks; after this returns, no further callback for `key` fires.
    /// Returns `false` if nothing was armed.
    pub async fn cancel(&self, key: &TaskKey) -> bool {
        let guard = self.dispatch_guard(&key.account_id);
        let _held = guard.lock().await;
        self.state.lock().live.remove(key).is_some()
    }

    pub fn is_armed(&self, key: &TaskKey) -> bool {
        self.state.lock().live.contains_key(key)
    }

    /// Deadline currently armed for `key`, if any.
    pub fn armed_at(&self, key: &TaskKey) -> Option<DateTime<Utc>> {
        self.state.lock().live.get(key).map(|live| live.fire_at)
    }

    /// Earliest live deadline, pruning stale heap entries from the top.
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        let mut state = self.state.lock();
        while let Some(top) = state.heap.peek() {
            if state.is_live(top) {
                return Some(top.fire_at);
            }
            state.heap.pop();
        }
        None
    }

    /// Pop the earliest task due at or before `now`, skipping superseded
    /// and cancelled entries. The liveness entry stays in place until
    /// [`Self::begin_dispatch`] consumes it.
    pub fn claim_due(&self, now: DateTime<Utc>) -> Option<DueTask> {
        let mut state = self.state.lock();
        loop {
            let top = state.heap.peek()?;
            if !state.is_live(top) {
                state.heap.pop();
                continue;
            }
            if top.fire_at > now {
                return None;
            }
            let entry = state.heap.pop()?;
            return Some(DueTask {
                key: entry.key,
                gen: entry.gen,
            });
        }
    }

    /// Acquire the dispatch permit for a claimed task. Returns `None` if
    /// the task was cancelled or superseded between claim and dispatch.
    /// Consumes the liveness entry, so repeating tasks must re-arm after
    /// their tick.
    pub async fn begin_dispatch(&self, due: &DueTask) -> Option<DispatchPermit> {
        let guard = self.dispatch_guard(&due.key.account_id);
        let held = guard.lock_owned().await;
        let mut state = self.state.lock();
        match state.live.get(&due.key) {
            Some(live) if live.gen == due.gen => {
                state.live.remove(&due.key);
                Some(DispatchPermit { _guard: held })
            }
            _ => None,
        }
    }

    /// Resolves when a new deadline is armed (driver wake-up).
    pub async fn wait_rearm(&self) {
        self.rearm.notified().await;
    }

    /// Number of live (armed) tasks.
    pub fn len(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().live.is_empty()
    }

    fn dispatch_guard(&self, account_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.guards
            .lock()
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
