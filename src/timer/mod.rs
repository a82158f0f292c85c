// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    self,
    limits,
};
use ::std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
        Arc,
        Mutex,
        Weak,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Source of timer identities. Deadline ties are broken by this id, so
/// iteration order over equal deadlines is deterministic.
static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Callback fired on timer expiry. Shared so recurring timers keep their
/// callback across firings.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Per-timer mutable state; guarded by the owning manager's lock.
struct TimerBody {
    /// Firing interval (ms).
    interval_ms: u64,
    /// Next deadline on the monotonic clock (ms).
    next_ms: u64,
    /// Cleared when a one-shot expires or the timer is cancelled.
    callback: Option<TimerCallback>,
}

/// A timer handle. Obtained from [TimerManager::add_timer]; the handle stays
/// valid after expiry (cancel then reports `false`).
pub struct Timer {
    id: u64,
    recurring: bool,
    body: Mutex<TimerBody>,
    manager: Weak<TimerManager>,
}

struct TimerQueue {
    /// Live timers ordered by (deadline, identity).
    queue: BTreeMap<(u64, u64), Arc<Timer>>,
    /// Did the most recent insertion land at the head?
    has_new_head: bool,
}

/// An ordered set of deadlines over the runtime's monotonic clock.
pub struct TimerManager {
    /// Back-reference to the `Arc` this manager lives in; timer handles
    /// point back here weakly.
    self_ref: Weak<TimerManager>,
    inner: Mutex<TimerQueue>,
    /// Set once a wake has been requested for the current head; cleared by
    /// [TimerManager::collect_due]. Suppresses redundant tickles.
    tickled: AtomicBool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Timer {
    /// Cancels this timer. Returns whether it was still pending; a second
    /// cancel returns `false`.
    pub fn cancel(&self) -> bool {
        let manager: Arc<TimerManager> = match self.manager.upgrade() {
            Some(manager) => manager,
            None => return false,
        };
        let mut inner = manager.inner.lock().unwrap();
        let mut body = self.body.lock().unwrap();
        if body.callback.is_none() {
            return false;
        }
        body.callback = None;
        inner.queue.remove(&(body.next_ms, self.id));
        true
    }

    /// Re-arms this timer at `now + interval`. No-op (returns `false`) if it
    /// was already cancelled or has expired.
    pub fn refresh(&self) -> bool {
        let manager: Arc<TimerManager> = match self.manager.upgrade() {
            Some(manager) => manager,
            None => return false,
        };
        let mut inner = manager.inner.lock().unwrap();
        let mut body = self.body.lock().unwrap();
        if body.callback.is_none() {
            return false;
        }
        let timer: Arc<Timer> = match inner.queue.remove(&(body.next_ms, self.id)) {
            Some(timer) => timer,
            None => return false,
        };
        body.next_ms = runtime::now_ms() + body.interval_ms;
        inner.queue.insert((body.next_ms, self.id), timer);
        true
    }

    /// Changes the interval. With `from_now`, the next deadline is
    /// `now + new_interval`; otherwise the original start point is kept and
    /// the new interval measured from it.
    pub fn reset(&self, new_interval_ms: u64, from_now: bool) -> bool {
        let manager: Arc<TimerManager> = match self.manager.upgrade() {
            Some(manager) => manager,
            None => return false,
        };
        let mut inner = manager.inner.lock().unwrap();
        let mut body = self.body.lock().unwrap();
        if new_interval_ms == body.interval_ms && !from_now {
            return true;
        }
        if body.callback.is_none() {
            return false;
        }
        let timer: Arc<Timer> = match inner.queue.remove(&(body.next_ms, self.id)) {
            Some(timer) => timer,
            None => return false,
        };
        let start_ms: u64 = if from_now {
            runtime::now_ms()
        } else {
            body.next_ms - body.interval_ms
        };
        body.interval_ms = new_interval_ms;
        body.next_ms = start_ms + new_interval_ms;
        inner.queue.insert((body.next_ms, self.id), timer);
        inner.has_new_head = inner.queue.keys().next() == Some(&(body.next_ms, self.id));
        true
    }
}

impl TimerManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            inner: Mutex::new(TimerQueue {
                queue: BTreeMap::new(),
                has_new_head: false,
            }),
            tickled: AtomicBool::new(false),
        })
    }

    /// Adds a timer firing `interval_ms` from now (and every `interval_ms`
    /// thereafter when `recurring`).
    pub fn add_timer(&self, interval_ms: u64, callback: TimerCallback, recurring: bool) -> Arc<Timer> {
        let id: u64 = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let next_ms: u64 = runtime::now_ms() + interval_ms;
        let timer: Arc<Timer> = Arc::new(Timer {
            id,
            recurring,
            body: Mutex::new(TimerBody {
                interval_ms,
                next_ms,
                callback: Some(callback),
            }),
            manager: self.self_ref.clone(),
        });

        let mut inner = self.inner.lock().unwrap();
        inner.queue.insert((next_ms, id), timer.clone());
        inner.has_new_head = inner.queue.keys().next() == Some(&(next_ms, id));
        timer
    }

    /// Adds a timer whose callback runs only while the weakly-referenced
    /// guard is alive and still false. Resolves the readiness/timeout race:
    /// the guard lives in the hooked call's frame, so a late firing after
    /// the call returned sees a dead guard and does nothing.
    pub fn add_condition_timer(
        &self,
        interval_ms: u64,
        callback: TimerCallback,
        condition: Weak<AtomicBool>,
        recurring: bool,
    ) -> Arc<Timer> {
        let guarded: TimerCallback = Arc::new(move || {
            if let Some(flag) = condition.upgrade() {
                if !flag.load(Ordering::Acquire) {
                    callback();
                }
            }
        });
        self.add_timer(interval_ms, guarded, recurring)
    }

    /// Should the caller wake the reactor for a newly-inserted head timer?
    /// The answer is `true` at most once per head; [TimerManager::set_tickled]
    /// records that the wake went out.
    pub fn need_tickle(&self) -> bool {
        self.inner.lock().unwrap().has_new_head && !self.tickled.load(Ordering::Acquire)
    }

    pub fn set_tickled(&self) {
        self.tickled.store(true, Ordering::Release);
    }

    /// Milliseconds until the head deadline: `None` when no timer is live,
    /// zero when the head is already due.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        let (&(next_ms, _), _) = inner.queue.iter().next()?;
        Some(next_ms.saturating_sub(runtime::now_ms()))
    }

    /// Removes every timer whose deadline has passed and returns their
    /// callbacks in (deadline, identity) order. Expired one-shots have their
    /// callback cleared; recurring timers are re-armed at `now + interval`.
    /// Clears the tickled bit.
    pub fn collect_due(&self) -> Vec<TimerCallback> {
        let now_ms: u64 = runtime::now_ms();
        let mut due: Vec<TimerCallback> = Vec::new();

        let mut inner = self.inner.lock().unwrap();
        let expired_keys: Vec<(u64, u64)> = inner
            .queue
            .range(..=(now_ms, u64::MAX))
            .map(|(&key, _)| key)
            .collect();
        for key in expired_keys {
            let timer: Arc<Timer> = inner.queue.remove(&key).expect("key was just enumerated");
            let mut body = timer.body.lock().unwrap();
            if let Some(callback) = body.callback.clone() {
                due.push(callback);
            }
            if timer.recurring {
                body.next_ms = now_ms + body.interval_ms;
                let reinsert_key: (u64, u64) = (body.next_ms, timer.id);
                drop(body);
                inner.queue.insert(reinsert_key, timer);
            } else {
                body.callback = None;
            }
        }
        inner.has_new_head = false;
        self.tickled.store(false, Ordering::Release);
        due
    }

    /// Is the deadline set empty?
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }

    /// Milliseconds until the head, saturated to the sentinel when empty.
    pub fn next_deadline_or_infinite(&self) -> u64 {
        self.next_deadline_ms().unwrap_or(limits::TIMEOUT_INFINITE)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
