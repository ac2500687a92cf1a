//! Deadline-ordered timer heap
//!
//! Timers live in a `BTreeMap` keyed by `(deadline_ms, id)`. The id comes
//! from a process-wide counter, so timers with the same deadline expire in
//! insertion order.
//!
//! Callbacks are never run by the heap. `list_expired_cb` hands them back
//! in deadline order and the owner (the reactor's idle loop) runs them
//! after the heap lock is released.
//!
//! Lock order: heap, then timer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Instant;
use strand_core::constants::NO_TIMER;
use strand_core::ktrace;

/// Timer callback; recurring timers call it once per period
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

static START_INSTANT: OnceLock<Instant> = OnceLock::new();
static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Milliseconds on the monotonic clock used for all deadlines
#[inline]
pub fn now_ms() -> u64 {
    START_INSTANT.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Deadline following `prev` for a recurring timer
///
/// Steps by whole periods from `prev` until the result lies after `now`,
/// so a late wakeup neither drifts nor fires a burst of catch-up calls.
pub fn next_deadline(prev: u64, period: u64, now: u64) -> u64 {
    let period = period.max(1);
    if prev > now {
        return prev;
    }
    let missed = (now - prev) / period + 1;
    prev.saturating_add(missed.saturating_mul(period))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct TimerState {
    /// Absolute deadline
    next: u64,
    /// 0 for one-shot timers
    period: u64,
    recurring: bool,
    /// None once cancelled or consumed
    cb: Option<TimerCallback>,
}

/// Handle to an armed timer
pub struct Timer {
    id: u64,
    state: Mutex<TimerState>,
    heap: Weak<HeapShared>,
}

impl Timer {
    /// Disarm the timer
    ///
    /// Returns false if it already fired (one-shot) or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(heap) = self.heap.upgrade() else {
            return false;
        };
        let mut inner = lock(&heap.inner);
        let mut st = lock(&self.state);
        if st.cb.is_none() {
            return false;
        }
        st.cb = None;
        inner.timers.remove(&(st.next, self.id));
        true
    }

    /// Push the deadline to now + period
    pub fn refresh(&self) -> bool {
        let Some(heap) = self.heap.upgrade() else {
            return false;
        };
        let mut inner = lock(&heap.inner);
        let mut st = lock(&self.state);
        if st.cb.is_none() {
            return false;
        }
        let Some(me) = inner.timers.remove(&(st.next, self.id)) else {
            return false;
        };
        st.next = now_ms().saturating_add(st.period);
        inner.timers.insert((st.next, self.id), me);
        true
    }

    /// Change the period to `ms`
    ///
    /// With `from_now` the new period starts now; otherwise it starts at
    /// the original arm time, so elapsed progress is kept.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(heap) = self.heap.upgrade() else {
            return false;
        };
        let at_front = {
            let mut inner = lock(&heap.inner);
            let mut st = lock(&self.state);
            if st.cb.is_none() {
                return false;
            }
            if ms == st.period && !from_now {
                return true;
            }
            let Some(me) = inner.timers.remove(&(st.next, self.id)) else {
                return false;
            };
            let start = if from_now {
                now_ms()
            } else {
                st.next.saturating_sub(st.period)
            };
            st.period = ms;
            st.next = start.saturating_add(ms);
            inner.insert(st.next, self.id, me)
        };
        if at_front {
            (heap.on_front)();
        }
        true
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current deadline on the `now_ms` clock
    pub fn deadline(&self) -> u64 {
        lock(&self.state).next
    }

    pub fn is_recurring(&self) -> bool {
        lock(&self.state).recurring
    }

    /// Still armed
    pub fn is_armed(&self) -> bool {
        lock(&self.state).cb.is_some()
    }
}

struct HeapInner {
    timers: BTreeMap<(u64, u64), Arc<Timer>>,
    /// Front hook already fired since the last get_next_timer
    tickled: bool,
}

impl HeapInner {
    /// Insert and report whether the front hook should fire
    fn insert(&mut self, next: u64, id: u64, timer: Arc<Timer>) -> bool {
        self.timers.insert((next, id), timer);
        let is_front = self.timers.keys().next() == Some(&(next, id));
        let notify = is_front && !self.tickled;
        if notify {
            self.tickled = true;
        }
        notify
    }
}

struct HeapShared {
    inner: Mutex<HeapInner>,
    on_front: Box<dyn Fn() + Send + Sync>,
}

/// Ordered set of armed timers
pub struct TimerManager {
    shared: Arc<HeapShared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        Self::with_front_hook(|| {})
    }

    /// `on_front` runs (outside the heap lock) when a new timer becomes the
    /// earliest one, at most once per `get_next_timer` call.
    pub fn with_front_hook<F>(on_front: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        TimerManager {
            shared: Arc::new(HeapShared {
                inner: Mutex::new(HeapInner {
                    timers: BTreeMap::new(),
                    tickled: false,
                }),
                on_front: Box::new(on_front),
            }),
        }
    }

    /// Arm a timer `ms` from now
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_cb(ms, Arc::new(cb), recurring)
    }

    pub fn add_timer_cb(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let next = now_ms().saturating_add(ms);
        let timer = Arc::new(Timer {
            id,
            state: Mutex::new(TimerState {
                next,
                period: ms,
                recurring,
                cb: Some(cb),
            }),
            heap: Arc::downgrade(&self.shared),
        });

        let at_front = lock(&self.shared.inner).insert(next, id, Arc::clone(&timer));
        ktrace!("timer {} armed for {} ms (recurring={})", id, ms, recurring);
        if at_front {
            (self.shared.on_front)();
        }
        timer
    }

    /// Arm a timer whose callback only runs while `cond` is alive
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline
    ///
    /// 0 if it already passed, `NO_TIMER` if nothing is armed. Re-enables
    /// the front hook.
    pub fn get_next_timer(&self) -> u64 {
        let mut inner = lock(&self.shared.inner);
        inner.tickled = false;
        match inner.timers.keys().next() {
            None => NO_TIMER,
            // Far-off deadlines must not read as NO_TIMER
            Some(&(next, _)) => next.saturating_sub(now_ms()).min(NO_TIMER - 1),
        }
    }

    /// Remove every timer due by now and return their callbacks in
    /// deadline order; recurring timers are re-armed.
    pub fn list_expired_cb(&self) -> Vec<TimerCallback> {
        self.list_expired_at(now_ms())
    }

    fn list_expired_at(&self, now: u64) -> Vec<TimerCallback> {
        let mut inner = lock(&self.shared.inner);
        if inner.timers.is_empty() {
            return Vec::new();
        }

        let later = inner.timers.split_off(&(now.saturating_add(1), 0));
        let expired = std::mem::replace(&mut inner.timers, later);

        let mut cbs = Vec::with_capacity(expired.len());
        for (_, timer) in expired {
            let mut st = lock(&timer.state);
            let Some(cb) = st.cb.clone() else {
                continue;
            };
            cbs.push(cb);
            if st.recurring {
                st.next = next_deadline(st.next, st.period, now);
                let key = (st.next, timer.id);
                drop(st);
                inner.timers.insert(key, timer);
            } else {
                st.cb = None;
            }
        }
        cbs
    }

    /// Anything armed
    pub fn has_timer(&self) -> bool {
        !lock(&self.shared.inner).timers.is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.inner).timers.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}
