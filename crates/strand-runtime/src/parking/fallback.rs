//! Condvar parking, selected by the `condvar-parking` feature

use super::IdleParking;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

pub struct FallbackParking {
    /// true = wake pending
    pending: Mutex<bool>,
    condvar: Condvar,
    parked: AtomicUsize,
}

impl FallbackParking {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for FallbackParking {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleParking for FallbackParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.lock();

        if !*guard {
            guard = match timeout {
                Some(t) => {
                    self.condvar
                        .wait_timeout(guard, t)
                        .unwrap_or_else(|p| p.into_inner())
                        .0
                }
                None => self.condvar.wait(guard).unwrap_or_else(|p| p.into_inner()),
            };
        }

        let woken = std::mem::replace(&mut *guard, false);
        self.parked.fetch_sub(1, Ordering::SeqCst);
        woken
    }

    fn wake_one(&self) {
        if self.parked.load(Ordering::Acquire) == 0 {
            return;
        }
        *self.lock() = true;
        self.condvar.notify_one();
    }

    fn wake_all(&self) {
        if self.parked.load(Ordering::Acquire) == 0 {
            return;
        }
        *self.lock() = true;
        self.condvar.notify_all();
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
