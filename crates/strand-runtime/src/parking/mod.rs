//! Idle-worker parking
//!
//! Used by schedulers without a reactor: an idle worker parks here with a
//! timeout and `tickle` wakes it when work is enqueued. Reactor-backed
//! schedulers block in `epoll_wait` instead.

use std::time::Duration;

/// Sleep/wake primitive for idle workers
pub trait IdleParking: Send + Sync {
    /// Park the calling thread until woken or `timeout` passes
    ///
    /// Returns true if woken by `wake_one`/`wake_all`. Callers re-check
    /// for work either way.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Wake one parked worker; lost if nobody is parked
    fn wake_one(&self);

    /// Wake every parked worker (shutdown)
    fn wake_all(&self);

    /// Parked workers right now (hint)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(not(feature = "condvar-parking"))] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::FallbackParking as PlatformParking;
    }
}

/// Platform-appropriate parking
pub fn new_parking() -> Box<dyn IdleParking> {
    Box::new(PlatformParking::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_times_out() {
        let parking = new_parking();
        let start = Instant::now();
        let woken = parking.park(Some(Duration::from_millis(50)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(parking.parked_count(), 0);
    }

    #[test]
    fn test_wake_all_releases_parked() {
        let parking = Arc::new(PlatformParking::new());
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let p = Arc::clone(&parking);
                thread::spawn(move || {
                    let start = Instant::now();
                    p.park(Some(Duration::from_secs(10)));
                    start.elapsed()
                })
            })
            .collect();

        while parking.parked_count() < 2 {
            thread::sleep(Duration::from_millis(5));
        }
        // Let both reach FUTEX_WAIT
        thread::sleep(Duration::from_millis(50));
        parking.wake_all();

        for h in handles {
            assert!(h.join().unwrap() < Duration::from_secs(5));
        }
    }
}
