//! Linux futex parking
//!
//! Futex word: 0 = nothing pending, 1 = wake pending. A parker that finds
//! a pending wake consumes it without sleeping.

use super::IdleParking;
use nix::errno::Errno;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub struct FutexParking {
    futex: AtomicU32,
    parked: AtomicUsize,
}

impl FutexParking {
    pub fn new() -> Self {
        Self {
            futex: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    fn wake(&self, count: i32) {
        if self.parked.load(Ordering::Acquire) == 0 {
            return;
        }
        self.futex.store(1, Ordering::Release);
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexParking {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleParking for FutexParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);

        if self
            .futex
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.parked.fetch_sub(1, Ordering::SeqCst);
            return true;
        }

        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);

        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                ts_ptr,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        let errno = Errno::last();

        self.parked.fetch_sub(1, Ordering::SeqCst);
        // Consume the wake we were handed, if any
        let _ = self
            .futex
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire);

        if ret == 0 {
            return true;
        }
        // EAGAIN: the word was already 1 when we tried to sleep
        errno == Errno::EAGAIN
    }

    fn wake_one(&self) {
        self.wake(1);
    }

    fn wake_all(&self) {
        self.wake(i32::MAX);
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
