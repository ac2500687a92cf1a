//! # strand - stackful fibers for Rust
//!
//! Cooperative fibers multiplexed onto a pool of OS threads, with an epoll
//! reactor that parks fibers on fd readiness and timers.
//!
//! ## Features
//!
//! - **Fibers**: 1 MiB mmap'd stacks with a guard page, hand-written context switch
//! - **M:N scheduling**: one shared run queue, optional per-thread affinity
//! - **Inject mode**: the constructing thread can work as one of the workers
//! - **Reactor**: level-triggered epoll, timers merged into the same wait
//! - **Blocking calls that park**: `hook::read`, `hook::accept`, `hook::sleep_ms`, ...
//!
//! ## Quick Start
//!
//! ```ignore
//! use strand::{IoConfig, IoManager, SchedulerConfig};
//!
//! fn main() {
//!     let iom = IoManager::new(SchedulerConfig::from_env(), IoConfig::from_env()).unwrap();
//!
//!     iom.schedule_fn(|| {
//!         println!("Hello from fiber {}", strand::current_fiber_id());
//!         strand::sleep_ms(10);
//!         strand::yield_now();
//!         println!("Back again!");
//!     });
//!
//!     // Runs this thread's share of the work, then joins the workers
//!     iom.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        schedule(), spawn(), yield_now(), hook::*            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Scheduler                              │
//! │        run queue, affinity, run loop per worker             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Caller   │
//!    │  Thread   │      │  Thread   │      │  Thread   │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │             Idle driver: epoll reactor                  │
//!    │     fd table, tickle pipe, timer heap                   │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use strand_core::{Event, FiberId, FiberState, SchedError, SchedResult};

// Re-export kprint macros for debug logging
pub use strand_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, set_sink, LogLevel, LogSink};
pub use strand_core::{fatal_assert, kdebug, kerror, kinfo, kprintln, ktrace, kwarn};

// Re-export env utilities
pub use strand_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use strand_runtime::hook;
pub use strand_runtime::{
    Fiber, IdleDriver, IoConfig, IoManager, Scheduler, SchedulerConfig, Task, Thread, Timer, TimerManager,
};

/// Schedule `f` on the scheduler the calling thread works for
///
/// Fails with `NotInitialized` outside a scheduler's threads.
pub fn spawn<F, R>(f: F) -> SchedResult<()>
where
    F: FnOnce() -> R + Send + 'static,
    R: strand_runtime::IntoFiberResult,
{
    let sched = Scheduler::current().ok_or(SchedError::NotInitialized)?;
    sched.schedule_fn(f);
    Ok(())
}

/// Yield execution to the scheduler
///
/// The current fiber goes back on the run queue. Outside a fiber this
/// yields the OS thread.
#[inline]
pub fn yield_now() {
    if Fiber::in_fiber() {
        Fiber::yield_to_ready();
    } else {
        std::thread::yield_now();
    }
}

/// Id of the running fiber
///
/// Returns `FiberId::NONE` outside a fiber.
#[inline]
pub fn current_fiber_id() -> FiberId {
    Fiber::current_id()
}

/// Check if currently executing on a fiber
#[inline]
pub fn is_in_fiber() -> bool {
    Fiber::in_fiber()
}

/// Sleep without blocking the worker when called from a reactor fiber
#[inline]
pub fn sleep_ms(ms: u64) {
    hook::sleep_ms(ms)
}
