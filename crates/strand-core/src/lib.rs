//! # strand-core
//!
//! Core types for the strand fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Context switching, stacks, the scheduler and the epoll reactor live in
//! `strand-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber lifecycle state
//! - `event` - Read/write interest bitmask used by the reactor
//! - `error` - Error types
//! - `spinlock` - Short critical section lock
//! - `kprint` - Leveled logging macros with a pluggable sink
//! - `env` - Environment variable utilities
//! - `assert` - Contract-violation assertions

pub mod id;
pub mod state;
pub mod event;
pub mod error;
pub mod spinlock;
pub mod kprint;
pub mod env;
pub mod assert;

// Re-exports for convenience
pub use id::FiberId;
pub use state::FiberState;
pub use event::Event;
pub use error::{SchedError, SchedResult};
pub use spinlock::SpinLock;
pub use env::{env_get, env_get_bool, env_get_millis, env_get_opt, env_get_size, env_get_str, env_is_set};

/// Constants shared by the runtime
pub mod constants {
    /// Default fiber stack size (1 MiB)
    pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

    /// Smallest stack a fiber may be created with
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Guard page size (4 KB)
    pub const GUARD_SIZE: usize = 4096;

    /// Affinity value meaning "any thread"
    pub const ANY_THREAD: i32 = -1;

    /// Multiplexer wait used when no timer is armed
    pub const NO_TIMER: u64 = u64::MAX;
}
