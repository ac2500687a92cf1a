//! # strand-runtime
//!
//! Linux runtime for the strand fiber scheduler.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Fiber stacks (mmap with a guard page)
//! - Fibers and the per-thread worker context
//! - The M:N scheduler and worker parking
//! - The timer heap
//! - The epoll reactor (`IoManager`) and fiber-aware blocking calls (`hook`)

pub mod arch;
pub mod config;
pub mod fiber;
pub mod hook;
pub mod iomanager;
pub mod parking;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;
pub mod tls;

// Re-exports
pub use config::{ConfigError, IoConfig, SchedulerConfig};
pub use fiber::{Fiber, FiberEntry, IntoFiberResult};
pub use iomanager::{IoManager, Reactor};
pub use parking::{new_parking, IdleParking};
pub use scheduler::{IdleDriver, ParkingDriver, Scheduler, Task};
pub use thread::Thread;
pub use timer::{Timer, TimerCallback, TimerManager};

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("strand-runtime needs epoll and is Linux only");
    }
}

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
