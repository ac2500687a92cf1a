//! Scheduler and reactor configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder setters
//! 2. Environment variables (`from_env()` only)
//! 3. User file named by `STRAND_CONFIG_RS` at build time
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_runtime::config::{IoConfig, SchedulerConfig};
//!
//! let sched = SchedulerConfig::from_env().name("io").threads(4).use_caller(false);
//! let io = IoConfig::from_env().max_wait(Duration::from_millis(500));
//! ```

pub mod defaults;

use std::time::Duration;
use strand_core::constants::MIN_STACK_SIZE;
use strand_core::env::{env_get, env_get_bool, env_get_millis, env_get_size, env_get_str};

/// Scheduler configuration with builder pattern
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Prefix for worker thread names (`<name>_<index>`)
    pub name: String,
    /// Total workers; in inject mode one of them is the calling thread
    pub threads: usize,
    /// Inject the constructing thread as a worker
    pub use_caller: bool,
    /// Stack size for task, idle and root fibers
    pub stack_size: usize,
    /// Longest park of an idle worker (non-reactor schedulers)
    pub park_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedulerConfig {
    /// Compile-time defaults with environment overrides
    ///
    /// Environment variables (all optional):
    /// - `STRAND_NAME` - Scheduler name
    /// - `STRAND_THREADS` - Worker threads
    /// - `STRAND_USE_CALLER` - Inject the calling thread (0/1)
    /// - `STRAND_STACK_SIZE` - Fiber stack size, `K`/`M` suffixes accepted
    /// - `STRAND_PARK_TIMEOUT_MS` - Idle park timeout
    pub fn from_env() -> Self {
        Self {
            name: env_get_str("STRAND_NAME", "strand"),
            threads: env_get("STRAND_THREADS", defaults::THREADS),
            use_caller: env_get_bool("STRAND_USE_CALLER", defaults::USE_CALLER),
            stack_size: env_get_size("STRAND_STACK_SIZE", defaults::STACK_SIZE),
            park_timeout: env_get_millis(
                "STRAND_PARK_TIMEOUT_MS",
                Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            ),
        }
    }

    /// Compile-time defaults only
    pub fn new() -> Self {
        Self {
            name: "strand".to_string(),
            threads: defaults::THREADS,
            use_caller: defaults::USE_CALLER,
            stack_size: defaults::STACK_SIZE,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn use_caller(mut self, enable: bool) -> Self {
        self.use_caller = enable;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    /// Threads the scheduler spawns itself
    pub fn spawned_threads(&self) -> usize {
        if self.use_caller {
            self.threads.saturating_sub(1)
        } else {
            self.threads
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::InvalidValue("threads must be > 0"));
        }
        if self.threads > 1024 {
            return Err(ConfigError::InvalidValue("threads must be <= 1024"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.park_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("park_timeout must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("Scheduler Configuration:");
        eprintln!("  name:          {}", self.name);
        eprintln!("  threads:       {}", self.threads);
        eprintln!("  use_caller:    {}", self.use_caller);
        eprintln!("  stack_size:    {}", self.stack_size);
        eprintln!("  park_timeout:  {:?}", self.park_timeout);
    }
}

/// Reactor configuration
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Upper bound for one multiplexer wait, even with no timer armed
    pub max_wait: Duration,
    /// Readiness events fetched per `epoll_wait`
    pub epoll_batch: usize,
    /// Initial size of the fd context table
    pub fd_table_size: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl IoConfig {
    /// Environment variables (all optional):
    /// - `STRAND_MAX_WAIT_MS` - Cap on a single multiplexer wait
    /// - `STRAND_EPOLL_BATCH` - Events per wait
    /// - `STRAND_FD_TABLE_SIZE` - Initial fd table size
    pub fn from_env() -> Self {
        Self {
            max_wait: env_get_millis(
                "STRAND_MAX_WAIT_MS",
                Duration::from_millis(defaults::MAX_WAIT_MS),
            ),
            epoll_batch: env_get("STRAND_EPOLL_BATCH", defaults::EPOLL_BATCH),
            fd_table_size: env_get("STRAND_FD_TABLE_SIZE", defaults::FD_TABLE_SIZE),
        }
    }

    pub fn new() -> Self {
        Self {
            max_wait: Duration::from_millis(defaults::MAX_WAIT_MS),
            epoll_batch: defaults::EPOLL_BATCH,
            fd_table_size: defaults::FD_TABLE_SIZE,
        }
    }

    pub fn max_wait(mut self, d: Duration) -> Self {
        self.max_wait = d;
        self
    }

    pub fn epoll_batch(mut self, n: usize) -> Self {
        self.epoll_batch = n;
        self
    }

    pub fn fd_table_size(mut self, n: usize) -> Self {
        self.fd_table_size = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_wait.is_zero() {
            return Err(ConfigError::InvalidValue("max_wait must be > 0"));
        }
        if self.max_wait.as_millis() > i32::MAX as u128 {
            return Err(ConfigError::InvalidValue("max_wait does not fit epoll_wait"));
        }
        if self.epoll_batch == 0 {
            return Err(ConfigError::InvalidValue("epoll_batch must be > 0"));
        }
        if self.fd_table_size == 0 {
            return Err(ConfigError::InvalidValue("fd_table_size must be > 0"));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for strand_core::SchedError {
    fn from(e: ConfigError) -> Self {
        strand_core::SchedError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SchedulerConfig::new();
        assert_eq!(config.threads, defaults::THREADS);
        assert!(config.validate().is_ok());
        assert!(IoConfig::new().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::new()
            .name("pool")
            .threads(4)
            .use_caller(true)
            .stack_size(64 * 1024);

        assert_eq!(config.name, "pool");
        assert_eq!(config.spawned_threads(), 3);
        assert_eq!(config.clone().use_caller(false).spawned_threads(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(SchedulerConfig::new().threads(0).validate().is_err());
        assert!(SchedulerConfig::new().stack_size(1024).validate().is_err());
        assert!(IoConfig::new().epoll_batch(0).validate().is_err());
        assert!(IoConfig::new().max_wait(Duration::ZERO).validate().is_err());
    }
}
