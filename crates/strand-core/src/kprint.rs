//! Kernel-style print macros for strand
//!
//! Leveled, line-atomic diagnostics. Every line carries the level, the
//! milliseconds since the first log call, the OS thread id, the thread
//! name and the current fiber id (0 outside a fiber).
//!
//! # Environment Variables
//!
//! - `STRAND_FLUSH_EPRINT=1` - Flush stderr after each line (useful for debugging crashes)
//! - `STRAND_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//!
//! # Sinks
//!
//! Output goes to stderr unless a [`LogSink`] is installed with
//! [`set_sink`]. Logging never feeds back into runtime behavior.
//!
//! ```ignore
//! use strand_core::{kinfo, kdebug};
//!
//! kinfo!("scheduler {} started", name);
//! kdebug!("fiber {} -> {}", id, state);
//! ```

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{OnceLock, RwLock};
use std::time::Instant;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

/// Destination for formatted log lines
///
/// `line` is fully formatted and has no trailing newline.
pub trait LogSink: Send + Sync {
    fn write_line(&self, level: LogLevel, line: &str);
}

/// Default sink: stderr, one locked write per line
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&self, _level: LogLevel, line: &str) {
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let _ = handle.write_all(line.as_bytes());
        let _ = handle.write_all(b"\n");
        if flush_enabled() {
            let _ = handle.flush();
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static SINK: RwLock<Option<Box<dyn LogSink>>> = RwLock::new(None);
static START: OnceLock<Instant> = OnceLock::new();

thread_local! {
    static THREAD_ID: Cell<i32> = const { Cell::new(0) };
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
    static FIBER_ID: Cell<u64> = const { Cell::new(0) };
}

/// Initialize logging from environment variables
///
/// Called automatically on first log, but can be called explicitly for
/// deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    START.get_or_init(Instant::now);

    if let Ok(val) = std::env::var("STRAND_FLUSH_EPRINT") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("STRAND_LOG_LEVEL") {
        let level = LogLevel::parse(&val).unwrap_or(LogLevel::Info);
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    init();
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 <= log_level() as u8
}

/// Replace the process-wide sink
pub fn set_sink(sink: Box<dyn LogSink>) {
    if let Ok(mut slot) = SINK.write() {
        *slot = Some(sink);
    }
}

/// Go back to the stderr sink
pub fn reset_sink() {
    if let Ok(mut slot) = SINK.write() {
        *slot = None;
    }
}

/// Record the OS thread id and name used in line prefixes
pub fn set_thread_context(tid: i32, name: &str) {
    THREAD_ID.with(|t| t.set(tid));
    THREAD_NAME.with(|n| {
        let mut n = n.borrow_mut();
        n.clear();
        n.push_str(name);
    });
}

/// Record the fiber id used in line prefixes (0 = none)
#[inline]
pub fn set_fiber_id(id: u64) {
    FIBER_ID.with(|f| f.set(id));
}

fn elapsed_ms() -> u128 {
    START.get_or_init(Instant::now).elapsed().as_millis()
}

/// Build a complete line with the context prefix
pub fn format_line(level: LogLevel, args: std::fmt::Arguments<'_>) -> String {
    let tid = THREAD_ID.with(|t| t.get());
    let fid = FIBER_ID.with(|f| f.get());
    THREAD_NAME.with(|name| {
        format!(
            "{} {:>8} {} {} {} {}",
            level.prefix(),
            elapsed_ms(),
            tid,
            name.borrow(),
            fid,
            args
        )
    })
}

fn emit(level: LogLevel, line: &str) {
    match SINK.read() {
        Ok(slot) => match slot.as_ref() {
            Some(sink) => sink.write_line(level, line),
            None => StderrSink.write_line(level, line),
        },
        Err(_) => StderrSink.write_line(level, line),
    }
}

/// Internal: Write with newline and optionally flush
#[doc(hidden)]
pub fn _kprintln_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

/// Internal: Leveled print
#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let line = format_line(level, args);
    emit(level, &line);
}

// ============================================================================
// Public Macros
// ============================================================================

/// Print to stderr with newline, bypassing levels and sinks
#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::kprint::_kprintln_impl(format_args!(""));
    }};
    ($($arg:tt)*) => {{
        $crate::kprint::_kprintln_impl(format_args!($($arg)*));
    }};
}

/// Error level log (always shown unless logging is off)
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Capture(Arc<Mutex<Vec<String>>>);

    impl LogSink for Capture {
        fn write_line(&self, _level: LogLevel, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    #[test]
    fn test_log_levels() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn test_line_prefix_fields() {
        set_thread_context(4242, "prefix_worker");
        set_fiber_id(17);
        let line = format_line(LogLevel::Warn, format_args!("hello {}", 1));
        set_fiber_id(0);

        assert!(line.starts_with("[WARN]"));
        assert!(line.contains(" 4242 prefix_worker 17 hello 1"));
    }

    #[test]
    fn test_sink_receives_lines() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        set_sink(Box::new(Capture(Arc::clone(&lines))));
        emit(LogLevel::Error, "sink-marker-line");
        reset_sink();

        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|l| l == "sink-marker-line"));
    }
}
