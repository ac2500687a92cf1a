//! Contract-violation assertions
//!
//! `fatal_assert!` is for states that correct callers can never produce:
//! resuming a running fiber, resetting a live one, stopping an inject-mode
//! scheduler from a foreign thread. It logs the condition with a forced
//! backtrace and then panics.

use std::backtrace::Backtrace;

#[doc(hidden)]
#[cold]
#[inline(never)]
pub fn _fatal_impl(cond: &str, args: std::fmt::Arguments<'_>) -> ! {
    let msg = args.to_string();
    crate::kerror!(
        "ASSERTION: {}\n{}\nbacktrace:\n{}",
        cond,
        msg,
        Backtrace::force_capture()
    );
    panic!("assertion failed: {}: {}", cond, msg);
}

/// Abort the current thread's work on a broken invariant
///
/// ```ignore
/// fatal_assert!(state != FiberState::Exec, "double resume of fiber {}", id);
/// ```
#[macro_export]
macro_rules! fatal_assert {
    ($cond:expr $(,)?) => {{
        if !$cond {
            $crate::assert::_fatal_impl(stringify!($cond), format_args!(""));
        }
    }};
    ($cond:expr, $($arg:tt)+) => {{
        if !$cond {
            $crate::assert::_fatal_impl(stringify!($cond), format_args!($($arg)+));
        }
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_holds_is_silent() {
        let x = 3;
        crate::fatal_assert!(x == 3);
        crate::fatal_assert!(x > 0, "x was {}", x);
    }

    #[test]
    #[should_panic(expected = "assertion failed: 1 + 1 == 3: arith 2")]
    fn test_violation_panics() {
        crate::fatal_assert!(1 + 1 == 3, "arith {}", 2);
    }
}
