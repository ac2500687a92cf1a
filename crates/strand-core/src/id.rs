//! Fiber identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide fiber identifier
///
/// Ids are handed out from a monotonic counter. Zero is reserved for
/// "no current fiber" and is also the id of every thread's main fiber.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Sentinel for "not running inside a fiber"
    pub const NONE: FiberId = FiberId(0);

    /// Allocate the next id from the process-wide counter
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        FiberId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_is_monotonic() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert!(b > a);
        assert!(a.is_some());
    }

    #[test]
    fn test_none_is_zero() {
        assert!(FiberId::NONE.is_none());
        assert_eq!(FiberId::default().as_u64(), 0);
        assert_eq!(format!("{:?}", FiberId::NONE), "FiberId(NONE)");
        assert_eq!(format!("{}", FiberId::new(7)), "7");
    }
}
