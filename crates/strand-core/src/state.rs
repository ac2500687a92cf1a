//! Fiber lifecycle state

use core::fmt;

/// State of a fiber
///
/// ```text
/// Init --resume--> Exec --yield_to_ready--> Ready --resume--> Exec
///                   |  \--yield_to_hold---> Hold  --resume--> Exec
///                   |--entry returns------> Term
///                   \--entry fails/panics-> Except
/// Term | Except | Init --reset--> Init
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created or reset, never resumed
    Init = 0,

    /// Parked, waiting for someone to re-enqueue it
    Hold = 1,

    /// Currently executing on some thread
    Exec = 2,

    /// Entry closure returned normally
    Term = 3,

    /// Yielded and wants to run again immediately
    Ready = 4,

    /// Entry closure failed or panicked
    Except = 5,
}

impl FiberState {
    /// Entry closure has finished, one way or another
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// `reset` is only legal from these states
    #[inline]
    pub const fn is_resettable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }

    /// A fiber in this state may be switched into
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Hold | FiberState::Ready)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Term,
            4 => FiberState::Ready,
            _ => FiberState::Except,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Init => "INIT",
            FiberState::Hold => "HOLD",
            FiberState::Exec => "EXEC",
            FiberState::Term => "TERM",
            FiberState::Ready => "READY",
            FiberState::Except => "EXCEPT",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Term.is_terminal());
        assert!(FiberState::Except.is_terminal());
        assert!(!FiberState::Hold.is_terminal());

        assert!(FiberState::Init.is_resettable());
        assert!(!FiberState::Exec.is_resettable());
        assert!(!FiberState::Hold.is_resettable());

        assert!(FiberState::Ready.is_resumable());
        assert!(!FiberState::Exec.is_resumable());
        assert!(!FiberState::Term.is_resumable());
    }

    #[test]
    fn test_u8_roundtrip() {
        for s in [
            FiberState::Init,
            FiberState::Hold,
            FiberState::Exec,
            FiberState::Term,
            FiberState::Ready,
            FiberState::Except,
        ] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
    }
}
