//! Readiness interest bitmask
//!
//! Values mirror the epoll bits so a mask can be handed to `epoll_ctl`
//! without translation: `READ` is `EPOLLIN`, `WRITE` is `EPOLLOUT`.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Set of I/O directions a descriptor is registered for
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0x0);
    pub const READ: Event = Event(0x1);
    pub const WRITE: Event = Event(0x4);

    /// Both directions
    pub const ALL: Event = Event(0x1 | 0x4);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Keep only the READ/WRITE bits of a raw mask
    #[inline]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Event(bits & Self::ALL.0)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Event) -> bool {
        other.0 != 0 && (self.0 & other.0) == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Event) -> bool {
        (self.0 & other.0) != 0
    }

    #[inline]
    pub fn insert(&mut self, other: Event) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Event) {
        self.0 &= !other.0;
    }

    /// A single direction, as opposed to NONE or ALL
    #[inline]
    pub const fn is_single(self) -> bool {
        self.0 == Self::READ.0 || self.0 == Self::WRITE.0
    }
}

impl BitOr for Event {
    type Output = Event;

    #[inline]
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    #[inline]
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;

    #[inline]
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Not for Event {
    type Output = Event;

    #[inline]
    fn not(self) -> Event {
        Event(!self.0 & Self::ALL.0)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event({})", self)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Event::READ), self.contains(Event::WRITE)) {
            (false, false) => f.write_str("NONE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (true, true) => f.write_str("READ|WRITE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let mut ev = Event::NONE;
        assert!(ev.is_empty());

        ev.insert(Event::READ);
        assert!(ev.contains(Event::READ));
        assert!(!ev.contains(Event::WRITE));

        ev |= Event::WRITE;
        assert_eq!(ev, Event::ALL);

        ev.remove(Event::READ);
        assert_eq!(ev, Event::WRITE);
        assert!(ev.is_single());
    }

    #[test]
    fn test_not_stays_in_range() {
        assert_eq!(!Event::READ, Event::WRITE);
        assert_eq!(!Event::ALL, Event::NONE);
        assert_eq!(Event::from_bits_truncate(0xffff_ffff), Event::ALL);
    }

    #[test]
    fn test_contains_none_is_false() {
        assert!(!Event::ALL.contains(Event::NONE));
        assert_eq!(format!("{}", Event::ALL), "READ|WRITE");
    }
}
