//! Readiness signals observed on a channel endpoint.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Bitset of readiness conditions on an endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Signals(u32);

impl Signals {
    /// No condition holds.
    pub const NONE: Signals = Signals(0);
    /// At least one frame is queued towards the endpoint.
    pub const READABLE: Signals = Signals(1 << 0);
    /// The peer can accept another frame.
    pub const WRITABLE: Signals = Signals(1 << 1);
    /// The opposite endpoint has been closed.
    pub const PEER_CLOSED: Signals = Signals(1 << 2);

    /// Returns the raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every bit of `other` is set.
    pub const fn contains(self, other: Signals) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any bit of `other` is set.
    pub const fn intersects(self, other: Signals) -> bool {
        self.0 & other.0 != 0
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: Signals) {
        self.0 &= !other.0;
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: Signals) {
        self.0 |= other.0;
    }
}

impl BitOr for Signals {
    type Output = Signals;

    fn bitor(self, rhs: Signals) -> Signals {
        Signals(self.0 | rhs.0)
    }
}

impl BitOrAssign for Signals {
    fn bitor_assign(&mut self, rhs: Signals) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Signals {
    type Output = Signals;

    fn bitand(self, rhs: Signals) -> Signals {
        Signals(self.0 & rhs.0)
    }
}

impl fmt::Debug for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Signals::READABLE) {
            names.push("READABLE");
        }
        if self.contains(Signals::WRITABLE) {
            names.push("WRITABLE");
        }
        if self.contains(Signals::PEER_CLOSED) {
            names.push("PEER_CLOSED");
        }
        if names.is_empty() {
            write!(f, "Signals(NONE)")
        } else {
            write!(f, "Signals({})", names.join(" | "))
        }
    }
}
