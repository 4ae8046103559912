//! Interest and readiness operation sets.
//!
//! The bit values follow the usual selection-key convention so that
//! masks can be logged and compared with other selector implementations.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};

/// A set of selector operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ops(u8);

impl Ops {
    /// The empty set.
    pub const NONE: Ops = Ops(0);

    /// Data can be read without blocking.
    pub const READ: Ops = Ops(1 << 0);

    /// Data can be written without blocking.
    pub const WRITE: Ops = Ops(1 << 2);

    /// A pending connect can be finished.
    pub const CONNECT: Ops = Ops(1 << 3);

    /// A pending connection can be accepted.
    pub const ACCEPT: Ops = Ops(1 << 4);

    const ALL: u8 = Self::READ.0 | Self::WRITE.0 | Self::CONNECT.0 | Self::ACCEPT.0;

    /// Returns the raw bits.
    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Builds a set from raw bits, dropping unknown bits.
    #[inline]
    pub const fn from_bits_truncate(bits: u8) -> Ops {
        Ops(bits & Self::ALL)
    }

    /// Returns true if no operation is set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every operation in `other` is also in `self`.
    #[inline]
    pub const fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if every operation in `self` is also in `other`.
    #[inline]
    pub const fn is_subset_of(self, other: Ops) -> bool {
        other.contains(self)
    }

    /// Set union.
    #[inline]
    pub const fn union(self, other: Ops) -> Ops {
        Ops(self.0 | other.0)
    }

    /// Set intersection.
    #[inline]
    pub const fn intersection(self, other: Ops) -> Ops {
        Ops(self.0 & other.0)
    }
}

impl BitOr for Ops {
    type Output = Ops;

    fn bitor(self, rhs: Ops) -> Ops {
        self.union(rhs)
    }
}

impl BitOrAssign for Ops {
    fn bitor_assign(&mut self, rhs: Ops) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ops {
    type Output = Ops;

    fn bitand(self, rhs: Ops) -> Ops {
        self.intersection(rhs)
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names = [
            (Ops::READ, "READ"),
            (Ops::WRITE, "WRITE"),
            (Ops::CONNECT, "CONNECT"),
            (Ops::ACCEPT, "ACCEPT"),
        ];
        let mut first = true;
        for (op, name) in names {
            if self.contains(op) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}
