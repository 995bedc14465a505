//! Feature flags requested by a caller and granted by a negotiation.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};

/// A set of security features.
///
/// `SEAL` implies `SIGN`: a sealed channel always carries an integrity check,
/// so [`Features::normalized`] adds `SIGN` whenever `SEAL` is present.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Features(u32);

impl Features {
    /// No features.
    pub const NONE: Self = Self(0);
    /// Integrity protection of wrapped messages.
    pub const SIGN: Self = Self(1 << 0);
    /// Confidentiality and integrity protection of wrapped messages.
    pub const SEAL: Self = Self(1 << 1);
    /// The caller intends to use the session key directly.
    pub const SESSION_KEY: Self = Self(1 << 2);

    const ALL: u32 = Self::SIGN.0 | Self::SEAL.0 | Self::SESSION_KEY.0;

    /// Raw bit representation, as carried on the wire.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, silently dropping unknown ones.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every flag in `other` is present.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Apply the implication rules (`SEAL` ⇒ `SIGN`).
    pub const fn normalized(self) -> Self {
        if self.0 & Self::SEAL.0 != 0 {
            Self(self.0 | Self::SIGN.0)
        } else {
            self
        }
    }

    /// The features both peers asked for.
    pub const fn negotiate(local: Self, remote: Self) -> Self {
        local
            .normalized()
            .intersection(remote.normalized())
            .normalized()
    }
}

impl BitOr for Features {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for Features {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl BitAnd for Features {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

impl fmt::Debug for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Features, &str); 3] = [
            (Features::SIGN, "SIGN"),
            (Features::SEAL, "SEAL"),
            (Features::SESSION_KEY, "SESSION_KEY"),
        ];
        if self.is_empty() {
            return f.write_str("Features(NONE)");
        }
        f.write_str("Features(")?;
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        f.write_str(")")
    }
}
