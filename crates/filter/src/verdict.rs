use std::ops::{BitOr, BitOrAssign};

/// Bitmask verdict returned by a filter service.
///
/// Verdicts from concurrent services combine with OR, so any single service
/// can drop a message or suppress its user-facing notification without
/// coordinating with the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verdict(u32);

impl Verdict {
    /// Let the message through unchanged.
    pub const ALLOW: Self = Self(0);
    /// Discard the message instead of delivering it.
    pub const DROP: Self = Self(1);
    /// Deliver, but without notifying the user.
    pub const SKIP_NOTIFY: Self = Self(1 << 1);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn should_drop(self) -> bool {
        self.0 & Self::DROP.0 != 0
    }

    #[must_use]
    pub const fn should_skip_notify(self) -> bool {
        self.0 & Self::SKIP_NOTIFY.0 != 0
    }
}

impl BitOr for Verdict {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Verdict {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}
