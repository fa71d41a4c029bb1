use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// An event mask: a bitset of the stable wire values watchers are notified with.
///
/// Multiple bits may be delivered to a single callback invocation, e.g.
/// `Mask::READ | Mask::WRITE | Mask::ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mask(u32);

impl Mask {
  pub const NONE: Mask = Mask(0);
  pub const READ: Mask = Mask(0x01);
  pub const WRITE: Mask = Mask(0x02);
  pub const POLL: Mask = Mask(0x04);
  pub const TIMER: Mask = Mask(0x08);
  pub const SIGNAL: Mask = Mask(0x20);
  pub const ASYNC: Mask = Mask(0x40);
  pub const IDLE: Mask = Mask(0x80);
  pub const PREPARE: Mask = Mask(0x100);
  pub const CHECK: Mask = Mask(0x200);
  pub const CLEANUP: Mask = Mask(0x400);
  pub const ONCE: Mask = Mask(0x800);
  pub const WALK: Mask = Mask(0x4000);
  pub const ERROR: Mask = Mask(0x8000);

  /// Internal: edge-triggered request bit, carried alongside READ/WRITE on a
  /// poll watcher's desired mask. Never delivered to a callback.
  pub(crate) const POLLET: Mask = Mask(0x1_0000);

  pub const fn empty() -> Mask {
    Mask(0)
  }

  pub const fn bits(self) -> u32 {
    self.0
  }

  pub const fn from_bits_truncate(bits: u32) -> Mask {
    Mask(bits)
  }

  pub const fn contains(self, other: Mask) -> bool {
    self.0 & other.0 == other.0
  }

  pub const fn intersects(self, other: Mask) -> bool {
    self.0 & other.0 != 0
  }

  pub const fn is_empty(self) -> bool {
    self.0 == 0
  }

  pub const fn intersection(self, other: Mask) -> Mask {
    Mask(self.0 & other.0)
  }

  pub(crate) const fn without(self, other: Mask) -> Mask {
    Mask(self.0 & !other.0)
  }
}

impl BitOr for Mask {
  type Output = Mask;
  fn bitor(self, rhs: Mask) -> Mask {
    Mask(self.0 | rhs.0)
  }
}

impl BitOrAssign for Mask {
  fn bitor_assign(&mut self, rhs: Mask) {
    self.0 |= rhs.0;
  }
}

impl fmt::Display for Mask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:#06x}", self.0)
  }
}
