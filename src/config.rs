//! Loop construction tunables (§10.3): a plain builder replacing the
//! original's `loop_new(flags)` bitset.

use crate::time::ClockSource;

/// Default initial capacity of the epoll event buffer (`EVIO_DEF_EVENTS` in
/// the original), grown geometrically up to [`MAX_EVENTS`].
pub const DEFAULT_EVENTS: usize = 64;

/// Ceiling the event buffer is allowed to grow to (`EVIO_MAX_EVENTS`).
pub const MAX_EVENTS: usize = 4096;

/// Construction-time configuration for an [`EventLoop`](crate::EventLoop).
#[derive(Debug, Clone)]
pub struct LoopConfig {
  pub(crate) uring: bool,
  pub(crate) initial_events: usize,
  pub(crate) clock: ClockSource,
}

impl Default for LoopConfig {
  fn default() -> Self {
    LoopConfig { uring: false, initial_events: DEFAULT_EVENTS, clock: ClockSource::default() }
  }
}

impl LoopConfig {
  pub fn new() -> Self {
    Self::default()
  }

  /// Enables the batched-ctl io_uring backend for descriptor-control
  /// operations (§4.2). Falls back silently to the synchronous `epoll_ctl`
  /// path if the running kernel lacks `IORING_OP_EPOLL_CTL`.
  pub fn uring(mut self, enabled: bool) -> Self {
    self.uring = enabled;
    self
  }

  /// Sets the initial epoll event buffer capacity. Clamped to
  /// `[1, MAX_EVENTS]`.
  pub fn initial_events(mut self, n: usize) -> Self {
    self.initial_events = n.clamp(1, MAX_EVENTS);
    self
  }

  pub fn clock_source(mut self, clock: ClockSource) -> Self {
    self.clock = clock;
    self
  }
}
