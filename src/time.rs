use std::io;
use std::time::Duration;

/// The monotonic clock source a loop reads its cached iteration timestamp from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
  /// `CLOCK_MONOTONIC`: full resolution, the default.
  #[default]
  Monotonic,
  /// `CLOCK_MONOTONIC_COARSE`: cheaper, lower-resolution (~1-4ms granularity);
  /// an explicit opt-in for loops that call `update_time` very frequently and
  /// don't need sub-millisecond timer accuracy.
  MonotonicCoarse,
}

impl ClockSource {
  pub(crate) fn clockid(self) -> libc::clockid_t {
    match self {
      ClockSource::Monotonic => libc::CLOCK_MONOTONIC,
      ClockSource::MonotonicCoarse => libc::CLOCK_MONOTONIC_COARSE,
    }
  }
}

/// Reads the given clock, returning absolute nanoseconds.
pub(crate) fn clock_gettime_ns(clock_id: libc::clockid_t) -> io::Result<u64> {
  let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
  let res = unsafe { libc::clock_gettime(clock_id, &mut ts) };
  if res == -1 {
    return Err(io::Error::last_os_error());
  }
  Ok(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

/// Converts a [`Duration`] to nanoseconds, saturating instead of panicking on
/// overflow (the overflow guards in the timer heap rely on saturating
/// arithmetic rather than a panic at this boundary).
pub fn duration_to_ns(d: Duration) -> u64 {
  d.as_nanos().min(u64::MAX as u128) as u64
}

/// Rounds an absolute-deadline-minus-now nanosecond budget up to whole
/// milliseconds, per §4.1 step 6: `floor(ns/1e6) + (remainder > 0 ? 1 : 0)`.
pub(crate) fn ns_to_timeout_ms(ns: u64) -> i32 {
  const NS_PER_MS: u64 = 1_000_000;
  let whole = ns / NS_PER_MS;
  let rem = ns % NS_PER_MS;
  let ms = whole + u64::from(rem > 0);
  ms.min(i32::MAX as u64) as i32
}
