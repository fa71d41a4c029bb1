//! Timer heap integration tests (§8 scenario 2, §4.3).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use evio::{EventLoop, LoopConfig, Mask, RunFlags};

#[test]
fn repeat_timer_fires_and_reschedules() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_cb = calls.clone();

  let one_ms = 1_000_000u64;
  let id = lp
    .timer_start(
      0,
      one_ms,
      Box::new(move |_lp, _id, mask| {
        assert_eq!(mask, Mask::TIMER);
        calls_cb.fetch_add(1, Ordering::SeqCst);
      }),
    )
    .expect("timer_start should not overflow");

  lp.run(RunFlags::ONCE);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  let remaining = lp.timer_remaining(id);
  assert!(remaining > 0 && remaining <= one_ms);

  std::thread::sleep(std::time::Duration::from_millis(2));
  lp.run(RunFlags::ONCE);
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
#[ignore]
fn slow_callback_does_not_starve_repeat_timer() {
  // Forward-progress clamp: a callback that overruns its own repeat must
  // not cause an immediate re-fire loop (§4.3 "Timer heap quirk").
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_cb = calls.clone();

  lp.timer_start(
    0,
    1_000_000,
    Box::new(move |_lp, _id, _mask| {
      calls_cb.fetch_add(1, Ordering::SeqCst);
      std::thread::sleep(std::time::Duration::from_millis(5));
    }),
  );

  let start = std::time::Instant::now();
  while start.elapsed() < std::time::Duration::from_millis(50) {
    lp.run(RunFlags::ONCE);
  }

  // Bounded by wall time / min repeat, not by how fast the loop can spin.
  assert!(calls.load(Ordering::SeqCst) < 40);
}

#[test]
fn timer_start_max_is_a_noop() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let before = lp.refcount();
  let id = lp.timer_start(u64::MAX, 0, Box::new(|_lp, _id, _mask| {}));
  assert!(id.is_none());
  assert_eq!(lp.refcount(), before);
}

#[test]
fn one_shot_timer_stops_after_firing() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_cb = calls.clone();

  lp.timer_start(0, 0, Box::new(move |_lp, _id, _mask| {
    calls_cb.fetch_add(1, Ordering::SeqCst);
  }));
  assert_eq!(lp.refcount(), 1);

  lp.run(RunFlags::ONCE);

  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(lp.refcount(), 0);
}
