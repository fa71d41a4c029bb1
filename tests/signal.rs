//! POSIX signal watcher integration tests (§8 scenario 4, §4.4).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use evio::{EventLoop, LoopConfig, RunFlags};

#[test]
fn repeated_raise_coalesces_without_corrupting_state() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_cb = calls.clone();

  lp.signal_start(
    libc::SIGUSR1,
    Box::new(move |_lp, _id, _mask| {
      calls_cb.fetch_add(1, Ordering::SeqCst);
    }),
  );
  assert_eq!(lp.refcount(), 1);

  for _ in 0..10 {
    unsafe {
      libc::raise(libc::SIGUSR1);
    }
  }

  lp.run(RunFlags::ONCE);

  let n = calls.load(Ordering::SeqCst);
  assert!(n >= 1 && n <= 10);
  assert_eq!(lp.refcount(), 1);
}

#[test]
fn stopped_watcher_does_not_receive_a_signal_still_bound_by_a_sibling() {
  // Stopping one watcher on a signum must not affect delivery to a sibling
  // watcher still registered on the same signum, and the stopped watcher
  // itself must not be fed — without reverting the process-wide handler
  // (which would happen only once the *last* watcher on the signum stops,
  // and for SIGUSR1 would restore the default terminating disposition).
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let stopped_calls = Arc::new(AtomicUsize::new(0));
  let kept_calls = Arc::new(AtomicUsize::new(0));
  let stopped_cb = stopped_calls.clone();
  let kept_cb = kept_calls.clone();

  let stopped_id = lp.signal_start(
    libc::SIGUSR2,
    Box::new(move |_lp, _id, _mask| {
      stopped_cb.fetch_add(1, Ordering::SeqCst);
    }),
  );
  lp.signal_start(
    libc::SIGUSR2,
    Box::new(move |_lp, _id, _mask| {
      kept_cb.fetch_add(1, Ordering::SeqCst);
    }),
  );
  lp.signal_stop(stopped_id);

  unsafe {
    libc::raise(libc::SIGUSR2);
  }

  lp.run(RunFlags::ONCE);

  assert_eq!(stopped_calls.load(Ordering::SeqCst), 0);
  assert_eq!(kept_calls.load(Ordering::SeqCst), 1);
}
