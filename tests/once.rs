//! Composed poll+timer `once` watcher integration tests (§3, §4.1 "once").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use evio::{EventLoop, LoopConfig, Mask, RunFlags};

fn pipe() -> (i32, i32) {
  let mut fds = [0i32; 2];
  let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
  assert_eq!(rc, 0);
  (fds[0], fds[1])
}

#[test]
fn timer_component_fires_and_stops_poll_component() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let (r, w) = pipe();
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_cb = calls.clone();

  lp.once_start(
    Some((r, Mask::READ)),
    Some(1_000_000), // 1ms, far shorter than the test's patience for writing to `w`
    Box::new(move |_lp, _id, mask| {
      calls_cb.fetch_add(1, Ordering::SeqCst);
      assert_eq!(mask, Mask::TIMER);
    }),
  );
  assert_eq!(lp.refcount(), 1);

  std::thread::sleep(std::time::Duration::from_millis(5));
  lp.run(RunFlags::ONCE);

  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(lp.refcount(), 0);

  unsafe {
    libc::close(r);
    libc::close(w);
  }
}

#[test]
fn poll_component_fires_and_stops_timer_component() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let (r, w) = pipe();
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_cb = calls.clone();

  lp.once_start(
    Some((r, Mask::READ)),
    Some(60_000_000_000), // 60s: long enough it never fires in this test
    Box::new(move |_lp, _id, mask| {
      calls_cb.fetch_add(1, Ordering::SeqCst);
      assert!(mask.contains(Mask::READ));
    }),
  );

  unsafe {
    libc::write(w, b"x".as_ptr() as *const _, 1);
  }
  lp.run(RunFlags::NOWAIT);

  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(lp.refcount(), 0);

  unsafe {
    libc::close(r);
    libc::close(w);
  }
}

#[test]
fn stop_before_either_component_fires_invokes_neither() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let (r, w) = pipe();
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_cb = calls.clone();

  let id = lp
    .once_start(
      Some((r, Mask::READ)),
      Some(60_000_000_000),
      Box::new(move |_lp, _id, _mask| {
        calls_cb.fetch_add(1, Ordering::SeqCst);
      }),
    )
    .unwrap();

  lp.once_stop(id);
  lp.run(RunFlags::NOWAIT);

  assert_eq!(calls.load(Ordering::SeqCst), 0);
  assert_eq!(lp.refcount(), 0);

  unsafe {
    libc::close(r);
    libc::close(w);
  }
}
