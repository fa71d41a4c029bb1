//! Idle / prepare / check / cleanup watcher list integration tests (§4.1, §4.5).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use evio::{EventLoop, LoopConfig, RunFlags};

#[test]
fn idle_watcher_fires_every_iteration_while_active() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_cb = calls.clone();

  let id = lp.idle_start(Box::new(move |_lp, _id, _mask| {
    calls_cb.fetch_add(1, Ordering::SeqCst);
  }));
  assert_eq!(lp.refcount(), 1);

  lp.run(RunFlags::NOWAIT);
  assert_eq!(calls.load(Ordering::SeqCst), 1);

  lp.run(RunFlags::NOWAIT);
  assert_eq!(calls.load(Ordering::SeqCst), 2);

  lp.idle_stop(id);
  lp.run(RunFlags::NOWAIT);
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn prepare_and_check_bracket_each_iteration() {
  // Invocation order within one iteration is prepare, then poll/timer
  // processing, then check. An idle watcher keeps the loop from blocking and
  // gives prepare/check something to bracket on every pass.
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let order = Arc::new(std::sync::Mutex::new(Vec::new()));
  let prepare_order = order.clone();
  let check_order = order.clone();

  lp.prepare_start(Box::new(move |_lp, _id, _mask| {
    prepare_order.lock().unwrap().push("prepare");
  }));
  lp.check_start(Box::new(move |_lp, _id, _mask| {
    check_order.lock().unwrap().push("check");
  }));
  lp.idle_start(Box::new(|_lp, _id, _mask| {}));

  lp.run(RunFlags::NOWAIT);

  let seen = order.lock().unwrap().clone();
  assert_eq!(seen, vec!["prepare", "check"]);
}

#[test]
fn cleanup_watcher_fires_on_drop() {
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_cb = calls.clone();
  {
    let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
    lp.cleanup_start(Box::new(move |_lp, _id, _mask| {
      calls_cb.fetch_add(1, Ordering::SeqCst);
    }));
    lp.run(RunFlags::NOWAIT);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn stopped_prepare_watcher_does_not_fire() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_cb = calls.clone();

  let id = lp.prepare_start(Box::new(move |_lp, _id, _mask| {
    calls_cb.fetch_add(1, Ordering::SeqCst);
  }));
  lp.prepare_stop(id);
  lp.run(RunFlags::NOWAIT);

  assert_eq!(calls.load(Ordering::SeqCst), 0);
  assert_eq!(lp.refcount(), 0);
}
