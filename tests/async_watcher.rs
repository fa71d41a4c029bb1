//! Cross-thread async watcher integration test (§8 scenario 3, §4.4).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use evio::{EventLoop, LoopConfig, Mask, RunFlags};

#[test]
fn cross_thread_send_delivers_exactly_once() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();

  let calls = Arc::new(AtomicUsize::new(0));
  let seen_mask = Arc::new(std::sync::Mutex::new(Mask::NONE));
  let calls_cb = calls.clone();
  let seen_cb = seen_mask.clone();

  let (_id, sender) = lp.async_start(Box::new(move |_lp, _id, mask| {
    calls_cb.fetch_add(1, Ordering::SeqCst);
    *seen_cb.lock().unwrap() = mask;
  }));

  let handle = std::thread::spawn(move || {
    sender.send();
  });
  handle.join().unwrap();

  lp.run(RunFlags::ONCE);

  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(*seen_mask.lock().unwrap(), Mask::ASYNC);
}

#[test]
fn send_before_first_run_is_queued() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_cb = calls.clone();

  let (_id, sender) = lp.async_start(Box::new(move |_lp, _id, _mask| {
    calls_cb.fetch_add(1, Ordering::SeqCst);
  }));

  assert!(!sender.is_pending());
  sender.send();
  assert!(sender.is_pending());

  lp.run(RunFlags::ONCE);

  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_discards_pending_send() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_cb = calls.clone();

  let (id, sender) = lp.async_start(Box::new(move |_lp, _id, _mask| {
    calls_cb.fetch_add(1, Ordering::SeqCst);
  }));

  sender.send();
  lp.async_stop(id);
  lp.run(RunFlags::ONCE);

  assert_eq!(calls.load(Ordering::SeqCst), 0);
}
