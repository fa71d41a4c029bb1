//! Break-state propagation and nested `run` calls (§8 scenario 5, §4.2).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use evio::{BreakState, EventLoop, LoopConfig, RunFlags};

#[test]
fn break_all_from_a_nested_run_unwinds_both_loops() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let nested_ran = Arc::new(AtomicUsize::new(0));
  let nested_ran_cb = nested_ran.clone();

  // The prepare watcher spawns a nested `run(DEFAULT)`; inside that nested
  // loop an idle watcher calls `break(ALL)`, which must unwind both the
  // nested and the outer run.
  lp.prepare_start(Box::new(move |lp, _id, _mask| {
    if nested_ran_cb.fetch_add(1, Ordering::SeqCst) == 0 {
      lp.idle_start(Box::new(|lp, _id, _mask| {
        lp.break_loop(BreakState::All);
      }));
      let nested_result = lp.run(RunFlags::DEFAULT);
      assert_eq!(nested_result, 0);
    }
  }));

  let outer_result = lp.run(RunFlags::DEFAULT);

  assert_eq!(outer_result, 0);
  assert_eq!(nested_ran.load(Ordering::SeqCst), 1);
}

#[test]
fn break_one_only_unwinds_the_innermost_run() {
  let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
  let outer_idle_calls = Arc::new(AtomicUsize::new(0));
  let outer_idle_cb = outer_idle_calls.clone();

  lp.idle_start(Box::new(move |_lp, _id, _mask| {
    outer_idle_cb.fetch_add(1, Ordering::SeqCst);
  }));

  lp.prepare_start(Box::new(|lp, _id, _mask| {
    lp.idle_start(Box::new(|lp, _id, _mask| {
      lp.break_loop(BreakState::One);
    }));
    lp.run(RunFlags::ONCE);
  }));

  lp.run(RunFlags::ONCE);

  // The outer run's own idle watcher still got to fire: BreakState::One only
  // stopped the nested run it was raised in.
  assert!(outer_idle_calls.load(Ordering::SeqCst) >= 1);
}
