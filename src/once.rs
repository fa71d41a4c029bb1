//! `once`: a composed poll + timer watcher that fires exactly one of its two
//! children, stopping both atomically (§3, §4.1 "once").

use std::os::fd::RawFd;

use crate::event_loop::EventLoop;
use crate::fds;
use crate::mask::Mask;
use crate::timer;
use crate::watcher::{Callback, KindState, WatcherId};

/// Starts a once-watcher. At least one of `fd` (with `emask`) or
/// `timeout_ns` must be supplied; whichever condition is satisfied first
/// stops the other and invokes `callback` exactly once.
pub fn start(
  lp: &mut EventLoop,
  fd: Option<(RawFd, Mask)>,
  timeout_ns: Option<u64>,
  callback: Callback,
) -> Option<WatcherId> {
  assert!(fd.is_some() || timeout_ns.is_some(), "once watcher needs a poll or timer component");

  let once_id = lp.slab.insert(callback, KindState::Once { inner_poll: None, inner_timer: None });

  let inner_poll = fd.map(|(fd, emask)| {
    fds::poll_start(lp, fd, emask, Box::new(move |lp, _id, mask| fire(lp, once_id, mask)))
  });

  let inner_timer = match timeout_ns {
    Some(ns) => timer::start(lp, ns, 0, Box::new(move |lp, _id, mask| fire(lp, once_id, mask))),
    None => None,
  };

  if inner_poll.is_none() && inner_timer.is_none() {
    // Both components were rejected (e.g. timer overflow with no poll
    // component): the once-watcher never activates.
    lp.slab.remove(once_id);
    return None;
  }

  if let Some(slot) = lp.slab.get_mut(once_id) {
    slot.kind = KindState::Once { inner_poll, inner_timer };
  }
  Some(once_id)
}

pub fn stop(lp: &mut EventLoop, id: WatcherId) {
  let Some(slot) = lp.slab.get(id) else { return };
  let (inner_poll, inner_timer) = match slot.kind {
    KindState::Once { inner_poll, inner_timer } => (inner_poll, inner_timer),
    _ => return,
  };
  if let Some(p) = inner_poll {
    fds::poll_stop(lp, p);
  }
  if let Some(t) = inner_timer {
    timer::stop(lp, t);
  }
  lp.slab.remove(id);
}

/// Invoked by whichever inner watcher fires first.
fn fire(lp: &mut EventLoop, once_id: WatcherId, mask: Mask) {
  let Some(slot) = lp.slab.get(once_id) else { return };
  let (inner_poll, inner_timer) = match slot.kind {
    KindState::Once { inner_poll, inner_timer } => (inner_poll, inner_timer),
    _ => return,
  };
  if let Some(p) = inner_poll {
    fds::poll_stop(lp, p);
  }
  if let Some(t) = inner_timer {
    timer::stop(lp, t);
  }
  if let Some(mut cb) = lp.slab.take_callback(once_id) {
    cb(lp, once_id, mask);
  }
  lp.slab.remove(once_id);
}
