//! Binary min-heap of timer watchers, keyed by absolute deadline in
//! nanoseconds on the loop's monotonic clock (§4.3).

use crate::event_loop::EventLoop;
use crate::mask::Mask;
use crate::pending;
use crate::watcher::{KindState, WatcherId};

struct Node {
  id: WatcherId,
  deadline: u64,
}

pub(crate) struct TimerHeap {
  nodes: Vec<Node>,
  /// One-shot timers that just fired this iteration. Their slab slot stays
  /// alive (as "inactive") only long enough for the queued TIMER event to be
  /// delivered by `invoke_pending`; `reap_expired` then frees it.
  expired_oneshots: Vec<WatcherId>,
}

impl TimerHeap {
  pub(crate) fn new() -> Self {
    TimerHeap { nodes: Vec::new(), expired_oneshots: Vec::new() }
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub(crate) fn next_deadline(&self) -> Option<u64> {
    self.nodes.first().map(|n| n.deadline)
  }

  fn set_heap_index(lp: &mut EventLoop, id: WatcherId, index: usize) {
    if let Some(slot) = lp.slab.get_mut(id) {
      if let KindState::Timer { heap_index, .. } = &mut slot.kind {
        *heap_index = index + 1;
      }
    }
  }

  fn heap_index(lp: &EventLoop, id: WatcherId) -> Option<usize> {
    match lp.slab.get(id)?.kind {
      KindState::Timer { heap_index, .. } if heap_index != 0 => Some(heap_index - 1),
      _ => None,
    }
  }

  fn sift_up(lp: &mut EventLoop, mut i: usize) {
    while i > 0 {
      let parent = (i - 1) / 2;
      if lp.timer.nodes[parent].deadline <= lp.timer.nodes[i].deadline {
        break;
      }
      lp.timer.nodes.swap(parent, i);
      Self::set_heap_index(lp, lp.timer.nodes[parent].id, parent);
      Self::set_heap_index(lp, lp.timer.nodes[i].id, i);
      i = parent;
    }
  }

  fn sift_down(lp: &mut EventLoop, mut i: usize) {
    loop {
      let left = 2 * i + 1;
      let right = 2 * i + 2;
      let mut smallest = i;
      if left < lp.timer.nodes.len() && lp.timer.nodes[left].deadline < lp.timer.nodes[smallest].deadline {
        smallest = left;
      }
      if right < lp.timer.nodes.len() && lp.timer.nodes[right].deadline < lp.timer.nodes[smallest].deadline {
        smallest = right;
      }
      if smallest == i {
        break;
      }
      lp.timer.nodes.swap(i, smallest);
      Self::set_heap_index(lp, lp.timer.nodes[i].id, i);
      Self::set_heap_index(lp, lp.timer.nodes[smallest].id, smallest);
      i = smallest;
    }
  }
}

fn push(lp: &mut EventLoop, id: WatcherId, deadline: u64) {
  let index = lp.timer.nodes.len();
  lp.timer.nodes.push(Node { id, deadline });
  TimerHeap::set_heap_index(lp, id, index);
  TimerHeap::sift_up(lp, index);
}

fn remove_at(lp: &mut EventLoop, index: usize) {
  let last = lp.timer.nodes.len() - 1;
  if index != last {
    lp.timer.nodes.swap(index, last);
  }
  lp.timer.nodes.pop();
  if index < lp.timer.nodes.len() {
    TimerHeap::set_heap_index(lp, lp.timer.nodes[index].id, index);
    TimerHeap::sift_down(lp, index);
    TimerHeap::sift_up(lp, index);
  }
}

/// `timer_start(w, after)`: silently no-ops on overflow.
pub fn start(lp: &mut EventLoop, after_ns: u64, repeat_ns: u64, callback: crate::watcher::Callback) -> Option<WatcherId> {
  let now = lp.time();
  let deadline = now.checked_add(after_ns)?;
  let id = lp.slab.insert(callback, KindState::Timer { repeat: repeat_ns, heap_index: 0 });
  lp.refcount += 1;
  push(lp, id, deadline);
  Some(id)
}

pub fn stop(lp: &mut EventLoop, id: WatcherId) {
  let Some(index) = TimerHeap::heap_index(lp, id) else { return };
  pending::clear_pending(lp, id);
  remove_at(lp, index);
  lp.slab.remove(id);
  lp.refcount -= 1;
}

/// `again(w)`: reschedule an active repeating timer to `now + repeat`;
/// start an inactive one with `repeat`; stop otherwise.
pub fn again(lp: &mut EventLoop, id: WatcherId, callback_if_restart: Option<crate::watcher::Callback>) {
  let Some(slot) = lp.slab.get(id) else { return };
  let (repeat, active) = match slot.kind {
    KindState::Timer { repeat, heap_index } => (repeat, heap_index != 0),
    _ => return,
  };

  if active {
    if repeat == 0 {
      stop(lp, id);
      return;
    }
    let now = lp.time();
    let index = TimerHeap::heap_index(lp, id).unwrap();
    match now.checked_add(repeat) {
      Some(deadline) => {
        lp.timer.nodes[index].deadline = deadline;
        TimerHeap::sift_down(lp, index);
        TimerHeap::sift_up(lp, index);
      }
      None => stop(lp, id),
    }
  } else if repeat > 0 {
    if let Some(cb) = callback_if_restart {
      start(lp, repeat, repeat, cb);
    }
  }
}

/// `remaining(w)`: 0 if inactive or due; else `deadline - now`.
pub fn remaining(lp: &EventLoop, id: WatcherId) -> u64 {
  let Some(index) = TimerHeap::heap_index(lp, id) else { return 0 };
  let deadline = lp.timer.nodes[index].deadline;
  let now = lp.time();
  deadline.saturating_sub(now)
}

/// Fires every timer whose deadline has passed (§4.3 "Firing").
pub(crate) fn update(lp: &mut EventLoop) {
  loop {
    let now = lp.time();
    let Some(deadline) = lp.timer.next_deadline() else { break };
    if deadline > now {
      break;
    }
    let id = lp.timer.nodes[0].id;
    pending::feed_event(lp, id, Mask::TIMER);

    let repeat = match lp.slab.get(id) {
      Some(slot) => match slot.kind {
        KindState::Timer { repeat, .. } => repeat,
        _ => 0,
      },
      None => 0,
    };

    if repeat == 0 {
      remove_at(lp, 0);
      if let Some(slot) = lp.slab.get_mut(id) {
        if let KindState::Timer { heap_index, .. } = &mut slot.kind {
          *heap_index = 0;
        }
      }
      lp.refcount -= 1;
      // The watcher is no longer heap-tracked, but its queued TIMER event
      // must still fire this iteration; the slab entry itself is left in
      // place so `invoke_pending` can still find it, and is reclaimed by
      // `reap_expired` once the event has been delivered.
      lp.timer.expired_oneshots.push(id);
    } else {
      let mut new_deadline = match deadline.checked_add(repeat) {
        Some(d) => d,
        None => {
          remove_at(lp, 0);
          if let Some(slot) = lp.slab.get_mut(id) {
            if let KindState::Timer { heap_index, .. } = &mut slot.kind {
              *heap_index = 0;
            }
          }
          lp.refcount -= 1;
          continue;
        }
      };
      if new_deadline <= now {
        // Guard forward progress under a slow callback.
        new_deadline = now + 1;
      }
      lp.timer.nodes[0].deadline = new_deadline;
      TimerHeap::sift_down(lp, 0);
    }
  }
}

/// Frees the slab slot of every one-shot timer that fired this iteration,
/// now that `invoke_pending` has delivered their TIMER event. A slot whose
/// callback re-armed it via `timer_start` inside the callback has a fresh,
/// distinct `WatcherId` (new generation), so this never reaps a live timer.
pub(crate) fn reap_expired(lp: &mut EventLoop) {
  let expired = std::mem::take(&mut lp.timer.expired_oneshots);
  for id in expired {
    lp.slab.remove(id);
  }
}

#[cfg(test)]
mod tests {
  use crate::config::LoopConfig;
  use crate::event_loop::EventLoop;

  /// Walks every heap node and checks the min-heap invariant of §8:
  /// `node[i].deadline <= node[child].deadline`.
  fn assert_heap_ordered(lp: &EventLoop) {
    let nodes = &lp.timer.nodes;
    for i in 0..nodes.len() {
      let left = 2 * i + 1;
      let right = 2 * i + 2;
      if left < nodes.len() {
        assert!(nodes[i].deadline <= nodes[left].deadline);
      }
      if right < nodes.len() {
        assert!(nodes[i].deadline <= nodes[right].deadline);
      }
    }
  }

  #[test]
  fn heap_stays_ordered_after_arbitrary_inserts_and_removals() {
    fastrand::seed(0x5eed);
    let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
    let mut ids = Vec::new();

    for _ in 0..64u64 {
      let deadline_ns = fastrand::u64(1..1_000_000_000);
      if let Some(id) = super::start(&mut lp, deadline_ns, 0, Box::new(|_, _, _| {})) {
        ids.push(id);
      }
      assert_heap_ordered(&lp);
    }

    while let Some(id) = ids.pop() {
      if fastrand::bool() {
        super::stop(&mut lp, id);
        assert_heap_ordered(&lp);
      }
    }
  }

  #[test]
  fn root_deadline_is_always_the_minimum() {
    let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
    let deadlines = [500u64, 10, 9_999, 3, 42];
    for d in deadlines {
      super::start(&mut lp, d, 0, Box::new(|_, _, _| {}));
    }
    assert_eq!(lp.timer.next_deadline(), Some(lp.time() + 3));
  }
}
