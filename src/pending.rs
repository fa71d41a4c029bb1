use crate::event_loop::EventLoop;
use crate::mask::Mask;
use crate::watcher::WatcherId;

struct PendingEntry {
  id: WatcherId,
  mask: Mask,
}

/// The double-buffered pending-event queue described in §4.1: one buffer is
/// always the *active* queue receiving new feeds, the other is *draining*.
/// `invoke_pending` swaps the two, runs every callback in the buffer it just
/// took over, and repeats until the (new) active buffer is empty at the
/// moment it would swap again — which is what makes callbacks that feed
/// further events process depth-first.
pub(crate) struct PendingQueue {
  buffers: [Vec<PendingEntry>; 2],
  active: usize,
}

/// Decodes a slot's `pending` field: 0 means "not pending"; otherwise the low
/// bit selects the buffer and the remaining bits are a 1-based index into it.
fn decode(pending: u32) -> Option<(usize, usize)> {
  if pending == 0 {
    None
  } else {
    Some(((pending & 1) as usize, (pending >> 1) as usize - 1))
  }
}

fn encode(buffer: usize, index: usize) -> u32 {
  (((index + 1) as u32) << 1) | (buffer as u32)
}

impl PendingQueue {
  pub(crate) fn new() -> Self {
    PendingQueue { buffers: [Vec::new(), Vec::new()], active: 0 }
  }

  pub(crate) fn is_active_empty(&self) -> bool {
    self.buffers[self.active].is_empty()
  }

  pub(crate) fn count(&self) -> usize {
    self.buffers[0].len() + self.buffers[1].len()
  }
}

/// Feeds `mask` for `id`. If the watcher already has a pending entry, the
/// mask is OR-ed into the existing one rather than duplicated.
pub(crate) fn feed_event(lp: &mut EventLoop, id: WatcherId, mask: Mask) {
  let Some(slot) = lp.slab.get_mut(id) else { return };
  if let Some((buffer, index)) = decode(slot.pending) {
    lp.pending.buffers[buffer][index].mask |= mask;
    return;
  }
  let active = lp.pending.active;
  let index = lp.pending.buffers[active].len();
  lp.pending.buffers[active].push(PendingEntry { id, mask });
  if let Some(slot) = lp.slab.get_mut(id) {
    slot.pending = encode(active, index);
  }
}

/// Cancels a watcher's queued event without invoking its callback. O(1): the
/// entry is removed via swap-remove and the displaced entry's `pending` field
/// (if any) is fixed up to point at its new index.
pub(crate) fn clear_pending(lp: &mut EventLoop, id: WatcherId) {
  let Some(slot) = lp.slab.get_mut(id) else { return };
  let Some((buffer, index)) = decode(slot.pending) else { return };
  slot.pending = 0;
  lp.pending.buffers[buffer].swap_remove(index);
  if index < lp.pending.buffers[buffer].len() {
    let moved = lp.pending.buffers[buffer][index].id;
    if let Some(moved_slot) = lp.slab.get_mut(moved) {
      moved_slot.pending = encode(buffer, index);
    }
  }
}

pub(crate) fn pending_count(lp: &EventLoop) -> usize {
  lp.pending.count()
}

#[cfg(test)]
mod encoding_tests {
  use super::{decode, encode};

  #[test]
  fn round_trips_through_encode_decode() {
    for buffer in [0usize, 1] {
      for index in [0usize, 1, 17, 9999] {
        let (b, i) = decode(encode(buffer, index)).unwrap();
        assert_eq!(b, buffer);
        assert_eq!(i, index);
      }
    }
  }

  #[test]
  fn zero_means_not_pending() {
    assert_eq!(decode(0), None);
  }

  #[test]
  fn low_bit_selects_buffer() {
    assert_eq!(encode(0, 0) & 1, 0);
    assert_eq!(encode(1, 0) & 1, 1);
  }

  use proptest::prelude::*;

  proptest! {
    #[test]
    fn encode_decode_round_trips_over_arbitrary_inputs(buffer in 0usize..=1, index in 0usize..(1 << 30)) {
      let (b, i) = decode(encode(buffer, index)).unwrap();
      prop_assert_eq!(b, buffer);
      prop_assert_eq!(i, index);
    }
  }
}

/// Drains the active buffer, invoking each watcher's callback in reverse
/// insertion order, and repeats until the (new) active buffer is empty at the
/// point a swap would otherwise occur. Re-entrant calls from within a
/// callback are safe and process depth-first: a callback that feeds more
/// events pushes into whichever buffer is active *now*, and the outer loop
/// picks them up on its next pass.
pub(crate) fn invoke_pending(lp: &mut EventLoop) {
  loop {
    if lp.pending.is_active_empty() {
      break;
    }
    let draining = lp.pending.active;
    lp.pending.active ^= 1;
    debug_assert!(lp.pending.buffers[lp.pending.active].is_empty());

    let entries = std::mem::take(&mut lp.pending.buffers[draining]);
    for entry in entries.into_iter().rev() {
      match lp.slab.get_mut(entry.id) {
        Some(slot) => slot.pending = 0,
        None => continue,
      }
      if let Some(mut cb) = lp.slab.take_callback(entry.id) {
        cb(lp, entry.id, entry.mask);
        lp.slab.restore_callback(entry.id, cb);
      }
    }
  }
}
