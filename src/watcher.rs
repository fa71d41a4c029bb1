use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::event_loop::EventLoop;
use crate::mask::Mask;
use crate::wake::WakeState;

/// A callback invoked with the loop it's registered on, its own identity, and
/// the event mask that fired.
///
/// There is no separate "userdata" field as in the C original: a Rust closure
/// captures whatever state it needs directly, which supersedes the `void *
/// data` idiom.
pub type Callback = Box<dyn FnMut(&mut EventLoop, WatcherId, Mask)>;

/// An opaque, generational handle to a registered watcher.
///
/// This is the Rust encoding of the "loop holds a borrow of the watcher from
/// start to stop" ownership model described in the original design: rather
/// than a non-owning reference with a lifetime tied to the watcher's storage,
/// `start` moves the watcher's state into a slab owned by the loop and hands
/// back this id; `stop` removes it. The generation guards against a stale id
/// from a previous registration on the same slot being mistaken for the
/// current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId {
  pub(crate) index: u32,
  pub(crate) generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKindTag {
  Poll,
  Timer,
  Signal,
  Async,
  Idle,
  Prepare,
  Check,
  Cleanup,
  Once,
}

/// Per-kind state distinct from the fields common to every watcher.
pub(crate) enum KindState {
  Poll { fd: RawFd, emask: Mask },
  Timer { repeat: u64, heap_index: usize },
  Signal { signum: i32, list_index: usize },
  Async { status: Arc<AsyncStatus> },
  Idle { list_index: usize },
  Prepare { list_index: usize },
  Check { list_index: usize },
  Cleanup { list_index: usize },
  Once { inner_poll: Option<WatcherId>, inner_timer: Option<WatcherId> },
}

impl KindState {
  pub(crate) fn tag(&self) -> WatcherKindTag {
    match self {
      KindState::Poll { .. } => WatcherKindTag::Poll,
      KindState::Timer { .. } => WatcherKindTag::Timer,
      KindState::Signal { .. } => WatcherKindTag::Signal,
      KindState::Async { .. } => WatcherKindTag::Async,
      KindState::Idle { .. } => WatcherKindTag::Idle,
      KindState::Prepare { .. } => WatcherKindTag::Prepare,
      KindState::Check { .. } => WatcherKindTag::Check,
      KindState::Cleanup { .. } => WatcherKindTag::Cleanup,
      KindState::Once { .. } => WatcherKindTag::Once,
    }
  }
}

/// The atomic status cell backing an async watcher, shared with its
/// thread-safe [`AsyncSender`](crate::async_watcher::AsyncSender) handle.
pub(crate) struct AsyncStatus {
  pub(crate) pending: AtomicBool,
}

impl AsyncStatus {
  pub(crate) fn new() -> Self {
    AsyncStatus { pending: AtomicBool::new(false) }
  }
}

/// A slot in the loop's watcher slab. `active != 0` matches the spec's
/// overloaded `active` field: for poll watchers it is unused (membership is
/// tracked by the per-fd list directly), for timers it is the 1-based heap
/// index, for the flat-list categories it is the 1-based index in the
/// category's `Vec<WatcherId>`.
pub(crate) struct Slot {
  pub(crate) callback: Option<Callback>,
  pub(crate) kind: KindState,
  /// 0 = not pending; otherwise a 1-based encoding into one of the two
  /// pending buffers (see `pending.rs`).
  pub(crate) pending: u32,
}

/// Owns the heterogeneous slab of all watchers currently registered with a
/// loop, plus free-list and generation bookkeeping for reuse.
pub(crate) struct Slab {
  slots: Vec<Option<Slot>>,
  /// Generation of whatever currently (or most recently) occupies each index;
  /// bumped on `remove` so a stale [`WatcherId`] referring to a freed-then-
  /// reused slot fails its generation check rather than aliasing.
  generations: Vec<u32>,
  free: Vec<u32>,
}

impl Slab {
  pub(crate) fn new() -> Self {
    Slab { slots: Vec::new(), generations: Vec::new(), free: Vec::new() }
  }

  pub(crate) fn insert(&mut self, callback: Callback, kind: KindState) -> WatcherId {
    let slot = Slot { callback: Some(callback), kind, pending: 0 };
    if let Some(index) = self.free.pop() {
      debug_assert!(self.slots[index as usize].is_none());
      self.slots[index as usize] = Some(slot);
      WatcherId { index, generation: self.generations[index as usize] }
    } else {
      let index = self.slots.len() as u32;
      self.slots.push(Some(slot));
      self.generations.push(0);
      WatcherId { index, generation: 0 }
    }
  }

  fn generation_matches(&self, id: WatcherId) -> bool {
    self.generations.get(id.index as usize) == Some(&id.generation)
  }

  pub(crate) fn get(&self, id: WatcherId) -> Option<&Slot> {
    if !self.generation_matches(id) {
      return None;
    }
    self.slots.get(id.index as usize)?.as_ref()
  }

  pub(crate) fn get_mut(&mut self, id: WatcherId) -> Option<&mut Slot> {
    if !self.generation_matches(id) {
      return None;
    }
    self.slots.get_mut(id.index as usize)?.as_mut()
  }

  pub(crate) fn remove(&mut self, id: WatcherId) -> Option<Slot> {
    if !self.generation_matches(id) {
      return None;
    }
    let slot = self.slots.get_mut(id.index as usize)?.take()?;
    self.generations[id.index as usize] = self.generations[id.index as usize].wrapping_add(1);
    self.free.push(id.index);
    Some(slot)
  }

  /// Takes the callback out so it can be invoked without holding a borrow of
  /// the slab across the call (a callback may freely mutate other watchers,
  /// including feeding events to itself).
  pub(crate) fn take_callback(&mut self, id: WatcherId) -> Option<Callback> {
    self.get_mut(id)?.callback.take()
  }

  /// Restores a callback previously removed with `take_callback`, if the
  /// watcher (by generation) is still registered.
  pub(crate) fn restore_callback(&mut self, id: WatcherId, cb: Callback) {
    if let Some(slot) = self.get_mut(id) {
      slot.callback = Some(cb);
    }
  }
}

/// Reference to the wake-path state, lazily created the first time a signal
/// or async watcher is started. Not part of the public API.
pub(crate) type SharedWake = Arc<WakeState>;

#[cfg(test)]
mod tests {
  use super::*;

  fn dummy_kind() -> KindState {
    KindState::Idle { list_index: 0 }
  }

  #[test]
  fn insert_then_get_round_trips() {
    let mut slab = Slab::new();
    let id = slab.insert(Box::new(|_, _, _| {}), dummy_kind());
    assert!(slab.get(id).is_some());
  }

  #[test]
  fn removed_slot_fails_generation_check_for_stale_id() {
    let mut slab = Slab::new();
    let id = slab.insert(Box::new(|_, _, _| {}), dummy_kind());
    slab.remove(id);
    assert!(slab.get(id).is_none());
  }

  #[test]
  fn reused_slot_gets_a_fresh_generation() {
    let mut slab = Slab::new();
    let first = slab.insert(Box::new(|_, _, _| {}), dummy_kind());
    slab.remove(first);
    let second = slab.insert(Box::new(|_, _, _| {}), dummy_kind());

    assert_eq!(first.index, second.index);
    assert_ne!(first.generation, second.generation);
    assert!(slab.get(first).is_none());
    assert!(slab.get(second).is_some());
  }

  #[test]
  fn take_callback_then_restore_preserves_identity() {
    let mut slab = Slab::new();
    let id = slab.insert(Box::new(|_, _, _| {}), dummy_kind());
    let cb = slab.take_callback(id).expect("callback present");
    assert!(slab.get(id).unwrap().callback.is_none());
    slab.restore_callback(id, cb);
    assert!(slab.get(id).unwrap().callback.is_some());
  }
}
