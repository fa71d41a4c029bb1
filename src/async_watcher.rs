//! Cross-thread async watcher: the one watcher variant whose `send` may be
//! called from any thread (§4.4, §5).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::event_loop::EventLoop;
use crate::mask::Mask;
use crate::pending;
use crate::wake::WakeState;
use crate::watcher::{AsyncStatus, Callback, KindState, WatcherId};

/// A thread-safe handle used to wake an [`EventLoop`] from any thread.
///
/// Cloning is cheap (two `Arc` clones); every clone refers to the same
/// underlying watcher.
#[derive(Clone)]
pub struct AsyncSender {
  status: Arc<AsyncStatus>,
  wake: Arc<WakeState>,
}

impl AsyncSender {
  /// `async_send`: safe to call from any thread. Sets the watcher's status,
  /// and — the first time it transitions from idle — arranges for the owning
  /// loop to wake and process it.
  pub fn send(&self) {
    self.status.pending.store(true, Ordering::Release);
    self.wake.wake_async();
  }

  /// `pending(w) -> bool`.
  pub fn is_pending(&self) -> bool {
    self.status.pending.load(Ordering::Acquire)
  }
}

/// Starts an async watcher, returning its id (for `stop`) and a
/// thread-safe [`AsyncSender`] clients can move to other threads.
pub fn start(lp: &mut EventLoop, callback: Callback) -> (WatcherId, AsyncSender) {
  let wake = lp.ensure_wake_installed().expect("failed to install wake descriptor");
  let status = Arc::new(AsyncStatus::new());
  let id = lp.slab.insert(callback, KindState::Async { status: status.clone() });
  let list_index = lp.async_list.len();
  lp.async_list.push(id);
  let _ = list_index;
  lp.refcount += 1;
  (id, AsyncSender { status, wake })
}

pub fn stop(lp: &mut EventLoop, id: WatcherId) {
  let Some(slot) = lp.slab.get(id) else { return };
  if !matches!(slot.kind, KindState::Async { .. }) {
    return;
  }
  pending::clear_pending(lp, id);
  lp.async_list.retain(|&w| w != id);
  lp.slab.remove(id);
  lp.refcount -= 1;
}

/// Called once per wake delivery: scans every registered async watcher and
/// queues an ASYNC event for any whose status is set, clearing it first
/// (discard-on-stop is handled naturally since a stopped watcher is no
/// longer in `async_list`).
pub(crate) fn process_pending(lp: &mut EventLoop) {
  let ids = lp.async_list.clone();
  for id in ids {
    let fired = match lp.slab.get(id) {
      Some(slot) => match &slot.kind {
        KindState::Async { status } => status.pending.swap(false, Ordering::Acquire),
        _ => false,
      },
      None => false,
    };
    if fired {
      pending::feed_event(lp, id, Mask::ASYNC);
    }
  }
}
