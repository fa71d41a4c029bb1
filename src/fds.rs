//! The file-descriptor watcher layer: per-fd bookkeeping, deferred-change
//! coalescing, and the epoll backend (§4.2).

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

use crate::event_loop::EventLoop;
use crate::mask::Mask;
use crate::pending;
use crate::watcher::{KindState, WatcherId};

const FD_INVAL: u8 = 0x80;

/// Per-fd bookkeeping (§3 "Per-FD record").
pub(crate) struct FdRecord {
  pub(crate) watchers: Vec<WatcherId>,
  /// Whether this fd is already queued in `EventLoop::fd_changes`.
  pub(crate) queued: bool,
  /// Current mask registered with the kernel.
  pub(crate) registered: Mask,
  /// Mask registered with the kernel before the pending change (used only to
  /// decide no-op/ADD/MOD/DEL at flush time; kept distinct from `registered`
  /// for clarity, though in this implementation flush happens synchronously
  /// so the two are only ever observed one at a time).
  pub(crate) flags: u8,
  pub(crate) generation: u32,
}

impl FdRecord {
  fn new() -> Self {
    FdRecord { watchers: Vec::new(), queued: false, registered: Mask::empty(), flags: 0, generation: 0 }
  }

  /// Takes `&Slab` rather than `&EventLoop` so callers holding a live
  /// `&mut FdRecord` (itself borrowed from `lp.fds.records`) can still pass
  /// `&lp.slab` — a disjoint field — without a borrow conflict.
  fn desired_mask(&self, slab: &crate::watcher::Slab) -> Mask {
    let mut m = Mask::empty();
    for &id in &self.watchers {
      if let Some(slot) = slab.get(id) {
        if let KindState::Poll { emask, .. } = slot.kind {
          m |= emask;
        }
      }
    }
    m
  }

  fn is_inval(&self) -> bool {
    self.flags & FD_INVAL != 0
  }
}

pub(crate) struct FdTable {
  records: HashMap<RawFd, FdRecord>,
  changes: Vec<RawFd>,
}

impl FdTable {
  pub(crate) fn new() -> Self {
    FdTable { records: HashMap::new(), changes: Vec::new() }
  }

  pub(crate) fn get(&self, fd: RawFd) -> Option<&FdRecord> {
    self.records.get(&fd)
  }
}

fn queue_fd_change(lp: &mut EventLoop, fd: RawFd) {
  let record = lp.fds.records.entry(fd).or_insert_with(FdRecord::new);
  record.flags &= !FD_INVAL;
  if !record.queued {
    record.queued = true;
    lp.fds.changes.push(fd);
  }
}

/// Starts a poll watcher: fd ≥ 0, `emask` carries READ/WRITE and optionally
/// the internal POLLET bit.
pub fn poll_start(lp: &mut EventLoop, fd: RawFd, emask: Mask, callback: crate::watcher::Callback) -> WatcherId {
  assert!(fd >= 0, "poll watcher fd must be >= 0, got {fd}");
  let id = lp.slab.insert(callback, KindState::Poll { fd, emask });
  let record = lp.fds.records.entry(fd).or_insert_with(FdRecord::new);
  record.watchers.push(id);
  lp.refcount += 1;
  queue_fd_change(lp, fd);
  id
}

pub fn poll_stop(lp: &mut EventLoop, id: WatcherId) {
  let Some(slot) = lp.slab.get(id) else { return };
  let KindState::Poll { fd, .. } = slot.kind else { return };
  pending::clear_pending(lp, id);
  if let Some(record) = lp.fds.records.get_mut(&fd) {
    record.watchers.retain(|&w| w != id);
  }
  lp.slab.remove(id);
  lp.refcount -= 1;
  queue_fd_change(lp, fd);
}

/// `poll_change` per §4.2: retargets fd and/or mask, following the exact
/// decision tree in the spec.
pub fn poll_change(lp: &mut EventLoop, id: WatcherId, fd: RawFd, emask: Mask, callback_for_restart: Option<crate::watcher::Callback>) -> Option<WatcherId> {
  let Some(slot) = lp.slab.get(id) else { return None };
  let (cur_fd, cur_mask) = match slot.kind {
    KindState::Poll { fd, emask } => (fd, emask),
    _ => return Some(id),
  };

  if fd != cur_fd {
    // stop-then-start; requires the caller to supply a fresh callback since
    // the old one is consumed by removal.
    let cb = lp.slab.take_callback(id).or(callback_for_restart).expect("poll_change fd retarget requires a callback");
    poll_stop(lp, id);
    return Some(poll_start(lp, fd, emask, cb));
  }
  if emask.is_empty() {
    poll_stop(lp, id);
    return None;
  }
  if emask != cur_mask {
    if let Some(slot) = lp.slab.get_mut(id) {
      slot.kind = KindState::Poll { fd, emask };
    }
    pending::clear_pending(lp, id);
    queue_fd_change(lp, fd);
  }
  Some(id)
}

pub(crate) fn invalidate_fd(lp: &mut EventLoop, fd: RawFd) {
  let epoll_fd = lp.backend_fd();
  let Some(record) = lp.fds.records.get_mut(&fd) else { return };
  if record.is_inval() {
    return;
  }
  if !record.registered.is_empty() {
    let res = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
    if res == -1 {
      let err = io::Error::last_os_error();
      let errno = err.raw_os_error().unwrap_or(0);
      if errno != libc::ENOENT && errno != libc::EPERM {
        #[cfg(feature = "log")]
        log::warn!("epoll_ctl(DEL) on fd {fd} failed: {err}");
      }
    }
    record.registered = Mask::empty();
  }
  record.flags |= FD_INVAL;
}

fn to_epoll_events(mask: Mask) -> u32 {
  let mut ev = 0u32;
  if mask.contains(Mask::READ) {
    ev |= libc::EPOLLIN as u32;
  }
  if mask.contains(Mask::WRITE) {
    ev |= libc::EPOLLOUT as u32;
  }
  if mask.contains(Mask::POLLET) {
    ev |= libc::EPOLLET as u32;
  }
  ev
}

/// Folds `EPOLLERR`/`EPOLLHUP` into both READ and WRITE, matching the
/// original's `evio_poll_wait`: an error or hangup is reported as ordinary
/// readiness on whichever directions the watcher asked for, rather than as a
/// distinct condition, since the kernel gives no way to tell "readable" apart
/// from "readable because the peer hung up" at this layer.
fn from_epoll_events(ev: u32) -> Mask {
  let mut m = Mask::empty();
  let err_or_hup = ev & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
  if ev & (libc::EPOLLIN as u32) != 0 || err_or_hup {
    m |= Mask::READ;
  }
  if ev & (libc::EPOLLOUT as u32) != 0 || err_or_hup {
    m |= Mask::WRITE;
  }
  m
}

fn cookie(fd: RawFd, generation: u32) -> u64 {
  (fd as u32 as u64) | ((generation as u64) << 32)
}

/// Issues one ADD/MOD control operation, routing through the batched
/// `io_uring` backend when one is configured and falling back to a direct
/// `epoll_ctl` otherwise (§4.2). Each call flushes its own single-entry
/// `io_uring` batch rather than accumulating across the whole changes queue;
/// this sacrifices some of the batching benefit for a much smaller
/// integration surface (noted in DESIGN.md).
fn ctl(lp: &mut EventLoop, epoll_fd: RawFd, op: i32, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
  #[cfg(feature = "io-uring")]
  if let Some(uring) = &mut lp.uring {
    uring.set_epoll_fd(epoll_fd);
    uring.queue(op, fd, events, data);
    match uring.flush() {
      Ok(results) => {
        return match results.first() {
          Some(&(_, _, res)) if res == 0 => Ok(()),
          Some(&(_, _, res)) => Err(io::Error::from_raw_os_error(-res)),
          None => Ok(()),
        };
      }
      Err(err) => {
        #[cfg(feature = "log")]
        log::warn!("io_uring flush failed, falling back to synchronous epoll_ctl: {err}");
      }
    }
  }

  let mut ev = libc::epoll_event { events, u64: data };
  let res = unsafe { libc::epoll_ctl(epoll_fd, op, fd, &mut ev) };
  if res == -1 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}

/// Flushes every queued fd change into the readiness backend. Called once
/// per iteration, step 3 of §4.1.
pub(crate) fn flush_fd_changes(lp: &mut EventLoop) {
  let epoll_fd = lp.backend_fd();
  let fds = std::mem::take(&mut lp.fds.changes);
  for fd in fds {
    let Some(record) = lp.fds.records.get_mut(&fd) else { continue };
    record.queued = false;
    if record.is_inval() {
      continue;
    }

    let desired = record.desired_mask(&lp.slab);
    let previous = record.registered;

    if desired == previous {
      continue;
    }

    if desired.is_empty() {
      invalidate_fd(lp, fd);
      continue;
    }

    let events = to_epoll_events(desired) | libc::EPOLLRDHUP as u32;
    let record = lp.fds.records.get_mut(&fd).unwrap();

    let op = if previous.is_empty() { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
    let new_generation = record.generation.wrapping_add(1);
    let data = cookie(fd, new_generation);

    let mut result = ctl(lp, epoll_fd, op, fd, events, data);
    if let Err(err) = &result {
      match err.raw_os_error() {
        Some(e) if e == libc::EEXIST && op == libc::EPOLL_CTL_ADD => {
          result = ctl(lp, epoll_fd, libc::EPOLL_CTL_MOD, fd, events, data);
        }
        Some(e) if e == libc::ENOENT && op == libc::EPOLL_CTL_MOD => {
          result = ctl(lp, epoll_fd, libc::EPOLL_CTL_ADD, fd, events, data);
        }
        _ => {}
      }
    }

    match result {
      Ok(()) => {
        let record = lp.fds.records.get_mut(&fd).unwrap();
        record.registered = desired;
        record.generation = new_generation;
      }
      Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
        // FD not pollable (e.g. a regular file): keep the watcher active and
        // synthesize a permanent-ready event for READ|WRITE intersected with
        // what's desired.
        #[cfg(feature = "log")]
        log::warn!("fd {fd} not pollable (EPERM); treating as always-ready");
        let synthetic = desired.intersection(Mask::READ | Mask::WRITE);
        queue_fd_events(lp, fd, synthetic);
      }
      Err(err) => {
        #[cfg(feature = "log")]
        log::warn!("epoll_ctl failed for fd {fd}: {err}");
        queue_fd_errors(lp, fd);
      }
    }
  }
}

/// Queues `mask` to every poll watcher currently registered on `fd`.
pub(crate) fn queue_fd_events(lp: &mut EventLoop, fd: RawFd, mask: Mask) {
  let Some(record) = lp.fds.records.get(&fd) else { return };
  let watchers = record.watchers.clone();
  for id in watchers {
    pending::feed_event(lp, id, mask | Mask::POLL);
  }
}

/// Queues an ERROR event to every watcher on `fd` and stops them all.
pub(crate) fn queue_fd_errors(lp: &mut EventLoop, fd: RawFd) {
  let Some(record) = lp.fds.records.get(&fd) else { return };
  let watchers = record.watchers.clone();
  for id in &watchers {
    pending::feed_event(lp, *id, Mask::ERROR | Mask::POLL);
  }
  for id in watchers {
    poll_stop(lp, id);
  }
}

/// Processes one fd's raw epoll event: stale-generation drop, then either
/// dispatch or the correction path (§4.2).
pub(crate) fn handle_epoll_event(lp: &mut EventLoop, data: u64, events: u32) {
  let fd = (data & 0xFFFF_FFFF) as RawFd;
  let generation = (data >> 32) as u32;

  let Some(record) = lp.fds.records.get(&fd) else { return };
  if record.generation != generation {
    return; // stale event from a since-superseded registration
  }

  let reported = from_epoll_events(events);
  let desired = record.desired_mask(&lp.slab);

  if !reported.is_empty() {
    queue_fd_events(lp, fd, reported);
  }

  if !desired.contains(reported) {
    // Kernel reported bits (e.g. stale EPOLLOUT) outside the currently
    // desired mask: resubmit a MOD (or DEL if nothing is desired anymore).
    if desired.is_empty() {
      invalidate_fd(lp, fd);
    } else {
      queue_fd_change(lp, fd);
    }
  }
}
