//! The central loop type: owns every subsystem and drives the iteration
//! order of §4.1.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::async_watcher::{self, AsyncSender};
use crate::config::LoopConfig;
use crate::error::NewLoopError;
use crate::fds::{self, FdTable};
use crate::mask::Mask;
use crate::once;
use crate::pending::{self, PendingQueue};
use crate::signal;
use crate::time::{self, ClockSource};
use crate::timer::{self, TimerHeap};
use crate::wake::WakeState;
use crate::watcher::{Callback, KindState, Slab, WatcherId};

#[cfg(feature = "io-uring")]
use crate::uring::UringCtl;

/// `run` flags: a bitset of `{NOWAIT, ONCE}` (§6). The unset value is the
/// original's `DEFAULT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunFlags(u32);

impl RunFlags {
  pub const DEFAULT: RunFlags = RunFlags(0);
  /// Force the readiness wait's timeout to 0 regardless of pending timers.
  pub const NOWAIT: RunFlags = RunFlags(0x1);
  /// Run exactly one iteration regardless of refcount or break state.
  pub const ONCE: RunFlags = RunFlags(0x2);

  pub const fn contains(self, other: RunFlags) -> bool {
    self.0 & other.0 == other.0
  }
}

impl BitOr for RunFlags {
  type Output = RunFlags;
  fn bitor(self, rhs: RunFlags) -> RunFlags {
    RunFlags(self.0 | rhs.0)
  }
}

/// `break` state (§4.1). `ONE` unwinds the current `run`; `ALL` propagates
/// through nested runs and is never silently overwritten by a later `ONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakState {
  #[default]
  Cancel,
  One,
  All,
}

fn list_swap_remove(list: &mut Vec<WatcherId>, index: usize) -> Option<WatcherId> {
  if index >= list.len() {
    return None;
  }
  list.swap_remove(index);
  if index < list.len() {
    Some(list[index])
  } else {
    None
  }
}

/// Owns every subsystem of a single, single-threaded event loop (§3).
pub struct EventLoop {
  epoll_fd: RawFd,
  clock: ClockSource,
  now: u64,
  refcount: usize,
  break_state: BreakState,
  sigmask: libc::sigset_t,
  events: Vec<libc::epoll_event>,

  pub(crate) pending: PendingQueue,
  pub(crate) slab: Slab,
  pub(crate) fds: FdTable,
  pub(crate) timer: TimerHeap,

  pub(crate) idle_list: Vec<WatcherId>,
  pub(crate) prepare_list: Vec<WatcherId>,
  pub(crate) check_list: Vec<WatcherId>,
  pub(crate) cleanup_list: Vec<WatcherId>,
  pub(crate) async_list: Vec<WatcherId>,
  signal_watchers: HashMap<i32, Vec<WatcherId>>,
  signal_saved: HashMap<i32, libc::sigaction>,

  wake: Option<Arc<WakeState>>,
  wake_poll_id: Option<WatcherId>,

  userdata: Option<Box<dyn Any>>,

  #[cfg(feature = "io-uring")]
  pub(crate) uring: Option<UringCtl>,
}

impl EventLoop {
  /// `loop_new(flags)`. The only fallible constructor in the crate (§10.1).
  pub fn new(config: LoopConfig) -> Result<Self, NewLoopError> {
    let epoll_fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
    let now = time::clock_gettime_ns(config.clock.clockid())?;

    let mut sigmask: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
      libc::sigemptyset(&mut sigmask);
      libc::sigaddset(&mut sigmask, libc::SIGPROF);
    }

    #[cfg(feature = "io-uring")]
    let uring = if config.uring {
      match UringCtl::try_new() {
        Ok(ctl) => Some(ctl),
        Err(_err) => {
          #[cfg(feature = "log")]
          log::warn!("io_uring batched-ctl backend unavailable, falling back to synchronous epoll_ctl: {_err}");
          None
        }
      }
    } else {
      None
    };
    #[cfg(not(feature = "io-uring"))]
    if config.uring {
      #[cfg(feature = "log")]
      log::warn!("uring requested but this build lacks the io-uring feature; using the synchronous epoll_ctl backend");
    }

    Ok(EventLoop {
      epoll_fd,
      clock: config.clock,
      now,
      refcount: 0,
      break_state: BreakState::Cancel,
      sigmask,
      events: vec![unsafe { std::mem::zeroed() }; config.initial_events.max(1)],
      pending: PendingQueue::new(),
      slab: Slab::new(),
      fds: FdTable::new(),
      timer: TimerHeap::new(),
      idle_list: Vec::new(),
      prepare_list: Vec::new(),
      check_list: Vec::new(),
      cleanup_list: Vec::new(),
      async_list: Vec::new(),
      signal_watchers: HashMap::new(),
      signal_saved: HashMap::new(),
      wake: None,
      wake_poll_id: None,
      userdata: None,
      #[cfg(feature = "io-uring")]
      uring,
    })
  }

  pub(crate) fn backend_fd(&self) -> RawFd {
    self.epoll_fd
  }

  /// `get_time(loop)`: the cached monotonic timestamp as of the last
  /// `update_time` call (nanoseconds).
  pub fn time(&self) -> u64 {
    self.now
  }

  /// `update_time(loop)`: refreshes the cached timestamp from the clock.
  pub fn update_time(&mut self) -> u64 {
    self.now = time::clock_gettime_ns(self.clock.clockid()).unwrap_or(self.now);
    self.now
  }

  pub fn add_ref(&mut self) {
    self.refcount += 1;
  }

  pub fn unref(&mut self) {
    self.refcount = self.refcount.saturating_sub(1);
  }

  pub fn refcount(&self) -> usize {
    self.refcount
  }

  pub fn set_userdata<T: 'static>(&mut self, data: T) {
    self.userdata = Some(Box::new(data));
  }

  pub fn userdata<T: 'static>(&self) -> Option<&T> {
    self.userdata.as_ref()?.downcast_ref()
  }

  pub fn userdata_mut<T: 'static>(&mut self) -> Option<&mut T> {
    self.userdata.as_mut()?.downcast_mut()
  }

  pub fn break_loop(&mut self, state: BreakState) {
    self.break_state = match (self.break_state, state) {
      (BreakState::All, BreakState::One) => BreakState::All,
      _ => state,
    };
  }

  pub fn break_state(&self) -> BreakState {
    self.break_state
  }

  // -- event injection (§6) --

  pub fn feed_event(&mut self, id: WatcherId, mask: Mask) {
    pending::feed_event(self, id, mask);
  }

  pub fn feed_fd_event(&mut self, fd: RawFd, mask: Mask) {
    fds::queue_fd_events(self, fd, mask);
  }

  pub fn feed_fd_error(&mut self, fd: RawFd) {
    fds::queue_fd_errors(self, fd);
  }

  pub fn feed_signal(&mut self, signum: i32) {
    let Some(watchers) = self.signal_watchers.get(&signum).cloned() else { return };
    for id in watchers {
      pending::feed_event(self, id, Mask::SIGNAL);
    }
  }

  pub fn invoke_pending(&mut self) {
    pending::invoke_pending(self);
  }

  pub fn clear_pending(&mut self, id: WatcherId) {
    pending::clear_pending(self, id);
  }

  pub fn pending_count(&self) -> usize {
    pending::pending_count(self)
  }

  // -- poll watchers --

  pub fn poll_start(&mut self, fd: RawFd, emask: Mask, callback: Callback) -> WatcherId {
    fds::poll_start(self, fd, emask, callback)
  }

  pub fn poll_stop(&mut self, id: WatcherId) {
    fds::poll_stop(self, id)
  }

  pub fn poll_change(&mut self, id: WatcherId, fd: RawFd, emask: Mask, callback_for_restart: Option<Callback>) -> Option<WatcherId> {
    fds::poll_change(self, id, fd, emask, callback_for_restart)
  }

  pub fn get_fd(&self, id: WatcherId) -> Option<RawFd> {
    match self.slab.get(id)?.kind {
      KindState::Poll { fd, .. } => Some(fd),
      _ => None,
    }
  }

  pub fn get_events(&self, id: WatcherId) -> Option<Mask> {
    match self.slab.get(id)?.kind {
      KindState::Poll { emask, .. } => Some(emask),
      _ => None,
    }
  }

  // -- timers --

  pub fn timer_start(&mut self, after_ns: u64, repeat_ns: u64, callback: Callback) -> Option<WatcherId> {
    timer::start(self, after_ns, repeat_ns, callback)
  }

  pub fn timer_stop(&mut self, id: WatcherId) {
    timer::stop(self, id)
  }

  pub fn timer_again(&mut self, id: WatcherId, callback_if_restart: Option<Callback>) {
    timer::again(self, id, callback_if_restart)
  }

  pub fn timer_remaining(&self, id: WatcherId) -> u64 {
    timer::remaining(self, id)
  }

  // -- once --

  pub fn once_start(&mut self, fd: Option<(RawFd, Mask)>, timeout_ns: Option<u64>, callback: Callback) -> Option<WatcherId> {
    once::start(self, fd, timeout_ns, callback)
  }

  pub fn once_stop(&mut self, id: WatcherId) {
    once::stop(self, id)
  }

  // -- async --

  pub fn async_start(&mut self, callback: Callback) -> (WatcherId, AsyncSender) {
    async_watcher::start(self, callback)
  }

  pub fn async_stop(&mut self, id: WatcherId) {
    async_watcher::stop(self, id)
  }

  // -- signals --

  pub fn signal_start(&mut self, signum: i32, callback: Callback) -> WatcherId {
    let wake = self.ensure_wake_installed().expect("failed to install wake descriptor");
    let list = self.signal_watchers.entry(signum).or_default();
    let is_first = list.is_empty();
    let list_index = list.len();
    let id = self.slab.insert(callback, KindState::Signal { signum, list_index });
    self.signal_watchers.get_mut(&signum).unwrap().push(id);
    self.refcount += 1;
    if is_first {
      let saved = signal::bind(signum, Arc::as_ptr(&wake));
      self.signal_saved.insert(signum, saved);
    }
    id
  }

  pub fn signal_stop(&mut self, id: WatcherId) {
    let Some(slot) = self.slab.get(id) else { return };
    let (signum, index) = match slot.kind {
      KindState::Signal { signum, list_index } => (signum, list_index),
      _ => return,
    };
    pending::clear_pending(self, id);
    if let Some(list) = self.signal_watchers.get_mut(&signum) {
      if let Some(moved) = list_swap_remove(list, index) {
        if let Some(slot) = self.slab.get_mut(moved) {
          if let KindState::Signal { list_index, .. } = &mut slot.kind {
            *list_index = index;
          }
        }
      }
    }
    self.slab.remove(id);
    self.refcount -= 1;
    let now_empty = self.signal_watchers.get(&signum).is_none_or(|l| l.is_empty());
    if now_empty {
      self.signal_watchers.remove(&signum);
      if let Some(saved) = self.signal_saved.remove(&signum) {
        signal::unbind(signum, saved);
      }
    }
  }

  // -- idle / prepare / check (identical shape; cleanup below omits refcount) --

  pub fn idle_start(&mut self, callback: Callback) -> WatcherId {
    let index = self.idle_list.len();
    let id = self.slab.insert(callback, KindState::Idle { list_index: index });
    self.idle_list.push(id);
    self.refcount += 1;
    id
  }

  pub fn idle_stop(&mut self, id: WatcherId) {
    let Some(slot) = self.slab.get(id) else { return };
    let index = match slot.kind {
      KindState::Idle { list_index } => list_index,
      _ => return,
    };
    pending::clear_pending(self, id);
    if let Some(moved) = list_swap_remove(&mut self.idle_list, index) {
      if let Some(slot) = self.slab.get_mut(moved) {
        if let KindState::Idle { list_index } = &mut slot.kind {
          *list_index = index;
        }
      }
    }
    self.slab.remove(id);
    self.refcount -= 1;
  }

  pub fn prepare_start(&mut self, callback: Callback) -> WatcherId {
    let index = self.prepare_list.len();
    let id = self.slab.insert(callback, KindState::Prepare { list_index: index });
    self.prepare_list.push(id);
    self.refcount += 1;
    id
  }

  pub fn prepare_stop(&mut self, id: WatcherId) {
    let Some(slot) = self.slab.get(id) else { return };
    let index = match slot.kind {
      KindState::Prepare { list_index } => list_index,
      _ => return,
    };
    pending::clear_pending(self, id);
    if let Some(moved) = list_swap_remove(&mut self.prepare_list, index) {
      if let Some(slot) = self.slab.get_mut(moved) {
        if let KindState::Prepare { list_index } = &mut slot.kind {
          *list_index = index;
        }
      }
    }
    self.slab.remove(id);
    self.refcount -= 1;
  }

  pub fn check_start(&mut self, callback: Callback) -> WatcherId {
    let index = self.check_list.len();
    let id = self.slab.insert(callback, KindState::Check { list_index: index });
    self.check_list.push(id);
    self.refcount += 1;
    id
  }

  pub fn check_stop(&mut self, id: WatcherId) {
    let Some(slot) = self.slab.get(id) else { return };
    let index = match slot.kind {
      KindState::Check { list_index } => list_index,
      _ => return,
    };
    pending::clear_pending(self, id);
    if let Some(moved) = list_swap_remove(&mut self.check_list, index) {
      if let Some(slot) = self.slab.get_mut(moved) {
        if let KindState::Check { list_index } = &mut slot.kind {
          *list_index = index;
        }
      }
    }
    self.slab.remove(id);
    self.refcount -= 1;
  }

  /// Cleanup watchers do not hold a reference (§8 "Refcount... except
  /// cleanup, and except the internal wake-watcher").
  pub fn cleanup_start(&mut self, callback: Callback) -> WatcherId {
    let index = self.cleanup_list.len();
    let id = self.slab.insert(callback, KindState::Cleanup { list_index: index });
    self.cleanup_list.push(id);
    id
  }

  pub fn cleanup_stop(&mut self, id: WatcherId) {
    let Some(slot) = self.slab.get(id) else { return };
    let index = match slot.kind {
      KindState::Cleanup { list_index } => list_index,
      _ => return,
    };
    pending::clear_pending(self, id);
    if let Some(moved) = list_swap_remove(&mut self.cleanup_list, index) {
      if let Some(slot) = self.slab.get_mut(moved) {
        if let KindState::Cleanup { list_index } = &mut slot.kind {
          *list_index = index;
        }
      }
    }
    self.slab.remove(id);
  }

  /// Lazily installs the wake eventfd as an internal, edge-triggered READ
  /// poll watcher the first time a signal or async watcher is started
  /// (§4.4). Internal: doesn't contribute to the public refcount.
  pub(crate) fn ensure_wake_installed(&mut self) -> io::Result<Arc<WakeState>> {
    if let Some(w) = &self.wake {
      return Ok(w.clone());
    }
    let wake = Arc::new(WakeState::new()?);
    let fd = wake.fd();
    let wake_for_cb = wake.clone();
    let id = fds::poll_start(
      self,
      fd,
      Mask::READ | Mask::POLLET,
      Box::new(move |lp, _id, _mask| {
        wake_for_cb.drain();
        wake_for_cb.event_pending.store(false, Ordering::Release);
        // Reset the per-source write-gating flags before processing so a
        // send racing with this drain re-arms a future notify rather than
        // being silently absorbed by an already-true CAS gate.
        wake_for_cb.async_pending.store(false, Ordering::Release);
        wake_for_cb.signal_pending.store(false, Ordering::Release);
        process_wake(lp);
      }),
    );
    self.refcount -= 1;
    self.wake_poll_id = Some(id);
    self.wake = Some(wake.clone());
    Ok(wake)
  }

  fn compute_timeout(&self) -> i32 {
    let event_pending = self.wake.as_ref().map(|w| w.event_pending.load(Ordering::Acquire)).unwrap_or(false);
    if self.refcount == 0 || !self.idle_list.is_empty() || event_pending {
      return 0;
    }
    match self.timer.next_deadline() {
      None => -1,
      Some(deadline) => {
        if deadline <= self.now {
          0
        } else {
          time::ns_to_timeout_ms(deadline - self.now)
        }
      }
    }
  }

  fn wait(&mut self, timeout_ms: i32) -> usize {
    loop {
      let res = unsafe {
        libc::epoll_pwait(
          self.epoll_fd,
          self.events.as_mut_ptr(),
          self.events.len() as i32,
          timeout_ms,
          &self.sigmask,
        )
      };
      if res >= 0 {
        let n = res as usize;
        if n == self.events.len() && self.events.len() < crate::config::MAX_EVENTS {
          let new_len = (self.events.len() * 2).min(crate::config::MAX_EVENTS);
          self.events.resize(new_len, unsafe { std::mem::zeroed() });
        }
        return n;
      }
      let err = io::Error::last_os_error();
      if err.raw_os_error() == Some(libc::EINTR) {
        continue;
      }
      panic!("epoll_pwait failed unrecoverably: {err}");
    }
  }

  /// `run(loop, flags)`: drives the iteration order of §4.1 until break or
  /// exhaustion, returning the remaining refcount (0 if `BreakState::All`
  /// was set).
  pub fn run(&mut self, flags: RunFlags) -> usize {
    if self.break_state == BreakState::All {
      return 0;
    }

    let saved_break = self.break_state;
    self.break_state = BreakState::Cancel;

    loop {
      // 1. prepare
      if !self.prepare_list.is_empty() {
        let ids = self.prepare_list.clone();
        for id in ids {
          pending::feed_event(self, id, Mask::PREPARE);
        }
        pending::invoke_pending(self);
      }

      // 2.
      if self.break_state != BreakState::Cancel {
        break;
      }

      // 3.
      fds::flush_fd_changes(self);

      // 4.
      self.update_time();

      // 5.
      if let Some(wake) = &self.wake {
        wake.eventfd_allow.store(true, Ordering::SeqCst);
      }

      // 6.
      let timeout_ms = if flags.contains(RunFlags::NOWAIT) { 0 } else { self.compute_timeout() };

      // 7.
      let n = self.wait(timeout_ms);

      // 8.
      if let Some(wake) = &self.wake {
        wake.eventfd_allow.store(false, Ordering::Relaxed);
      }

      // 9.
      let event_pending = self.wake.as_ref().map(|w| w.event_pending.load(Ordering::Acquire)).unwrap_or(false);
      if event_pending {
        if let Some(id) = self.wake_poll_id {
          pending::feed_event(self, id, Mask::READ);
        }
      }
      for i in 0..n {
        let ev = self.events[i];
        fds::handle_epoll_event(self, ev.u64, ev.events);
      }

      // 10.
      self.update_time();
      timer::update(self);

      // 11.
      if !self.idle_list.is_empty() && self.pending.is_active_empty() {
        let ids = self.idle_list.clone();
        for id in ids {
          pending::feed_event(self, id, Mask::IDLE);
        }
      }

      // 12.
      pending::invoke_pending(self);
      timer::reap_expired(self);

      // 13.
      if !self.check_list.is_empty() {
        let ids = self.check_list.clone();
        for id in ids {
          pending::feed_event(self, id, Mask::CHECK);
        }
        pending::invoke_pending(self);
      }

      // 14.
      if flags.contains(RunFlags::ONCE) {
        break;
      }
      if self.refcount == 0 || self.break_state != BreakState::Cancel {
        break;
      }
    }

    match self.break_state {
      BreakState::All => 0,
      BreakState::One => {
        self.break_state = saved_break;
        self.refcount
      }
      BreakState::Cancel => self.refcount,
    }
  }
}

fn process_wake(lp: &mut EventLoop) {
  async_watcher::process_pending(lp);
  process_signals(lp);
}

fn process_signals(lp: &mut EventLoop) {
  let signums: Vec<i32> = lp.signal_watchers.keys().copied().collect();
  for signum in signums {
    if signal::take_pending(signum) {
      if let Some(watchers) = lp.signal_watchers.get(&signum).cloned() {
        for id in watchers {
          pending::feed_event(lp, id, Mask::SIGNAL);
        }
      }
    }
  }
}

impl Drop for EventLoop {
  /// `loop_free`: invokes every active cleanup watcher before releasing
  /// resources (§3).
  fn drop(&mut self) {
    if !self.cleanup_list.is_empty() {
      let ids = self.cleanup_list.clone();
      for id in ids {
        pending::feed_event(self, id, Mask::CLEANUP);
      }
      pending::invoke_pending(self);
    }
    let signums: Vec<i32> = self.signal_saved.keys().copied().collect();
    for signum in signums {
      if let Some(saved) = self.signal_saved.remove(&signum) {
        signal::unbind(signum, saved);
      }
    }
    unsafe {
      libc::close(self.epoll_fd);
    }
  }
}
