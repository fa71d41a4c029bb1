use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cross-thread/signal-safe wake state shared by a loop and any
/// [`AsyncSender`](crate::async_watcher::AsyncSender) handles or signal
/// bindings derived from it.
///
/// This is installed lazily (see §4.4): the first time a signal or async
/// watcher is started, the loop creates one of these, wraps it in an `Arc`,
/// and registers the eventfd as an internal, edge-triggered READ poll
/// watcher that does not contribute to the public refcount.
pub(crate) struct WakeState {
  eventfd: RawFd,
  /// Flipped to `true` with `SeqCst` immediately before the loop blocks in
  /// the readiness wait, and back to `false` with `SeqCst` immediately
  /// after — the exact window in which a sender-side write is guaranteed not
  /// to race with loop teardown.
  pub(crate) eventfd_allow: AtomicBool,
  pub(crate) event_pending: AtomicBool,
  pub(crate) async_pending: AtomicBool,
  pub(crate) signal_pending: AtomicBool,
}

impl WakeState {
  pub(crate) fn new() -> io::Result<Self> {
    let fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;
    Ok(WakeState {
      eventfd: fd,
      eventfd_allow: AtomicBool::new(false),
      event_pending: AtomicBool::new(false),
      async_pending: AtomicBool::new(false),
      signal_pending: AtomicBool::new(false),
    })
  }

  pub(crate) fn fd(&self) -> RawFd {
    self.eventfd
  }

  /// Writes one unit to the counting semaphore. Async-signal-safe: a single
  /// `write(2)` syscall, nothing else — this is reachable from the installed
  /// POSIX signal handler via `wake_signal`, so it must not allocate, log, or
  /// touch a mutex. Any failure (including `EAGAIN`, counter already
  /// saturated or no allowance) is silently swallowed rather than logged.
  pub(crate) fn notify(&self) {
    let one: u64 = 1;
    unsafe {
      libc::write(self.eventfd, &one as *const u64 as *const libc::c_void, 8);
    }
  }

  /// Drains the counting semaphore back to zero.
  pub(crate) fn drain(&self) {
    let mut buf: u64 = 0;
    loop {
      let res = unsafe {
        libc::read(self.eventfd, &mut buf as *mut u64 as *mut libc::c_void, 8)
      };
      if res == -1 {
        break;
      }
    }
  }

  /// Called from the sender side (`async_send`, the POSIX signal handler, or
  /// any other cross-thread/async-signal-safe waker). `flag` is the specific
  /// pending flag (`async_pending` or `signal_pending`) that gates whether a
  /// wake write is actually issued, avoiding redundant writes when one is
  /// already outstanding.
  fn wake_via(&self, flag: &AtomicBool) {
    self.event_pending.store(true, Ordering::Release);
    if flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
      && self.eventfd_allow.load(Ordering::SeqCst)
    {
      self.notify();
    }
  }

  pub(crate) fn wake_async(&self) {
    self.wake_via(&self.async_pending);
  }

  /// Signal-handler-safe variant of [`wake_async`](Self::wake_async): same
  /// two atomic stores plus at most one `write()`, callable from a POSIX
  /// signal handler context.
  pub(crate) fn wake_signal(&self) {
    self.wake_via(&self.signal_pending);
  }
}

impl Drop for WakeState {
  fn drop(&mut self) {
    unsafe {
      libc::close(self.eventfd);
    }
  }
}
