use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::OnceLock;

use crate::wake::WakeState;

/// One more than the highest real-time signal number on Linux; large enough
/// to index by raw signal number directly.
const NSIG: usize = 65;

struct SignalSlot {
  status: AtomicBool,
  /// Raw pointer derived from `Arc::into_raw` on the owning loop's
  /// [`WakeState`]. Null means unbound. Read by the signal handler with a
  /// plain atomic load — no refcount traffic happens in handler context.
  wake: AtomicPtr<WakeState>,
}

impl SignalSlot {
  const fn new() -> Self {
    SignalSlot { status: AtomicBool::new(false), wake: AtomicPtr::new(std::ptr::null_mut()) }
  }
}

fn table() -> &'static [SignalSlot] {
  static TABLE: OnceLock<Vec<SignalSlot>> = OnceLock::new();
  TABLE.get_or_init(|| {
    let mut v = Vec::with_capacity(NSIG);
    for _ in 0..NSIG {
      v.push(SignalSlot::new());
    }
    v
  })
}

/// The installed handler for every signum this crate watches. Async-signal-
/// safe by construction: one atomic load, one atomic store, and (inside
/// `WakeState::wake_signal`) one more CAS plus at most one `write(2)`.
extern "C" fn dispatch(signum: c_int) {
  let idx = signum as usize;
  if idx >= NSIG {
    return;
  }
  let slot = &table()[idx];
  let ptr = slot.wake.load(Ordering::Acquire);
  if ptr.is_null() {
    return;
  }
  slot.status.store(true, Ordering::Release);
  // SAFETY: non-null only while a loop holds a live Arc<WakeState> pinned via
  // `bind`; `unbind` clears the pointer and restores the old action before
  // dropping its Arc reference.
  let wake: &WakeState = unsafe { &*ptr };
  wake.wake_signal();
}

/// Binds `signum` to `wake`, installing the async-signal-safe handler and
/// returning the previous `sigaction` so it can be restored later.
///
/// Fatal per §5: "registering two watchers with the same signum from
/// different loops aborts". Binding the same signum to the *same* wake is a
/// no-op success (multiple signal watchers on one loop share the binding).
pub(crate) fn bind(signum: i32, wake: *const WakeState) -> libc::sigaction {
  let idx = signum as usize;
  assert!(idx > 0 && idx < NSIG, "signal number out of range: {signum}");
  let slot = &table()[idx];

  let current = slot.wake.load(Ordering::Acquire);
  if !current.is_null() {
    assert!(
      std::ptr::eq(current, wake),
      "signal {signum} is already bound to a different loop"
    );
    // Already bound to this loop; the caller's per-signum watcher list
    // already reflects additional watchers, nothing more to install.
    let mut zeroed: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe {
      libc::sigaction(signum, std::ptr::null(), &mut zeroed);
    }
    return zeroed;
  }

  slot.wake.store(wake as *mut WakeState, Ordering::Release);

  let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
  sa.sa_sigaction = dispatch as usize;
  unsafe {
    libc::sigemptyset(&mut sa.sa_mask);
  }
  sa.sa_flags = libc::SA_RESTART;

  let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
  let res = unsafe { libc::sigaction(signum, &sa, &mut old) };
  assert!(res == 0, "sigaction({signum}) failed: {}", std::io::Error::last_os_error());

  #[cfg(feature = "log")]
  log::debug!("bound signal {signum}");

  old
}

/// Unbinds `signum`, restoring the saved prior action. Called when the last
/// watcher on a signum is stopped, or when the owning loop is freed.
pub(crate) fn unbind(signum: i32, old_action: libc::sigaction) {
  let idx = signum as usize;
  if idx == 0 || idx >= NSIG {
    return;
  }
  unsafe {
    libc::sigaction(signum, &old_action, std::ptr::null_mut());
  }
  table()[idx].wake.store(std::ptr::null_mut(), Ordering::Release);
  table()[idx].status.store(false, Ordering::Relaxed);

  #[cfg(feature = "log")]
  log::debug!("unbound signal {signum}");
}

/// Reads-and-clears the pending status for `signum`. Called only from the
/// loop thread while processing the wake path.
pub(crate) fn take_pending(signum: i32) -> bool {
  let idx = signum as usize;
  if idx == 0 || idx >= NSIG {
    return false;
  }
  table()[idx].status.swap(false, Ordering::Acquire)
}
