//! # evio
//!
//! A Linux event loop: epoll-backed I/O multiplexing, a timer min-heap,
//! POSIX signal delivery, and cross-thread wake-ups, driven by a single
//! fixed iteration order.
//!
//! A client builds an [`EventLoop`], registers watchers on it (poll, timer,
//! signal, async, and the list-style idle/prepare/check/cleanup/once
//! categories), and calls [`EventLoop::run`]. Callbacks fire from `run` on
//! the thread that called it — the only thread-safe entrypoints are
//! [`async_watcher::AsyncSender::send`] and the installed POSIX signal
//! handler.
//!
//! ```no_run
//! use evio::{BreakState, EventLoop, LoopConfig, Mask};
//!
//! let mut lp = EventLoop::new(LoopConfig::default()).unwrap();
//! let (r, _w) = unsafe {
//!     let mut fds = [0; 2];
//!     libc::pipe(fds.as_mut_ptr());
//!     (fds[0], fds[1])
//! };
//! lp.poll_start(r, Mask::READ, Box::new(|lp, _id, mask| {
//!     if mask.contains(Mask::READ) {
//!         lp.break_loop(BreakState::One);
//!     }
//! }));
//! lp.run(Default::default());
//! ```
//!
//! Every operation besides [`EventLoop::new`] is infallible from the
//! caller's point of view: preconditions are enforced by assertion, and
//! recoverable OS-level errors surface as the `ERROR` bit in a delivered
//! [`Mask`] rather than as a `Result`.

#[macro_use]
mod macros;

mod async_watcher;
mod config;
mod error;
mod event_loop;
mod fds;
mod mask;
mod once;
mod pending;
mod signal;
mod time;
mod timer;
#[cfg(feature = "io-uring")]
mod uring;
mod wake;
mod watcher;

pub use async_watcher::AsyncSender;
pub use config::LoopConfig;
pub use error::NewLoopError;
pub use event_loop::{BreakState, EventLoop, RunFlags};
pub use mask::Mask;
pub use time::ClockSource;
pub use watcher::{Callback, WatcherId};
