use std::fmt;
use std::io;

/// Failure to construct an [`EventLoop`](crate::EventLoop).
///
/// Every other operation in this crate is infallible from the caller's point of
/// view: preconditions are enforced by assertion (programming errors abort) and
/// recoverable OS-level errors are folded into the `ERROR` event mask bit instead
/// of being returned. Construction is the one place where resource exhaustion can
/// surface directly.
#[derive(Debug)]
pub enum NewLoopError {
  /// The readiness backend (`epoll_create1`) or the wake descriptor (`eventfd`)
  /// could not be created.
  Io(io::Error),
}

impl From<io::Error> for NewLoopError {
  fn from(err: io::Error) -> Self {
    NewLoopError::Io(err)
  }
}

impl std::error::Error for NewLoopError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      NewLoopError::Io(err) => Some(err),
    }
  }
}

impl fmt::Display for NewLoopError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NewLoopError::Io(err) => write!(f, "failed to construct event loop: {err}"),
    }
  }
}
