use std::{io, os::unix::io::AsRawFd};

use tokio::io::unix::AsyncFd;

/// Register an owned descriptor with the tokio reactor.
///
/// Must be called from within a tokio runtime.
pub(crate) fn register<T: AsRawFd>(inner: T) -> io::Result<AsyncFd<T>> {
    // SAFETY: callers pass values owning their descriptor, which stays open
    // and keeps its number until the value is dropped.
    Ok(unsafe { AsyncFd::register(inner) }?)
}
