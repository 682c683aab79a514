/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Readiness polling on a single descriptor

use std::io;
use std::os::unix::io::BorrowedFd;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::debug;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn poll_events() -> PollFlags {
    PollFlags::POLLIN | PollFlags::POLLPRI | PollFlags::from_bits_retain(libc::POLLRDHUP)
}
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn poll_events() -> PollFlags {
    PollFlags::POLLIN | PollFlags::POLLPRI
}

/// Outcome of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Data is available or the peer hung up.
    Ready,
    TimedOut,
}

/// Wait for `fd` to become readable or hung up.
///
/// A negative `timeout_ms` blocks indefinitely and zero returns immediately.
/// Interrupted waits are restarted.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout_ms: i32) -> io::Result<Readiness> {
    let timeout = PollTimeout::try_from(timeout_ms.max(-1))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let mut fds = [PollFd::new(fd, poll_events())];

    loop {
        match poll(&mut fds, timeout) {
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                debug!("poll produced error: {}", errno);
                return Err(errno.into());
            }
            Ok(0) => {
                debug!("poll timed out after {} milliseconds", timeout_ms);
                return Ok(Readiness::TimedOut);
            }
            Ok(ready) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.contains(PollFlags::POLLNVAL) {
                    return Err(Errno::EBADF.into());
                }
                debug!(
                    pollin = revents.contains(PollFlags::POLLIN),
                    pollpri = revents.contains(PollFlags::POLLPRI),
                    hangup = revents.contains(PollFlags::POLLHUP),
                    "poll has {} fds ready",
                    ready
                );
                return Ok(Readiness::Ready);
            }
        }
    }
}
