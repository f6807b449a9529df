//! Pipe-based edge notifiers.
//!
//! The server gives every participant a pipe: publishers are woken when
//! slots free up, subscribers when new messages arrive. A notification is a
//! single byte written to the pipe; the byte value carries no meaning. The
//! write side is held by whoever needs to do the waking (a publisher holds
//! its subscribers' triggers, a subscriber holds its reliable publishers'),
//! the read side by the participant being woken.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{Result, SubspaceError};

/// Write side of a notifier. Fires a one-byte wakeup.
#[derive(Debug)]
pub struct Trigger {
    fd: OwnedFd,
}

/// Read side of a notifier. Waited on with `poll`, drained with `clear`.
#[derive(Debug)]
pub struct PollFd {
    fd: OwnedFd,
}

/// Create a connected (write, read) notifier pair backed by a non-blocking
/// pipe. This is the server-side path; the two ends are distributed to
/// different participants.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn notifier_pair() -> Result<(Trigger, PollFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds is a valid out-array of two ints.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: both descriptors are fresh and owned by us.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((Trigger { fd: write }, PollFd { fd: read }))
}

/// Portable fallback: plain `pipe` plus fcntl flags.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn notifier_pair() -> Result<(Trigger, PollFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds is a valid out-array of two ints.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: both descriptors are fresh and owned by us.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [read.as_raw_fd(), write.as_raw_fd()] {
        // SAFETY: fd is a valid open descriptor.
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    Ok((Trigger { fd: write }, PollFd { fd: read }))
}

impl Trigger {
    /// Wrap a received write-side descriptor. Duplicates it; the caller
    /// keeps ownership of the fd it passed in.
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        Ok(Self { fd: dup(fd)? })
    }

    /// Fire the notifier. A full pipe means the peer is already signalled,
    /// so EAGAIN is silently fine.
    pub fn fire(&self) {
        let buf = [1u8];
        // SAFETY: fd is a valid open descriptor, buf a valid one-byte buffer.
        let rc = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                log::warn!("trigger write failed: {}", err);
            }
        }
    }

    /// Duplicate this trigger for another holder.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            fd: dup(self.fd.as_raw_fd())?,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl PollFd {
    /// Wrap a received read-side descriptor. Duplicates it; the caller
    /// keeps ownership of the fd it passed in.
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        Ok(Self { fd: dup(fd)? })
    }

    /// Block until the notifier fires, or until `timeout_ms` elapses.
    /// `None` waits forever. Returns `Timeout` on expiry.
    pub fn wait(&self, timeout_ms: Option<i32>) -> Result<()> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for one open descriptor.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms.unwrap_or(-1)) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if rc == 0 {
            return Err(SubspaceError::Timeout("poll fd never became readable".into()));
        }
        Ok(())
    }

    /// Drain any pending notification bytes so the next `wait` blocks until
    /// a fresh trigger.
    pub fn clear(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: fd is a valid open non-blocking descriptor, buf a valid buffer.
            let rc = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rc <= 0 {
                break;
            }
        }
    }

    /// Raw descriptor, for callers that integrate the wait into their own
    /// poll loop or cooperative scheduler.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn dup(fd: RawFd) -> Result<OwnedFd> {
    // SAFETY: fcntl with F_DUPFD_CLOEXEC on a caller-supplied fd; result checked.
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: dup is a fresh descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}
