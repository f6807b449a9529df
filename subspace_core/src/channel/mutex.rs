//! Robust process-shared mutex embedded in the channel control block.
//!
//! Every CCB mutation happens under this lock. It is configured
//! `PTHREAD_PROCESS_SHARED` so any participant mapping the CCB can take it,
//! and `PTHREAD_MUTEX_ROBUST` so the death of a holder does not wedge the
//! channel: the next acquirer observes `EOWNERDEAD`, reconciles the dead
//! participant's footprint, and marks the mutex consistent.

use std::io;

use crate::error::Result;

/// The pthread mutex as it lives inside the CCB.
#[repr(C)]
pub struct ChannelLock {
    inner: libc::pthread_mutex_t,
}

/// Outcome of an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockState {
    /// Normal acquisition.
    Acquired,
    /// The previous holder died while holding the lock. The caller owns the
    /// lock but must reconcile shared state and call [`mark_consistent`]
    /// before unlocking.
    Inconsistent,
}

fn os_err(code: i32) -> crate::error::SubspaceError {
    io::Error::from_raw_os_error(code).into()
}

/// Initialize the mutex in place. Called once, by the allocating side,
/// before the CCB fd is handed to anyone else.
///
/// # Safety
/// `lock` must point to zeroed, writable memory inside the mapped CCB that
/// no other process is touching yet.
pub(crate) unsafe fn init(lock: *mut ChannelLock) -> Result<()> {
    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    let rc = libc::pthread_mutexattr_init(&mut attr);
    if rc != 0 {
        return Err(os_err(rc));
    }
    libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
    let rc = libc::pthread_mutex_init(&mut (*lock).inner, &attr);
    libc::pthread_mutexattr_destroy(&mut attr);
    if rc != 0 {
        return Err(os_err(rc));
    }
    Ok(())
}

/// Acquire the mutex, distinguishing a normal acquire from one that
/// inherited the lock from a dead holder.
///
/// # Safety
/// `lock` must point to a mutex previously set up by [`init`] in memory
/// mapped by this process.
pub(crate) unsafe fn lock(lock: *mut ChannelLock) -> Result<LockState> {
    match libc::pthread_mutex_lock(&mut (*lock).inner) {
        0 => Ok(LockState::Acquired),
        libc::EOWNERDEAD => Ok(LockState::Inconsistent),
        rc => Err(os_err(rc)),
    }
}

/// Mark the mutex consistent after dead-holder recovery.
///
/// # Safety
/// The caller must hold the lock and have acquired it in the
/// [`LockState::Inconsistent`] state.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) unsafe fn mark_consistent(lock: *mut ChannelLock) -> Result<()> {
    let rc = libc::pthread_mutex_consistent(&mut (*lock).inner);
    if rc != 0 {
        return Err(os_err(rc));
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) unsafe fn mark_consistent(_lock: *mut ChannelLock) -> Result<()> {
    Ok(())
}

/// Release the mutex.
///
/// # Safety
/// The caller must hold the lock.
pub(crate) unsafe fn unlock(lock: *mut ChannelLock) {
    let rc = libc::pthread_mutex_unlock(&mut (*lock).inner);
    debug_assert_eq!(rc, 0, "pthread_mutex_unlock failed: {}", rc);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Map a ChannelLock into MAP_SHARED anonymous memory so a forked child
    /// shares it with the parent.
    fn shared_lock() -> *mut ChannelLock {
        // SAFETY: anonymous shared mapping of sufficient size; checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                std::mem::size_of::<ChannelLock>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        ptr as *mut ChannelLock
    }

    #[test]
    fn lock_unlock_same_process() {
        let l = shared_lock();
        unsafe {
            init(l).unwrap();
            assert_eq!(lock(l).unwrap(), LockState::Acquired);
            unlock(l);
            assert_eq!(lock(l).unwrap(), LockState::Acquired);
            unlock(l);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn dead_holder_is_recovered() {
        let l = shared_lock();
        unsafe {
            init(l).unwrap();
        }

        // Child takes the lock and exits without releasing it.
        // SAFETY: the child only calls async-signal-safe functions before _exit.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            unsafe {
                let _ = lock(l);
                libc::_exit(0);
            }
        }

        let mut status = 0;
        // SAFETY: pid is our forked child.
        unsafe { libc::waitpid(pid, &mut status, 0) };

        unsafe {
            assert_eq!(lock(l).unwrap(), LockState::Inconsistent);
            mark_consistent(l).unwrap();
            unlock(l);
            // Lock is usable again after recovery.
            assert_eq!(lock(l).unwrap(), LockState::Acquired);
            unlock(l);
        }
    }
}
