//! Fd-backed shared memory regions.
//!
//! The allocating side (the server) creates an anonymous memory object
//! (`memfd_create` on Linux, an unlinked POSIX shm object elsewhere) and
//! distributes duplicates of its file descriptor. Receivers map the fd they
//! were given. Nothing here has a name in any filesystem, so region
//! lifetime is exactly the lifetime of the descriptors.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Result, SubspaceError};

/// A mapped shared-memory region, read/write.
#[derive(Debug)]
pub struct ShmRegion {
    mmap: MmapMut,
    file: File,
    size: usize,
}

#[cfg(target_os = "linux")]
fn create_backing_fd(debug_name: &str) -> Result<OwnedFd> {
    let name = std::ffi::CString::new(debug_name.as_bytes())
        .map_err(|_| SubspaceError::invalid_input("region name contains a null byte"))?;
    // SAFETY: name is a valid null-terminated string; MFD_CLOEXEC is a valid flag.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: fd is a fresh descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn create_backing_fd(debug_name: &str) -> Result<OwnedFd> {
    // POSIX shm object, unlinked immediately so only the fd keeps it alive.
    let unique = format!(
        "/subspace_{}_{}_{}",
        debug_name,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    );
    let name = std::ffi::CString::new(unique)
        .map_err(|_| SubspaceError::invalid_input("region name contains a null byte"))?;
    // SAFETY: name is a valid null-terminated string; flags are valid POSIX constants.
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
            0o600,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: name is still a valid null-terminated string.
    unsafe { libc::shm_unlink(name.as_ptr()) };
    // SAFETY: fd is a fresh descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn dup_raw(fd: RawFd) -> Result<OwnedFd> {
    // SAFETY: fcntl with F_DUPFD_CLOEXEC on a caller-supplied fd; result checked.
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: dup is a fresh descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

impl ShmRegion {
    /// Allocate a new zero-filled region of `size` bytes. This is the
    /// server-side path; hand out descriptors with [`ShmRegion::dup_fd`].
    pub fn create(debug_name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SubspaceError::invalid_input("region size must be > 0"));
        }
        let fd = create_backing_fd(debug_name)?;
        let file = File::from(fd);
        file.set_len(size as u64)?;
        // SAFETY: file is a valid open descriptor whose length was just set to `size`.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        log::debug!("allocated shm region '{}' ({} bytes)", debug_name, size);
        Ok(Self { mmap, file, size })
    }

    /// Map a region from a received descriptor. The fd is duplicated; the
    /// caller keeps ownership of the one it passed in.
    pub fn from_fd(fd: RawFd, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SubspaceError::invalid_input("region size must be > 0"));
        }
        let file = File::from(dup_raw(fd)?);
        let len = file.metadata()?.len();
        if len < size as u64 {
            return Err(SubspaceError::memory(format!(
                "shared memory object too small: {} < {}",
                len, size
            )));
        }
        // SAFETY: file is a valid open descriptor at least `size` bytes long.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        Ok(Self { mmap, file, size })
    }

    /// Duplicate the backing descriptor for transfer to another participant.
    pub fn dup_fd(&self) -> Result<OwnedFd> {
        dup_raw(self.file.as_raw_fd())
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

// SAFETY: the region is plain OS shared memory with no thread-local state;
// concurrent access is serialized by the channel mutex (or is lock-free by
// design, for the SCB).
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}
