//! Advisory locks on queue files.
//!
//! Delivery agents hold a shared or exclusive `flock(2)` lock while they work
//! on a queue file. Taking an exclusive lock without blocking tells the
//! scheduler whether a file left behind by a previous run is still in use.

use std::{fs::File, io, os::fd::AsRawFd};

/// Try to take an exclusive lock; `Ok(false)` means somebody else holds one.
///
/// The lock is released when the file is closed.
pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    // SAFETY: the descriptor is owned by `file` and stays open for the call
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Take a shared lock, waiting for any exclusive holder.
pub fn lock_shared(file: &File) -> io::Result<()> {
    // SAFETY: as above
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_exclusive_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        std::fs::write(&path, b"x").unwrap();

        let holder = File::open(&path).unwrap();
        assert!(try_lock_exclusive(&holder).unwrap());

        let other = File::open(&path).unwrap();
        assert!(!try_lock_exclusive(&other).unwrap());

        drop(holder);
        assert!(try_lock_exclusive(&other).unwrap());
    }
}
