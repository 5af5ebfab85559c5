//! Linux-specific shared memory operations

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Create a new file-backed shared mapping of exactly `size` bytes.
///
/// Fails with `AlreadyExists` if the file is present and with `Allocation`
/// if the OS refuses to size or map it.
pub fn create_block_mmap(path: &str, name: &str, size: usize) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                ShmError::AlreadyExists {
                    name: name.to_string(),
                }
            } else {
                ShmError::Io { source: e }
            }
        })?;

    let allocation_error = |e: std::io::Error| ShmError::Allocation {
        size,
        reason: e.to_string(),
    };

    if let Err(e) = file.set_len(size as u64) {
        let _ = std::fs::remove_file(path);
        return Err(allocation_error(e));
    }

    // Populate so that a tmpfs short on pages fails here rather than with SIGBUS later.
    match unsafe { MmapOptions::new().len(size).populate().map_mut(&file) } {
        Ok(mmap) => Ok(mmap),
        Err(e) => {
            let _ = std::fs::remove_file(path);
            Err(allocation_error(e))
        }
    }
}

/// Attach to an existing block file
pub fn attach_block_mmap(path: &str, name: &str) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ShmError::NotFound {
                    name: name.to_string(),
                }
            } else {
                ShmError::Io { source: e }
            }
        })?;

    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(mmap)
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false, // No such process
        Err(nix::Error::EPERM) => true,  // Process exists but no permission to signal
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Block while `word == expected`, for at most `timeout`.
///
/// The word must live in shared memory; the wait is not process-private.
/// Returns on wake-up, timeout, signal or value mismatch: callers recheck.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: libc::time_t::try_from(d.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: d.subsec_nanos() as _,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);

    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Wake up to `count` processes blocked in [`futex_wait`] on `word`.
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32, count: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Polling fallback for platforms without futexes
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    use std::sync::atomic::Ordering;

    let slice = Duration::from_micros(200);
    let nap = timeout.map_or(slice, |t| t.min(slice));
    if word.load(Ordering::Acquire) == expected {
        std::thread::sleep(nap);
    }
}

/// Polling fallback for platforms without futexes
#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_word: &AtomicU32, _count: i32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(get_current_pid()));
    }

    #[test]
    fn test_futex_wait_times_out_when_value_unchanged() {
        let word = AtomicU32::new(7);
        let start = Instant::now();
        futex_wait(&word, 7, Some(Duration::from_millis(20)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_futex_wait_returns_on_mismatch() {
        let word = AtomicU32::new(1);
        let start = Instant::now();
        futex_wait(&word, 0, Some(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(word.load(Ordering::Relaxed), 1);
    }
}
