//! Process table queries used by the lock manager and log cleanup.

/// PID of the running process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Check if a process with the given PID is running
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    // PIDs that don't fit in pid_t would turn into process-group or broadcast
    // targets for kill(2)
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // kill with signal 0 only probes: 0 means alive, EPERM means alive but owned
    // by another user, ESRCH means gone
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    errno == libc::EPERM
}

#[cfg(windows)]
pub fn is_process_running(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    if pid == 0 {
        return false;
    }
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut exit_code: u32 = 0;
        let result = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle);
        result != 0 && exit_code == STILL_ACTIVE as u32
    }
}

#[cfg(not(any(unix, windows)))]
pub fn is_process_running(_pid: u32) -> bool {
    // Without a process table every lock looks stale
    false
}

/// Find a PID that no process currently uses.
///
/// Searches downward from a high value; used by tests that need a dead owner.
pub fn find_unused_pid() -> Option<u32> {
    (100_000..999_999u32)
        .rev()
        .find(|pid| !is_process_running(*pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(current_pid()));
    }

    #[test]
    fn test_pid_zero_is_never_running() {
        assert!(!is_process_running(0));
    }

    #[test]
    fn test_unused_pid_is_not_running() {
        let pid = find_unused_pid().expect("some high pid should be free");
        assert!(!is_process_running(pid));
    }
}
