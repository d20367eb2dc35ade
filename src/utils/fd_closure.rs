/// Descriptor hygiene for the workload.
///
/// Descriptors are marked close-on-exec in the supervisor before fork, so the
/// child never has to walk `/proc` (not async-signal-safe) and the supervisor
/// keeps using its own descriptors.
use crate::config::types::{Result, StartupError};
use std::fs;

/// Mark every descriptor above stderr close-on-exec
pub fn mark_inherited_fds_cloexec() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        // close_range with CLOSE_RANGE_CLOEXEC (Linux 5.11+)
        if try_close_range_cloexec() {
            log::debug!("Marked inherited FDs close-on-exec using close_range");
            return Ok(());
        }
    }

    mark_fds_via_proc()
}

#[cfg(target_os = "linux")]
fn try_close_range_cloexec() -> bool {
    use std::os::raw::c_int;

    const CLOSE_RANGE_CLOEXEC: c_int = 1 << 2;

    let result = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            3 as c_int,
            !0 as c_int,
            CLOSE_RANGE_CLOEXEC,
        )
    };
    result == 0
}

fn mark_fds_via_proc() -> Result<()> {
    let mut marked = 0;
    let mut failed = Vec::new();

    for fd in get_open_fds()? {
        if fd <= 2 {
            continue;
        }
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            // The descriptor used to read /proc/self/fd is already gone
            continue;
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
            failed.push((fd, std::io::Error::last_os_error()));
        } else {
            marked += 1;
        }
    }

    if !failed.is_empty() {
        let error_msg = failed
            .iter()
            .map(|(fd, err)| format!("fd {}: {}", fd, err))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(StartupError::Process(format!(
            "Failed to mark {} FD(s) close-on-exec: {}",
            failed.len(),
            error_msg
        )));
    }

    log::debug!("Marked {} inherited FDs close-on-exec via /proc/self/fd", marked);
    Ok(())
}

/// Get list of open file descriptors
pub fn get_open_fds() -> Result<Vec<i32>> {
    let fd_dir = "/proc/self/fd";

    let entries = fs::read_dir(fd_dir)
        .map_err(|e| StartupError::Process(format!("Failed to read {}: {}", fd_dir, e)))?;

    let mut fds = Vec::new();
    for entry in entries.flatten() {
        if let Ok(file_name) = entry.file_name().into_string() {
            if let Ok(fd) = file_name.parse::<i32>() {
                fds.push(fd);
            }
        }
    }

    fds.sort();
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_open_fds() {
        let fds = get_open_fds().unwrap();
        assert!(fds.len() >= 3);
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }

    #[test]
    fn test_proc_fallback_marks_cloexec() {
        use std::os::fd::AsRawFd;

        // Files opened by std are already CLOEXEC; clear the flag first
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };

        mark_fds_via_proc().unwrap();

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }
}
