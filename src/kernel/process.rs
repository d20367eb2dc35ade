//! Process lifecycle primitives: subreaper registration, parent-death signal,
//! process-group isolation, and group teardown.

use crate::config::types::{Result, StartupError};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Register the current process as child subreaper.
///
/// Orphaned descendants are re-parented to us instead of the real init, so
/// the supervisor can reap them when it is not PID 1.
pub fn set_child_subreaper() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        nix::sys::prctl::set_child_subreaper(true).map_err(|e| {
            StartupError::Process(format!("Failed to register as child subreaper: {}", e))
        })?;
        log::debug!("Registered as child subreaper");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(StartupError::Process(
            "child subreaper is only supported on Linux".to_string(),
        ))
    }
}

/// Whether the supervisor runs as PID 1 of its pid namespace
pub fn is_pid1() -> bool {
    std::process::id() == 1
}

/// Ask the kernel to SIGKILL the calling child when its parent dies.
///
/// Must be called in the child after fork. Async-signal-safe.
pub fn set_parent_death_signal() -> std::result::Result<(), nix::errno::Errno> {
    #[cfg(target_os = "linux")]
    {
        nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL)
    }

    #[cfg(not(target_os = "linux"))]
    {
        Ok(())
    }
}

/// Put the calling child in its own process group and, when stdin is a
/// terminal, make that group the terminal's foreground group.
///
/// Async-signal-safe. A stdin that is not a terminal is not an error.
pub fn isolate_process_group() -> std::result::Result<(), nix::errno::Errno> {
    nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))?;

    let rc = unsafe { libc::tcsetpgrp(libc::STDIN_FILENO, libc::getpgrp()) };
    if rc != 0 {
        match nix::errno::Errno::last() {
            nix::errno::Errno::ENOTTY | nix::errno::Errno::ENXIO | nix::errno::Errno::EBADF => {}
            e => return Err(e),
        }
    }
    Ok(())
}

/// Signal escalation report for group teardown
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// SIGTERM the workload's process group, wait `grace`, then SIGKILL it.
///
/// Falls back to signalling the leader alone when the group is gone.
pub fn terminate_process_group(leader: Pid, grace: Duration) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();

    let term_rc = unsafe { libc::kill(-leader.as_raw(), libc::SIGTERM) };
    if term_rc == 0 {
        report.term_sent = true;
    } else {
        let _ = unsafe { libc::kill(leader.as_raw(), libc::SIGTERM) };
        report.term_sent = true;
        report.notes.push(format!(
            "group SIGTERM fallback used: {}",
            std::io::Error::last_os_error()
        ));
    }

    std::thread::sleep(grace);

    let kill_rc = unsafe { libc::kill(-leader.as_raw(), libc::SIGKILL) };
    if kill_rc == 0 {
        report.kill_sent = true;
    } else {
        // ESRCH here means everything already exited on SIGTERM
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            let _ = unsafe { libc::kill(leader.as_raw(), libc::SIGKILL) };
            report.kill_sent = true;
            report
                .notes
                .push(format!("group SIGKILL fallback used: {}", err));
        }
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_pid1_outside_container_init() {
        // The test harness is never PID 1
        assert!(!is_pid1());
    }

    #[test]
    fn test_terminate_missing_group_reports_fallback() {
        let gone = Pid::from_raw(i32::MAX - 1);
        let report = terminate_process_group(gone, Duration::from_millis(1));
        assert!(report.term_sent);
        assert!(!report.notes.is_empty());
    }

    #[test]
    fn test_terminate_live_group() {
        use std::os::unix::process::CommandExt;
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .expect("spawn sleep");
        let pid = Pid::from_raw(child.id() as i32);

        let report = terminate_process_group(pid, Duration::from_millis(20));
        assert!(report.term_sent);

        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
