/// Signal plumbing for the PID-1 supervisor.
///
/// The supervisor never installs asynchronous handlers for forwarded signals.
/// It blocks them and collects them synchronously with `sigtimedwait`, so the
/// main loop is the only place that reacts to a signal.
use crate::config::types::{Result, StartupError};
use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use std::time::Duration;

/// Signals raised by faults in the supervisor itself. They stay unblocked.
const SYNCHRONOUS_SIGNALS: [Signal; 7] = [
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGABRT,
    Signal::SIGTRAP,
    Signal::SIGSYS,
];

/// Signals ignored by the supervisor so a background PID 1 is never stopped
/// by terminal access.
const TERMINAL_STOP_SIGNALS: [Signal; 2] = [Signal::SIGTTIN, Signal::SIGTTOU];

/// Outcome of one wait on the blocked set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalWait {
    Received(Signal),
    /// Real-time or otherwise unmapped signal number
    Unsupported(i32),
    /// Timeout expired or the wait was interrupted
    Idle,
}

/// Signal mask and dispositions in effect before the supervisor took over.
///
/// The child restores both before exec so the workload starts with the
/// signal state the container runtime gave us.
pub struct SignalConfiguration {
    original_mask: SigSet,
    original_ttin: SigHandler,
    original_ttou: SigHandler,
    blocked: SigSet,
}

impl SignalConfiguration {
    /// Block every forwardable signal and ignore terminal stop signals
    pub fn install() -> Result<Self> {
        let mut blocked = SigSet::all();
        for sig in SYNCHRONOUS_SIGNALS {
            blocked.remove(sig);
        }

        let mut original_mask = SigSet::empty();
        signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&blocked), Some(&mut original_mask))
            .map_err(|e| StartupError::Signal(format!("Failed to block signals: {}", e)))?;

        let original_ttin = ignore(TERMINAL_STOP_SIGNALS[0])?;
        let original_ttou = ignore(TERMINAL_STOP_SIGNALS[1])?;

        log::debug!("Blocked forwardable signals, ignoring SIGTTIN/SIGTTOU");
        Ok(Self {
            original_mask,
            original_ttin,
            original_ttou,
            blocked,
        })
    }

    /// Wait for one blocked signal, up to `timeout`
    pub fn wait(&self, timeout: Duration) -> Result<SignalWait> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };

        let rc = unsafe { libc::sigtimedwait(self.blocked.as_ref(), &mut info, &ts) };
        if rc < 0 {
            return match Errno::last() {
                Errno::EAGAIN | Errno::EINTR => Ok(SignalWait::Idle),
                e => Err(StartupError::Signal(format!("sigtimedwait failed: {}", e))),
            };
        }

        Ok(Signal::try_from(rc)
            .map(SignalWait::Received)
            .unwrap_or(SignalWait::Unsupported(rc)))
    }

    /// Restore the pre-supervisor dispositions and mask.
    ///
    /// Called in the forked child right before exec. Only async-signal-safe
    /// calls are made, errors are ignored because the child can only exec or
    /// exit at this point.
    pub fn restore_in_child(&self) {
        unsafe {
            let _ = signal::signal(TERMINAL_STOP_SIGNALS[0], self.original_ttin);
            let _ = signal::signal(TERMINAL_STOP_SIGNALS[1], self.original_ttou);
        }
        let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.original_mask), None);
    }

    /// Restore the pre-supervisor state in the supervisor process itself
    pub fn restore(self) -> Result<()> {
        unsafe {
            signal::signal(TERMINAL_STOP_SIGNALS[0], self.original_ttin)
                .map_err(|e| StartupError::Signal(format!("Failed to restore SIGTTIN: {}", e)))?;
            signal::signal(TERMINAL_STOP_SIGNALS[1], self.original_ttou)
                .map_err(|e| StartupError::Signal(format!("Failed to restore SIGTTOU: {}", e)))?;
        }
        signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.original_mask), None)
            .map_err(|e| StartupError::Signal(format!("Failed to restore signal mask: {}", e)))
    }
}

fn ignore(sig: Signal) -> Result<SigHandler> {
    unsafe { signal::signal(sig, SigHandler::SigIgn) }
        .map_err(|e| StartupError::Signal(format!("Failed to ignore {}: {}", sig, e)))
}

/// Forward `sig` to the workload, or to its whole process group.
///
/// Returns `Ok(false)` when the target is already gone.
pub fn forward(pid: nix::unistd::Pid, sig: Signal, to_group: bool) -> Result<bool> {
    let target = if to_group {
        nix::unistd::Pid::from_raw(-pid.as_raw())
    } else {
        pid
    };

    match signal::kill(target, sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(StartupError::Signal(format!(
            "Failed to forward {} to {}: {}",
            sig, target, e
        ))),
    }
}

/// Conventional shell exit code for death by signal
pub fn exit_code_for_signal(sig: i32) -> i32 {
    128 + sig
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_for_signal() {
        assert_eq!(exit_code_for_signal(Signal::SIGTERM as i32), 143);
        assert_eq!(exit_code_for_signal(Signal::SIGKILL as i32), 137);
    }

    #[test]
    fn test_synchronous_signals_stay_deliverable() {
        let mut blocked = SigSet::all();
        for sig in SYNCHRONOUS_SIGNALS {
            blocked.remove(sig);
        }
        assert!(!blocked.contains(Signal::SIGSEGV));
        assert!(blocked.contains(Signal::SIGTERM));
        assert!(blocked.contains(Signal::SIGCHLD));
    }

    #[test]
    fn test_forward_to_missing_process() {
        // pid_max is far below i32::MAX on every Linux configuration
        let gone = nix::unistd::Pid::from_raw(i32::MAX - 1);
        assert_eq!(forward(gone, Signal::SIGTERM, false).unwrap(), false);
    }

    #[test]
    fn test_wait_receives_raised_signal() {
        // Block on this thread only, then raise a thread-directed signal.
        let config = SignalConfiguration::install().unwrap();
        signal::raise(Signal::SIGUSR1).unwrap();
        let got = config.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(got, SignalWait::Received(Signal::SIGUSR1));
        config.restore().unwrap();
    }
}
