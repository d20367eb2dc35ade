//! Workload launch
//!
//! Child-side sequence after fork, fixed order:
//! 1. own process group, terminal foreground when stdin is a tty
//! 2. prctl(PR_SET_PDEATHSIG, SIGKILL)
//! 3. restore signal dispositions and mask
//! 4. setgroups, setgid, setuid when a run-as identity is configured
//! 5. chdir to the configured working directory
//! 6. execvpe
//!
//! Everything the child needs is allocated before fork. A failing step
//! reports `(stage, errno)` through a close-on-exec pipe and `_exit`s.

use crate::config::types::{Result, RunAs, StartupError};
use crate::kernel::process::{isolate_process_group, set_parent_death_signal};
use crate::kernel::signal::SignalConfiguration;
use nix::errno::Errno;
use nix::unistd::{fork, ForkResult, Gid, Pid, Uid};
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Exit status of a child whose program could not be found
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit status of a child that failed any other pre-exec step
pub const EXIT_CANNOT_EXEC: i32 = 126;

/// Pre-exec stage reported back on failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ChildStage {
    ProcessGroup = 1,
    ParentDeathSignal = 2,
    Credentials = 3,
    WorkingDirectory = 4,
    Exec = 5,
}

impl ChildStage {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::ProcessGroup),
            2 => Some(Self::ParentDeathSignal),
            3 => Some(Self::Credentials),
            4 => Some(Self::WorkingDirectory),
            5 => Some(Self::Exec),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ProcessGroup => "process group setup",
            Self::ParentDeathSignal => "parent death signal",
            Self::Credentials => "credential switch",
            Self::WorkingDirectory => "chdir",
            Self::Exec => "exec",
        };
        f.write_str(name)
    }
}

/// Exec arguments, prebuilt so the child never allocates
#[derive(Debug)]
pub struct LaunchSpec {
    command: Vec<String>,
    argv: Vec<CString>,
    envp: Vec<CString>,
    workdir: Option<CString>,
    run_as: Option<RunAs>,
}

fn to_cstring(what: &str, value: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| StartupError::Config(format!("{} contains NUL byte: {:?}", what, value)))
}

/// `KEY=VALUE` built from raw bytes, so non-UTF-8 entries survive
fn env_entry(key: &OsStr, value: &OsStr) -> Result<CString> {
    let mut entry = Vec::with_capacity(key.len() + value.len() + 1);
    entry.extend_from_slice(key.as_bytes());
    entry.push(b'=');
    entry.extend_from_slice(value.as_bytes());
    CString::new(entry).map_err(|_| {
        StartupError::Config(format!(
            "environment entry {} contains NUL byte",
            key.to_string_lossy()
        ))
    })
}

impl LaunchSpec {
    pub fn new<I, K, V>(
        command: &[String],
        env: I,
        workdir: Option<&Path>,
        run_as: Option<RunAs>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        if command.is_empty() {
            return Err(StartupError::Config("empty workload command".to_string()));
        }

        let argv = command
            .iter()
            .map(|arg| to_cstring("command argument", arg))
            .collect::<Result<Vec<_>>>()?;
        let envp = env
            .into_iter()
            .map(|(k, v)| env_entry(k.as_ref(), v.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let workdir = workdir
            .map(|dir| {
                CString::new(dir.as_os_str().as_bytes()).map_err(|_| {
                    StartupError::Config(format!(
                        "working directory contains NUL byte: {}",
                        dir.display()
                    ))
                })
            })
            .transpose()?;

        Ok(Self {
            command: command.to_vec(),
            argv,
            envp,
            workdir,
            run_as,
        })
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }
}

/// Result of a fork+exec attempt
#[derive(Debug)]
pub struct Spawned {
    pub pid: Pid,
    /// Set when the child failed before or at exec; it exits on its own
    pub failure: Option<(ChildStage, Errno)>,
}

impl Spawned {
    /// Human-readable diagnostic for a pre-exec failure
    pub fn diagnostic(&self, command: &[String]) -> Option<String> {
        self.failure.map(|(stage, errno)| {
            format!(
                "failed to start {:?}: {} failed: {}",
                command.first().map(String::as_str).unwrap_or(""),
                stage,
                errno.desc()
            )
        })
    }
}

fn error_pipe() -> Result<(i32, i32)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(StartupError::Spawn(format!(
            "pipe2 failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok((fds[0], fds[1]))
}

/// Fork and exec the workload.
///
/// `signals` must already be installed: the child inherits the blocked mask
/// and restores it right before exec.
pub fn spawn(spec: &LaunchSpec, signals: &SignalConfiguration) -> Result<Spawned> {
    let (read_fd, write_fd) = error_pipe()?;

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            unsafe { libc::close(read_fd) };
            let (stage, errno) = child_exec(spec, signals);
            report_and_exit(write_fd, stage, errno)
        }
        Ok(ForkResult::Parent { child }) => {
            unsafe { libc::close(write_fd) };
            let failure = read_child_failure(read_fd);
            unsafe { libc::close(read_fd) };
            Ok(Spawned {
                pid: child,
                failure,
            })
        }
        Err(e) => {
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            Err(StartupError::Spawn(format!("fork failed: {}", e)))
        }
    }
}

/// Runs in the child. Returns only on failure.
fn child_exec(spec: &LaunchSpec, signals: &SignalConfiguration) -> (ChildStage, Errno) {
    // ASYNC-SIGNAL SAFETY: only raw syscalls below, no allocation, no locks.
    if let Err(e) = isolate_process_group() {
        return (ChildStage::ProcessGroup, e);
    }
    if let Err(e) = set_parent_death_signal() {
        return (ChildStage::ParentDeathSignal, e);
    }

    signals.restore_in_child();

    if let Some(run_as) = spec.run_as {
        let gid = Gid::from_raw(run_as.gid);
        if let Err(e) = nix::unistd::setgroups(&[gid]) {
            return (ChildStage::Credentials, e);
        }
        if let Err(e) = nix::unistd::setgid(gid) {
            return (ChildStage::Credentials, e);
        }
        if let Err(e) = nix::unistd::setuid(Uid::from_raw(run_as.uid)) {
            return (ChildStage::Credentials, e);
        }
    }

    if let Some(dir) = &spec.workdir {
        if unsafe { libc::chdir(dir.as_ptr()) } != 0 {
            return (ChildStage::WorkingDirectory, Errno::last());
        }
    }

    match nix::unistd::execvpe(&spec.argv[0], &spec.argv, &spec.envp) {
        Ok(never) => match never {},
        Err(e) => (ChildStage::Exec, e),
    }
}

fn report_and_exit(write_fd: i32, stage: ChildStage, errno: Errno) -> ! {
    let payload = [stage as i32, errno as i32];
    unsafe {
        libc::write(
            write_fd,
            payload.as_ptr() as *const libc::c_void,
            std::mem::size_of_val(&payload),
        );
    }
    let code = if stage == ChildStage::Exec && errno == Errno::ENOENT {
        EXIT_NOT_FOUND
    } else {
        EXIT_CANNOT_EXEC
    };
    unsafe { libc::_exit(code) }
}

/// EOF means exec succeeded (the write end was closed by CLOEXEC)
fn read_child_failure(read_fd: i32) -> Option<(ChildStage, Errno)> {
    let mut payload = [0i32; 2];
    let size = std::mem::size_of_val(&payload);
    loop {
        let n = unsafe { libc::read(read_fd, payload.as_mut_ptr() as *mut libc::c_void, size) };
        if n < 0 && Errno::last() == Errno::EINTR {
            continue;
        }
        if n as usize != size {
            return None;
        }
        let stage = ChildStage::from_raw(payload[0])?;
        return Some((stage, Errno::from_i32(payload[1])));
    }
}
