use crate::config::types::{Result, StartupError, SupervisorConfig};
use crate::core::types::{ChildExit, PreparedEnvironment, SupervisorReport};
use crate::exec::spawn::{spawn, LaunchSpec};
use crate::kernel::process::{is_pid1, set_child_subreaper, terminate_process_group, KillReport};
use crate::kernel::procfs::zombie_children;
use crate::kernel::signal::{forward, SignalConfiguration, SignalWait};
use crate::observability::events;
use crate::utils::fd_closure::mark_inherited_fds_cloexec;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::path::Path;
use std::time::{Duration, Instant};

/// Upper bound on one signal wait; reaping also runs on every timeout
const WAIT_INTERVAL: Duration = Duration::from_secs(1);

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> StartupError {
    StartupError::Process(format!("{prefix}: {err}"))
}

#[derive(Default)]
struct ReapState {
    main_exit: Option<ChildExit>,
    reaped_descendants: u32,
    forwarded_signals: Vec<String>,
}

enum ReapProgress {
    ChildrenRemain,
    NoChildren,
}

/// Collect every exited child without blocking
fn reap(main_pid: Pid, state: &mut ReapState) -> Result<ReapProgress> {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return Ok(ReapProgress::ChildrenRemain),
            Ok(WaitStatus::Exited(pid, code)) if pid == main_pid => {
                log::info!("Workload {} exited with code {}", pid, code);
                state.main_exit = Some(ChildExit::Exited(code));
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) if pid == main_pid => {
                log::info!("Workload {} killed by {}", pid, sig);
                state.main_exit = Some(ChildExit::Signaled(sig as i32));
            }
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                log::debug!("Reaped descendant {}", pid);
                state.reaped_descendants += 1;
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(ReapProgress::NoChildren),
            Err(e) => return Err(to_process_error("waitpid(reap)", e)),
        }
    }
}

fn forward_raw(pid: Pid, signo: i32, to_group: bool) -> Result<bool> {
    let target = if to_group { -pid.as_raw() } else { pid.as_raw() };
    if unsafe { libc::kill(target, signo) } == 0 {
        return Ok(true);
    }
    match Errno::last() {
        Errno::ESRCH => Ok(false),
        e => Err(to_process_error(&format!("kill({target}, {signo})"), e)),
    }
}

fn relay(
    run_id: &str,
    config: &SupervisorConfig,
    pid: Pid,
    name: String,
    sent: bool,
    state: &mut ReapState,
) {
    if sent {
        log::info!("Forwarded {} to workload {}", name, pid);
        events::signal_forwarded(run_id, pid.as_raw(), &name, config.forward_to_group);
    } else {
        log::debug!("{} not forwarded, workload {} is gone", name, pid);
    }
    state.forwarded_signals.push(name);
}

fn supervise_loop(
    run_id: &str,
    config: &SupervisorConfig,
    signals: &SignalConfiguration,
    pid: Pid,
    state: &mut ReapState,
) -> Result<()> {
    loop {
        match signals.wait(WAIT_INTERVAL)? {
            SignalWait::Idle | SignalWait::Received(Signal::SIGCHLD) => {}
            SignalWait::Received(sig) => {
                let sent = forward(pid, sig, config.forward_to_group)?;
                relay(run_id, config, pid, sig.as_str().to_string(), sent, state);
            }
            SignalWait::Unsupported(signo) => {
                let sent = forward_raw(pid, signo, config.forward_to_group)?;
                relay(run_id, config, pid, format!("signal {}", signo), sent, state);
            }
        }

        let progress = reap(pid, state)?;
        if state.main_exit.is_some() {
            match progress {
                ReapProgress::NoChildren => return Ok(()),
                ReapProgress::ChildrenRemain if !config.drain_descendants => return Ok(()),
                ReapProgress::ChildrenRemain => {
                    log::debug!("Workload gone, draining remaining descendants");
                }
            }
        }
    }
}

/// Tear the workload down after the supervisor itself failed
fn abort_workload(pid: Pid, grace: Duration, state: &mut ReapState) -> KillReport {
    let report = terminate_process_group(pid, grace);
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => state.main_exit = Some(ChildExit::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                state.main_exit = Some(ChildExit::Signaled(sig as i32))
            }
            Err(Errno::EINTR) | Ok(_) => continue,
            Err(_) => {}
        }
        break;
    }
    report
}

fn write_report(path: &Path, report: &SupervisorReport) {
    let written = serde_json::to_vec_pretty(report)
        .map_err(|e| e.to_string())
        .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));
    match written {
        Ok(()) => log::debug!("Wrote supervisor report to {}", path.display()),
        Err(e) => log::warn!("Failed to write report {}: {}", path.display(), e),
    }
}

/// Run `command` as the supervised workload until it exits.
///
/// Signals are blocked before fork and collected synchronously; everything
/// except SIGCHLD is relayed to the workload. Every child that exits is
/// reaped, whether or not it is the workload.
pub fn supervise(
    run_id: &str,
    config: &SupervisorConfig,
    prepared: &PreparedEnvironment,
    command: &[String],
) -> Result<SupervisorReport> {
    let start = Instant::now();
    let spec = LaunchSpec::new(
        command,
        prepared.exec_environment(),
        prepared.workdir.as_deref(),
        prepared.run_as,
    )?;

    if config.close_inherited_fds {
        mark_inherited_fds_cloexec()?;
    }

    if config.subreaper {
        if is_pid1() {
            log::debug!("Running as PID 1, subreaper registration not needed");
        } else {
            set_child_subreaper()?;
        }
    } else if !is_pid1() {
        log::warn!("Not PID 1 and subreaper disabled, orphaned descendants will not be reaped");
    }

    let signals = SignalConfiguration::install()?;
    let spawned = match spawn(&spec, &signals) {
        Ok(spawned) => spawned,
        Err(e) => {
            let _ = signals.restore();
            return Err(e);
        }
    };
    let pid = spawned.pid;
    let spawn_failure = spawned.diagnostic(spec.command());
    if let Some(msg) = &spawn_failure {
        log::error!("{}", msg);
    } else {
        log::info!("Started workload {}: {:?}", pid, command);
    }
    events::workload_started(run_id, pid.as_raw(), command);

    let mut state = ReapState::default();
    let teardown = match supervise_loop(run_id, config, &signals, pid, &mut state) {
        Ok(()) => None,
        Err(e) => {
            log::error!("Supervisor failed, tearing down workload {}: {}", pid, e);
            let grace = Duration::from_millis(config.stop_grace_ms);
            Some(abort_workload(pid, grace, &mut state))
        }
    };
    signals.restore()?;

    let exit = state
        .main_exit
        .ok_or_else(|| StartupError::Process("workload exit status was lost".to_string()))?;

    let zombie_count = match zombie_children(std::process::id()) {
        Ok(zombies) => zombies.len() as u32,
        Err(e) => {
            log::warn!("Could not count zombie children: {}", e);
            0
        }
    };

    let report = SupervisorReport {
        run_id: run_id.to_string(),
        child_pid: pid.as_raw(),
        command: command.to_vec(),
        exit,
        exit_code: exit.exit_code(&config.remap_exit_codes),
        forwarded_signals: state.forwarded_signals,
        reaped_descendants: state.reaped_descendants,
        zombie_count,
        wall_time_ms: start.elapsed().as_millis() as u64,
        spawn_failure,
        teardown,
    };

    events::workload_exited(
        run_id,
        pid.as_raw(),
        &format!("{}, reporting {}", exit, report.exit_code),
    );
    if let Some(path) = &config.report_file {
        write_report(path, &report);
    }
    Ok(report)
}
