//! Preparation hooks: external commands run to completion, in order, before
//! the workload exists. Typically the enclave runtime's own init and build
//! commands.

use crate::config::types::{HookSpec, Result, StartupError};
use crate::core::types::PreparedEnvironment;
use crate::kernel::process::terminate_process_group;
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Time between SIGTERM and SIGKILL when a hook is torn down
const HOOK_STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct HookOutcome {
    pub name: String,
    pub elapsed_ms: u64,
}

fn hook_error(hook: &HookSpec, reason: impl Into<String>) -> StartupError {
    StartupError::Hook {
        name: hook.name.clone(),
        reason: reason.into(),
    }
}

fn describe(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(sig)) => format!("killed by signal {}", sig),
        _ => "terminated abnormally".to_string(),
    }
}

/// Tear down the hook's process group, grandchildren included
fn stop_hook(hook: &HookSpec, child: &mut Child) {
    let leader = Pid::from_raw(child.id() as i32);
    let report = terminate_process_group(leader, HOOK_STOP_GRACE);
    log::warn!(
        "Stopped hook '{}' (process group {}): {:?}",
        hook.name,
        leader,
        report
    );
    let _ = child.wait();
}

/// Run one hook in its own process group with exactly the prepared
/// environment
pub fn run_hook(hook: &HookSpec, prepared: &PreparedEnvironment) -> Result<HookOutcome> {
    let (program, args) = hook
        .command
        .split_first()
        .ok_or_else(|| hook_error(hook, "empty command"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(prepared.exec_environment())
        .process_group(0);
    if let Some(dir) = &hook.working_dir {
        cmd.current_dir(dir);
    }

    log::info!("Running hook '{}': {:?}", hook.name, hook.command);
    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| hook_error(hook, format!("failed to spawn {}: {}", program, e)))?;

    let timeout = hook.timeout_secs.map(Duration::from_secs);
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                stop_hook(hook, &mut child);
                return Err(hook_error(hook, format!("failed to wait: {}", e)));
            }
        }
        if let Some(limit) = timeout {
            if start.elapsed() >= limit {
                stop_hook(hook, &mut child);
                return Err(hook_error(
                    hook,
                    format!("timed out after {}s", limit.as_secs()),
                ));
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    if !status.success() {
        return Err(hook_error(hook, describe(status)));
    }

    let elapsed_ms = start.elapsed().as_millis() as u64;
    log::info!("Hook '{}' finished in {} ms", hook.name, elapsed_ms);
    Ok(HookOutcome {
        name: hook.name.clone(),
        elapsed_ms,
    })
}

/// Run all hooks in order, stopping at the first failure
pub fn run_hooks(hooks: &[HookSpec], prepared: &PreparedEnvironment) -> Result<Vec<HookOutcome>> {
    hooks.iter().map(|hook| run_hook(hook, prepared)).collect()
}
