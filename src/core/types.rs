use crate::config::types::{PrepareStep, RunAs};
use crate::kernel::process::KillReport;
use crate::kernel::signal::exit_code_for_signal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

/// What the workload is started with once preparation is done
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PreparedEnvironment {
    /// Final environment, sorted by name
    pub env: BTreeMap<String, String>,
    /// Inherited variables that are not UTF-8, passed through as raw bytes
    #[serde(skip)]
    pub opaque_env: BTreeMap<OsString, OsString>,
    pub workdir: Option<PathBuf>,
    pub run_as: Option<RunAs>,
    /// Steps performed, in order
    pub steps: Vec<PrepareStep>,
}

impl PreparedEnvironment {
    /// Every variable handed to a child process
    pub fn exec_environment(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> + '_ {
        self.env
            .iter()
            .map(|(k, v)| (OsStr::new(k.as_str()), OsStr::new(v.as_str())))
            .chain(
                self.opaque_env
                    .iter()
                    .map(|(k, v)| (k.as_os_str(), v.as_os_str())),
            )
    }
}

/// How the workload ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ChildExit {
    Exited(i32),
    Signaled(i32),
}

impl ChildExit {
    /// Shell convention: exit status as is, `128 + n` for death by signal
    pub fn raw_code(&self) -> i32 {
        match *self {
            Self::Exited(code) => code,
            Self::Signaled(sig) => exit_code_for_signal(sig),
        }
    }

    /// Exit code after applying the success remap list
    pub fn exit_code(&self, remap_to_success: &[i32]) -> i32 {
        let code = self.raw_code();
        if remap_to_success.contains(&code) {
            0
        } else {
            code
        }
    }
}

impl std::fmt::Display for ChildExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {}", sig),
        }
    }
}

/// Outcome of one supervised run, also written as the JSON report file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupervisorReport {
    pub run_id: String,
    pub child_pid: i32,
    pub command: Vec<String>,
    pub exit: ChildExit,
    pub exit_code: i32,
    pub forwarded_signals: Vec<String>,
    pub reaped_descendants: u32,
    /// Zombie children of the supervisor left after the final reap
    pub zombie_count: u32,
    pub wall_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown: Option<KillReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_environment_includes_opaque_vars() {
        use std::os::unix::ffi::OsStringExt;

        let mut prepared = PreparedEnvironment::default();
        prepared.env.insert("A".to_string(), "1".to_string());
        prepared.opaque_env.insert(
            OsString::from("LEGACY"),
            OsString::from_vec(b"\xff".to_vec()),
        );

        let vars: Vec<(&OsStr, &OsStr)> = prepared.exec_environment().collect();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0], (OsStr::new("A"), OsStr::new("1")));
        assert_eq!(vars[1].0, OsStr::new("LEGACY"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ChildExit::Exited(0).exit_code(&[]), 0);
        assert_eq!(ChildExit::Exited(42).exit_code(&[]), 42);
        assert_eq!(ChildExit::Signaled(15).exit_code(&[]), 143);
    }

    #[test]
    fn test_remap_applies_to_signal_codes_too() {
        assert_eq!(ChildExit::Exited(143).exit_code(&[143]), 0);
        assert_eq!(ChildExit::Signaled(15).exit_code(&[143]), 0);
        assert_eq!(ChildExit::Exited(1).exit_code(&[143]), 1);
    }

    #[test]
    fn test_report_json_shape() {
        let report = SupervisorReport {
            run_id: "run-1".to_string(),
            child_pid: 7,
            command: vec!["true".to_string()],
            exit: ChildExit::Signaled(9),
            exit_code: 137,
            forwarded_signals: vec!["SIGTERM".to_string()],
            reaped_descendants: 2,
            zombie_count: 0,
            wall_time_ms: 12,
            spawn_failure: None,
            teardown: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["exit"]["kind"], "signaled");
        assert_eq!(json["exit"]["value"], 9);
        assert_eq!(json["exit_code"], 137);
        assert!(json.get("teardown").is_none());

        let back: SupervisorReport = serde_json::from_value(json).unwrap();
        assert_eq!(back.exit, ChildExit::Signaled(9));
    }
}
