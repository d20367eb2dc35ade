/// Core types and structures for the enclave-init startup sequence
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Framework installation consumed by the workload (opaque, fixed layout)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FrameworkConfig {
    /// Installation root
    pub home: PathBuf,
    /// Variable the workload reads the installation root from
    pub home_env: String,
    /// Directory of jars, relative to `home`
    pub jars_dir: String,
    /// Variable receiving the composed classpath
    pub classpath_env: String,
    /// Packaged examples, relative to `home`
    pub examples_dir: String,
    /// Packaged tests, relative to `home`
    pub tests_dir: String,
    /// Fail preparation when the packaged layout is incomplete
    pub require_layout: bool,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from("/opt/spark"),
            home_env: "SPARK_HOME".to_string(),
            jars_dir: "jars".to_string(),
            classpath_env: "SPARK_CLASSPATH".to_string(),
            examples_dir: "examples".to_string(),
            tests_dir: "tests".to_string(),
            require_layout: false,
        }
    }
}

impl FrameworkConfig {
    pub fn jars_path(&self) -> PathBuf {
        self.home.join(&self.jars_dir)
    }

    pub fn examples_path(&self) -> PathBuf {
        self.home.join(&self.examples_dir)
    }

    pub fn tests_path(&self) -> PathBuf {
        self.home.join(&self.tests_dir)
    }
}

/// Java runtime location
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JavaConfig {
    pub home: PathBuf,
    pub home_env: String,
    /// Require `<home>/bin/java` to be an executable file
    pub require: bool,
}

impl Default for JavaConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from("/usr/lib/jvm/java-8-openjdk-amd64"),
            home_env: "JAVA_HOME".to_string(),
            require: false,
        }
    }
}

impl JavaConfig {
    pub fn java_binary(&self) -> PathBuf {
        self.home.join("bin").join("java")
    }
}

/// File or directory copied into the enclave image on first preparation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CopySpec {
    pub from: PathBuf,
    /// Destination relative to `<instance_dir>/image`
    pub to: PathBuf,
}

/// Enclave runtime instance layout
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnclaveConfig {
    /// Instance directory; `None` skips the step entirely
    pub instance_dir: Option<PathBuf>,
    /// Directories created under `<instance_dir>/image`
    pub image_dirs: Vec<String>,
    pub copy: Vec<CopySpec>,
    /// Marker written once every copy succeeded
    pub marker: String,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            instance_dir: None,
            image_dirs: Vec::new(),
            copy: Vec::new(),
            marker: ".enclave-init-prepared".to_string(),
        }
    }
}

/// passwd handling for containers started with an arbitrary uid
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    pub ensure_passwd_entry: bool,
    pub passwd_file: PathBuf,
    pub shell: String,
    pub gecos: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            ensure_passwd_entry: true,
            passwd_file: PathBuf::from("/etc/passwd"),
            shell: "/bin/false".to_string(),
            gecos: "anonymous uid".to_string(),
        }
    }
}

/// Directory created during preparation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DirectorySpec {
    pub path: PathBuf,
    #[serde(default = "default_dir_mode")]
    pub mode: u32,
}

fn default_dir_mode() -> u32 {
    0o755
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LayoutConfig {
    pub required_paths: Vec<PathBuf>,
    pub directories: Vec<DirectorySpec>,
}

/// Workload environment composition
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Values may reference other variables as `${NAME}`
    pub set: BTreeMap<String, String>,
    /// Variables that must be non-empty after composition
    pub required: Vec<String>,
    pub path_prepend: Vec<String>,
    /// Drop LD_* loader variables
    pub sanitize_loader_vars: bool,
    /// Start from an empty environment instead of the inherited one
    pub clear: bool,
    pub umask: Option<u32>,
}

/// Command run to completion before the workload starts
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HookSpec {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Credentials the workload is exec'd with
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

/// PID-1 behavior
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Register as child subreaper (useful when not running as PID 1)
    pub subreaper: bool,
    /// Forward signals to the workload's process group instead of its pid
    pub forward_to_group: bool,
    /// Keep reaping until no descendant is left
    pub drain_descendants: bool,
    /// Workload exit codes reported as success
    pub remap_exit_codes: Vec<i32>,
    pub default_command: Vec<String>,
    pub run_as: Option<RunAs>,
    pub workdir: Option<PathBuf>,
    pub report_file: Option<PathBuf>,
    /// Grace between SIGTERM and SIGKILL when tearing down the workload group
    pub stop_grace_ms: u64,
    /// Keep descriptors above stderr from leaking into the workload
    pub close_inherited_fds: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            subreaper: false,
            forward_to_group: false,
            drain_descendants: false,
            remap_exit_codes: Vec::new(),
            default_command: Vec::new(),
            run_as: None,
            workdir: None,
            report_file: None,
            stop_grace_ms: 200,
            close_inherited_fds: false,
        }
    }
}

/// Full configuration file structure
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShimConfig {
    pub instance_id: Option<String>,
    pub framework: FrameworkConfig,
    pub java: JavaConfig,
    pub enclave: EnclaveConfig,
    pub identity: IdentityConfig,
    pub layout: LayoutConfig,
    pub environment: EnvironmentConfig,
    pub hooks: Vec<HookSpec>,
    pub supervisor: SupervisorConfig,
    pub events_file: Option<PathBuf>,
}

impl ShimConfig {
    /// Resolve the correlation id, generating one when the config has none
    pub fn resolved_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

/// Preparation steps, in the order they run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareStep {
    Umask,
    Layout,
    Runtime,
    Identity,
    Environment,
    Enclave,
    Hooks,
}

impl std::fmt::Display for PrepareStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Umask => "umask",
            Self::Layout => "layout",
            Self::Runtime => "runtime",
            Self::Identity => "identity",
            Self::Environment => "environment",
            Self::Enclave => "enclave",
            Self::Hooks => "hooks",
        };
        f.write_str(name)
    }
}

/// Errors of the startup sequence
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Preparation failed at {step}: {reason}")]
    Prepare { step: PrepareStep, reason: String },

    #[error("Hook '{name}' failed: {reason}")]
    Hook { name: String, reason: String },

    #[error("Failed to start workload: {0}")]
    Spawn(String),

    #[error("Signal handling error: {0}")]
    Signal(String),

    #[error("Process error: {0}")]
    Process(String),
}

impl StartupError {
    pub fn prepare(step: PrepareStep, reason: impl Into<String>) -> Self {
        Self::Prepare {
            step,
            reason: reason.into(),
        }
    }

    /// Exit code reported when startup aborts with this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Prepare { .. } | Self::Hook { .. } | Self::Io(_) => 1,
            Self::Spawn(_) => 126,
            Self::Signal(_) | Self::Process(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, StartupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_framework_layout() {
        let config = ShimConfig::default();
        assert_eq!(config.framework.home, PathBuf::from("/opt/spark"));
        assert_eq!(config.framework.jars_path(), PathBuf::from("/opt/spark/jars"));
        assert_eq!(config.framework.examples_path(), PathBuf::from("/opt/spark/examples"));
        assert_eq!(config.framework.tests_path(), PathBuf::from("/opt/spark/tests"));
        assert_eq!(
            config.java.java_binary(),
            PathBuf::from("/usr/lib/jvm/java-8-openjdk-amd64/bin/java")
        );
        assert!(config.identity.ensure_passwd_entry);
        assert_eq!(config.supervisor.stop_grace_ms, 200);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ShimConfig = serde_json::from_str(
            r#"{"framework": {"home": "/srv/framework"}, "supervisor": {"subreaper": true}}"#,
        )
        .unwrap();
        assert_eq!(config.framework.home, PathBuf::from("/srv/framework"));
        assert_eq!(config.framework.home_env, "SPARK_HOME");
        assert!(config.supervisor.subreaper);
        assert!(!config.supervisor.forward_to_group);
    }

    #[test]
    fn test_directory_mode_default() {
        let spec: DirectorySpec = serde_json::from_str(r#"{"path": "/tmp/x"}"#).unwrap();
        assert_eq!(spec.mode, 0o755);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(StartupError::Config("x".into()).exit_code(), 2);
        assert_eq!(StartupError::prepare(PrepareStep::Layout, "x").exit_code(), 1);
        assert_eq!(
            StartupError::Hook {
                name: "h".into(),
                reason: "x".into()
            }
            .exit_code(),
            1
        );
        assert_eq!(StartupError::Spawn("x".into()).exit_code(), 126);
    }

    #[test]
    fn test_prepare_error_names_step() {
        let err = StartupError::prepare(PrepareStep::Identity, "passwd not writable");
        assert_eq!(
            err.to_string(),
            "Preparation failed at identity: passwd not writable"
        );
    }

    #[test]
    fn test_instance_id_generated_when_absent() {
        let config = ShimConfig::default();
        let a = config.resolved_instance_id();
        let b = config.resolved_instance_id();
        assert_ne!(a, b);

        let named = ShimConfig {
            instance_id: Some("spark-driver".to_string()),
            ..ShimConfig::default()
        };
        assert_eq!(named.resolved_instance_id(), "spark-driver");
    }
}
