// Startup config validation.
// Every problem is collected before failing so one run reports all of them.

use crate::config::types::{Result, ShimConfig, StartupError};
use std::path::{Component, Path};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate config at startup, failing fast with every error found
pub fn validate_config(config: &ShimConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_runtime(config, &mut result);
    validate_layout(config, &mut result);
    validate_environment(config, &mut result);
    validate_enclave(config, &mut result);
    validate_hooks(config, &mut result);
    validate_supervisor(config, &mut result);

    for warning in &result.warnings {
        log::warn!("Config warning: {}", warning);
    }

    if !result.is_valid() {
        return Err(StartupError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_runtime(config: &ShimConfig, result: &mut ValidationResult) {
    if !config.framework.home.is_absolute() {
        result.add_error(format!(
            "framework.home must be absolute: {}",
            config.framework.home.display()
        ));
    }
    if !config.java.home.is_absolute() {
        result.add_error(format!(
            "java.home must be absolute: {}",
            config.java.home.display()
        ));
    }
    for (field, name) in [
        ("framework.home_env", &config.framework.home_env),
        ("framework.classpath_env", &config.framework.classpath_env),
        ("java.home_env", &config.java.home_env),
    ] {
        if let Err(reason) = check_env_name(name) {
            result.add_error(format!("{}: {}", field, reason));
        }
    }
    for (field, rel) in [
        ("framework.jars_dir", &config.framework.jars_dir),
        ("framework.examples_dir", &config.framework.examples_dir),
        ("framework.tests_dir", &config.framework.tests_dir),
    ] {
        if !is_contained_relative(Path::new(rel)) {
            result.add_error(format!("{} must stay inside framework.home: {}", field, rel));
        }
    }
}

fn validate_layout(config: &ShimConfig, result: &mut ValidationResult) {
    for dir in &config.layout.directories {
        if !dir.path.is_absolute() {
            result.add_error(format!(
                "layout directory must be absolute: {}",
                dir.path.display()
            ));
        }
        if dir.mode > 0o7777 {
            result.add_error(format!(
                "layout directory {} has invalid mode {:o}",
                dir.path.display(),
                dir.mode
            ));
        }
    }
    for path in &config.layout.required_paths {
        if !path.is_absolute() {
            result.add_warning(format!(
                "required path {} is relative to the working directory",
                path.display()
            ));
        }
    }
}

fn validate_environment(config: &ShimConfig, result: &mut ValidationResult) {
    let env = &config.environment;
    for name in env.set.keys().chain(env.required.iter()) {
        if let Err(reason) = check_env_name(name) {
            result.add_error(format!("environment variable '{}': {}", name, reason));
        }
    }
    for (name, value) in &env.set {
        if value.contains('\0') {
            result.add_error(format!("environment value for {} contains NUL byte", name));
        }
    }
    if let Some(umask) = env.umask {
        if umask > 0o777 {
            result.add_error(format!("invalid umask: {:o}", umask));
        }
    }
    if env.clear && env.path_prepend.is_empty() && !env.set.contains_key("PATH") {
        result.add_warning(
            "environment.clear is set without a PATH; the workload is resolved against \
             the default search path"
                .to_string(),
        );
    }
}

fn validate_enclave(config: &ShimConfig, result: &mut ValidationResult) {
    let enclave = &config.enclave;
    let Some(instance_dir) = &enclave.instance_dir else {
        if !enclave.image_dirs.is_empty() || !enclave.copy.is_empty() {
            result.add_warning(
                "enclave.image_dirs/copy are ignored without enclave.instance_dir".to_string(),
            );
        }
        return;
    };

    if !instance_dir.is_absolute() {
        result.add_error(format!(
            "enclave.instance_dir must be absolute: {}",
            instance_dir.display()
        ));
    }
    if !is_contained_relative(Path::new(&enclave.marker)) || enclave.marker.contains('/') {
        result.add_error(format!("enclave.marker must be a file name: {}", enclave.marker));
    }
    for dir in &enclave.image_dirs {
        if !is_contained_relative(Path::new(dir)) {
            result.add_error(format!("enclave image dir escapes the image: {}", dir));
        }
    }
    for copy in &enclave.copy {
        if !is_contained_relative(&copy.to) {
            result.add_error(format!(
                "enclave copy target escapes the image: {}",
                copy.to.display()
            ));
        }
    }
}

fn validate_hooks(config: &ShimConfig, result: &mut ValidationResult) {
    for (index, hook) in config.hooks.iter().enumerate() {
        if hook.name.trim().is_empty() {
            result.add_error(format!("hook #{} has an empty name", index));
        }
        if hook.command.is_empty() || hook.command[0].is_empty() {
            result.add_error(format!("hook '{}' has an empty command", hook.name));
        }
        if hook.timeout_secs == Some(0) {
            result.add_error(format!("hook '{}' has a zero timeout", hook.name));
        }
    }
}

fn validate_supervisor(config: &ShimConfig, result: &mut ValidationResult) {
    let supervisor = &config.supervisor;
    if supervisor.default_command.iter().any(|arg| arg.contains('\0')) {
        result.add_error("supervisor.default_command contains NUL byte".to_string());
    }
    for code in &supervisor.remap_exit_codes {
        if !(0..=255).contains(code) {
            result.add_error(format!("remap exit code out of range: {}", code));
        }
    }
    if let Some(workdir) = &supervisor.workdir {
        if !workdir.is_absolute() {
            result.add_error(format!(
                "supervisor.workdir must be absolute: {}",
                workdir.display()
            ));
        }
    }
    if let Some(run_as) = &supervisor.run_as {
        if run_as.uid == 0 {
            result.add_warning("supervisor.run_as keeps uid 0".to_string());
        }
    }
}

/// Environment variable names must be non-empty and free of `=` and NUL
pub fn check_env_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }
    if name.contains('=') || name.contains('\0') {
        return Err("name contains '=' or NUL".to_string());
    }
    Ok(())
}

/// Relative path without `..`, root or prefix components
fn is_contained_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{CopySpec, DirectorySpec, HookSpec};
    use std::path::PathBuf;

    #[test]
    fn test_default_config_is_valid() {
        let result = validate_config(&ShimConfig::default()).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn test_empty_hook_command_rejected() {
        let mut config = ShimConfig::default();
        config.hooks.push(HookSpec {
            name: "build".to_string(),
            command: vec![],
            working_dir: None,
            timeout_secs: None,
        });
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("hook 'build' has an empty command"));
    }

    #[test]
    fn test_all_errors_reported_together() {
        let mut config = ShimConfig::default();
        config.enclave.instance_dir = Some(PathBuf::from("relative/instance"));
        config.environment.umask = Some(0o1777);
        config.layout.directories.push(DirectorySpec {
            path: PathBuf::from("/var/run/workload"),
            mode: 0o17777,
        });

        let msg = validate_config(&config).unwrap_err().to_string();
        assert!(msg.contains("enclave.instance_dir must be absolute"));
        assert!(msg.contains("invalid umask"));
        assert!(msg.contains("invalid mode"));
    }

    #[test]
    fn test_copy_target_escape_rejected() {
        let mut config = ShimConfig::default();
        config.enclave.instance_dir = Some(PathBuf::from("/opt/instance"));
        config.enclave.copy.push(CopySpec {
            from: PathBuf::from("/opt/spark/jars"),
            to: PathBuf::from("../../etc"),
        });
        let msg = validate_config(&config).unwrap_err().to_string();
        assert!(msg.contains("escapes the image"));
    }

    #[test]
    fn test_env_name_checks() {
        assert!(check_env_name("SPARK_HOME").is_ok());
        assert!(check_env_name("").is_err());
        assert!(check_env_name("A=B").is_err());

        let mut config = ShimConfig::default();
        config
            .environment
            .set
            .insert("BAD=NAME".to_string(), "x".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_remap_range() {
        let mut config = ShimConfig::default();
        config.supervisor.remap_exit_codes = vec![143, 256];
        let msg = validate_config(&config).unwrap_err().to_string();
        assert!(msg.contains("256"));
        assert!(!msg.contains("143"));
    }

    #[test]
    fn test_contained_relative() {
        assert!(is_contained_relative(Path::new("opt/spark")));
        assert!(is_contained_relative(Path::new("./bin")));
        assert!(!is_contained_relative(Path::new("/bin")));
        assert!(!is_contained_relative(Path::new("a/../../b")));
        assert!(!is_contained_relative(Path::new("")));
    }
}
