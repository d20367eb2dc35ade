use crate::config::types::{Result, ShimConfig, StartupError};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Config path used when `--config` is not given
pub const CONFIG_ENV: &str = "ENCLAVE_INIT_CONFIG";
pub const SUBREAPER_ENV: &str = "ENCLAVE_INIT_SUBREAPER";
pub const KILL_GROUP_ENV: &str = "ENCLAVE_INIT_KILL_PROCESS_GROUP";
pub const DRAIN_ENV: &str = "ENCLAVE_INIT_DRAIN";
pub const REPORT_ENV: &str = "ENCLAVE_INIT_REPORT";

impl ShimConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StartupError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            StartupError::Config(format!(
                "Failed to parse config JSON {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Resolve the config path: explicit flag first, then `ENCLAVE_INIT_CONFIG`
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(|| {
        std::env::var_os(CONFIG_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
}

/// Load the configuration and apply environment overrides.
///
/// No path at all yields the built-in defaults; a path that cannot be read
/// is an error.
pub fn load(explicit: Option<&Path>) -> Result<ShimConfig> {
    let mut config = match resolve_config_path(explicit) {
        Some(path) => {
            log::info!("Loading configuration from {}", path.display());
            ShimConfig::load_from_file(&path)?
        }
        None => {
            log::info!("No configuration file given, using defaults");
            ShimConfig::default()
        }
    };

    apply_env_overrides(&mut config, |key| std::env::var_os(key))?;
    Ok(config)
}

/// Apply `ENCLAVE_INIT_*` overrides using the given variable lookup
pub fn apply_env_overrides<F>(config: &mut ShimConfig, raw_lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<OsString>,
{
    let lookup = |name: &str| -> Result<Option<String>> {
        raw_lookup(name)
            .map(|raw| {
                raw.into_string().map_err(|raw| {
                    StartupError::Config(format!("{} is not valid UTF-8: {:?}", name, raw))
                })
            })
            .transpose()
    };

    if let Some(value) = lookup(SUBREAPER_ENV)? {
        if parse_flag(SUBREAPER_ENV, &value)? {
            config.supervisor.subreaper = true;
        }
    }
    if let Some(value) = lookup(KILL_GROUP_ENV)? {
        if parse_flag(KILL_GROUP_ENV, &value)? {
            config.supervisor.forward_to_group = true;
        }
    }
    if let Some(value) = lookup(DRAIN_ENV)? {
        if parse_flag(DRAIN_ENV, &value)? {
            config.supervisor.drain_descendants = true;
        }
    }
    if let Some(value) = lookup(REPORT_ENV)? {
        if !value.is_empty() {
            config.supervisor.report_file = Some(PathBuf::from(value));
        }
    }
    Ok(())
}

/// Parse a boolean flag variable. Empty means unset.
fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" => Ok(false),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(StartupError::Config(format!(
            "{} must be a boolean (1/true/yes/on), got '{}'",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"instance_id": "driver-0", "hooks": [{{"name": "init", "command": ["true"]}}]}}"#
        )
        .unwrap();

        let config = ShimConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.instance_id.as_deref(), Some("driver-0"));
        assert_eq!(config.hooks.len(), 1);
        assert_eq!(config.hooks[0].timeout_secs, None);
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = load(Some(Path::new("/nonexistent/enclave-init.json"))).unwrap_err();
        assert!(matches!(err, StartupError::Config(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_load_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = ShimConfig::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config JSON"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ShimConfig::default();
        apply_env_overrides(
            &mut config,
            lookup_from(&[
                (SUBREAPER_ENV, "1"),
                (KILL_GROUP_ENV, "Yes"),
                (DRAIN_ENV, "off"),
                (REPORT_ENV, "/tmp/report.json"),
            ]),
        )
        .unwrap();

        assert!(config.supervisor.subreaper);
        assert!(config.supervisor.forward_to_group);
        assert!(!config.supervisor.drain_descendants);
        assert_eq!(
            config.supervisor.report_file,
            Some(PathBuf::from("/tmp/report.json"))
        );
    }

    #[test]
    fn test_env_override_does_not_clear_file_setting() {
        let mut config = ShimConfig::default();
        config.supervisor.subreaper = true;
        apply_env_overrides(&mut config, lookup_from(&[(SUBREAPER_ENV, "0")])).unwrap();
        assert!(config.supervisor.subreaper);
    }

    #[test]
    fn test_invalid_flag_value() {
        let mut config = ShimConfig::default();
        let err = apply_env_overrides(&mut config, lookup_from(&[(DRAIN_ENV, "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains(DRAIN_ENV));
    }

    #[test]
    fn test_non_utf8_override_is_config_error() {
        use std::os::unix::ffi::OsStringExt;

        let mut config = ShimConfig::default();
        let err = apply_env_overrides(&mut config, |key| {
            (key == SUBREAPER_ENV).then(|| OsString::from_vec(b"\xff".to_vec()))
        })
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains(SUBREAPER_ENV));
    }

    #[test]
    fn test_explicit_path_wins() {
        let explicit = Path::new("/etc/enclave-init.json");
        assert_eq!(
            resolve_config_path(Some(explicit)),
            Some(PathBuf::from("/etc/enclave-init.json"))
        );
    }
}
