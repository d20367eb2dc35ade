/// Environment and permission hygiene
///
/// Pure helpers over an environment map. The supervisor never mutates its
/// own environment; the composed map is handed to `execvpe`.
use crate::config::types::{Result, StartupError};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Loader variables that let a caller inject code into the workload
pub const LOADER_VARS: [&str; 8] = [
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "LD_BIND_NOW",
    "LD_DEBUG",
    "LD_PROFILE",
    "LD_USE_LOAD_BIAS",
    "LD_DYNAMIC_WEAK",
];

/// Split inherited variables into UTF-8 ones and the rest.
///
/// Variables whose name or value is not UTF-8 are kept as raw bytes so they
/// still reach the workload unchanged.
pub fn split_inherited<I>(vars: I) -> (BTreeMap<String, String>, BTreeMap<OsString, OsString>)
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut text = BTreeMap::new();
    let mut opaque = BTreeMap::new();
    for (key, value) in vars {
        match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => {
                text.insert(key, value);
            }
            (key, value) => {
                let key = key.map_or_else(|raw| raw, OsString::from);
                let value = value.map_or_else(|raw| raw, OsString::from);
                log::warn!(
                    "Inherited variable {} is not valid UTF-8, passing it through unchanged",
                    key.to_string_lossy()
                );
                opaque.insert(key, value);
            }
        }
    }
    (text, opaque)
}

/// Drop loader variables, returning the names that were present
pub fn sanitize_loader_vars(env: &mut BTreeMap<String, String>) -> Vec<String> {
    let mut removed = Vec::new();
    for var in LOADER_VARS {
        if env.remove(var).is_some() {
            log::info!("Removed loader environment variable: {}", var);
            removed.push(var.to_string());
        }
    }
    removed
}

/// Prepend entries to `PATH`, skipping ones already present
pub fn prepend_path(env: &mut BTreeMap<String, String>, entries: &[String]) {
    if entries.is_empty() {
        return;
    }
    let current = env.get("PATH").cloned().unwrap_or_default();
    let existing: Vec<&str> = current.split(':').filter(|p| !p.is_empty()).collect();

    let mut parts: Vec<String> = entries
        .iter()
        .filter(|e| !e.is_empty() && !existing.contains(&e.as_str()))
        .cloned()
        .collect();
    parts.extend(existing.iter().map(|s| s.to_string()));
    env.insert("PATH".to_string(), parts.join(":"));
}

/// Expand `${NAME}` references against `env`. Unknown names expand to "".
pub fn expand_vars(value: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if let Some(v) = env.get(name) {
                    out.push_str(v);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Warnings about variables that commonly break or subvert a workload
pub fn validate_environment_safety(env: &BTreeMap<String, String>) -> Vec<String> {
    let mut warnings = Vec::new();

    for var in ["LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT"] {
        if env.contains_key(var) {
            warnings.push(format!("Loader environment variable present: {}", var));
        }
    }

    if let Some(path) = env.get("PATH") {
        if path.contains("..") || path.contains('~') {
            warnings.push("PATH contains relative or home directory references".to_string());
        }
    }

    warnings
}

/// Apply the process umask
pub fn apply_umask(mask: u32) -> Result<()> {
    use nix::sys::stat::{umask, Mode};

    let mode = Mode::from_bits(mask as libc::mode_t)
        .ok_or_else(|| StartupError::Config(format!("Invalid umask: {:o}", mask)))?;
    umask(mode);
    log::info!("Applied umask: {:o}", mask);
    Ok(())
}

/// Set directory permissions
pub fn set_directory_permissions(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
        StartupError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to set permissions {:o} on {}: {}", mode, path.display(), e),
        ))
    })?;
    log::debug!("Set permissions {:o} on {}", mode, path.display());
    Ok(())
}
