//! Filesystem layout checks and directory creation.

use crate::config::types::{DirectorySpec, FrameworkConfig, JavaConfig, Result, StartupError};
use crate::utils::env_hygiene::set_directory_permissions;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn missing(path: &Path, what: &str) -> StartupError {
    StartupError::Config(format!("{} not found: {}", what, path.display()))
}

/// Every path must exist (file, directory or anything else)
pub fn verify_required_paths(paths: &[PathBuf]) -> Result<()> {
    let absent: Vec<String> = paths
        .iter()
        .filter(|p| fs::symlink_metadata(p).is_err())
        .map(|p| p.display().to_string())
        .collect();

    if absent.is_empty() {
        return Ok(());
    }
    Err(StartupError::Config(format!(
        "required path(s) missing: {}",
        absent.join(", ")
    )))
}

/// Create directories recursively and apply their modes.
///
/// Returns the directories that did not exist before.
pub fn create_directories(dirs: &[DirectorySpec]) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    for dir in dirs {
        if dir.path.exists() && !dir.path.is_dir() {
            return Err(StartupError::Config(format!(
                "{} exists and is not a directory",
                dir.path.display()
            )));
        }
        if !dir.path.exists() {
            fs::create_dir_all(&dir.path)?;
            created.push(dir.path.clone());
        }
        set_directory_permissions(&dir.path, dir.mode)?;
    }
    Ok(created)
}

/// Check the framework's packaged layout (home, jars, examples, tests)
pub fn verify_framework(framework: &FrameworkConfig) -> Result<()> {
    for (path, what) in [
        (framework.home.clone(), "framework home"),
        (framework.jars_path(), "framework jars directory"),
        (framework.examples_path(), "framework examples directory"),
        (framework.tests_path(), "framework tests directory"),
    ] {
        if !path.is_dir() {
            return Err(missing(&path, what));
        }
    }
    Ok(())
}

/// Check that `<java.home>/bin/java` is an executable file
pub fn verify_java(java: &JavaConfig) -> Result<()> {
    let binary = java.java_binary();
    let meta = fs::metadata(&binary).map_err(|_| missing(&binary, "java binary"))?;
    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
        return Err(StartupError::Config(format!(
            "java binary is not executable: {}",
            binary.display()
        )));
    }
    Ok(())
}
