//! Enclave runtime instance preparation.
//!
//! The trusted-execution runtime runs the workload from an image directory
//! inside its instance directory. This step creates the image skeleton and
//! copies the configured artifacts into it once; a marker file makes later
//! starts skip the copy.

use crate::config::types::{CopySpec, EnclaveConfig, Result, StartupError};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnclaveOutcome {
    Disabled,
    /// Marker present, copy skipped
    AlreadyPrepared,
    Prepared { copied_files: usize },
}

pub fn image_root(instance_dir: &Path) -> PathBuf {
    instance_dir.join("image")
}

/// Prepare the instance directory described by `config`
pub fn prepare_instance(config: &EnclaveConfig) -> Result<EnclaveOutcome> {
    let Some(instance_dir) = &config.instance_dir else {
        return Ok(EnclaveOutcome::Disabled);
    };

    let image = image_root(instance_dir);
    fs::create_dir_all(&image)?;
    for dir in &config.image_dirs {
        fs::create_dir_all(image.join(dir))?;
    }

    let marker = instance_dir.join(&config.marker);
    if marker.exists() {
        log::info!(
            "Enclave instance {} already prepared, skipping copy",
            instance_dir.display()
        );
        return Ok(EnclaveOutcome::AlreadyPrepared);
    }

    let mut copied_files = 0;
    for spec in &config.copy {
        copied_files += copy_into_image(spec, &image)?;
    }

    // Only a complete copy is marked, an interrupted one is redone next start
    fs::write(&marker, "prepared\n")?;
    log::info!(
        "Enclave instance {} prepared ({} files copied)",
        instance_dir.display(),
        copied_files
    );
    Ok(EnclaveOutcome::Prepared { copied_files })
}

/// Copy one file or directory tree to `<image>/<to>`, returning files copied
fn copy_into_image(spec: &CopySpec, image: &Path) -> Result<usize> {
    let dest = image.join(&spec.to);
    let meta = fs::metadata(&spec.from).map_err(|e| {
        StartupError::Config(format!(
            "enclave copy source {}: {}",
            spec.from.display(),
            e
        ))
    })?;

    if meta.is_file() {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&spec.from, &dest)?;
        return Ok(1);
    }

    let mut copied = 0;
    for entry in WalkDir::new(&spec.from).follow_links(true) {
        let entry = entry.map_err(|e| {
            StartupError::Config(format!(
                "walking enclave copy source {}: {}",
                spec.from.display(),
                e
            ))
        })?;
        let rel = entry
            .path()
            .strip_prefix(&spec.from)
            .map_err(|e| StartupError::Process(format!("unexpected walk path: {}", e)))?;
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
