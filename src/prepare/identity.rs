//! passwd entry for containers started with an arbitrary uid.
//!
//! Container platforms may run the image with a uid that has no passwd
//! entry. The JVM and the framework look the current user up, so an
//! anonymous entry is appended to a group-writable passwd file.

use crate::config::types::{IdentityConfig, Result, StartupError};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityOutcome {
    Disabled,
    AlreadyPresent,
    Appended(String),
}

/// Whether `content` (passwd format) has an entry for `uid`
pub fn has_passwd_entry(content: &str, uid: u32) -> bool {
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| line.split(':').nth(2))
        .any(|field| field.parse::<u32>().ok() == Some(uid))
}

/// Entry appended for an unknown uid
pub fn anonymous_entry(config: &IdentityConfig, uid: u32, gid: u32, home: &Path) -> String {
    format!(
        "{uid}:x:{uid}:{gid}:{}:{}:{}",
        config.gecos,
        home.display(),
        config.shell
    )
}

/// Ensure the passwd file has an entry for `uid`
pub fn ensure_passwd_entry(
    config: &IdentityConfig,
    uid: u32,
    gid: u32,
    home: &Path,
) -> Result<IdentityOutcome> {
    if !config.ensure_passwd_entry {
        return Ok(IdentityOutcome::Disabled);
    }

    let path = &config.passwd_file;
    let content = fs::read_to_string(path).map_err(|e| {
        StartupError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;

    if has_passwd_entry(&content, uid) {
        log::debug!("uid {} already present in {}", uid, path.display());
        return Ok(IdentityOutcome::AlreadyPresent);
    }

    let entry = anonymous_entry(config, uid, gid, home);
    let mut file = OpenOptions::new().append(true).open(path).map_err(|e| {
        StartupError::Config(format!(
            "uid {} has no entry and {} is not writable: {}",
            uid,
            path.display(),
            e
        ))
    })?;

    let separator = if content.is_empty() || content.ends_with('\n') {
        ""
    } else {
        "\n"
    };
    writeln!(file, "{}{}", separator, entry)?;
    log::info!("Added passwd entry for uid {}", uid);
    Ok(IdentityOutcome::Appended(entry))
}
