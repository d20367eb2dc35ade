//! Process table inspection through `/proc`.

use crate::config::types::{Result, StartupError};
use std::fs;

/// Fields of `/proc/<pid>/stat` the supervisor cares about
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    pub state: char,
    pub ppid: i32,
}

/// Parse a `/proc/<pid>/stat` line.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// or parentheses, so fields are split after the last `)`.
pub fn parse_stat(line: &str) -> Option<ProcStat> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    let pid = line[..open].trim().parse().ok()?;
    let mut rest = line.get(close + 1..)?.split_whitespace();
    let state = rest.next()?.chars().next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some(ProcStat { pid, state, ppid })
}

/// Every process currently visible in `/proc`
pub fn list_processes() -> Result<Vec<ProcStat>> {
    let entries = fs::read_dir("/proc")
        .map_err(|e| StartupError::Process(format!("Failed to read /proc: {}", e)))?;

    let mut stats = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        // Processes exit between readdir and read; skip them.
        if let Ok(line) = fs::read_to_string(entry.path().join("stat")) {
            if let Some(stat) = parse_stat(&line) {
                stats.push(stat);
            }
        }
    }
    Ok(stats)
}

/// Children of `parent` that are zombies (exited, not yet reaped)
pub fn zombie_children(parent: u32) -> Result<Vec<i32>> {
    Ok(list_processes()?
        .into_iter()
        .filter(|s| s.ppid == parent as i32 && s.state == 'Z')
        .map(|s| s.pid)
        .collect())
}
