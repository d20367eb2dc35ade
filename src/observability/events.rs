/// Lifecycle event logging for the startup sequence.
///
/// Every event goes to the `log` facade under the `enclave_init::events`
/// target. When an events file is configured, the same event is appended to
/// it as one JSON line.
use crate::config::types::{Result, StartupError};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

const TARGET: &str = "enclave_init::events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConfigLoaded,
    PrepareStep,
    PrepareFailed,
    WorkloadStarted,
    SignalForwarded,
    WorkloadExited,
}

impl EventKind {
    fn is_failure(self) -> bool {
        matches!(self, Self::PrepareFailed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub details: String,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_pid: Option<i32>,
}

impl LifecycleEvent {
    pub fn new(run_id: &str, kind: EventKind, details: impl Into<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            kind,
            details: details.into(),
            pid: std::process::id(),
            child_pid: None,
        }
    }

    pub fn with_child_pid(mut self, pid: i32) -> Self {
        self.child_pid = Some(pid);
        self
    }
}

/// JSON-lines sink for lifecycle events
pub struct EventSink {
    file: Mutex<File>,
    path: PathBuf,
}

impl EventSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StartupError::Config(format!(
                    "Failed to create events directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                StartupError::Config(format!(
                    "Failed to open events file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, event: &LifecycleEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(target: TARGET, "Failed to encode lifecycle event: {}", e);
                return;
            }
        };

        match self.file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                    warn!(target: TARGET, "Failed to write events file: {}", e);
                }
            }
            Err(_) => warn!(target: TARGET, "Events file lock poisoned"),
        }
    }
}

static EVENT_SINK: OnceLock<EventSink> = OnceLock::new();

/// Install the global events file. A second call keeps the first sink.
pub fn init_event_sink(path: &Path) -> Result<()> {
    let sink = EventSink::open(path)?;
    if EVENT_SINK.set(sink).is_err() {
        warn!(target: TARGET, "Event sink already initialized");
    } else {
        info!(target: TARGET, "Lifecycle events written to {}", path.display());
    }
    Ok(())
}

/// Emit an event to the log and, when installed, to the events file
pub fn emit(event: LifecycleEvent) {
    if event.kind.is_failure() {
        warn!(target: TARGET, "{:?}: {}", event.kind, event.details);
    } else {
        info!(target: TARGET, "{:?}: {}", event.kind, event.details);
    }

    if let Some(sink) = EVENT_SINK.get() {
        sink.write(&event);
    }
}

pub fn config_loaded(run_id: &str, source: &str) {
    emit(LifecycleEvent::new(
        run_id,
        EventKind::ConfigLoaded,
        format!("configuration loaded from {}", source),
    ));
}

pub fn prepare_step(run_id: &str, step: &str, details: &str) {
    emit(LifecycleEvent::new(
        run_id,
        EventKind::PrepareStep,
        format!("{}: {}", step, details),
    ));
}

pub fn prepare_failed(run_id: &str, error: &str) {
    emit(LifecycleEvent::new(run_id, EventKind::PrepareFailed, error));
}

pub fn workload_started(run_id: &str, child_pid: i32, command: &[String]) {
    emit(
        LifecycleEvent::new(
            run_id,
            EventKind::WorkloadStarted,
            format!("started {:?}", command),
        )
        .with_child_pid(child_pid),
    );
}

pub fn signal_forwarded(run_id: &str, child_pid: i32, signal: &str, to_group: bool) {
    let target = if to_group { "process group" } else { "process" };
    emit(
        LifecycleEvent::new(
            run_id,
            EventKind::SignalForwarded,
            format!("forwarded {} to workload {}", signal, target),
        )
        .with_child_pid(child_pid),
    );
}

pub fn workload_exited(run_id: &str, child_pid: i32, details: &str) {
    emit(LifecycleEvent::new(run_id, EventKind::WorkloadExited, details).with_child_pid(child_pid));
}
