use crate::shared::fs_atomic::{append_line, atomic_write_json};
use crate::shared::scrub::redact;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
pub enum RunlogError {
    #[error("failed to read run state {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse run state {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("run `{run_id}` has no log directory under {log_root}")]
    MissingRun { run_id: String, log_root: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed | RunStatus::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UploadedFile {
    pub file_id: String,
    pub sha256: Option<String>,
    pub size: u64,
}

/// Durable per-run state. Only the supervisor's run thread mutates it; the
/// logger persists scrubbed snapshots, and resume reads the latest snapshot
/// back. The step cursor never regresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunState {
    pub run_id: String,
    pub project: String,
    pub mode: String,
    pub model: String,
    pub status: RunStatus,
    pub step_cursor: u32,
    #[serde(default)]
    pub response_chain: Vec<String>,
    #[serde(default)]
    pub uploaded: BTreeMap<String, UploadedFile>,
    #[serde(default)]
    pub manifest_file_id: Option<String>,
    #[serde(default)]
    pub vector_store_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub snapshot_created: bool,
    #[serde(default)]
    pub structure: Option<Value>,
    #[serde(default)]
    pub structure_response_id: Option<String>,
    #[serde(default)]
    pub completed_paths: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunState {
    pub fn new(run_id: &str, project: &str, mode: &str, model: &str, now: i64) -> Self {
        Self {
            run_id: run_id.to_string(),
            project: project.to_string(),
            mode: mode.to_string(),
            model: model.to_string(),
            status: RunStatus::Pending,
            step_cursor: 0,
            response_chain: Vec::new(),
            uploaded: BTreeMap::new(),
            manifest_file_id: None,
            vector_store_id: None,
            batch_id: None,
            snapshot_created: false,
            structure: None,
            structure_response_id: None,
            completed_paths: Vec::new(),
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn advance_cursor(&mut self, to: u32, now: i64) {
        // The cursor is monotonic; resume relies on it never moving back.
        self.step_cursor = self.step_cursor.max(to);
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Request,
    Response,
    Manifest,
    UiState,
}

impl ArtifactKind {
    fn dir_name(self) -> &'static str {
        match self {
            ArtifactKind::Request => "requests",
            ArtifactKind::Response => "responses",
            ArtifactKind::Manifest => "manifests",
            ArtifactKind::UiState => "",
        }
    }
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Per-run artifact store under `LOG/<run_id>/`. All writes are atomic and
/// scrubbed. Disk failures never propagate: the logger flips into degraded
/// mode, buffers events in memory, and the run continues.
pub struct RunLogger {
    run_dir: PathBuf,
    events_path: PathBuf,
    state_path: PathBuf,
    seq: AtomicU64,
    degraded: AtomicBool,
    buffered: Mutex<Vec<String>>,
}

impl RunLogger {
    pub fn create(log_root: &Path, run_id: &str) -> Self {
        let run_dir = log_root.join(run_id);
        let events_path = run_dir.join("events.jsonl");
        let starting_seq = fs::read_to_string(&events_path)
            .map(|raw| raw.lines().count() as u64)
            .unwrap_or(0);
        let logger = Self {
            state_path: run_dir.join("run_state.json"),
            events_path,
            run_dir,
            seq: AtomicU64::new(starting_seq),
            degraded: AtomicBool::new(false),
            buffered: Mutex::new(Vec::new()),
        };
        if fs::create_dir_all(&logger.run_dir).is_err() {
            logger.enter_degraded();
        }
        logger
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn buffered_events(&self) -> Vec<String> {
        self.buffered.lock().map(|b| b.clone()).unwrap_or_default()
    }

    fn enter_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
    }

    pub fn event(&self, level: &str, step: &str, kind: &str, data: Value) {
        let record = json!({
            "ts": now_secs(),
            "seq": self.seq.fetch_add(1, Ordering::Relaxed),
            "level": level,
            "step": step,
            "kind": kind,
            "data": redact(&data),
        });
        let line = record.to_string();
        if self.is_degraded() || append_line(&self.events_path, &line).is_err() {
            self.enter_degraded();
            if let Ok(mut buffer) = self.buffered.lock() {
                buffer.push(line);
            }
        }
    }

    pub fn write_state(&self, state: &RunState) {
        let value = match serde_json::to_value(state) {
            Ok(value) => redact(&value),
            Err(_) => return,
        };
        if atomic_write_json(&self.state_path, &value).is_err() {
            self.enter_degraded();
        }
    }

    /// Store a discrete artifact. Returns the path when it landed on disk;
    /// `None` means the logger is degraded and the artifact was dropped.
    pub fn save_artifact(&self, kind: ArtifactKind, name: &str, payload: &Value) -> Option<PathBuf> {
        let safe: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            .take(140)
            .collect();
        let path = match kind {
            ArtifactKind::UiState => self.run_dir.join("ui_state.json"),
            other => self.run_dir.join(other.dir_name()).join(format!("{safe}.json")),
        };
        if atomic_write_json(&path, &redact(payload)).is_err() {
            self.enter_degraded();
            return None;
        }
        self.event(
            "debug",
            "",
            "artifact.saved",
            json!({"path": path.display().to_string()}),
        );
        Some(path)
    }
}

pub fn run_state_path(log_root: &Path, run_id: &str) -> PathBuf {
    log_root.join(run_id).join("run_state.json")
}

pub fn load_run_state(log_root: &Path, run_id: &str) -> Result<RunState, RunlogError> {
    let path = run_state_path(log_root, run_id);
    if !path.is_file() {
        return Err(RunlogError::MissingRun {
            run_id: run_id.to_string(),
            log_root: log_root.display().to_string(),
        });
    }
    let raw = fs::read_to_string(&path).map_err(|source| RunlogError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| RunlogError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RunSummary {
    pub run_id: String,
    pub mode: String,
    pub model: String,
    pub status: RunStatus,
    pub updated_at: i64,
}

pub fn list_runs(log_root: &Path) -> Vec<RunSummary> {
    let Ok(entries) = fs::read_dir(log_root) else {
        return Vec::new();
    };
    let mut summaries = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("RUN_") || !entry.path().is_dir() {
            continue;
        }
        if let Ok(state) = load_run_state(log_root, &name) {
            summaries.push(RunSummary {
                run_id: state.run_id,
                mode: state.mode,
                model: state.model,
                status: state.status,
                updated_at: state.updated_at,
            });
        }
    }
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.run_id.cmp(&a.run_id)));
    summaries
}

/// Most recently updated run that never reached a terminal state, if any.
pub fn find_resumable(log_root: &Path) -> Option<String> {
    list_runs(log_root)
        .into_iter()
        .find(|summary| !summary.status.is_terminal())
        .map(|summary| summary.run_id)
}
