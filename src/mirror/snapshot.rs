use crate::mirror::{io_error, MirrorError};
use crate::shared::ids::{is_snapshot_dir_name, ts_code};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};

const DENY_NAMES: [&str; 3] = ["venv", ".venv", "LOG"];

/// Copy-on-first-write versioning gate. The snapshot directory
/// `<root_name><DDMMYYYYHHMM>` is created inside the output root at most once
/// per run, immediately before the first destructive write, and existing
/// snapshots are never copied into a new one.
#[derive(Debug)]
pub struct SnapshotGate {
    out_root: PathBuf,
    enabled: bool,
    created: Option<PathBuf>,
}

impl SnapshotGate {
    pub fn new(out_root: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            out_root: out_root.into(),
            enabled,
            created: None,
        }
    }

    pub fn disabled(out_root: impl Into<PathBuf>) -> Self {
        Self::new(out_root, false)
    }

    pub fn created_dir(&self) -> Option<&Path> {
        self.created.as_deref()
    }

    /// Take the snapshot if versioning is on and none was taken yet this run.
    /// Returns the snapshot directory when one was just created.
    pub fn ensure_snapshot(&mut self) -> Result<Option<&Path>, MirrorError> {
        if !self.enabled || self.created.is_some() {
            return Ok(None);
        }
        if !self.out_root.is_dir() {
            // Nothing to preserve yet; the first write will create the root.
            self.created = None;
            self.enabled = false;
            return Ok(None);
        }

        let root_name = self
            .out_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "out".to_string());
        let snap_name = format!("{root_name}{}", ts_code(Local::now()));
        let snap_dir = self.out_root.join(&snap_name);

        copy_tree(&self.out_root, &snap_dir, &root_name, &snap_name)?;
        self.created = Some(snap_dir);
        Ok(self.created.as_deref())
    }
}

fn copy_tree(
    src: &Path,
    dst: &Path,
    root_name: &str,
    snap_name: &str,
) -> Result<(), MirrorError> {
    fs::create_dir_all(dst).map_err(|source| io_error(dst, source))?;
    let entries = fs::read_dir(src).map_err(|source| io_error(src, source))?;
    for entry in entries {
        let entry = entry.map_err(|source| io_error(src, source))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name == snap_name
            || DENY_NAMES.contains(&name.as_str())
            || is_snapshot_dir_name(&name, root_name)
        {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        let file_type = entry
            .file_type()
            .map_err(|source| io_error(&from, source))?;
        if file_type.is_dir() {
            copy_tree(&from, &to, root_name, snap_name)?;
        } else if file_type.is_file() {
            fs::copy(&from, &to).map_err(|source| io_error(&from, source))?;
        }
    }
    Ok(())
}
