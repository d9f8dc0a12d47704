pub mod manifest;
pub mod snapshot;
pub mod upload;
pub mod walk;

use crate::mirror::snapshot::SnapshotGate;
use crate::mirror::walk::safe_join;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("path policy violation for `{path}`: {reason}")]
    PathPolicy { path: String, reason: String },
}

pub(crate) fn io_error(path: &Path, source: std::io::Error) -> MirrorError {
    MirrorError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn sha256_file(path: &Path) -> Result<String, MirrorError> {
    let bytes = fs::read(path).map_err(|source| io_error(path, source))?;
    Ok(sha256_hex(&bytes))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
    pub replaced: bool,
}

/// Writes model-produced files under the output root, one file at a time,
/// taking the versioning snapshot before the first write of the run.
pub struct OutputWriter {
    out_root: PathBuf,
    gate: SnapshotGate,
}

impl OutputWriter {
    pub fn new(out_root: impl Into<PathBuf>, gate: SnapshotGate) -> Self {
        Self {
            out_root: out_root.into(),
            gate,
        }
    }

    pub fn out_root(&self) -> &Path {
        &self.out_root
    }

    pub fn snapshot_dir(&self) -> Option<&Path> {
        self.gate.created_dir()
    }

    pub fn write(&mut self, relative_path: &str, content: &str) -> Result<SavedFile, MirrorError> {
        let target = safe_join(&self.out_root, relative_path).map_err(|reason| {
            MirrorError::PathPolicy {
                path: relative_path.to_string(),
                reason,
            }
        })?;

        self.gate.ensure_snapshot()?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        let replaced = target.exists();
        fs::write(&target, content.as_bytes()).map_err(|source| io_error(&target, source))?;

        Ok(SavedFile {
            relative_path: relative_path.to_string(),
            absolute_path: target,
            bytes: content.len() as u64,
            sha256: sha256_hex(content.as_bytes()),
            replaced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::snapshot::SnapshotGate;

    #[test]
    fn writer_rejects_escaping_paths_and_writes_bytes_verbatim() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gate = SnapshotGate::disabled(temp.path());
        let mut writer = OutputWriter::new(temp.path(), gate);

        let saved = writer.write("pkg/main.py", "print('hi')\n").expect("write");
        assert_eq!(
            fs::read_to_string(&saved.absolute_path).expect("read"),
            "print('hi')\n"
        );
        assert!(!saved.replaced);

        let again = writer.write("pkg/main.py", "print('bye')\n").expect("rewrite");
        assert!(again.replaced);

        assert!(writer.write("../escape.txt", "x").is_err());
        assert!(writer.write("a\\b.txt", "x").is_err());
    }
}
