use crate::mirror::walk::ScanItem;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ManifestEntry {
    pub relative_path: String,
    pub absolute_path: String,
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    pub uploaded: bool,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub skip_reason: Option<String>,
}

/// Inventory of the mirrored input tree for one run. Serialized into the run
/// log, uploaded to the provider as a regular file, and restated as a text
/// listing inside request instructions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Manifest {
    pub root: String,
    pub project: String,
    pub generated_at: i64,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn from_scan(root: &Path, project: &str, items: &[ScanItem], now: i64) -> Self {
        Self {
            root: root.display().to_string(),
            project: project.to_string(),
            generated_at: now,
            files: items
                .iter()
                .map(|item| ManifestEntry {
                    relative_path: item.rel_path.clone(),
                    absolute_path: item.abs_path.display().to_string(),
                    size: item.size,
                    sha256: item.sha256.clone(),
                    uploaded: false,
                    file_id: None,
                    skip_reason: item.skip_reason.clone(),
                })
                .collect(),
        }
    }

    pub fn mark_uploaded(&mut self, relative_path: &str, file_id: &str) {
        if let Some(entry) = self
            .files
            .iter_mut()
            .find(|e| e.relative_path == relative_path)
        {
            entry.uploaded = true;
            entry.file_id = Some(file_id.to_string());
            entry.skip_reason = None;
        }
    }

    pub fn mark_upload_failed(&mut self, relative_path: &str) {
        if let Some(entry) = self
            .files
            .iter_mut()
            .find(|e| e.relative_path == relative_path)
        {
            entry.uploaded = false;
            entry.file_id = None;
            entry.skip_reason = Some("upload_failed".to_string());
        }
    }

    pub fn uploaded_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.files.iter().filter(|e| e.uploaded)
    }

    pub fn uploaded_file_ids(&self) -> Vec<String> {
        self.uploaded_entries()
            .filter_map(|e| e.file_id.clone())
            .collect()
    }

    /// The redundant in-prompt channel: one line per mirrored file so the
    /// model can resolve paths to file ids without the search tool.
    pub fn instruction_listing(&self) -> String {
        let mut lines = vec!["MANIFEST (path -> file_id):".to_string()];
        for entry in self.uploaded_entries() {
            lines.push(format!(
                "- {} -> {}",
                entry.relative_path,
                entry.file_id.as_deref().unwrap_or("")
            ));
        }
        lines.join("\n")
    }
}
