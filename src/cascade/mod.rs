pub mod assemble;
pub mod batch;
pub mod contract;
pub mod engine;
pub mod request;

use crate::cascade::assemble::AssemblyError;
use crate::cascade::contract::ContractError;
use crate::ledger::LedgerError;
use crate::mirror::MirrorError;
use crate::provider::transport::{ProviderError, ProviderErrorKind};
use crate::runlog::RunlogError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunMode {
    Generate,
    Modify,
    Qa,
    Qfile,
    Batch,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Generate => "GENERATE",
            RunMode::Modify => "MODIFY",
            RunMode::Qa => "QA",
            RunMode::Qfile => "QFILE",
            RunMode::Batch => "BATCH",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "GENERATE" => Some(RunMode::Generate),
            "MODIFY" => Some(RunMode::Modify),
            "QA" => Some(RunMode::Qa),
            "QFILE" => Some(RunMode::Qfile),
            "BATCH" | "C" => Some(RunMode::Batch),
            _ => None,
        }
    }

    pub fn writes_files(&self) -> bool {
        !matches!(self, RunMode::Qa)
    }

    pub fn needs_chaining(&self) -> bool {
        matches!(self, RunMode::Generate | RunMode::Modify)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the caller specifies for one run. Validated before a run id is
/// even allocated; configuration problems never produce a run directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunRequest {
    pub mode: RunMode,
    #[serde(default)]
    pub project: String,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub previous_response_id: Option<String>,
    #[serde(default)]
    pub input_root: Option<PathBuf>,
    #[serde(default)]
    pub output_root: Option<PathBuf>,
    #[serde(default)]
    pub attached_file_ids: Vec<String>,
    #[serde(default)]
    pub versioning: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub use_file_search: bool,
    #[serde(default)]
    pub skip_paths: Vec<String>,
    #[serde(default)]
    pub skip_extensions: Vec<String>,
}

impl RunRequest {
    pub fn validate(&self) -> Result<(), RunError> {
        let fail = |reason: &str| Err(RunError::Configuration(reason.to_string()));
        if self.model.trim().is_empty() {
            return fail("model must be set");
        }
        if self.prompt.trim().is_empty() {
            return fail("prompt must be non-empty");
        }
        match self.mode {
            RunMode::Generate | RunMode::Qfile | RunMode::Batch => {
                if self.input_root.is_some() {
                    return fail("this mode does not take an input root");
                }
                if self.output_root.is_none() {
                    return fail("an output root is required");
                }
            }
            RunMode::Modify => {
                if self.input_root.is_none() {
                    return fail("MODIFY requires an input root");
                }
                if self.output_root.is_none() {
                    return fail("an output root is required");
                }
            }
            RunMode::Qa => {
                if self.input_root.is_some() {
                    return fail("QA does not take an input root");
                }
            }
        }
        if let Some(root) = &self.input_root {
            if !root.is_dir() {
                return fail("input root is not a directory");
            }
        }
        if self.dry_run && self.mode != RunMode::Modify {
            return fail("dry-run applies to MODIFY only");
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error("path policy violation for `{path}`: {reason}")]
    PathPolicy { path: String, reason: String },
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Runlog(#[from] RunlogError),
    #[error("invalid run request: {0}")]
    Configuration(String),
    #[error("run cancelled")]
    Cancelled,
}

impl RunError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            RunError::Cancelled => true,
            RunError::Provider(err) => err.kind == ProviderErrorKind::Cancelled,
            _ => false,
        }
    }
}

/// What a finished run hands back to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub response_id: Option<String>,
    pub batch_id: Option<String>,
    pub saved_paths: Vec<String>,
    pub failed_paths: Vec<String>,
    pub answer: Option<String>,
    pub snapshot_dir: Option<PathBuf>,
}
