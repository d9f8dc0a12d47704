use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to write settings {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub breaker_failures: u32,
    pub breaker_window_s: u64,
    pub breaker_cooldown_s: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            breaker_failures: 5,
            breaker_window_s: 30,
            breaker_cooldown_s: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SecurityPolicy {
    pub max_file_bytes: u64,
    pub deny_extensions: Vec<String>,
    pub allow_extensions: Vec<String>,
    pub deny_globs: Vec<String>,
    pub allow_globs: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            max_file_bytes: 10 * 1024 * 1024,
            deny_extensions: [
                ".exe", ".dll", ".so", ".dylib", ".zip", ".7z", ".rar", ".png", ".jpg",
                ".jpeg", ".gif", ".pdf", ".db", ".sqlite", ".pkl", ".pt", ".onnx",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            allow_extensions: Vec::new(),
            deny_globs: ["**/.git/**", "**/node_modules/**", "**/target/**"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allow_globs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BatchPolicy {
    pub poll_min_s: u64,
    pub poll_max_s: u64,
    pub timeout_s: u64,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            poll_min_s: 5,
            poll_max_s: 60,
            timeout_s: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    pub log_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub capability_cache_path: PathBuf,
    pub pricing_cache_path: PathBuf,
    pub provider_base_url: String,
    pub request_timeout_s: u64,
    pub upload_workers: usize,
    pub default_temperature: f32,
    pub retry: RetryPolicy,
    pub security: SecurityPolicy,
    pub batch: BatchPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("LOG"),
            ledger_path: PathBuf::from("cascader.sqlite"),
            capability_cache_path: PathBuf::from("cache/capabilities.json"),
            pricing_cache_path: PathBuf::from("cache/pricing.json"),
            provider_base_url: "https://api.openai.com/v1".to_string(),
            request_timeout_s: 120,
            upload_workers: 4,
            default_temperature: 0.2,
            retry: RetryPolicy::default(),
            security: SecurityPolicy::default(),
            batch: BatchPolicy::default(),
        }
    }
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.is_file() {
            Self::from_path(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        let body = serde_yaml::to_string(self).map_err(|source| ConfigError::Invalid(
            format!("settings encode failed: {source}"),
        ))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.display().to_string(),
                source,
            })?;
        }
        fs::write(path, body).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload_workers == 0 {
            return Err(ConfigError::Invalid(
                "`upload_workers` must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_s == 0 {
            return Err(ConfigError::Invalid(
                "`request_timeout_s` must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "`retry.max_attempts` must be at least 1".to_string(),
            ));
        }
        if self.batch.poll_min_s == 0 || self.batch.poll_min_s > self.batch.poll_max_s {
            return Err(ConfigError::Invalid(
                "`batch.poll_min_s` must be in 1..=poll_max_s".to_string(),
            ));
        }
        if !(0.0..=0.2).contains(&self.default_temperature) {
            return Err(ConfigError::Invalid(
                "`default_temperature` must be within 0.0..=0.2".to_string(),
            ));
        }
        Ok(())
    }
}

pub const DEFAULT_SETTINGS_FILE: &str = "cascader.yaml";
