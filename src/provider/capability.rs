use crate::provider::client::ProviderApi;
use crate::provider::types::{ContentPart, InputMessage, ResponsesRequest, Tool};
use crate::shared::fs_atomic::atomic_write_file;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

pub const CAPABILITY_TTL_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CapabilityRecord {
    pub model: String,
    pub probed_at: i64,
    pub supports_previous_response: bool,
    pub supports_temperature: bool,
    pub supports_file_search: bool,
}

impl CapabilityRecord {
    /// Starting point before any probe: chaining and temperature are assumed
    /// to work, the search tool is off until proven.
    pub fn optimistic(model: &str, now: i64) -> Self {
        Self {
            model: model.to_string(),
            probed_at: now,
            supports_previous_response: true,
            supports_temperature: true,
            supports_file_search: false,
        }
    }

    pub fn is_stale(&self, now: i64, ttl_secs: i64) -> bool {
        ttl_secs > 0 && now.saturating_sub(self.probed_at) > ttl_secs
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityCacheError {
    #[error("failed to read capability cache {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse capability cache {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write capability cache {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    models: BTreeMap<String, CapabilityRecord>,
}

/// Disk-backed per-model capability matrix. Probe updates are serialized
/// through a sibling lock file so concurrent processes do not clobber the
/// cache.
#[derive(Debug)]
pub struct CapabilityCache {
    path: PathBuf,
    models: BTreeMap<String, CapabilityRecord>,
}

impl CapabilityCache {
    pub fn load(path: &Path) -> Result<Self, CapabilityCacheError> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                models: BTreeMap::new(),
            });
        }
        let raw = fs::read_to_string(path).map_err(|source| CapabilityCacheError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: CacheFile =
            serde_json::from_str(&raw).map_err(|source| CapabilityCacheError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            models: file.models,
        })
    }

    pub fn get(&self, model: &str) -> Option<&CapabilityRecord> {
        self.models.get(model)
    }

    pub fn fresh(&self, model: &str, now: i64) -> Option<&CapabilityRecord> {
        self.get(model)
            .filter(|record| !record.is_stale(now, CAPABILITY_TTL_SECS))
    }

    pub fn upsert(&mut self, record: CapabilityRecord) {
        self.models.insert(record.model.clone(), record);
    }

    pub fn save(&self) -> Result<(), CapabilityCacheError> {
        let _lock = CacheLock::acquire(&self.path);
        let body = serde_json::to_vec_pretty(&CacheFile {
            models: self.models.clone(),
        })
        .map_err(|source| CapabilityCacheError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;
        atomic_write_file(&self.path, &body).map_err(|source| CapabilityCacheError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }
}

struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    fn acquire(cache_path: &Path) -> Option<Self> {
        let path = cache_path.with_extension("lock");
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        for _ in 0..50 {
            match fs::OpenOptions::new().create_new(true).write(true).open(&path) {
                Ok(_) => return Some(Self { path }),
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        }
        // A stale lock must not wedge the cache forever; proceed unlocked.
        None
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// True only for error messages that clearly say the named parameter was
/// rejected by the schema. Rate limits, timeouts and server errors must not
/// look like "unsupported".
pub fn err_indicates_param_unsupported(message: &str, param: &str) -> bool {
    if message.is_empty() {
        return false;
    }
    let lowered = message.to_ascii_lowercase();
    let key = param.to_ascii_lowercase();
    if !lowered.contains(&key) {
        return false;
    }
    let needles = [
        format!("unknown parameter: {key}"),
        format!("unrecognized parameter: {key}"),
        format!("unexpected parameter: {key}"),
        format!("unsupported parameter: {key}"),
        format!("'{key}' is not permitted"),
        format!("'{key}' was unexpected"),
        format!("{key} is not allowed"),
        format!("{key} is not supported"),
        "additional properties are not allowed".to_string(),
        "extra fields not permitted".to_string(),
    ];
    if needles.iter().any(|n| lowered.contains(n.as_str())) {
        return true;
    }
    (lowered.contains("unknown") || lowered.contains("unrecognized") || lowered.contains("unsupported"))
        && (lowered.contains("parameter") || lowered.contains("field"))
}

fn probe_request(model: &str, contract: &str, text: &str) -> ResponsesRequest {
    ResponsesRequest {
        model: model.to_string(),
        instructions: format!(
            "Return ONLY valid JSON: {{\"contract\":\"{contract}\",\"ok\":true}}. No extra text."
        ),
        input: vec![InputMessage::user(vec![ContentPart::InputText {
            text: text.to_string(),
        }])],
        tools: None,
        previous_response_id: None,
        temperature: None,
        idempotency_key: format!("probe:{model}:{contract}"),
    }
}

/// Probe one model. Prior values survive transient failures; only explicit
/// parameter rejections flip a flag to `false`, and only a successful use
/// flips one to `true`.
pub fn probe_model(
    api: &dyn ProviderApi,
    model: &str,
    probe_vector_store: Option<&str>,
    prior: Option<&CapabilityRecord>,
    now: i64,
) -> CapabilityRecord {
    let mut record = prior
        .cloned()
        .unwrap_or_else(|| CapabilityRecord::optimistic(model, now));
    record.probed_at = now;

    let basic = api.create_response(&probe_request(model, "CAP_PING", "ping"));
    let base_id = match basic {
        Ok(envelope) => envelope.id,
        Err(_) => return record,
    };

    if !base_id.is_empty() {
        let mut chained = probe_request(model, "CAP_PREV", "pong");
        chained.previous_response_id = Some(base_id);
        match api.create_response(&chained) {
            Ok(_) => record.supports_previous_response = true,
            Err(err) => {
                if err_indicates_param_unsupported(&err.message, "previous_response_id") {
                    record.supports_previous_response = false;
                }
            }
        }
    }

    let mut tempered = probe_request(model, "CAP_TEMP", "temp");
    tempered.temperature = Some(0.0);
    match api.create_response(&tempered) {
        Ok(_) => record.supports_temperature = true,
        Err(err) => {
            if err_indicates_param_unsupported(&err.message, "temperature") {
                record.supports_temperature = false;
            }
        }
    }

    if let Some(vs_id) = probe_vector_store {
        let mut searched = probe_request(model, "CAP_TOOLS", "search for the marker and confirm");
        searched.tools = Some(vec![Tool::FileSearch {
            vector_store_ids: vec![vs_id.to_string()],
        }]);
        match api.create_response(&searched) {
            Ok(_) => record.supports_file_search = true,
            Err(err) => {
                if err_indicates_param_unsupported(&err.message, "tools") {
                    record.supports_file_search = false;
                }
            }
        }
    }

    record
}

/// Resolve capabilities for a run: fresh cache hit unless forced, otherwise
/// probe and persist. Transient probe failures leave the cached record as it
/// was apart from the timestamp.
pub fn resolve_capabilities(
    api: &dyn ProviderApi,
    cache: &mut CapabilityCache,
    model: &str,
    probe_vector_store: Option<&str>,
    force: bool,
    now: i64,
) -> Result<CapabilityRecord, CapabilityCacheError> {
    if !force {
        if let Some(fresh) = cache.fresh(model, now) {
            return Ok(fresh.clone());
        }
    }
    let prior = cache.get(model).cloned();
    let record = probe_model(api, model, probe_vector_store, prior.as_ref(), now);
    cache.upsert(record.clone());
    cache.save()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_rejection_detection_requires_the_parameter_name() {
        assert!(err_indicates_param_unsupported(
            "Unknown parameter: temperature",
            "temperature"
        ));
        assert!(err_indicates_param_unsupported(
            "'previous_response_id' is not permitted",
            "previous_response_id"
        ));
        assert!(!err_indicates_param_unsupported(
            "429 too many requests",
            "temperature"
        ));
        assert!(!err_indicates_param_unsupported(
            "Unknown parameter: tools",
            "temperature"
        ));
        assert!(!err_indicates_param_unsupported("", "temperature"));
    }

    #[test]
    fn records_age_out_after_ttl() {
        let record = CapabilityRecord::optimistic("m", 1_000);
        assert!(!record.is_stale(1_000 + CAPABILITY_TTL_SECS, CAPABILITY_TTL_SECS));
        assert!(record.is_stale(1_001 + CAPABILITY_TTL_SECS, CAPABILITY_TTL_SECS));
    }

    #[test]
    fn cache_round_trips_and_locks_are_released() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("caps.json");
        let mut cache = CapabilityCache::load(&path).expect("empty load");
        cache.upsert(CapabilityRecord {
            model: "m-1".to_string(),
            probed_at: 10,
            supports_previous_response: true,
            supports_temperature: false,
            supports_file_search: true,
        });
        cache.save().expect("save");
        assert!(!path.with_extension("lock").exists());

        let reloaded = CapabilityCache::load(&path).expect("reload");
        let record = reloaded.get("m-1").expect("record");
        assert!(!record.supports_temperature);
        assert!(record.supports_file_search);
    }
}
