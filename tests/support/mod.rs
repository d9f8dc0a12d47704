#![allow(dead_code)]

use cascader::config::Settings;
use cascader::provider::capability::{CapabilityCache, CapabilityRecord};
use cascader::provider::client::ProviderApi;
use cascader::provider::transport::ProviderError;
use cascader::provider::types::{
    BatchInfo, ModelInfo, ResponseEnvelope, ResponsesRequest, VectorStoreFileStatus,
};
use cascader::runlog::now_secs;
use cascader::runtime::CancelFlag;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn fresh_settings(root: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.log_dir = root.join("LOG");
    settings.ledger_path = root.join("receipts.sqlite");
    settings.capability_cache_path = root.join("cache/capabilities.json");
    settings.pricing_cache_path = root.join("cache/pricing.json");
    settings
}

/// Pre-seed a fresh capability record so runs do not spend scripted
/// responses on probing.
pub fn seed_capabilities(settings: &Settings, model: &str, prev: bool, temp: bool, search: bool) {
    let mut cache = CapabilityCache::load(&settings.capability_cache_path).expect("cache");
    cache.upsert(CapabilityRecord {
        model: model.to_string(),
        probed_at: now_secs(),
        supports_previous_response: prev,
        supports_temperature: temp,
        supports_file_search: search,
    });
    cache.save().expect("save caps");
}

/// A raw `/responses` payload the way the provider would return it.
pub fn envelope(id: &str, contract: &Value, tokens: (u64, u64)) -> Value {
    json!({
        "id": id,
        "status": "completed",
        "usage": {"input_tokens": tokens.0, "output_tokens": tokens.1},
        "output_text": contract.to_string(),
    })
}

/// Scripted stand-in for the provider: responses are served in order,
/// uploads get sequential ids, vector stores index instantly, batches walk a
/// scripted status sequence.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<Value, ProviderError>>>,
    pub seen_requests: Mutex<Vec<ResponsesRequest>>,
    pub uploads: Mutex<Vec<(String, String)>>,
    pub vector_stores_created: Mutex<Vec<String>>,
    pub vector_store_files: Mutex<Vec<(String, String)>>,
    pub file_contents: Mutex<HashMap<String, Vec<u8>>>,
    batch_statuses: Mutex<VecDeque<String>>,
    pub batch_output_file: Option<String>,
    next_id: AtomicUsize,
    block_at_request: Option<usize>,
    cancel: Mutex<Option<CancelFlag>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            seen_requests: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            vector_stores_created: Mutex::new(Vec::new()),
            vector_store_files: Mutex::new(Vec::new()),
            file_contents: Mutex::new(HashMap::new()),
            batch_statuses: Mutex::new(VecDeque::new()),
            batch_output_file: None,
            next_id: AtomicUsize::new(1),
            block_at_request: None,
            cancel: Mutex::new(None),
        }
    }
}

impl ScriptedProvider {
    pub fn with_responses(responses: Vec<Result<Value, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    pub fn with_batch(
        responses: Vec<Result<Value, ProviderError>>,
        statuses: Vec<&str>,
        output_file: &str,
        output_bytes: &[u8],
    ) -> Self {
        let provider = Self {
            responses: Mutex::new(responses.into()),
            batch_statuses: Mutex::new(statuses.iter().map(|s| s.to_string()).collect()),
            batch_output_file: Some(output_file.to_string()),
            ..Self::default()
        };
        provider
            .file_contents
            .lock()
            .expect("contents lock")
            .insert(output_file.to_string(), output_bytes.to_vec());
        provider
    }

    /// Block the Nth (0-based) response call until the run's cancel flag
    /// trips, then answer with a cancellation, the way the transport does.
    pub fn block_at(mut self, request_index: usize) -> Self {
        self.block_at_request = Some(request_index);
        self
    }

    pub fn bind_cancel(&self, flag: CancelFlag) {
        *self.cancel.lock().expect("cancel lock") = Some(flag);
    }

    pub fn request_count(&self) -> usize {
        self.seen_requests.lock().expect("requests lock").len()
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl ProviderApi for ScriptedProvider {
    fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        Ok(vec![])
    }

    fn create_response(&self, request: &ResponsesRequest) -> Result<ResponseEnvelope, ProviderError> {
        let index = {
            let mut seen = self.seen_requests.lock().expect("requests lock");
            seen.push(request.clone());
            seen.len() - 1
        };
        if self.block_at_request == Some(index) {
            let flag = self.cancel.lock().expect("cancel lock").clone();
            if let Some(flag) = flag {
                while !flag.is_tripped() {
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
            return Err(ProviderError::cancelled());
        }
        match self.responses.lock().expect("responses lock").pop_front() {
            Some(Ok(raw)) => Ok(ResponseEnvelope::from_value(raw)),
            Some(Err(err)) => Err(err),
            None => Err(ProviderError::api("response script exhausted")),
        }
    }

    fn upload_file(&self, path: &Path, _purpose: &str) -> Result<String, ProviderError> {
        let file_id = self.fresh_id("file");
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.uploads
            .lock()
            .expect("uploads lock")
            .push((name, file_id.clone()));
        Ok(file_id)
    }

    fn upload_bytes(
        &self,
        file_name: &str,
        bytes: &[u8],
        _purpose: &str,
    ) -> Result<String, ProviderError> {
        let file_id = self.fresh_id("file");
        self.uploads
            .lock()
            .expect("uploads lock")
            .push((file_name.to_string(), file_id.clone()));
        self.file_contents
            .lock()
            .expect("contents lock")
            .insert(file_id.clone(), bytes.to_vec());
        Ok(file_id)
    }

    fn file_content(&self, file_id: &str) -> Result<Vec<u8>, ProviderError> {
        self.file_contents
            .lock()
            .expect("contents lock")
            .get(file_id)
            .cloned()
            .ok_or_else(|| ProviderError::api(format!("unknown file {file_id}")))
    }

    fn delete_file(&self, _file_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    fn create_vector_store(&self, name: &str) -> Result<String, ProviderError> {
        let vs_id = self.fresh_id("vs");
        self.vector_stores_created
            .lock()
            .expect("vs lock")
            .push(name.to_string());
        Ok(vs_id)
    }

    fn delete_vector_store(&self, _vs_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    fn add_vector_store_file(
        &self,
        vs_id: &str,
        file_id: &str,
        _attributes: Option<Map<String, Value>>,
    ) -> Result<String, ProviderError> {
        self.vector_store_files
            .lock()
            .expect("vsf lock")
            .push((vs_id.to_string(), file_id.to_string()));
        Ok(self.fresh_id("vsf"))
    }

    fn remove_vector_store_file(&self, _vs_id: &str, _vs_file_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    fn vector_store_file_status(
        &self,
        _vs_id: &str,
        vs_file_id: &str,
    ) -> Result<VectorStoreFileStatus, ProviderError> {
        Ok(VectorStoreFileStatus {
            id: vs_file_id.to_string(),
            status: "completed".to_string(),
            last_error: None,
        })
    }

    fn set_vector_store_expiration(&self, _vs_id: &str, _days: u32) -> Result<(), ProviderError> {
        Ok(())
    }

    fn create_batch(&self, input_file_id: &str) -> Result<BatchInfo, ProviderError> {
        assert!(
            self.file_contents
                .lock()
                .expect("contents lock")
                .contains_key(input_file_id),
            "batch input must be an uploaded file"
        );
        Ok(BatchInfo {
            id: "batch-1".to_string(),
            status: "validating".to_string(),
            output_file_id: None,
            error_file_id: None,
        })
    }

    fn get_batch(&self, batch_id: &str) -> Result<BatchInfo, ProviderError> {
        let status = self
            .batch_statuses
            .lock()
            .expect("statuses lock")
            .pop_front()
            .unwrap_or_else(|| "completed".to_string());
        Ok(BatchInfo {
            id: batch_id.to_string(),
            status: status.clone(),
            output_file_id: (status == "completed")
                .then(|| self.batch_output_file.clone())
                .flatten(),
            error_file_id: None,
        })
    }

    fn cancel_batch(&self, batch_id: &str) -> Result<BatchInfo, ProviderError> {
        Ok(BatchInfo {
            id: batch_id.to_string(),
            status: "cancelled".to_string(),
            output_file_id: None,
            error_file_id: None,
        })
    }

    fn list_batches(&self) -> Result<Vec<BatchInfo>, ProviderError> {
        Ok(vec![])
    }
}
