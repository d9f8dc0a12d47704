use crate::provider::transport::{ProviderError, Transport};
use crate::provider::types::{
    BatchInfo, ModelInfo, ResponseEnvelope, ResponsesRequest, VectorStoreFileStatus,
};
use serde_json::{json, Map, Value};
use std::path::Path;

/// The narrow provider capability the run engine consumes. Everything the
/// cascade needs, nothing the concrete SDK exposes beyond it; test doubles
/// implement this directly.
pub trait ProviderApi: Send + Sync {
    fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;
    fn create_response(&self, request: &ResponsesRequest) -> Result<ResponseEnvelope, ProviderError>;

    fn upload_file(&self, path: &Path, purpose: &str) -> Result<String, ProviderError>;
    fn upload_bytes(
        &self,
        file_name: &str,
        bytes: &[u8],
        purpose: &str,
    ) -> Result<String, ProviderError>;
    fn file_content(&self, file_id: &str) -> Result<Vec<u8>, ProviderError>;
    fn delete_file(&self, file_id: &str) -> Result<(), ProviderError>;

    fn create_vector_store(&self, name: &str) -> Result<String, ProviderError>;
    fn delete_vector_store(&self, vs_id: &str) -> Result<(), ProviderError>;
    fn add_vector_store_file(
        &self,
        vs_id: &str,
        file_id: &str,
        attributes: Option<Map<String, Value>>,
    ) -> Result<String, ProviderError>;
    fn remove_vector_store_file(&self, vs_id: &str, vs_file_id: &str) -> Result<(), ProviderError>;
    fn vector_store_file_status(
        &self,
        vs_id: &str,
        vs_file_id: &str,
    ) -> Result<VectorStoreFileStatus, ProviderError>;
    fn set_vector_store_expiration(&self, vs_id: &str, days: u32) -> Result<(), ProviderError>;

    fn create_batch(&self, input_file_id: &str) -> Result<BatchInfo, ProviderError>;
    fn get_batch(&self, batch_id: &str) -> Result<BatchInfo, ProviderError>;
    fn cancel_batch(&self, batch_id: &str) -> Result<BatchInfo, ProviderError>;
    fn list_batches(&self) -> Result<Vec<BatchInfo>, ProviderError>;
}

/// HTTP implementation over the retrying transport.
pub struct HttpProvider {
    transport: Transport,
}

impl HttpProvider {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T, ProviderError> {
        serde_json::from_value(value)
            .map_err(|err| ProviderError::api(format!("{what} decode failed: {err}")))
    }

    fn decode_list<T: serde::de::DeserializeOwned>(
        value: Value,
        what: &str,
    ) -> Result<Vec<T>, ProviderError> {
        let data = value
            .get("data")
            .cloned()
            .ok_or_else(|| ProviderError::api(format!("{what} response missing `data`")))?;
        Self::decode(data, what)
    }

    fn id_of(value: &Value, what: &str) -> Result<String, ProviderError> {
        value
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::api(format!("{what} response missing `id`")))
    }
}

impl ProviderApi for HttpProvider {
    fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let value = self.transport.request_json("GET", "/models", None, None)?;
        Self::decode_list(value, "models")
    }

    fn create_response(&self, request: &ResponsesRequest) -> Result<ResponseEnvelope, ProviderError> {
        let body = request.to_body();
        let value = self.transport.request_json(
            "POST",
            "/responses",
            Some(&body),
            Some(&request.idempotency_key),
        )?;
        Ok(ResponseEnvelope::from_value(value))
    }

    fn upload_file(&self, path: &Path, purpose: &str) -> Result<String, ProviderError> {
        let bytes = std::fs::read(path)
            .map_err(|err| ProviderError::api(format!("upload source unreadable: {err}")))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.bin".to_string());
        self.upload_bytes(&name, &bytes, purpose)
    }

    fn upload_bytes(
        &self,
        file_name: &str,
        bytes: &[u8],
        purpose: &str,
    ) -> Result<String, ProviderError> {
        let value = self
            .transport
            .upload_multipart("/files", file_name, bytes, purpose)?;
        Self::id_of(&value, "file upload")
    }

    fn file_content(&self, file_id: &str) -> Result<Vec<u8>, ProviderError> {
        self.transport.download(&format!("/files/{file_id}/content"))
    }

    fn delete_file(&self, file_id: &str) -> Result<(), ProviderError> {
        self.transport
            .request_json("DELETE", &format!("/files/{file_id}"), None, None)?;
        Ok(())
    }

    fn create_vector_store(&self, name: &str) -> Result<String, ProviderError> {
        let value =
            self.transport
                .request_json("POST", "/vector_stores", Some(&json!({"name": name})), None)?;
        Self::id_of(&value, "vector store")
    }

    fn delete_vector_store(&self, vs_id: &str) -> Result<(), ProviderError> {
        self.transport
            .request_json("DELETE", &format!("/vector_stores/{vs_id}"), None, None)?;
        Ok(())
    }

    fn add_vector_store_file(
        &self,
        vs_id: &str,
        file_id: &str,
        attributes: Option<Map<String, Value>>,
    ) -> Result<String, ProviderError> {
        let mut body = json!({"file_id": file_id});
        if let Some(attrs) = attributes {
            body["attributes"] = Value::Object(attrs);
        }
        let value = self.transport.request_json(
            "POST",
            &format!("/vector_stores/{vs_id}/files"),
            Some(&body),
            None,
        )?;
        Self::id_of(&value, "vector store file")
    }

    fn remove_vector_store_file(&self, vs_id: &str, vs_file_id: &str) -> Result<(), ProviderError> {
        self.transport.request_json(
            "DELETE",
            &format!("/vector_stores/{vs_id}/files/{vs_file_id}"),
            None,
            None,
        )?;
        Ok(())
    }

    fn vector_store_file_status(
        &self,
        vs_id: &str,
        vs_file_id: &str,
    ) -> Result<VectorStoreFileStatus, ProviderError> {
        let value = self.transport.request_json(
            "GET",
            &format!("/vector_stores/{vs_id}/files/{vs_file_id}"),
            None,
            None,
        )?;
        Ok(VectorStoreFileStatus {
            id: Self::id_of(&value, "vector store file")?,
            status: value
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            last_error: value
                .get("last_error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn set_vector_store_expiration(&self, vs_id: &str, days: u32) -> Result<(), ProviderError> {
        let body = json!({"expires_after": {"anchor": "last_active_at", "days": days}});
        self.transport.request_json(
            "POST",
            &format!("/vector_stores/{vs_id}"),
            Some(&body),
            None,
        )?;
        Ok(())
    }

    fn create_batch(&self, input_file_id: &str) -> Result<BatchInfo, ProviderError> {
        let body = json!({
            "input_file_id": input_file_id,
            "endpoint": "/v1/responses",
            "completion_window": "24h",
        });
        let value = self
            .transport
            .request_json("POST", "/batches", Some(&body), None)?;
        Self::decode(value, "batch")
    }

    fn get_batch(&self, batch_id: &str) -> Result<BatchInfo, ProviderError> {
        let value = self
            .transport
            .request_json("GET", &format!("/batches/{batch_id}"), None, None)?;
        Self::decode(value, "batch")
    }

    fn cancel_batch(&self, batch_id: &str) -> Result<BatchInfo, ProviderError> {
        let value = self.transport.request_json(
            "POST",
            &format!("/batches/{batch_id}/cancel"),
            Some(&json!({})),
            None,
        )?;
        Self::decode(value, "batch")
    }

    fn list_batches(&self) -> Result<Vec<BatchInfo>, ProviderError> {
        let value = self.transport.request_json("GET", "/batches", None, None)?;
        Self::decode_list(value, "batches")
    }
}
