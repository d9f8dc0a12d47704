use crate::cascade::contract::ContractError;
use crate::cascade::RunError;
use crate::provider::client::ProviderApi;
use crate::provider::types::{BatchInfo, ResponsesRequest};
use crate::runtime::events::CancelFlag;
use serde_json::{json, Value};
use std::time::Duration;

/// The single JSONL line submitted to the batch endpoint for mode C.
pub fn build_batch_line(run_id: &str, request: &ResponsesRequest) -> String {
    json!({
        "custom_id": format!("{run_id}_C1"),
        "method": "POST",
        "url": "/v1/responses",
        "body": request.to_body(),
    })
    .to_string()
}

/// Pull the inner response body out of a downloaded batch output file. Each
/// line is `{custom_id, response: {status_code, body}}`; only the first line
/// matters for a single-request batch.
pub fn parse_batch_output(bytes: &[u8]) -> Result<Value, ContractError> {
    let text = String::from_utf8_lossy(bytes);
    let line = text
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| ContractError::new("C_FILES_ALL", "", "batch output file is empty"))?;
    let value: Value = serde_json::from_str(line).map_err(|err| {
        ContractError::new("C_FILES_ALL", "", format!("batch output line is not JSON: {err}"))
    })?;
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        return Err(ContractError::new(
            "C_FILES_ALL",
            "/error",
            format!("batch request failed: {error}"),
        ));
    }
    value
        .get("response")
        .and_then(|r| r.get("body"))
        .cloned()
        .or_else(|| value.get("body").cloned())
        .ok_or_else(|| {
            ContractError::new("C_FILES_ALL", "/response/body", "batch output has no body")
        })
}

/// Polls an async batch to a terminal state with bounded backoff, observing
/// the cancel flag between polls.
pub struct BatchMonitor<'a> {
    api: &'a dyn ProviderApi,
    cancel: &'a CancelFlag,
    poll_min: Duration,
    poll_max: Duration,
    timeout: Duration,
}

impl<'a> BatchMonitor<'a> {
    pub fn new(
        api: &'a dyn ProviderApi,
        cancel: &'a CancelFlag,
        poll_min: Duration,
        poll_max: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            api,
            cancel,
            poll_min,
            poll_max,
            timeout,
        }
    }

    pub fn await_terminal(
        &self,
        batch_id: &str,
        mut on_poll: impl FnMut(&BatchInfo),
    ) -> Result<BatchInfo, RunError> {
        let started = std::time::Instant::now();
        let mut interval = self.poll_min;
        loop {
            if self.cancel.is_tripped() {
                return Err(RunError::Cancelled);
            }
            let info = self.api.get_batch(batch_id)?;
            on_poll(&info);
            if info.is_terminal() {
                return Ok(info);
            }
            if started.elapsed() > self.timeout {
                return Err(RunError::Configuration(format!(
                    "batch {batch_id} did not reach a terminal state within {}s",
                    self.timeout.as_secs()
                )));
            }
            if !self.cancel.sleep_unless_cancelled(interval) {
                return Err(RunError::Cancelled);
            }
            interval = (interval * 2).min(self.poll_max);
        }
    }

    pub fn download_output(&self, info: &BatchInfo) -> Result<Value, RunError> {
        let file_id = info.output_file_id.as_deref().ok_or_else(|| {
            RunError::Contract(ContractError::new(
                "C_FILES_ALL",
                "/output_file_id",
                "completed batch has no output file",
            ))
        })?;
        let bytes = self.api.file_content(file_id)?;
        Ok(parse_batch_output(&bytes)?)
    }

    pub fn download_error_file(&self, info: &BatchInfo) -> Option<Vec<u8>> {
        let file_id = info.error_file_id.as_deref()?;
        self.api.file_content(file_id).ok()
    }
}

/// Anything not yet terminal, for the caller's batch overview.
pub fn list_open_batches(api: &dyn ProviderApi) -> Result<Vec<BatchInfo>, RunError> {
    Ok(api
        .list_batches()?
        .into_iter()
        .filter(|batch| !batch.is_terminal())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::capability::CapabilityRecord;
    use crate::cascade::request::RequestContext;

    #[test]
    fn batch_line_wraps_the_responses_body() {
        let ctx = RequestContext {
            run_id: "RUN_020820261330_AAAA".to_string(),
            model: "m-1".to_string(),
            caps: CapabilityRecord::optimistic("m-1", 0),
            file_ids: Vec::new(),
            vector_store_ids: Vec::new(),
            use_file_search: false,
            manifest_listing: None,
        };
        let request = ctx.build("C", "emit all files", "make it", 0.0, None);
        let line = build_batch_line("RUN_020820261330_AAAA", &request);
        let value: Value = serde_json::from_str(&line).expect("line json");
        assert_eq!(value["custom_id"], "RUN_020820261330_AAAA_C1");
        assert_eq!(value["method"], "POST");
        assert_eq!(value["url"], "/v1/responses");
        assert_eq!(value["body"]["model"], "m-1");
    }

    #[test]
    fn batch_output_extracts_inner_body() {
        let line = json!({
            "custom_id": "RUN_X_C1",
            "response": {"status_code": 200, "body": {"id": "resp-1", "output_text": "{}"}},
        })
        .to_string();
        let body = parse_batch_output(line.as_bytes()).expect("body");
        assert_eq!(body["id"], "resp-1");

        let errored = json!({
            "custom_id": "RUN_X_C1",
            "error": {"message": "boom"},
        })
        .to_string();
        assert!(parse_batch_output(errored.as_bytes()).is_err());
        assert!(parse_batch_output(b"").is_err());
        assert!(parse_batch_output(b"not json").is_err());
    }
}
