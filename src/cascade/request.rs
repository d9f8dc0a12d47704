use crate::cascade::contract::ContractKind;
use crate::provider::capability::CapabilityRecord;
use crate::provider::types::{ContentPart, InputMessage, ResponsesRequest, Tool};

/// Prompts longer than this go through the A0 ingest cascade instead of one
/// request. Exactly this many characters still fits in one request.
pub const PROMPT_INGEST_THRESHOLD: usize = 150_000;
/// Size of one ingest/message part, in characters.
pub const PROMPT_PART_CHARS: usize = 20_000;

pub const TEMPERATURE_PLANNING: f32 = 0.2;
pub const TEMPERATURE_FILE_OUTPUT: f32 = 0.0;

/// Character-exact splitting, safe on UTF-8 boundaries. An empty text still
/// yields one empty part so every request has a message.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() || max_chars == 0 {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Everything a cascade step needs to phrase a request: model, capability
/// booleans, the file-id inventory, and the redundant manifest channel.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub run_id: String,
    pub model: String,
    pub caps: CapabilityRecord,
    /// Every provider file id the run knows about, enumerated in
    /// instructions and attached as input parts on every request.
    pub file_ids: Vec<String>,
    pub vector_store_ids: Vec<String>,
    pub use_file_search: bool,
    pub manifest_listing: Option<String>,
}

impl RequestContext {
    pub fn tools(&self) -> Option<Vec<Tool>> {
        if self.caps.supports_file_search
            && self.use_file_search
            && !self.vector_store_ids.is_empty()
        {
            Some(vec![Tool::FileSearch {
                vector_store_ids: self.vector_store_ids.clone(),
            }])
        } else {
            None
        }
    }

    fn data_reference_note(&self) -> Option<String> {
        if self.file_ids.is_empty() && self.vector_store_ids.is_empty() {
            return None;
        }
        let mut lines = vec!["DATA REFERENCE:".to_string()];
        if !self.file_ids.is_empty() {
            lines.push(format!("Files API file_id: {}", self.file_ids.join(", ")));
            lines.push("These files are also attached as input_file parts.".to_string());
        }
        if !self.vector_store_ids.is_empty() {
            lines.push(format!(
                "Vector store id: {}",
                self.vector_store_ids.join(", ")
            ));
            lines.push(
                "If file_search is available, use it over the vector stores above.".to_string(),
            );
        }
        Some(lines.join("\n"))
    }

    fn append_once(text: &str, extra: &str) -> String {
        if extra.is_empty() || text.contains(extra) {
            text.to_string()
        } else if text.is_empty() {
            extra.to_string()
        } else {
            format!("{text}\n\n{extra}")
        }
    }

    /// Build one request. The contract and the file inventory are restated in
    /// both `instructions` and `input`; attached files ride along as
    /// `input_file` parts on the first message.
    pub fn build(
        &self,
        step_key: &str,
        instructions: &str,
        input_text: &str,
        temperature: f32,
        previous_response_id: Option<&str>,
    ) -> ResponsesRequest {
        let mut instructions = instructions.to_string();
        let mut input_text = input_text.to_string();
        if let Some(note) = self.data_reference_note() {
            instructions = Self::append_once(&instructions, &note);
            input_text = Self::append_once(&input_text, &note);
        }
        if let Some(listing) = &self.manifest_listing {
            instructions = Self::append_once(&instructions, listing);
        }

        let parts = split_text(&input_text, PROMPT_PART_CHARS);
        let mut input = Vec::with_capacity(parts.len());
        for (index, part) in parts.into_iter().enumerate() {
            let mut content = vec![ContentPart::InputText { text: part }];
            if index == 0 {
                for file_id in &self.file_ids {
                    content.push(ContentPart::InputFile {
                        file_id: file_id.clone(),
                    });
                }
            }
            input.push(InputMessage::user(content));
        }

        ResponsesRequest {
            model: self.model.clone(),
            instructions,
            input,
            tools: self.tools(),
            previous_response_id: previous_response_id
                .filter(|_| self.caps.supports_previous_response)
                .map(str::to_string),
            temperature: self
                .caps
                .supports_temperature
                .then_some(temperature.clamp(0.0, 0.2)),
            idempotency_key: format!("{}:{}", self.run_id, step_key),
        }
    }
}

/// Instruction preamble for a contract-bearing step. Forbids markdown,
/// fences and prose twice over; file contracts also pin whole-file content
/// and the 500-line chunk bound.
pub fn contract_instructions(kind: ContractKind, role_line: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !role_line.is_empty() {
        parts.push(role_line.to_string());
    }
    parts.push(
        "OUTPUT: return ONLY a valid JSON object. No markdown, no code fences, no prose, \
         nothing outside the JSON object."
            .to_string(),
    );
    if matches!(
        kind,
        ContractKind::A3File | ContractKind::B3File | ContractKind::CFilesAll
    ) {
        parts.push(
            "CRITICAL: `content` is always the complete resulting file, never a diff or patch. \
             CHUNK: at most 500 lines per chunk."
                .to_string(),
        );
    }
    parts.push(format!("CONTRACT {}: {}", kind.as_str(), kind.schema_line()));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(prev: bool, temp: bool, fs: bool) -> CapabilityRecord {
        CapabilityRecord {
            model: "m-1".to_string(),
            probed_at: 0,
            supports_previous_response: prev,
            supports_temperature: temp,
            supports_file_search: fs,
        }
    }

    fn context(caps: CapabilityRecord) -> RequestContext {
        RequestContext {
            run_id: "RUN_020820261330_AAAA".to_string(),
            model: "m-1".to_string(),
            caps,
            file_ids: vec!["file-1".to_string(), "file-2".to_string()],
            vector_store_ids: vec!["vs-1".to_string()],
            use_file_search: true,
            manifest_listing: Some("MANIFEST (path -> file_id):\n- a.txt -> file-1".to_string()),
        }
    }

    #[test]
    fn split_respects_char_counts_and_boundaries() {
        assert_eq!(split_text("", 10), vec!["".to_string()]);
        assert_eq!(split_text("abcdef", 2), vec!["ab", "cd", "ef"]);
        assert_eq!(split_text("abcde", 2), vec!["ab", "cd", "e"]);
        // multi-byte characters count as one
        let text = "é".repeat(5);
        let parts = split_text(&text, 2);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn ingest_threshold_is_exclusive() {
        let exactly = "a".repeat(PROMPT_INGEST_THRESHOLD);
        let over = "a".repeat(PROMPT_INGEST_THRESHOLD + 1);
        assert!(exactly.chars().count() <= PROMPT_INGEST_THRESHOLD);
        assert!(over.chars().count() > PROMPT_INGEST_THRESHOLD);
    }

    #[test]
    fn build_attaches_files_once_and_restates_references_twice() {
        let ctx = context(caps(true, true, true));
        let request = ctx.build("A1", "plan it", "make a thing", 0.2, Some("resp-0"));

        assert!(request.instructions.contains("DATA REFERENCE:"));
        assert!(request.instructions.contains("MANIFEST (path -> file_id):"));
        let body = request.to_body();
        let first_content = body["input"][0]["content"].as_array().expect("content");
        let file_parts = first_content
            .iter()
            .filter(|p| p["type"] == "input_file")
            .count();
        assert_eq!(file_parts, 2);
        // input text also carries the reference note
        assert!(first_content[0]["text"]
            .as_str()
            .expect("text")
            .contains("DATA REFERENCE:"));
        assert_eq!(request.previous_response_id.as_deref(), Some("resp-0"));
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.idempotency_key, "RUN_020820261330_AAAA:A1");
    }

    #[test]
    fn capability_gaps_drop_parameters_not_requests() {
        let ctx = context(caps(false, false, false));
        let request = ctx.build("A1", "plan", "text", 0.2, Some("resp-0"));
        assert_eq!(request.previous_response_id, None);
        assert_eq!(request.temperature, None);
        assert_eq!(request.tools, None);
    }

    #[test]
    fn long_input_is_chunked_into_parts_with_files_on_first() {
        let ctx = context(caps(true, true, false));
        let long = "x".repeat(PROMPT_PART_CHARS * 2 + 5);
        let request = ctx.build("QA", "answer", &long, 0.2, None);
        assert!(request.input.len() >= 3);
        let body = request.to_body();
        assert!(body["input"][0]["content"]
            .as_array()
            .expect("c0")
            .iter()
            .any(|p| p["type"] == "input_file"));
        assert!(body["input"][1]["content"]
            .as_array()
            .expect("c1")
            .iter()
            .all(|p| p["type"] == "input_text"));
    }

    #[test]
    fn temperature_is_clamped_to_contract_range() {
        let ctx = context(caps(true, true, false));
        let request = ctx.build("A3", "gen", "file", 0.9, None);
        assert_eq!(request.temperature, Some(0.2));
    }

    #[test]
    fn contract_instructions_forbid_fences_and_pin_schema() {
        let text = contract_instructions(ContractKind::A3File, "You are an implementer.");
        assert!(text.contains("ONLY a valid JSON object"));
        assert!(text.contains("no code fences"));
        assert!(text.contains("complete resulting file"));
        assert!(text.contains("CONTRACT A3_FILE:"));
        assert!(text.contains("\"chunk_index\""));
    }
}
