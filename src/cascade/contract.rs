use crate::mirror::walk::validate_relative_path;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

pub const MAX_CHUNK_LINES: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractKind {
    A0IngestAck,
    A1Plan,
    A2Structure,
    A3File,
    B1Plan,
    B2Structure,
    B3File,
    CFilesAll,
}

impl ContractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractKind::A0IngestAck => "A0_INGEST_ACK",
            ContractKind::A1Plan => "A1_PLAN",
            ContractKind::A2Structure => "A2_STRUCTURE",
            ContractKind::A3File => "A3_FILE",
            ContractKind::B1Plan => "B1_PLAN",
            ContractKind::B2Structure => "B2_STRUCTURE",
            ContractKind::B3File => "B3_FILE",
            ContractKind::CFilesAll => "C_FILES_ALL",
        }
    }

    /// The one-line schema restated to the model in every request carrying
    /// this contract.
    pub fn schema_line(&self) -> &'static str {
        match self {
            ContractKind::A0IngestAck => {
                r#"{"contract":"A0_INGEST_ACK","part_index":0,"part_count":0,"ok":true}"#
            }
            ContractKind::A1Plan => {
                r#"{"contract":"A1_PLAN","project":{"name":"string","one_liner":"string","target_os":"string","language":"string","runtime":"string"},"assumptions":["string"],"requirements":{"functional":["string"],"non_functional":["string"],"constraints":["string"]},"architecture":{"modules":[{"name":"string","responsibility":"string"}],"data_flow":["string"],"error_handling":["string"],"security_notes":["string"]},"build_run":{"prerequisites":["string"],"commands":["string"],"verification":["string"]},"deliverable_policy":{"max_lines_per_chunk":500}}"#
            }
            ContractKind::A2Structure => {
                r#"{"contract":"A2_STRUCTURE","root":"string","files":[{"path":"string","purpose":"string","language":"string","generated_in_phase":"A3"}]}"#
            }
            ContractKind::A3File => {
                r#"{"contract":"A3_FILE","path":"string","chunking":{"max_lines":500,"chunk_index":0,"chunk_count":0,"has_more":false,"next_chunk_index":null},"content":"string"}"#
            }
            ContractKind::B1Plan => {
                r#"{"contract":"B1_PLAN","diagnosis":{"summary":"string","evidence":[{"path":"string","reason":"string"}],"likely_root_causes":["string"]},"change_plan":{"goals":["string"],"files_to_modify":[{"path":"string","intent":"string"}],"files_to_add":[{"path":"string","intent":"string"}],"verification_steps":["string"]},"missing_inputs":["string"]}"#
            }
            ContractKind::B2Structure => {
                r#"{"contract":"B2_STRUCTURE","touched_files":[{"path":"string","action":"modify|add","intent":"string"}],"invariants":["string"]}"#
            }
            ContractKind::B3File => {
                r#"{"contract":"B3_FILE","path":"string","action":"modify|add","chunking":{"max_lines":500,"chunk_index":0,"chunk_count":0,"has_more":false,"next_chunk_index":null},"content":"string","notes":["string"]}"#
            }
            ContractKind::CFilesAll => {
                r#"{"contract":"C_FILES_ALL","project":{"name":"string","target_os":"string","runtime":"string","language":"string"},"root":"string","files":[{"path":"relative/path/file.ext","purpose":"string","content":"string"}],"build_run":{"prerequisites":["string"],"commands":["string"],"verification":["string"]},"notes":["string"]}"#
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("contract {contract} violated at {pointer}: {reason}")]
pub struct ContractError {
    pub contract: String,
    pub pointer: String,
    pub reason: String,
}

impl ContractError {
    pub fn new(contract: &str, pointer: &str, reason: impl Into<String>) -> Self {
        Self {
            contract: contract.to_string(),
            pointer: pointer.to_string(),
            reason: reason.into(),
        }
    }
}

/// Extract the first balanced `{…}` object from free text, honoring string
/// literals and escapes. The strict parser falls back to this when the raw
/// text is not pure JSON; there is no tolerance for fences or comments.
fn extract_first_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Accept only a JSON object: either the whole trimmed text, or the first
/// balanced object substring of it.
pub fn parse_json_strict(contract: &str, text: &str) -> Result<Map<String, Value>, ContractError> {
    let trimmed = text.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => return Ok(map),
        Ok(_) => {
            return Err(ContractError::new(
                contract,
                "",
                "response JSON must be an object",
            ))
        }
        Err(_) => {}
    }
    if let Some(candidate) = extract_first_object(trimmed) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
            return Ok(map);
        }
    }
    Err(ContractError::new(
        contract,
        "",
        "response is not valid JSON (strict contract violated)",
    ))
}

fn require_contract_field(
    kind: ContractKind,
    map: &Map<String, Value>,
) -> Result<(), ContractError> {
    match map.get("contract").and_then(Value::as_str) {
        Some(found) if found == kind.as_str() => Ok(()),
        Some(found) => Err(ContractError::new(
            kind.as_str(),
            "/contract",
            format!("expected {}, got {found}", kind.as_str()),
        )),
        None => Err(ContractError::new(
            kind.as_str(),
            "/contract",
            "missing `contract` field",
        )),
    }
}

fn str_field<'a>(
    kind: ContractKind,
    map: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a str, ContractError> {
    map.get(key).and_then(Value::as_str).ok_or_else(|| {
        ContractError::new(
            kind.as_str(),
            &format!("/{key}"),
            format!("missing or non-string `{key}`"),
        )
    })
}

fn object_field<'a>(
    kind: ContractKind,
    map: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a Map<String, Value>, ContractError> {
    map.get(key).and_then(Value::as_object).ok_or_else(|| {
        ContractError::new(
            kind.as_str(),
            &format!("/{key}"),
            format!("missing or non-object `{key}`"),
        )
    })
}

fn array_field<'a>(
    kind: ContractKind,
    map: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a [Value], ContractError> {
    map.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| {
            ContractError::new(
                kind.as_str(),
                &format!("/{key}"),
                format!("missing or non-array `{key}`"),
            )
        })
}

fn validate_unique_paths<'a>(
    kind: ContractKind,
    key: &str,
    paths: impl Iterator<Item = &'a str>,
) -> Result<(), ContractError> {
    let mut seen = BTreeSet::new();
    for (index, path) in paths.enumerate() {
        let pointer = format!("/{key}/{index}/path");
        validate_relative_path(path)
            .map_err(|reason| ContractError::new(kind.as_str(), &pointer, reason))?;
        if !seen.insert(path.to_string()) {
            return Err(ContractError::new(
                kind.as_str(),
                &pointer,
                format!("duplicate path `{path}`"),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub path: String,
    pub purpose: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchedFile {
    pub path: String,
    pub action: String,
    pub intent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunking {
    pub chunk_index: u64,
    pub chunk_count: u64,
    pub has_more: bool,
    pub next_chunk_index: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub path: String,
    pub action: Option<String>,
    pub chunking: Chunking,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFileSpec {
    pub path: String,
    pub purpose: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContractPayload {
    IngestAck {
        part_index: u64,
        part_count: u64,
        ok: bool,
    },
    Plan(Map<String, Value>),
    Structure {
        root: Option<String>,
        files: Vec<PlannedFile>,
    },
    Touched {
        files: Vec<TouchedFile>,
    },
    FileChunk(FileChunk),
    FilesAll {
        files: Vec<OutputFileSpec>,
    },
}

fn parse_chunking(kind: ContractKind, map: &Map<String, Value>) -> Result<Chunking, ContractError> {
    let chunking = object_field(kind, map, "chunking")?;
    let chunk_index = chunking
        .get("chunk_index")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            ContractError::new(kind.as_str(), "/chunking/chunk_index", "missing chunk_index")
        })?;
    let chunk_count = chunking
        .get("chunk_count")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            ContractError::new(kind.as_str(), "/chunking/chunk_count", "missing chunk_count")
        })?;
    let has_more = chunking
        .get("has_more")
        .and_then(Value::as_bool)
        .ok_or_else(|| {
            ContractError::new(kind.as_str(), "/chunking/has_more", "missing has_more")
        })?;
    let next_chunk_index = chunking.get("next_chunk_index").and_then(Value::as_u64);
    Ok(Chunking {
        chunk_index,
        chunk_count,
        has_more,
        next_chunk_index,
    })
}

pub fn parse_contract(kind: ContractKind, text: &str) -> Result<ContractPayload, ContractError> {
    let map = parse_json_strict(kind.as_str(), text)?;
    require_contract_field(kind, &map)?;

    match kind {
        ContractKind::A0IngestAck => Ok(ContractPayload::IngestAck {
            part_index: map.get("part_index").and_then(Value::as_u64).unwrap_or(0),
            part_count: map.get("part_count").and_then(Value::as_u64).unwrap_or(0),
            ok: map.get("ok").and_then(Value::as_bool).unwrap_or(false),
        }),
        ContractKind::A1Plan => {
            object_field(kind, &map, "project")?;
            Ok(ContractPayload::Plan(map))
        }
        ContractKind::B1Plan => {
            object_field(kind, &map, "diagnosis")?;
            object_field(kind, &map, "change_plan")?;
            Ok(ContractPayload::Plan(map))
        }
        ContractKind::A2Structure => {
            let raw_files = array_field(kind, &map, "files")?;
            let mut files = Vec::with_capacity(raw_files.len());
            for (index, entry) in raw_files.iter().enumerate() {
                let obj = entry.as_object().ok_or_else(|| {
                    ContractError::new(
                        kind.as_str(),
                        &format!("/files/{index}"),
                        "file entry must be an object",
                    )
                })?;
                files.push(PlannedFile {
                    path: str_field(kind, obj, "path")?.to_string(),
                    purpose: obj
                        .get("purpose")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    language: obj
                        .get("language")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            validate_unique_paths(kind, "files", files.iter().map(|f| f.path.as_str()))?;
            Ok(ContractPayload::Structure {
                root: map.get("root").and_then(Value::as_str).map(str::to_string),
                files,
            })
        }
        ContractKind::B2Structure => {
            let raw = array_field(kind, &map, "touched_files")?;
            let mut files = Vec::with_capacity(raw.len());
            for (index, entry) in raw.iter().enumerate() {
                let obj = entry.as_object().ok_or_else(|| {
                    ContractError::new(
                        kind.as_str(),
                        &format!("/touched_files/{index}"),
                        "touched_files entry must be an object",
                    )
                })?;
                let action = obj
                    .get("action")
                    .and_then(Value::as_str)
                    .unwrap_or("modify");
                if action != "modify" && action != "add" {
                    return Err(ContractError::new(
                        kind.as_str(),
                        &format!("/touched_files/{index}/action"),
                        format!("action must be modify|add, got `{action}`"),
                    ));
                }
                files.push(TouchedFile {
                    path: str_field(kind, obj, "path")?.to_string(),
                    action: action.to_string(),
                    intent: obj
                        .get("intent")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            Ok(ContractPayload::Touched { files })
        }
        ContractKind::A3File | ContractKind::B3File => {
            let path = str_field(kind, &map, "path")?.to_string();
            let content = str_field(kind, &map, "content")?.to_string();
            let chunking = parse_chunking(kind, &map)?;
            let action = if kind == ContractKind::B3File {
                Some(
                    map.get("action")
                        .and_then(Value::as_str)
                        .unwrap_or("modify")
                        .to_string(),
                )
            } else {
                None
            };
            Ok(ContractPayload::FileChunk(FileChunk {
                path,
                action,
                chunking,
                content,
            }))
        }
        ContractKind::CFilesAll => {
            let raw_files = array_field(kind, &map, "files")?;
            let mut files = Vec::with_capacity(raw_files.len());
            for (index, entry) in raw_files.iter().enumerate() {
                let obj = entry.as_object().ok_or_else(|| {
                    ContractError::new(
                        kind.as_str(),
                        &format!("/files/{index}"),
                        "file entry must be an object",
                    )
                })?;
                files.push(OutputFileSpec {
                    path: str_field(kind, obj, "path")?.to_string(),
                    purpose: obj
                        .get("purpose")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    content: str_field(kind, obj, "content")?.to_string(),
                });
            }
            validate_unique_paths(kind, "files", files.iter().map(|f| f.path.as_str()))?;
            Ok(ContractPayload::FilesAll { files })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_parser_accepts_objects_and_balanced_extraction_only() {
        let map = parse_json_strict("A1_PLAN", "{\"a\": 1}").expect("object");
        assert_eq!(map["a"], 1);

        let embedded = parse_json_strict("A1_PLAN", "noise {\"a\": {\"b\": \"}\"}} trailing")
            .expect("embedded object");
        assert_eq!(embedded["a"]["b"], "}");

        assert!(parse_json_strict("A1_PLAN", "[1, 2]").is_err());
        assert!(parse_json_strict("A1_PLAN", "no json at all").is_err());
        assert!(parse_json_strict("A1_PLAN", "{\"unterminated\": ").is_err());
    }

    #[test]
    fn missing_contract_field_is_rejected() {
        let err = parse_contract(
            ContractKind::A3File,
            r#"{"path":"ok.py","content":"x","chunking":{"chunk_index":0,"chunk_count":1,"has_more":false}}"#,
        )
        .expect_err("missing contract");
        assert_eq!(err.pointer, "/contract");
    }

    #[test]
    fn a2_paths_must_be_relative_and_unique() {
        let dup = r#"{"contract":"A2_STRUCTURE","root":"r","files":[
            {"path":"main.py"},{"path":"main.py"}]}"#;
        let err = parse_contract(ContractKind::A2Structure, dup).expect_err("duplicate");
        assert!(err.reason.contains("duplicate"));

        let escape = r#"{"contract":"A2_STRUCTURE","files":[{"path":"../x.py"}]}"#;
        assert!(parse_contract(ContractKind::A2Structure, escape).is_err());

        let backslash = r#"{"contract":"A2_STRUCTURE","files":[{"path":"a\\b.py"}]}"#;
        assert!(parse_contract(ContractKind::A2Structure, backslash).is_err());

        let ok = r#"{"contract":"A2_STRUCTURE","root":"r","files":[
            {"path":"main.py","purpose":"entry","language":"python"}]}"#;
        let ContractPayload::Structure { files, root } =
            parse_contract(ContractKind::A2Structure, ok).expect("ok")
        else {
            panic!("wrong payload");
        };
        assert_eq!(root.as_deref(), Some("r"));
        assert_eq!(files[0].path, "main.py");
    }

    #[test]
    fn b3_carries_action_and_chunking() {
        let raw = r#"{"contract":"B3_FILE","path":"a.txt","action":"modify",
            "chunking":{"max_lines":500,"chunk_index":0,"chunk_count":2,"has_more":true,"next_chunk_index":1},
            "content":"x"}"#;
        let ContractPayload::FileChunk(chunk) =
            parse_contract(ContractKind::B3File, raw).expect("parse")
        else {
            panic!("wrong payload");
        };
        assert_eq!(chunk.action.as_deref(), Some("modify"));
        assert!(chunk.chunking.has_more);
        assert_eq!(chunk.chunking.next_chunk_index, Some(1));
    }

    #[test]
    fn b2_rejects_unknown_actions() {
        let raw = r#"{"contract":"B2_STRUCTURE","touched_files":[{"path":"a.txt","action":"delete"}]}"#;
        let err = parse_contract(ContractKind::B2Structure, raw).expect_err("bad action");
        assert!(err.reason.contains("modify|add"));
    }

    #[test]
    fn c_files_all_requires_content_per_file() {
        let raw = r#"{"contract":"C_FILES_ALL","files":[{"path":"r/x"}]}"#;
        let err = parse_contract(ContractKind::CFilesAll, raw).expect_err("no content");
        assert!(err.pointer.contains("/files/0"));

        let ok = r#"{"contract":"C_FILES_ALL","files":[
            {"path":"r/x","content":"1"},{"path":"r/y","content":"2"}]}"#;
        let ContractPayload::FilesAll { files } =
            parse_contract(ContractKind::CFilesAll, ok).expect("ok")
        else {
            panic!("wrong payload");
        };
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn serialize_then_parse_is_identity_for_file_chunks() {
        let raw = serde_json::json!({
            "contract": "A3_FILE",
            "path": "pkg/mod.rs",
            "chunking": {"max_lines": 500, "chunk_index": 1, "chunk_count": 3,
                         "has_more": true, "next_chunk_index": 2},
            "content": "line\n",
        })
        .to_string();
        let ContractPayload::FileChunk(chunk) =
            parse_contract(ContractKind::A3File, &raw).expect("parse")
        else {
            panic!("wrong payload");
        };
        assert_eq!(chunk.path, "pkg/mod.rs");
        assert_eq!(chunk.chunking.chunk_index, 1);
        assert_eq!(chunk.chunking.chunk_count, 3);
        assert_eq!(chunk.content, "line\n");
    }
}
