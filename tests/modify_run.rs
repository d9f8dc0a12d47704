mod support;

use cascader::cascade::{RunMode, RunRequest};
use cascader::ledger::{ReceiptLedger, ReceiptQuery};
use cascader::provider::client::ProviderApi;
use cascader::provider::types::ContentPart;
use cascader::runlog::{load_run_state, RunStatus};
use cascader::runtime::supervisor::ApiFactory;
use cascader::runtime::Supervisor;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use support::{envelope, fresh_settings, seed_capabilities, ScriptedProvider};

fn factory_for(provider: &Arc<ScriptedProvider>) -> ApiFactory {
    let shared = Arc::clone(provider);
    Arc::new(move |cancel| {
        shared.bind_cancel(cancel);
        Arc::clone(&shared) as Arc<dyn ProviderApi>
    })
}

fn b1_plan() -> serde_json::Value {
    json!({
        "contract": "B1_PLAN",
        "diagnosis": {"summary": "s", "evidence": [], "likely_root_causes": []},
        "change_plan": {"goals": [], "files_to_modify": [{"path": "a.txt", "intent": "double"}],
                        "files_to_add": [], "verification_steps": []},
        "missing_inputs": [],
    })
}

fn b2_touched() -> serde_json::Value {
    json!({
        "contract": "B2_STRUCTURE",
        "touched_files": [{"path": "a.txt", "action": "modify", "intent": "double"}],
        "invariants": [],
    })
}

fn b3_chunk(index: u64, count: u64, content: &str) -> serde_json::Value {
    json!({
        "contract": "B3_FILE",
        "path": "a.txt",
        "action": "modify",
        "chunking": {"max_lines": 500, "chunk_index": index, "chunk_count": count,
                     "has_more": index + 1 < count,
                     "next_chunk_index": if index + 1 < count { json!(index + 1) } else { json!(null) }},
        "content": content,
        "notes": [],
    })
}

fn modify_request(input: &Path, out: &Path, dry_run: bool) -> RunRequest {
    RunRequest {
        mode: RunMode::Modify,
        project: "proj".to_string(),
        model: "m-1".to_string(),
        prompt: "double the contents of a.txt".to_string(),
        previous_response_id: None,
        input_root: Some(input.to_path_buf()),
        output_root: Some(out.to_path_buf()),
        attached_file_ids: Vec::new(),
        versioning: false,
        dry_run,
        use_file_search: true,
        skip_paths: Vec::new(),
        skip_extensions: Vec::new(),
    }
}

fn seed_input_tree(root: &Path) {
    std::fs::create_dir_all(root).expect("input root");
    std::fs::write(root.join("a.txt"), "x").expect("a.txt");
    std::fs::write(root.join("b.py"), "y").expect("b.py");
}

#[test]
fn modify_without_file_search_uploads_mirror_and_chains_chunks() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = fresh_settings(temp.path());
    // The model lacks file_search: no vector store, attachments only.
    seed_capabilities(&settings, "m-1", true, true, false);
    let input = temp.path().join("IN");
    seed_input_tree(&input);

    let provider = Arc::new(ScriptedProvider::with_responses(vec![
        Ok(envelope("resp-b1", &b1_plan(), (10, 5))),
        Ok(envelope("resp-b2", &b2_touched(), (8, 4))),
        Ok(envelope("resp-b3-0", &b3_chunk(0, 2, "x"), (6, 3))),
        Ok(envelope("resp-b3-1", &b3_chunk(1, 2, "x"), (6, 3))),
    ]));
    let supervisor =
        Supervisor::new(settings.clone(), factory_for(&provider)).expect("supervisor");

    let out = temp.path().join("OUT");
    let handle = supervisor
        .start(modify_request(&input, &out, false))
        .expect("start");
    let outcome = handle.wait().expect("run");

    assert_eq!(std::fs::read_to_string(out.join("a.txt")).expect("a.txt"), "xx");
    assert_eq!(outcome.saved_paths, vec!["a.txt".to_string()]);

    // Both input files and the manifest went up; no vector store was built.
    let uploads = provider.uploads.lock().expect("uploads");
    let upload_names: Vec<_> = uploads.iter().map(|(name, _)| name.clone()).collect();
    assert!(upload_names.contains(&"a.txt".to_string()));
    assert!(upload_names.contains(&"b.py".to_string()));
    assert!(upload_names.contains(&"mirror_manifest.json".to_string()));
    assert!(provider.vector_stores_created.lock().expect("vs").is_empty());

    // Redundant channels: ids enumerated in instructions AND attached as
    // input parts on the first message.
    let requests = provider.seen_requests.lock().expect("requests");
    let b1 = requests
        .iter()
        .find(|r| r.idempotency_key.ends_with(":B1"))
        .expect("b1 request");
    assert!(b1.instructions.contains("MANIFEST (path -> file_id):"));
    assert!(b1.instructions.contains("DATA REFERENCE:"));
    let attached = b1.input[0]
        .content
        .iter()
        .filter(|part| matches!(part, ContentPart::InputFile { .. }))
        .count();
    assert_eq!(attached, 3, "two mirrored files plus the manifest");
    assert_eq!(b1.tools, None, "no file_search tool without the capability");

    // Chunk 1 chains onto chunk 0's response.
    let b3_second = requests
        .iter()
        .find(|r| r.idempotency_key.contains("B3:a.txt#1"))
        .expect("second chunk request");
    assert_eq!(b3_second.previous_response_id.as_deref(), Some("resp-b3-0"));
    // File-producing steps run at temperature 0.0, planning at 0.2.
    assert_eq!(b3_second.temperature, Some(0.0));
    assert_eq!(b1.temperature, Some(0.2));

    // Pricing cache was absent, so every receipt is an estimate.
    let ledger = ReceiptLedger::open(&settings.ledger_path).expect("ledger");
    let receipts = ledger
        .query(&ReceiptQuery {
            run_id: Some(handle.run_id.clone()),
            ..Default::default()
        })
        .expect("query");
    assert!(!receipts.is_empty());
    assert!(receipts.iter().all(|r| r.cost_estimated));
}

#[test]
fn dry_run_halts_after_structure_until_approved() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = fresh_settings(temp.path());
    seed_capabilities(&settings, "m-1", true, true, false);
    let input = temp.path().join("IN");
    seed_input_tree(&input);

    let provider = Arc::new(ScriptedProvider::with_responses(vec![
        Ok(envelope("resp-b1", &b1_plan(), (1, 1))),
        Ok(envelope("resp-b2", &b2_touched(), (1, 1))),
        Ok(envelope("resp-b3-0", &b3_chunk(0, 1, "xx"), (1, 1))),
    ]));
    let supervisor =
        Supervisor::new(settings.clone(), factory_for(&provider)).expect("supervisor");

    let out = temp.path().join("OUT");
    let handle = supervisor
        .start(modify_request(&input, &out, true))
        .expect("start");

    let mut saw_gate = false;
    for event in handle.events() {
        if event.kind == "dry_run.waiting" {
            saw_gate = true;
            assert!(!out.join("a.txt").exists(), "nothing written before approval");
            handle.approve_continue();
        }
    }
    assert!(saw_gate, "dry run must surface the gate event");

    handle.wait().expect("run");
    assert_eq!(std::fs::read_to_string(out.join("a.txt")).expect("a.txt"), "xx");
    let state = load_run_state(&settings.log_dir, &handle.run_id).expect("state");
    assert_eq!(state.status, RunStatus::Done);
}
