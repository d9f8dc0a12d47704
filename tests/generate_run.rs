mod support;

use cascader::cascade::{RunMode, RunRequest};
use cascader::ledger::{ReceiptLedger, ReceiptQuery};
use cascader::provider::client::ProviderApi;
use cascader::runlog::{load_run_state, RunStatus};
use cascader::runtime::supervisor::ApiFactory;
use cascader::runtime::Supervisor;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use support::{envelope, fresh_settings, seed_capabilities, ScriptedProvider};

fn factory_for(provider: &Arc<ScriptedProvider>) -> ApiFactory {
    let shared = Arc::clone(provider);
    Arc::new(move |cancel| {
        shared.bind_cancel(cancel);
        Arc::clone(&shared) as Arc<dyn ProviderApi>
    })
}

fn plan() -> serde_json::Value {
    json!({
        "contract": "A1_PLAN",
        "project": {"name": "demo", "one_liner": "x", "target_os": "linux",
                    "language": "python", "runtime": "python3"},
        "assumptions": [],
        "requirements": {"functional": [], "non_functional": [], "constraints": []},
        "architecture": {"modules": [], "data_flow": [], "error_handling": [], "security_notes": []},
        "build_run": {"prerequisites": [], "commands": [], "verification": []},
        "deliverable_policy": {"max_lines_per_chunk": 500},
    })
}

fn structure(paths: &[&str]) -> serde_json::Value {
    json!({
        "contract": "A2_STRUCTURE",
        "root": "demo",
        "files": paths.iter().map(|p| json!({
            "path": p, "purpose": "p", "language": "python", "generated_in_phase": "A3",
        })).collect::<Vec<_>>(),
    })
}

fn file_chunk(path: &str, content: &str) -> serde_json::Value {
    json!({
        "contract": "A3_FILE",
        "path": path,
        "chunking": {"max_lines": 500, "chunk_index": 0, "chunk_count": 1,
                     "has_more": false, "next_chunk_index": null},
        "content": content,
    })
}

fn generate_request(out: PathBuf, prompt: &str) -> RunRequest {
    RunRequest {
        mode: RunMode::Generate,
        project: "demo".to_string(),
        model: "m-1".to_string(),
        prompt: prompt.to_string(),
        previous_response_id: None,
        input_root: None,
        output_root: Some(out),
        attached_file_ids: Vec::new(),
        versioning: false,
        dry_run: false,
        use_file_search: false,
        skip_paths: Vec::new(),
        skip_extensions: Vec::new(),
    }
}

#[test]
fn generate_happy_path_writes_the_file_and_one_receipt_per_request() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = fresh_settings(temp.path());
    seed_capabilities(&settings, "m-1", true, true, false);

    let provider = Arc::new(ScriptedProvider::with_responses(vec![
        Ok(envelope("resp-a1", &plan(), (10, 5))),
        Ok(envelope("resp-a2", &structure(&["main.py"]), (12, 6))),
        Ok(envelope("resp-a3", &file_chunk("main.py", "print('hi')\n"), (20, 8))),
    ]));
    let supervisor =
        Supervisor::new(settings.clone(), factory_for(&provider)).expect("supervisor");

    let out = temp.path().join("OUT");
    let handle = supervisor
        .start(generate_request(out.clone(), "make a one-file script"))
        .expect("start");
    let outcome = handle.wait().expect("run");

    assert_eq!(
        std::fs::read_to_string(out.join("main.py")).expect("main.py"),
        "print('hi')\n"
    );
    assert_eq!(outcome.saved_paths, vec!["main.py".to_string()]);
    assert_eq!(outcome.response_id.as_deref(), Some("resp-a2"));

    let state = load_run_state(&settings.log_dir, &handle.run_id).expect("state");
    assert_eq!(state.status, RunStatus::Done);

    let ledger = ReceiptLedger::open(&settings.ledger_path).expect("ledger");
    let receipts = ledger
        .query(&ReceiptQuery {
            run_id: Some(handle.run_id.clone()),
            ..Default::default()
        })
        .expect("query");
    assert_eq!(receipts.len(), 3, "one receipt per usage-bearing request");
    let keys: BTreeSet<_> = receipts.iter().map(|r| r.step_key.clone()).collect();
    assert_eq!(keys.len(), receipts.len(), "receipt keys are unique");

    let events: Vec<_> = handle.events().try_iter().collect();
    assert!(events.iter().any(|e| e.kind == "run.done"));
    let seqs: Vec<_> = events.iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort();
    assert_eq!(seqs, sorted, "events arrive in sequence order");
}

#[test]
fn contract_violation_quarantines_the_path_and_continues() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = fresh_settings(temp.path());
    seed_capabilities(&settings, "m-1", true, true, false);

    // a.py answers three times without the contract field, then b.py is fine.
    let broken = json!({"path": "a.py", "content": "x"});
    let provider = Arc::new(ScriptedProvider::with_responses(vec![
        Ok(envelope("resp-a1", &plan(), (10, 5))),
        Ok(envelope("resp-a2", &structure(&["a.py", "b.py"]), (12, 6))),
        Ok(envelope("resp-bad1", &broken, (1, 1))),
        Ok(envelope("resp-bad2", &broken, (1, 1))),
        Ok(envelope("resp-bad3", &broken, (1, 1))),
        Ok(envelope("resp-b", &file_chunk("b.py", "ok\n"), (2, 2))),
    ]));
    let supervisor =
        Supervisor::new(settings.clone(), factory_for(&provider)).expect("supervisor");

    let out = temp.path().join("OUT");
    let handle = supervisor
        .start(generate_request(out.clone(), "two files"))
        .expect("start");
    let outcome = handle.wait().expect("run");

    assert_eq!(outcome.failed_paths, vec!["a.py".to_string()]);
    assert_eq!(outcome.saved_paths, vec!["b.py".to_string()]);
    assert!(!out.join("a.py").exists());
    assert_eq!(std::fs::read_to_string(out.join("b.py")).expect("b.py"), "ok\n");
    assert!(
        out.join("_invalid").join("A3_a.py.json").is_file(),
        "offending raw response is quarantined"
    );

    let state = load_run_state(&settings.log_dir, &handle.run_id).expect("state");
    assert_eq!(state.status, RunStatus::Done, "other paths still complete");
}

#[test]
fn prompt_at_threshold_skips_ingest_but_one_char_more_triggers_it() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = fresh_settings(temp.path());
    seed_capabilities(&settings, "m-1", true, true, false);

    // Exactly 150k characters: no A0 phase.
    let provider = Arc::new(ScriptedProvider::with_responses(vec![
        Ok(envelope("resp-a1", &plan(), (1, 1))),
        Ok(envelope("resp-a2", &structure(&[]), (1, 1))),
    ]));
    let supervisor =
        Supervisor::new(settings.clone(), factory_for(&provider)).expect("supervisor");
    let handle = supervisor
        .start(generate_request(temp.path().join("OUT1"), &"a".repeat(150_000)))
        .expect("start");
    handle.wait().expect("run");
    let ingest_requests = provider
        .seen_requests
        .lock()
        .expect("requests")
        .iter()
        .filter(|r| r.idempotency_key.contains(":A0#"))
        .count();
    assert_eq!(ingest_requests, 0);

    // One more character: eight 20k-char parts are ingested first.
    let ack = json!({"contract": "A0_INGEST_ACK", "part_index": 0, "part_count": 8, "ok": true});
    let mut responses = Vec::new();
    for index in 0..8 {
        responses.push(Ok(envelope(&format!("resp-a0-{index}"), &ack, (1, 1))));
    }
    responses.push(Ok(envelope("resp-a1", &plan(), (1, 1))));
    responses.push(Ok(envelope("resp-a2", &structure(&[]), (1, 1))));
    let provider = Arc::new(ScriptedProvider::with_responses(responses));
    let supervisor =
        Supervisor::new(settings.clone(), factory_for(&provider)).expect("supervisor");
    let handle = supervisor
        .start(generate_request(temp.path().join("OUT2"), &"a".repeat(150_001)))
        .expect("start");
    handle.wait().expect("run");

    let requests = provider.seen_requests.lock().expect("requests");
    let ingest: Vec<_> = requests
        .iter()
        .filter(|r| r.idempotency_key.contains(":A0#"))
        .collect();
    assert_eq!(ingest.len(), 8);
    // The ingest chain threads previous_response_id part to part.
    assert_eq!(ingest[1].previous_response_id.as_deref(), Some("resp-a0-0"));
    let plan_request = requests
        .iter()
        .find(|r| r.idempotency_key.ends_with(":A1"))
        .expect("plan request");
    assert_eq!(
        plan_request.previous_response_id.as_deref(),
        Some("resp-a0-7"),
        "the plan chains onto the last ingested part"
    );
}
