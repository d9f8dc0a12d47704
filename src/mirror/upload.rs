use crate::cascade::RunError;
use crate::config::SecurityPolicy;
use crate::mirror::manifest::Manifest;
use crate::mirror::walk::scan_tree;
use crate::provider::client::ProviderApi;
use crate::runtime::events::CancelFlag;
use crate::runlog::now_secs;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

const VECTOR_STORE_INDEX_TIMEOUT: Duration = Duration::from_secs(180);
const VECTOR_STORE_POLL: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct MirrorUploadOutcome {
    pub manifest: Manifest,
    pub manifest_file_id: Option<String>,
    pub vector_store_id: Option<String>,
}

/// Walk the input tree, upload every eligible file on a bounded worker pool,
/// upload the manifest itself, and (when the model supports the search tool)
/// build a vector store holding all of it. Single-file upload failures mark
/// the manifest entry and the run continues.
#[allow(clippy::too_many_arguments)]
pub fn mirror_input_tree(
    api: &dyn ProviderApi,
    input_root: &Path,
    project: &str,
    policy: &SecurityPolicy,
    build_vector_store: bool,
    vector_store_name: &str,
    workers: usize,
    cancel: &CancelFlag,
    mut log: impl FnMut(&str, Value),
) -> Result<MirrorUploadOutcome, RunError> {
    let root_name = input_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "in".to_string());
    let items = scan_tree(input_root, &root_name, policy)?;
    let mut manifest = Manifest::from_scan(input_root, project, &items, now_secs());

    let to_upload: Vec<_> = items.iter().filter(|item| item.uploadable).collect();
    log(
        "mirror.scanned",
        json!({
            "total": items.len(),
            "to_upload": to_upload.len(),
            "skipped": items.len() - to_upload.len(),
        }),
    );

    // Bounded fan-out: a shared cursor over the upload list, one thread per
    // worker slot, results collected under a lock.
    let cursor = AtomicUsize::new(0);
    let results: Mutex<Vec<(String, Result<String, String>)>> = Mutex::new(Vec::new());
    let worker_count = workers.clamp(1, to_upload.len().max(1));
    thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| loop {
                if cancel.is_tripped() {
                    return;
                }
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(item) = to_upload.get(index) else {
                    return;
                };
                let outcome = api
                    .upload_file(&item.abs_path, "user_data")
                    .map_err(|err| err.to_string());
                if let Ok(mut collected) = results.lock() {
                    collected.push((item.rel_path.clone(), outcome));
                }
            });
        }
    });
    if cancel.is_tripped() {
        return Err(RunError::Cancelled);
    }

    let mut uploaded_pairs: Vec<(String, String)> = Vec::new();
    for (rel_path, outcome) in results.into_inner().unwrap_or_default() {
        match outcome {
            Ok(file_id) => {
                manifest.mark_uploaded(&rel_path, &file_id);
                uploaded_pairs.push((rel_path, file_id));
            }
            Err(message) => {
                manifest.mark_upload_failed(&rel_path);
                log(
                    "mirror.upload_failed",
                    json!({"path": rel_path, "error": message}),
                );
            }
        }
    }
    uploaded_pairs.sort();
    log(
        "mirror.uploaded",
        json!({"count": uploaded_pairs.len()}),
    );

    // The manifest is its own provider file: a second, tool-independent way
    // for the model to resolve the tree.
    let manifest_bytes = serde_json::to_vec_pretty(&manifest).unwrap_or_default();
    let manifest_file_id = match api.upload_bytes("mirror_manifest.json", &manifest_bytes, "user_data")
    {
        Ok(file_id) => {
            log("mirror.manifest_uploaded", json!({"file_id": file_id.as_str()}));
            Some(file_id)
        }
        Err(err) => {
            log(
                "mirror.manifest_upload_failed",
                json!({"error": err.to_string()}),
            );
            None
        }
    };

    let vector_store_id = if build_vector_store {
        match build_store(
            api,
            vector_store_name,
            input_root,
            &uploaded_pairs,
            manifest_file_id.as_deref(),
            cancel,
            &mut log,
        ) {
            Ok(vs_id) => vs_id,
            Err(RunError::Cancelled) => return Err(RunError::Cancelled),
            Err(err) => {
                // The store is an optimization; losing it downgrades the run
                // to plain attachments.
                log(
                    "mirror.vector_store_failed",
                    json!({"error": err.to_string()}),
                );
                None
            }
        }
    } else {
        None
    };

    Ok(MirrorUploadOutcome {
        manifest,
        manifest_file_id,
        vector_store_id,
    })
}

fn build_store(
    api: &dyn ProviderApi,
    name: &str,
    input_root: &Path,
    uploaded: &[(String, String)],
    manifest_file_id: Option<&str>,
    cancel: &CancelFlag,
    log: &mut impl FnMut(&str, Value),
) -> Result<Option<String>, RunError> {
    if uploaded.is_empty() && manifest_file_id.is_none() {
        return Ok(None);
    }
    let vs_id = api.create_vector_store(name)?;
    let mut pending = Vec::new();
    for (rel_path, file_id) in uploaded {
        if cancel.is_tripped() {
            return Err(RunError::Cancelled);
        }
        let mut attributes = Map::new();
        attributes.insert(
            "source_path".to_string(),
            Value::String(input_root.join(rel_path).display().to_string()),
        );
        let vs_file_id = api.add_vector_store_file(&vs_id, file_id, Some(attributes))?;
        pending.push(vs_file_id);
    }
    if let Some(manifest_id) = manifest_file_id {
        let mut attributes = Map::new();
        attributes.insert(
            "source".to_string(),
            Value::String("mirror_manifest".to_string()),
        );
        pending.push(api.add_vector_store_file(&vs_id, manifest_id, Some(attributes))?);
    }
    wait_for_indexing(api, &vs_id, &pending, cancel)?;
    log(
        "mirror.vector_store_ready",
        json!({"vector_store_id": vs_id, "files": pending.len()}),
    );
    Ok(Some(vs_id))
}

fn wait_for_indexing(
    api: &dyn ProviderApi,
    vs_id: &str,
    vs_file_ids: &[String],
    cancel: &CancelFlag,
) -> Result<(), RunError> {
    let started = std::time::Instant::now();
    let mut pending: Vec<&String> = vs_file_ids.iter().collect();
    while !pending.is_empty() {
        if cancel.is_tripped() {
            return Err(RunError::Cancelled);
        }
        if started.elapsed() > VECTOR_STORE_INDEX_TIMEOUT {
            return Err(RunError::Configuration(format!(
                "vector store {vs_id} indexing timed out"
            )));
        }
        let mut still_pending = Vec::new();
        for vs_file_id in pending {
            let status = match api.vector_store_file_status(vs_id, vs_file_id) {
                Ok(status) => status,
                Err(_) => {
                    still_pending.push(vs_file_id);
                    continue;
                }
            };
            match status.status.as_str() {
                "completed" => {}
                "failed" => {
                    return Err(RunError::Configuration(format!(
                        "vector store {vs_id} indexing failed: {}",
                        status.last_error.unwrap_or_else(|| "unknown".to_string())
                    )));
                }
                _ => still_pending.push(vs_file_id),
            }
        }
        pending = still_pending;
        if !pending.is_empty() && !cancel.sleep_unless_cancelled(VECTOR_STORE_POLL) {
            return Err(RunError::Cancelled);
        }
    }
    Ok(())
}
