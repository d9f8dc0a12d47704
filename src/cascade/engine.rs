use crate::cascade::assemble::ChunkAssembler;
use crate::cascade::batch::{build_batch_line, BatchMonitor};
use crate::cascade::contract::{
    parse_contract, ContractError, ContractKind, ContractPayload, OutputFileSpec,
};
use crate::cascade::request::{
    contract_instructions, split_text, RequestContext, PROMPT_INGEST_THRESHOLD, PROMPT_PART_CHARS,
    TEMPERATURE_FILE_OUTPUT, TEMPERATURE_PLANNING,
};
use crate::cascade::{RunError, RunMode, RunOutcome, RunRequest};
use crate::config::Settings;
use crate::ledger::pricing::{compute_cost, PriceTable};
use crate::ledger::{Receipt, ReceiptLedger};
use crate::mirror::snapshot::SnapshotGate;
use crate::mirror::upload::mirror_input_tree;
use crate::mirror::{MirrorError, OutputWriter};
use crate::provider::capability::CapabilityRecord;
use crate::provider::client::ProviderApi;
use crate::provider::transport::ProviderErrorKind;
use crate::provider::types::{ResponseEnvelope, ResponsesRequest, Usage};
use crate::runlog::{now_secs, ArtifactKind, RunLogger, RunState, UploadedFile};
use crate::runtime::events::{CancelFlag, ContinueGate, EventBus, EventLevel};
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::ids::ts_code;
use chrono::Local;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

const CONTRACT_PARSE_ATTEMPTS: u32 = 3;

/// The cascade steps, as values. A run is a fold over the sequence for its
/// mode; resume restarts the fold at the persisted cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    MirrorInput,
    IngestPrompt,
    Plan,
    Structure,
    AwaitContinue,
    FileLoop,
    Answer,
    SingleFile,
    BatchSubmit,
    BatchAwait,
    WriteAll,
}

pub fn step_sequence(mode: RunMode) -> Vec<Step> {
    match mode {
        RunMode::Generate => vec![Step::IngestPrompt, Step::Plan, Step::Structure, Step::FileLoop],
        RunMode::Modify => vec![
            Step::MirrorInput,
            Step::IngestPrompt,
            Step::Plan,
            Step::Structure,
            Step::AwaitContinue,
            Step::FileLoop,
        ],
        RunMode::Qa => vec![Step::Answer],
        RunMode::Qfile => vec![Step::SingleFile],
        RunMode::Batch => vec![Step::BatchSubmit, Step::BatchAwait, Step::WriteAll],
    }
}

impl Step {
    pub fn label(&self, mode: RunMode) -> &'static str {
        let b_side = mode == RunMode::Modify;
        match self {
            Step::MirrorInput => "INGEST",
            Step::IngestPrompt => "A0",
            Step::Plan => {
                if b_side {
                    "B1"
                } else {
                    "A1"
                }
            }
            Step::Structure => {
                if b_side {
                    "B2"
                } else {
                    "A2"
                }
            }
            Step::AwaitContinue => "B2_GATE",
            Step::FileLoop => {
                if b_side {
                    "B3"
                } else {
                    "A3"
                }
            }
            Step::Answer => "QA",
            Step::SingleFile => "QFILE",
            Step::BatchSubmit => "C",
            Step::BatchAwait => "C_POLL",
            Step::WriteAll => "C_WRITE",
        }
    }
}

pub struct EngineDeps<'a> {
    pub api: &'a dyn ProviderApi,
    pub logger: &'a RunLogger,
    pub ledger: &'a ReceiptLedger,
    pub prices: &'a PriceTable,
    pub settings: &'a Settings,
    pub caps: CapabilityRecord,
    pub cancel: CancelFlag,
    pub bus: EventBus,
    pub continue_gate: ContinueGate,
}

/// Runs one cascade to completion against the provider, mutating the run
/// state after every step so a crash at any point resumes cleanly.
pub struct CascadeEngine<'a> {
    deps: EngineDeps<'a>,
    request: &'a RunRequest,
    writer: Option<OutputWriter>,
    outcome: RunOutcome,
}

impl<'a> CascadeEngine<'a> {
    pub fn new(deps: EngineDeps<'a>, request: &'a RunRequest) -> Self {
        Self {
            deps,
            request,
            writer: None,
            outcome: RunOutcome::default(),
        }
    }

    pub fn run(&mut self, state: &mut RunState) -> Result<RunOutcome, RunError> {
        if self.request.mode.needs_chaining() && !self.deps.caps.supports_previous_response {
            return Err(RunError::Configuration(
                "selected model explicitly rejects previous_response_id, required for cascades"
                    .to_string(),
            ));
        }

        let steps = step_sequence(self.request.mode);
        for (index, step) in steps.iter().enumerate() {
            if (index as u32) < state.step_cursor {
                continue;
            }
            self.check_cancel()?;
            let label = step.label(self.request.mode);
            let percent = (index * 100 / steps.len()) as u8;
            self.emit(label, percent, EventLevel::Info, "step.start", label);
            self.execute(*step, state)?;
            state.advance_cursor(index as u32 + 1, now_secs());
            self.deps.logger.write_state(state);
        }

        self.outcome.response_id = state.response_chain.last().cloned();
        self.outcome.batch_id = state.batch_id.clone();
        if let Some(writer) = &self.writer {
            self.outcome.snapshot_dir = writer.snapshot_dir().map(PathBuf::from);
        }
        Ok(std::mem::take(&mut self.outcome))
    }

    fn execute(&mut self, step: Step, state: &mut RunState) -> Result<(), RunError> {
        match step {
            Step::MirrorInput => self.step_mirror_input(state),
            Step::IngestPrompt => self.step_ingest_prompt(state),
            Step::Plan => self.step_plan(state),
            Step::Structure => self.step_structure(state),
            Step::AwaitContinue => self.step_await_continue(state),
            Step::FileLoop => self.step_file_loop(state),
            Step::Answer => self.step_answer(state),
            Step::SingleFile => self.step_single_file(state),
            Step::BatchSubmit => self.step_batch_submit(state),
            Step::BatchAwait => self.step_batch_await(state),
            Step::WriteAll => self.step_write_all(state),
        }
    }

    // ---- plumbing -------------------------------------------------------

    fn check_cancel(&self) -> Result<(), RunError> {
        if self.deps.cancel.is_tripped() {
            Err(RunError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn emit(&self, step: &str, percent: u8, level: EventLevel, kind: &str, message: &str) {
        self.deps.bus.emit(step, percent, level, kind, message);
        let level_str = match level {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        };
        self.deps
            .logger
            .event(level_str, step, kind, json!({"message": message}));
    }

    fn context(&self, state: &RunState) -> RequestContext {
        let mut file_ids = self.request.attached_file_ids.clone();
        for uploaded in state.uploaded.values() {
            file_ids.push(uploaded.file_id.clone());
        }
        if let Some(manifest_id) = &state.manifest_file_id {
            file_ids.push(manifest_id.clone());
        }
        file_ids.dedup();

        let manifest_listing = if state.uploaded.is_empty() {
            None
        } else {
            let mut lines = vec!["MANIFEST (path -> file_id):".to_string()];
            for (rel_path, uploaded) in &state.uploaded {
                lines.push(format!("- {} -> {}", rel_path, uploaded.file_id));
            }
            Some(lines.join("\n"))
        };

        RequestContext {
            run_id: state.run_id.clone(),
            model: self.request.model.clone(),
            caps: self.deps.caps.clone(),
            file_ids,
            vector_store_ids: state.vector_store_id.iter().cloned().collect(),
            use_file_search: self.request.use_file_search,
            manifest_listing,
        }
    }

    fn base_previous_id(&self, state: &RunState) -> Option<String> {
        state
            .response_chain
            .last()
            .cloned()
            .or_else(|| self.request.previous_response_id.clone())
    }

    /// One provider call with artifacts, receipt, cooling-down pause, and
    /// rejected-chain detection.
    fn send(
        &self,
        state: &RunState,
        step_key: &str,
        request: &ResponsesRequest,
    ) -> Result<ResponseEnvelope, RunError> {
        self.deps.logger.save_artifact(
            ArtifactKind::Request,
            &format!("{}_{}", state.run_id, step_key.replace(['/', ':'], "_")),
            &json!({"payload": request.to_body()}),
        );

        loop {
            self.check_cancel()?;
            match self.deps.api.create_response(request) {
                Ok(envelope) => {
                    self.deps.logger.save_artifact(
                        ArtifactKind::Response,
                        &format!(
                            "{}_{}_{}",
                            state.run_id,
                            step_key.replace(['/', ':'], "_"),
                            if envelope.id.is_empty() { "NOID" } else { &envelope.id }
                        ),
                        &envelope.raw,
                    );
                    if let Some(usage) = envelope.usage {
                        self.record_receipt(
                            state,
                            step_key,
                            Some(envelope.id.clone()).filter(|id| !id.is_empty()),
                            None,
                            usage,
                            false,
                            request.tools.is_some(),
                        );
                    }
                    return Ok(envelope);
                }
                Err(err) if err.kind == ProviderErrorKind::CoolingDown => {
                    // Breaker is open: pause the cascade, do not fail it.
                    self.emit(
                        step_key,
                        0,
                        EventLevel::Warn,
                        "provider.cooling_down",
                        "circuit breaker open, pausing",
                    );
                    let wait = Duration::from_secs(self.deps.settings.retry.breaker_cooldown_s);
                    if !self.deps.cancel.sleep_unless_cancelled(wait) {
                        return Err(RunError::Cancelled);
                    }
                }
                Err(err)
                    if request.previous_response_id.is_some()
                        && err.message.to_ascii_lowercase().contains("previous_response_id") =>
                {
                    // The server-side chain is gone; retrying will not help.
                    return Err(RunError::Contract(ContractError::new(
                        step_key,
                        "/previous_response_id",
                        "previous_response_rejected",
                    )));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn record_receipt(
        &self,
        state: &RunState,
        step_key: &str,
        response_id: Option<String>,
        batch_id: Option<String>,
        usage: Usage,
        is_batch: bool,
        used_file_search: bool,
    ) {
        let now = now_secs();
        let row = self.deps.prices.get(&self.request.model);
        let cost = compute_cost(
            row,
            usage.input_tokens,
            usage.output_tokens,
            is_batch,
            used_file_search,
            0.0,
        );
        let receipt = Receipt {
            run_id: state.run_id.clone(),
            step_key: step_key.to_string(),
            recorded_at: now,
            project: self.request.project.clone(),
            model: self.request.model.clone(),
            mode: self.request.mode.as_str().to_string(),
            response_id,
            batch_id,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            tool_cost: cost.tool_cost,
            storage_cost: cost.storage_cost,
            total_cost: cost.total,
            cost_estimated: row.is_none() || self.deps.prices.is_stale(now),
            prompt_digest: self.request.prompt.chars().take(4000).collect(),
        };
        if let Err(err) = self.deps.ledger.record(&receipt) {
            self.deps.logger.event(
                "warn",
                step_key,
                "receipt.failed",
                json!({"error": err.to_string()}),
            );
        }
    }

    fn writer(&mut self, state: &RunState) -> Result<&mut OutputWriter, RunError> {
        if self.writer.is_none() {
            let out_root = self.request.output_root.clone().ok_or_else(|| {
                RunError::Configuration("this mode requires an output root".to_string())
            })?;
            // A snapshot taken by an earlier attempt of this run still counts.
            let gate = SnapshotGate::new(
                &out_root,
                self.request.versioning && !state.snapshot_created,
            );
            self.writer = Some(OutputWriter::new(out_root, gate));
        }
        self.writer
            .as_mut()
            .ok_or_else(|| RunError::Configuration("output writer unavailable".to_string()))
    }

    /// Park the offending raw response under `<OUT>/_invalid/<step>.json`.
    fn quarantine(&self, step_key: &str, raw: &Value) {
        let Some(out_root) = &self.request.output_root else {
            return;
        };
        let safe: String = step_key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let path = out_root.join("_invalid").join(format!("{safe}.json"));
        if atomic_write_json(&path, raw).is_err() {
            self.deps.logger.event(
                "warn",
                step_key,
                "quarantine.failed",
                json!({"path": path.display().to_string()}),
            );
        } else {
            self.deps.logger.event(
                "info",
                step_key,
                "quarantine.saved",
                json!({"path": path.display().to_string()}),
            );
        }
    }

    // ---- steps ----------------------------------------------------------

    fn step_mirror_input(&mut self, state: &mut RunState) -> Result<(), RunError> {
        let input_root = self.request.input_root.clone().ok_or_else(|| {
            RunError::Configuration("MODIFY requires an input root".to_string())
        })?;
        let project = if self.request.project.trim().is_empty() {
            input_root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string())
        } else {
            self.request.project.clone()
        };
        let vector_store_name = format!("{project}{}", ts_code(Local::now()));
        let build_store =
            self.deps.caps.supports_file_search && self.request.use_file_search;
        if self.request.use_file_search && !self.deps.caps.supports_file_search {
            // Requested but unavailable: downgrade, not an error.
            self.emit(
                "INGEST",
                5,
                EventLevel::Info,
                "capability.downgrade",
                "file_search unsupported by model, using plain attachments",
            );
        }

        let logger = self.deps.logger;
        let outcome = mirror_input_tree(
            self.deps.api,
            &input_root,
            &project,
            &self.deps.settings.security,
            build_store,
            &vector_store_name,
            self.deps.settings.upload_workers,
            &self.deps.cancel,
            |kind, data| logger.event("info", "INGEST", kind, data),
        )?;

        state.uploaded.clear();
        for entry in outcome.manifest.uploaded_entries() {
            if let Some(file_id) = &entry.file_id {
                state.uploaded.insert(
                    entry.relative_path.clone(),
                    UploadedFile {
                        file_id: file_id.clone(),
                        sha256: entry.sha256.clone(),
                        size: entry.size,
                    },
                );
            }
        }
        state.manifest_file_id = outcome.manifest_file_id.clone();
        state.vector_store_id = outcome.vector_store_id.clone();

        self.deps.logger.save_artifact(
            ArtifactKind::Manifest,
            &format!("{}_mirror_manifest", state.run_id),
            &serde_json::to_value(&outcome.manifest).unwrap_or(Value::Null),
        );
        Ok(())
    }

    fn step_ingest_prompt(&mut self, state: &mut RunState) -> Result<(), RunError> {
        if self.request.prompt.chars().count() <= PROMPT_INGEST_THRESHOLD {
            return Ok(());
        }
        let parts = split_text(&self.request.prompt, PROMPT_PART_CHARS);
        let part_count = parts.len();
        // Ingest parts carry no attachments; they exist only to chain the
        // long brief into server-side context.
        let mut bare = self.context(state);
        bare.file_ids = Vec::new();
        bare.manifest_listing = None;

        let instructions = contract_instructions(
            ContractKind::A0IngestAck,
            "You are an ingestion step. DO NOT summarize.",
        );
        let mut previous = self.base_previous_id(state);
        for (index, part) in parts.into_iter().enumerate() {
            self.check_cancel()?;
            let step_key = format!("A0#{index}");
            let text = format!("PART {}/{part_count}:\n{part}", index + 1);
            let request = bare.build(
                &step_key,
                &instructions,
                &text,
                TEMPERATURE_PLANNING,
                previous.as_deref(),
            );
            let envelope = self.send(state, &step_key, &request)?;
            if envelope.id.is_empty() {
                return Err(RunError::Contract(ContractError::new(
                    "A0_INGEST_ACK",
                    "/id",
                    "ingest response carries no id",
                )));
            }
            if parse_contract(ContractKind::A0IngestAck, &envelope.output_text()).is_err() {
                // The ack content is advisory; the chain id is what matters.
                self.deps.logger.event(
                    "debug",
                    &step_key,
                    "ingest.ack_unparsed",
                    json!({"part": index}),
                );
            }
            previous = Some(envelope.id.clone());
            state.response_chain.push(envelope.id);
            self.emit(
                "A0",
                ((index + 1) * 100 / part_count.max(1)) as u8,
                EventLevel::Info,
                "ingest.part",
                &format!("part {}/{part_count}", index + 1),
            );
        }
        Ok(())
    }

    fn plan_kind(&self) -> (ContractKind, &'static str, &'static str) {
        if self.request.mode == RunMode::Modify {
            (
                ContractKind::B1Plan,
                "B1",
                "You are a senior maintenance engineer. Use file_search over the mirrored tree when available.",
            )
        } else {
            (
                ContractKind::A1Plan,
                "A1",
                "You are a senior software architect and implementer.",
            )
        }
    }

    fn step_plan(&mut self, state: &mut RunState) -> Result<(), RunError> {
        let (kind, label, role) = self.plan_kind();
        let ctx = self.context(state);
        let text = if self.request.prompt.chars().count() <= PROMPT_INGEST_THRESHOLD {
            self.request.prompt.clone()
        } else {
            "Use the ingested brief (A0 parts) and the attached files; return the plan per the contract."
                .to_string()
        };
        let request = ctx.build(
            label,
            &contract_instructions(kind, role),
            &text,
            TEMPERATURE_PLANNING,
            self.base_previous_id(state).as_deref(),
        );
        let envelope = self.send(state, label, &request)?;
        let raw_text = envelope.output_text();
        match parse_contract(kind, &raw_text) {
            Ok(ContractPayload::Plan(_)) => {}
            Ok(_) => unreachable!("plan contracts parse to Plan payloads"),
            Err(err) => {
                self.quarantine(label, &envelope.raw);
                return Err(err.into());
            }
        }
        state.response_chain.push(envelope.id);
        Ok(())
    }

    fn step_structure(&mut self, state: &mut RunState) -> Result<(), RunError> {
        let b_side = self.request.mode == RunMode::Modify;
        let (kind, label) = if b_side {
            (ContractKind::B2Structure, "B2")
        } else {
            (ContractKind::A2Structure, "A2")
        };
        let ctx = self.context(state);
        let text = if b_side {
            "Return the touched_files list to implement in B3."
        } else {
            "Generate the file structure for the plan."
        };
        let request = ctx.build(
            label,
            &contract_instructions(kind, ""),
            text,
            TEMPERATURE_PLANNING,
            self.base_previous_id(state).as_deref(),
        );
        let envelope = self.send(state, label, &request)?;
        let raw_text = envelope.output_text();
        let planned: Vec<(String, Option<String>)> = match parse_contract(kind, &raw_text) {
            Ok(ContractPayload::Structure { files, .. }) => {
                files.into_iter().map(|f| (f.path, None)).collect()
            }
            Ok(ContractPayload::Touched { files }) => files
                .into_iter()
                .map(|f| (f.path, Some(f.action)))
                .collect(),
            Ok(_) => unreachable!("structure contracts parse to Structure/Touched"),
            Err(err) => {
                self.quarantine(label, &envelope.raw);
                return Err(err.into());
            }
        };

        let mut kept: Vec<(String, Option<String>)> = planned
            .into_iter()
            .filter(|(path, _)| {
                if self.request.skip_paths.iter().any(|skip| skip == path) {
                    return false;
                }
                let extension = path
                    .rsplit_once('.')
                    .map(|(_, ext)| format!(".{}", ext.to_ascii_lowercase()))
                    .unwrap_or_default();
                !self
                    .request
                    .skip_extensions
                    .iter()
                    .any(|skip| skip.eq_ignore_ascii_case(&extension))
            })
            .collect();
        // Lexical order keeps the chunk loop deterministic and resume
        // idempotent.
        kept.sort();

        state.structure = Some(json!(kept
            .iter()
            .map(|(path, action)| json!({"path": path, "action": action}))
            .collect::<Vec<_>>()));
        state.structure_response_id = Some(envelope.id.clone());
        state.response_chain.push(envelope.id);

        // The structure is the resume anchor: persist it before any file
        // generation begins.
        self.deps.logger.save_artifact(
            ArtifactKind::Manifest,
            &format!("{}_resume_structure", state.run_id),
            &json!({
                "files": state.structure,
                "structure_response_id": state.structure_response_id,
            }),
        );
        Ok(())
    }

    fn step_await_continue(&mut self, state: &mut RunState) -> Result<(), RunError> {
        if !self.request.dry_run {
            return Ok(());
        }
        let touched = state.structure.clone().unwrap_or(Value::Null);
        self.deps.logger.event(
            "info",
            "B2_GATE",
            "dry_run.waiting",
            json!({"touched_files": touched}),
        );
        self.emit(
            "B2_GATE",
            50,
            EventLevel::Info,
            "dry_run.waiting",
            "dry-run: waiting for continue approval before B3",
        );
        while !self.deps.continue_gate.is_approved() {
            if !self.deps.cancel.sleep_unless_cancelled(Duration::from_millis(200)) {
                return Err(RunError::Cancelled);
            }
        }
        self.emit(
            "B2_GATE",
            55,
            EventLevel::Info,
            "dry_run.continued",
            "continue approved",
        );
        Ok(())
    }

    fn planned_files(&self, state: &RunState) -> Vec<(String, Option<String>)> {
        let Some(Value::Array(entries)) = &state.structure else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|entry| {
                let path = entry.get("path").and_then(Value::as_str)?.to_string();
                let action = entry
                    .get("action")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some((path, action))
            })
            .collect()
    }

    fn step_file_loop(&mut self, state: &mut RunState) -> Result<(), RunError> {
        let b_side = self.request.mode == RunMode::Modify;
        let (kind, label) = if b_side {
            (ContractKind::B3File, "B3")
        } else {
            (ContractKind::A3File, "A3")
        };
        let files = self.planned_files(state);
        let total = files.len();

        for (file_index, (path, action)) in files.into_iter().enumerate() {
            self.check_cancel()?;
            if state.completed_paths.iter().any(|done| done == &path) {
                continue;
            }
            let percent = (30 + file_index * 60 / total.max(1)) as u8;
            self.emit(
                label,
                percent,
                EventLevel::Info,
                "file.start",
                &format!("{path} ({}/{total})", file_index + 1),
            );

            match self.generate_one_file(state, kind, label, &path, action.as_deref()) {
                Ok(content) => {
                    let saved = self.writer(state)?.write(&path, &content).map_err(|err| {
                        match err {
                            MirrorError::PathPolicy { path, reason } => {
                                RunError::PathPolicy { path, reason }
                            }
                            other => RunError::Mirror(other),
                        }
                    });
                    match saved {
                        Ok(saved_file) => {
                            state.snapshot_created |=
                                self.writer.as_ref().is_some_and(|w| w.snapshot_dir().is_some());
                            state.completed_paths.push(path.clone());
                            self.deps.logger.event(
                                "info",
                                label,
                                "file.saved",
                                json!({
                                    "path": saved_file.relative_path,
                                    "bytes": saved_file.bytes,
                                    "sha256": saved_file.sha256,
                                    "replaced": saved_file.replaced,
                                }),
                            );
                            self.outcome.saved_paths.push(path);
                            self.deps.logger.write_state(state);
                        }
                        Err(RunError::PathPolicy { path, reason }) => {
                            // The model asked for an illegal destination;
                            // only this path dies.
                            self.emit(
                                label,
                                percent,
                                EventLevel::Warn,
                                "file.path_rejected",
                                &format!("{path}: {reason}"),
                            );
                            self.outcome.failed_paths.push(path);
                        }
                        Err(other) => return Err(other),
                    }
                }
                Err(PathFailure::Fatal(err)) => return Err(err),
                Err(PathFailure::PathOnly(reason)) => {
                    self.emit(
                        label,
                        percent,
                        EventLevel::Warn,
                        "file.failed",
                        &format!("{path}: {reason}"),
                    );
                    self.outcome.failed_paths.push(path);
                }
            }
        }
        Ok(())
    }

    fn generate_one_file(
        &mut self,
        state: &mut RunState,
        kind: ContractKind,
        label: &str,
        path: &str,
        action: Option<&str>,
    ) -> Result<String, PathFailure> {
        if let Err(reason) = crate::mirror::walk::validate_relative_path(path) {
            return Err(PathFailure::PathOnly(reason));
        }
        let ctx = self.context(state);
        let instructions = contract_instructions(kind, "");
        let mut assembler = ChunkAssembler::new(path);
        let mut chunk_index: u64 = 0;
        let mut previous = state.structure_response_id.clone();

        loop {
            if self.deps.cancel.is_tripped() {
                return Err(PathFailure::Fatal(RunError::Cancelled));
            }
            let step_key = format!("{label}:{path}#{chunk_index}");
            let text = match action {
                Some(action) => format!(
                    "Return the resulting content of file PATH={path} ACTION={action}. \
                     If it is long, return chunk CHUNK_INDEX={chunk_index}."
                ),
                None => format!(
                    "Return the content of file PATH={path}. \
                     If it is long, return chunk CHUNK_INDEX={chunk_index}."
                ),
            };

            let mut parsed = None;
            let mut last_raw: Option<Value> = None;
            let mut last_reason = String::new();
            for _attempt in 0..CONTRACT_PARSE_ATTEMPTS {
                let request = ctx.build(
                    &step_key,
                    &instructions,
                    &text,
                    TEMPERATURE_FILE_OUTPUT,
                    previous.as_deref(),
                );
                let envelope = match self.send(state, &step_key, &request) {
                    Ok(envelope) => envelope,
                    Err(err) if err.is_cancelled() => return Err(PathFailure::Fatal(err)),
                    Err(RunError::Contract(err)) => {
                        return Err(PathFailure::Fatal(RunError::Contract(err)))
                    }
                    Err(err) => return Err(PathFailure::Fatal(err)),
                };
                match parse_contract(kind, &envelope.output_text()) {
                    Ok(ContractPayload::FileChunk(chunk)) => {
                        parsed = Some((chunk, envelope.id.clone()));
                        break;
                    }
                    Ok(_) => unreachable!("file contracts parse to FileChunk"),
                    Err(err) => {
                        last_reason = err.to_string();
                        last_raw = Some(envelope.raw.clone());
                        self.deps.logger.event(
                            "warn",
                            &step_key,
                            "contract.retry",
                            json!({"reason": last_reason}),
                        );
                    }
                }
            }

            let Some((chunk, response_id)) = parsed else {
                if let Some(raw) = &last_raw {
                    self.quarantine(&format!("{label}_{path}"), raw);
                }
                return Err(PathFailure::PathOnly(format!(
                    "contract violated after {CONTRACT_PARSE_ATTEMPTS} attempts: {last_reason}"
                )));
            };

            match assembler.accept(&chunk) {
                Ok(None) => {
                    return assembler
                        .into_content()
                        .map_err(|err| PathFailure::PathOnly(err.to_string()));
                }
                Ok(Some(next)) => {
                    previous = Some(response_id);
                    chunk_index = next;
                }
                Err(err) => {
                    self.quarantine(
                        &format!("{label}_{path}"),
                        &json!({"assembly_error": err.to_string()}),
                    );
                    return Err(PathFailure::PathOnly(err.to_string()));
                }
            }
        }
    }

    fn step_answer(&mut self, state: &mut RunState) -> Result<(), RunError> {
        let ctx = self.context(state);
        let mut text = self.request.prompt.clone();
        let note = "Note: return plain text only, no markdown, and do not emit any files.";
        if !text.contains(note) {
            text = format!("{text}\n\n{note}");
        }
        let request = ctx.build(
            "QA",
            "You are a QA assistant. Return plain text only, without markdown and without files.",
            &text,
            TEMPERATURE_PLANNING,
            self.base_previous_id(state).as_deref(),
        );
        let envelope = self.send(state, "QA", &request)?;
        self.outcome.answer = Some(envelope.output_text());
        state.response_chain.push(envelope.id);
        Ok(())
    }

    fn step_single_file(&mut self, state: &mut RunState) -> Result<(), RunError> {
        let ctx = self.context(state);
        let instructions = contract_instructions(ContractKind::A3File, "");
        let text = format!(
            "Return the complete content of exactly one file for the brief below. \
             CHUNK_INDEX=0, chunk_count=1, has_more=false (this is a single request). \
             Use the path described in the brief.\nBrief:\n{}",
            self.request.prompt
        );
        let request = ctx.build(
            "QFILE",
            &instructions,
            &text,
            TEMPERATURE_FILE_OUTPUT,
            self.base_previous_id(state).as_deref(),
        );
        let envelope = self.send(state, "QFILE", &request)?;
        let chunk = match parse_contract(ContractKind::A3File, &envelope.output_text()) {
            Ok(ContractPayload::FileChunk(chunk)) => chunk,
            Ok(_) => unreachable!("A3_FILE parses to FileChunk"),
            Err(err) => {
                self.quarantine("QFILE", &envelope.raw);
                return Err(err.into());
            }
        };
        if chunk.chunking.has_more {
            self.quarantine("QFILE", &envelope.raw);
            return Err(RunError::Contract(ContractError::new(
                "A3_FILE",
                "/chunking/has_more",
                "single-request file must fit one chunk",
            )));
        }
        let path = chunk.path.clone();
        let saved = self
            .writer(state)?
            .write(&path, &chunk.content)
            .map_err(|err| match err {
                MirrorError::PathPolicy { path, reason } => RunError::PathPolicy { path, reason },
                other => RunError::Mirror(other),
            })?;
        state.snapshot_created |= self.writer.as_ref().is_some_and(|w| w.snapshot_dir().is_some());
        state.completed_paths.push(saved.relative_path.clone());
        state.response_chain.push(envelope.id);
        self.outcome.saved_paths.push(saved.relative_path);
        Ok(())
    }

    fn step_batch_submit(&mut self, state: &mut RunState) -> Result<(), RunError> {
        let ctx = self.context(state);
        let instructions = contract_instructions(
            ContractKind::CFilesAll,
            "You are a senior implementer. Emit the complete project in one JSON document.",
        );
        // Batch requests never chain, and file content wants determinism.
        let request = ctx.build(
            "C",
            &instructions,
            &self.request.prompt,
            TEMPERATURE_FILE_OUTPUT,
            None,
        );
        let line = build_batch_line(&state.run_id, &request);
        self.deps.logger.save_artifact(
            ArtifactKind::Request,
            &format!("{}_C_batch", state.run_id),
            &json!({"jsonl": line}),
        );
        let input_file_id =
            self.deps
                .api
                .upload_bytes("batch_input.jsonl", format!("{line}\n").as_bytes(), "batch")?;
        let batch = self.deps.api.create_batch(&input_file_id)?;
        state.batch_id = Some(batch.id.clone());
        self.emit(
            "C",
            20,
            EventLevel::Info,
            "batch.created",
            &format!("batch {} ({})", batch.id, batch.status),
        );
        Ok(())
    }

    fn step_batch_await(&mut self, state: &mut RunState) -> Result<(), RunError> {
        let batch_id = state.batch_id.clone().ok_or_else(|| {
            RunError::Configuration("batch step reached without a batch id".to_string())
        })?;
        let settings = &self.deps.settings.batch;
        let monitor = BatchMonitor::new(
            self.deps.api,
            &self.deps.cancel,
            Duration::from_secs(settings.poll_min_s),
            Duration::from_secs(settings.poll_max_s),
            Duration::from_secs(settings.timeout_s),
        );
        let logger = self.deps.logger;
        let info = monitor.await_terminal(&batch_id, |poll| {
            logger.event(
                "info",
                "C_POLL",
                "batch.status",
                json!({"batch_id": poll.id, "status": poll.status}),
            );
        })?;

        if info.status != "completed" {
            if let Some(error_bytes) = monitor.download_error_file(&info) {
                self.deps.logger.save_artifact(
                    ArtifactKind::Response,
                    &format!("{}_C_error", state.run_id),
                    &json!({"error_file": String::from_utf8_lossy(&error_bytes)}),
                );
            }
            // Account for the attempt even though no usage came back.
            self.record_receipt(
                state,
                "C",
                None,
                Some(batch_id.clone()),
                Usage::default(),
                true,
                false,
            );
            return Err(RunError::Configuration(format!(
                "batch {batch_id} ended {}",
                info.status
            )));
        }

        let body = monitor.download_output(&info)?;
        self.deps.logger.save_artifact(
            ArtifactKind::Response,
            &format!("{}_C_result", state.run_id),
            &body,
        );
        let envelope = ResponseEnvelope::from_value(body);
        self.record_receipt(
            state,
            "C",
            Some(envelope.id.clone()).filter(|id| !id.is_empty()),
            Some(batch_id.clone()),
            envelope.usage.unwrap_or_default(),
            true,
            false,
        );
        let files = match parse_contract(ContractKind::CFilesAll, &envelope.output_text()) {
            Ok(ContractPayload::FilesAll { files }) => files,
            Ok(_) => unreachable!("C_FILES_ALL parses to FilesAll"),
            Err(err) => {
                self.quarantine("C_RESULT", &envelope.raw);
                return Err(err.into());
            }
        };
        state.structure = Some(json!(files
            .iter()
            .map(|f| json!({"path": f.path, "content": f.content}))
            .collect::<Vec<_>>()));
        if !envelope.id.is_empty() {
            state.response_chain.push(envelope.id);
        }
        Ok(())
    }

    fn step_write_all(&mut self, state: &mut RunState) -> Result<(), RunError> {
        let Some(Value::Array(entries)) = state.structure.clone() else {
            return Err(RunError::Configuration(
                "batch result vanished before write".to_string(),
            ));
        };
        let files: Vec<OutputFileSpec> = entries
            .iter()
            .filter_map(|entry| {
                Some(OutputFileSpec {
                    path: entry.get("path").and_then(Value::as_str)?.to_string(),
                    purpose: String::new(),
                    content: entry.get("content").and_then(Value::as_str)?.to_string(),
                })
            })
            .collect();
        let total = files.len();
        for (index, file) in files.into_iter().enumerate() {
            self.check_cancel()?;
            if state.completed_paths.iter().any(|done| done == &file.path) {
                continue;
            }
            match self.writer(state)?.write(&file.path, &file.content) {
                Ok(saved) => {
                    state.snapshot_created |=
                        self.writer.as_ref().is_some_and(|w| w.snapshot_dir().is_some());
                    state.completed_paths.push(file.path.clone());
                    self.outcome.saved_paths.push(file.path.clone());
                    self.deps.logger.event(
                        "info",
                        "C_WRITE",
                        "file.saved",
                        json!({"path": saved.relative_path, "bytes": saved.bytes}),
                    );
                    self.deps.logger.write_state(state);
                }
                Err(MirrorError::PathPolicy { path, reason }) => {
                    self.emit(
                        "C_WRITE",
                        (80 + index * 20 / total.max(1)) as u8,
                        EventLevel::Warn,
                        "file.path_rejected",
                        &format!("{path}: {reason}"),
                    );
                    self.outcome.failed_paths.push(path);
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(())
    }
}

/// Failures inside the file loop split into path-scoped and run-fatal.
enum PathFailure {
    PathOnly(String),
    Fatal(RunError),
}
