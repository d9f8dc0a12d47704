use crate::cascade::engine::{CascadeEngine, EngineDeps};
use crate::cascade::{RunError, RunOutcome, RunRequest};
use crate::config::Settings;
use crate::ledger::pricing::PriceTable;
use crate::ledger::ReceiptLedger;
use crate::provider::capability::{resolve_capabilities, CapabilityCache, CapabilityRecord};
use crate::provider::client::{HttpProvider, ProviderApi};
use crate::provider::transport::Transport;
use crate::runlog::{
    find_resumable, list_runs, load_run_state, now_secs, ArtifactKind, RunLogger, RunState,
    RunStatus, RunSummary,
};
use crate::runtime::events::{CancelFlag, ContinueGate, EventBus, EventLevel, RunEvent};
use crate::shared::credentials::CredentialProvider;
use crate::shared::ids::new_run_id;
use chrono::Local;
use serde_json::json;
use std::fs;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const STALL_WARNING_AFTER_SECS: i64 = 5 * 60;
const STALL_CHECK_EVERY: Duration = Duration::from_secs(30);

pub type ApiFactory = Arc<dyn Fn(CancelFlag) -> Arc<dyn ProviderApi> + Send + Sync>;

/// Live handle to one run: its event stream, cancellation flag, dry-run
/// continue gate, and the join point for the final outcome.
pub struct RunHandle {
    pub run_id: String,
    log_dir: std::path::PathBuf,
    cancel: CancelFlag,
    continue_gate: ContinueGate,
    events: Receiver<RunEvent>,
    join: Mutex<Option<JoinHandle<Result<RunOutcome, RunError>>>>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.trip();
    }

    pub fn approve_continue(&self) {
        self.continue_gate.approve();
    }

    pub fn events(&self) -> &Receiver<RunEvent> {
        &self.events
    }

    /// Block until the run thread finishes. A panicked thread reports as a
    /// non-cooperative termination instead of propagating the panic.
    pub fn wait(&self) -> Result<RunOutcome, RunError> {
        let handle = self
            .join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| RunError::Configuration("run already waited on".to_string()))?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => {
                // The run thread died without writing its terminal state;
                // leave an explicit marker so resume does not pick it up as
                // merely interrupted.
                if let Ok(mut state) = load_run_state(&self.log_dir, &self.run_id) {
                    state.status = RunStatus::Failed;
                    state.error = Some("non-cooperative termination".to_string());
                    state.updated_at = now_secs();
                    RunLogger::create(&self.log_dir, &self.run_id).write_state(&state);
                }
                Err(RunError::Configuration(
                    "run thread terminated non-cooperatively".to_string(),
                ))
            }
        }
    }
}

/// Owns run lifecycle: one run at a time, event fan-out, resume, and the
/// stall watchdog. All UI surfaces sit on the other side of this API.
pub struct Supervisor {
    settings: Arc<Settings>,
    api_factory: ApiFactory,
    ledger: Arc<ReceiptLedger>,
    prices: Arc<PriceTable>,
    active: Arc<Mutex<Option<String>>>,
}

impl Supervisor {
    pub fn new(settings: Settings, api_factory: ApiFactory) -> Result<Self, RunError> {
        let ledger = ReceiptLedger::open(&settings.ledger_path)?;
        let prices = PriceTable::load(&settings.pricing_cache_path);
        Ok(Self {
            settings: Arc::new(settings),
            api_factory,
            ledger: Arc::new(ledger),
            prices: Arc::new(prices),
            active: Arc::new(Mutex::new(None)),
        })
    }

    /// Production wiring: HTTP provider over the retrying transport, API key
    /// from the credential seam.
    pub fn with_http_provider(
        settings: Settings,
        credentials: &dyn CredentialProvider,
    ) -> Result<Self, RunError> {
        let api_key = credentials
            .get("api_key")
            .ok_or_else(|| RunError::Configuration("no api_key credential available".to_string()))?;
        let base_url = settings.provider_base_url.clone();
        let retry = settings.retry;
        let timeout = Duration::from_secs(settings.request_timeout_s);
        let factory: ApiFactory = Arc::new(move |cancel: CancelFlag| {
            Arc::new(HttpProvider::new(Transport::new(
                &base_url, &api_key, retry, timeout, cancel,
            ))) as Arc<dyn ProviderApi>
        });
        Self::new(settings, factory)
    }

    pub fn list_runs(&self) -> Vec<RunSummary> {
        list_runs(&self.settings.log_dir)
    }

    pub fn resumable_run(&self) -> Option<String> {
        find_resumable(&self.settings.log_dir)
    }

    pub fn receipts(&self) -> &ReceiptLedger {
        &self.ledger
    }

    pub fn start(&self, request: RunRequest) -> Result<RunHandle, RunError> {
        request.validate()?;
        let run_id = new_run_id(Local::now());
        let state = RunState::new(
            &run_id,
            &request.project,
            request.mode.as_str(),
            &request.model,
            now_secs(),
        );
        self.launch(run_id, request, state)
    }

    /// Pick up a non-terminal run where its last persisted cursor left off.
    pub fn resume(&self, run_id: &str) -> Result<RunHandle, RunError> {
        let state = load_run_state(&self.settings.log_dir, run_id)?;
        if state.status.is_terminal() {
            return Err(RunError::Configuration(format!(
                "run {run_id} already ended as {}",
                state.status
            )));
        }
        let request_path = self.settings.log_dir.join(run_id).join("ui_state.json");
        let raw = fs::read_to_string(&request_path).map_err(|_| {
            RunError::Configuration(format!("run {run_id} has no persisted request to resume"))
        })?;
        let request: RunRequest = serde_json::from_str(&raw).map_err(|err| {
            RunError::Configuration(format!("persisted request unreadable: {err}"))
        })?;
        self.launch(run_id.to_string(), request, state)
    }

    fn claim_slot(&self, run_id: &str) -> Result<(), RunError> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(current) = active.as_ref() {
            return Err(RunError::Configuration(format!(
                "run {current} is still active; one run at a time"
            )));
        }
        *active = Some(run_id.to_string());
        Ok(())
    }

    fn launch(
        &self,
        run_id: String,
        request: RunRequest,
        mut state: RunState,
    ) -> Result<RunHandle, RunError> {
        self.claim_slot(&run_id)?;

        let cancel = CancelFlag::new();
        let continue_gate = ContinueGate::new();
        let (bus, events) = EventBus::channel();
        let api = (self.api_factory)(cancel.clone());

        let settings = Arc::clone(&self.settings);
        let ledger = Arc::clone(&self.ledger);
        let prices = Arc::clone(&self.prices);
        let active = Arc::clone(&self.active);
        let thread_cancel = cancel.clone();
        let thread_gate = continue_gate.clone();
        let thread_bus = bus.clone();
        let thread_run_id = run_id.clone();

        let join = thread::spawn(move || {
            let logger = RunLogger::create(&settings.log_dir, &thread_run_id);
            logger.save_artifact(
                ArtifactKind::UiState,
                "ui_state",
                &serde_json::to_value(&request).unwrap_or(serde_json::Value::Null),
            );
            state.status = RunStatus::Running;
            state.updated_at = now_secs();
            logger.write_state(&state);
            thread_bus.emit("", 0, EventLevel::Info, "run.started", &thread_run_id);
            if logger.is_degraded() {
                thread_bus.emit(
                    "",
                    0,
                    EventLevel::Warn,
                    "logging.degraded",
                    "run log unavailable, events buffered in memory",
                );
            }

            let watchdog_bus = thread_bus.clone();
            let watchdog_stop = CancelFlag::new();
            let watchdog_flag = watchdog_stop.clone();
            let watchdog = thread::spawn(move || {
                while watchdog_flag.sleep_unless_cancelled(STALL_CHECK_EVERY) {
                    if watchdog_bus.seconds_since_last_event() > STALL_WARNING_AFTER_SECS {
                        watchdog_bus.emit(
                            "",
                            0,
                            EventLevel::Warn,
                            "run.stalled",
                            "no progress events for five minutes",
                        );
                    }
                }
            });

            let caps = resolve_caps_for_run(&settings, api.as_ref(), &request.model, &logger);
            let deps = EngineDeps {
                api: api.as_ref(),
                logger: &logger,
                ledger: &ledger,
                prices: &prices,
                settings: &settings,
                caps,
                cancel: thread_cancel,
                bus: thread_bus.clone(),
                continue_gate: thread_gate,
            };
            let mut engine = CascadeEngine::new(deps, &request);
            let result = engine.run(&mut state);

            match &result {
                Ok(outcome) => {
                    state.status = RunStatus::Done;
                    state.error = None;
                    thread_bus.emit(
                        "",
                        100,
                        EventLevel::Info,
                        "run.done",
                        &format!("saved {} file(s)", outcome.saved_paths.len()),
                    );
                }
                Err(err) if err.is_cancelled() => {
                    state.status = RunStatus::Cancelled;
                    state.error = Some("cancelled".to_string());
                    thread_bus.emit("", 0, EventLevel::Warn, "run.cancelled", "cancelled");
                }
                Err(err) => {
                    state.status = RunStatus::Failed;
                    state.error = Some(err.to_string());
                    logger.event("error", "", "run.failed", json!({"error": err.to_string()}));
                    thread_bus.emit("", 0, EventLevel::Error, "run.failed", &err.to_string());
                }
            }
            state.updated_at = now_secs();
            logger.write_state(&state);

            watchdog_stop.trip();
            let _ = watchdog.join();
            let mut slot = active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.as_deref() == Some(thread_run_id.as_str()) {
                *slot = None;
            }
            result
        });

        Ok(RunHandle {
            run_id,
            log_dir: self.settings.log_dir.clone(),
            cancel,
            continue_gate,
            events,
            join: Mutex::new(Some(join)),
        })
    }
}

fn resolve_caps_for_run(
    settings: &Settings,
    api: &dyn ProviderApi,
    model: &str,
    logger: &RunLogger,
) -> CapabilityRecord {
    let now = now_secs();
    match CapabilityCache::load(&settings.capability_cache_path) {
        Ok(mut cache) => {
            match resolve_capabilities(api, &mut cache, model, None, false, now) {
                Ok(record) => record,
                Err(err) => {
                    logger.event(
                        "warn",
                        "",
                        "capability.cache_failed",
                        json!({"error": err.to_string()}),
                    );
                    cache
                        .get(model)
                        .cloned()
                        .unwrap_or_else(|| CapabilityRecord::optimistic(model, now))
                }
            }
        }
        Err(err) => {
            logger.event(
                "warn",
                "",
                "capability.cache_failed",
                json!({"error": err.to_string()}),
            );
            CapabilityRecord::optimistic(model, now)
        }
    }
}
