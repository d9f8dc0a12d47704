use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared cooperative cancellation flag. Long-running steps check it between
/// units of work; the transport checks it before every attempt and during
/// backoff sleeps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Sleep in small slices so cancellation is observed promptly. Returns
    /// `false` when the flag tripped during (or before) the sleep.
    pub fn sleep_unless_cancelled(&self, total: Duration) -> bool {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.is_tripped() {
                return false;
            }
            let step = remaining.min(Duration::from_millis(200));
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        !self.is_tripped()
    }
}

/// Approval latch for dry-run MODIFY: the cascade halts after B2 and waits
/// for this gate before touching any file.
#[derive(Debug, Clone, Default)]
pub struct ContinueGate(Arc<AtomicBool>);

impl ContinueGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approve(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_approved(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunEvent {
    pub seq: u64,
    pub step: String,
    pub percent: u8,
    pub level: EventLevel,
    pub kind: String,
    pub message: String,
}

/// Fan-out point for run progress: every event goes to the subscriber channel
/// (the UI side) and is mirrored into the run log by the caller.
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<RunEvent>,
    seq: Arc<AtomicU64>,
    last_emit: Arc<AtomicI64>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl EventBus {
    pub fn channel() -> (Self, Receiver<RunEvent>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (
            Self {
                tx,
                seq: Arc::new(AtomicU64::new(0)),
                last_emit: Arc::new(AtomicI64::new(unix_now())),
            },
            rx,
        )
    }

    pub fn emit(
        &self,
        step: &str,
        percent: u8,
        level: EventLevel,
        kind: &str,
        message: impl Into<String>,
    ) -> RunEvent {
        let event = RunEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            step: step.to_string(),
            percent: percent.min(100),
            level,
            kind: kind.to_string(),
            message: message.into(),
        };
        self.last_emit.store(unix_now(), Ordering::Relaxed);
        let _ = self.tx.send(event.clone());
        event
    }

    /// Seconds since the last emitted event, for the stall watchdog.
    pub fn seconds_since_last_event(&self) -> i64 {
        unix_now().saturating_sub(self.last_emit.load(Ordering::Relaxed))
    }
}
