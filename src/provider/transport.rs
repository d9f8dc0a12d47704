use crate::config::RetryPolicy;
use crate::runtime::events::CancelFlag;
use rand::Rng;
use serde_json::Value;
use std::io::Read;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Transport,
    RateLimited,
    Api,
    CoolingDown,
    Cancelled,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Transport => "transport",
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::Api => "api",
            ProviderErrorKind::CoolingDown => "cooling_down",
            ProviderErrorKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("provider {} error{}: {message}", kind.as_str(), status.map(|s| format!(" (http {s})")).unwrap_or_default())]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub retryable: bool,
    pub message: String,
}

impl ProviderError {
    pub fn cancelled() -> Self {
        Self {
            kind: ProviderErrorKind::Cancelled,
            status: None,
            retryable: false,
            message: "cancelled before completion".to_string(),
        }
    }

    pub fn cooling_down() -> Self {
        Self {
            kind: ProviderErrorKind::CoolingDown,
            status: None,
            retryable: false,
            message: "circuit breaker open".to_string(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transport,
            status: None,
            retryable: true,
            message: sanitize_message(&message.into()),
        }
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Api,
            status: None,
            retryable: false,
            message: sanitize_message(&message.into()),
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let retryable = matches!(status, 408 | 425 | 429) || status >= 500;
        Self {
            kind: if status == 429 {
                ProviderErrorKind::RateLimited
            } else if retryable {
                ProviderErrorKind::Transport
            } else {
                ProviderErrorKind::Api
            },
            status: Some(status),
            retryable,
            message: sanitize_message(body),
        }
    }
}

/// Strip anything credential- or path-shaped before an error message can
/// travel upward into logs or the UI.
pub fn sanitize_message(message: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut mask_next = false;
    for token in message.split_whitespace() {
        let lowered = token.to_ascii_lowercase();
        if mask_next {
            out.push("***".to_string());
            mask_next = false;
            continue;
        }
        if lowered == "bearer" {
            out.push(token.to_string());
            mask_next = true;
            continue;
        }
        if token.starts_with("sk-")
            || (token.len() >= 40
                && token
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'))
        {
            out.push("***".to_string());
            continue;
        }
        if lowered.contains("api_key=") || lowered.contains("api_key\":") {
            out.push("api_key=***".to_string());
            continue;
        }
        if token.len() > 1 && (token.starts_with('/') || token.starts_with("\\\\")) {
            out.push("<path>".to_string());
            continue;
        }
        out.push(token.to_string());
    }
    let mut joined = out.join(" ");
    joined.truncate(400);
    joined
}

#[derive(Debug)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen { probing: bool },
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    streak: u32,
    streak_started: Option<Instant>,
}

/// Trips after N consecutive retryable failures inside a sliding window,
/// stays open for the cooldown, then admits exactly one half-open probe.
#[derive(Debug)]
pub struct CircuitBreaker {
    failures: u32,
    window: Duration,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failures: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            failures: failures.max(1),
            window,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                streak: 0,
                streak_started: None,
            }),
        }
    }

    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(
            policy.breaker_failures,
            Duration::from_secs(policy.breaker_window_s),
            Duration::from_secs(policy.breaker_cooldown_s),
        )
    }

    /// Admission check before an attempt. `Err(CoolingDown)` while open;
    /// at most one caller passes while half-open.
    pub fn admit(&self, now: Instant) -> Result<(), ProviderError> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open { until } => {
                if now >= until {
                    inner.state = BreakerState::HalfOpen { probing: true };
                    Ok(())
                } else {
                    Err(ProviderError::cooling_down())
                }
            }
            BreakerState::HalfOpen { probing } => {
                if probing {
                    Err(ProviderError::cooling_down())
                } else {
                    inner.state = BreakerState::HalfOpen { probing: true };
                    Ok(())
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.state = BreakerState::Closed;
        inner.streak = 0;
        inner.streak_started = None;
    }

    pub fn on_retryable_failure(&self, now: Instant) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if matches!(inner.state, BreakerState::HalfOpen { .. }) {
            inner.state = BreakerState::Open {
                until: now + self.cooldown,
            };
            inner.streak = 0;
            inner.streak_started = None;
            return;
        }
        match inner.streak_started {
            Some(start) if now.duration_since(start) <= self.window => {
                inner.streak += 1;
            }
            _ => {
                inner.streak = 1;
                inner.streak_started = Some(now);
            }
        }
        if inner.streak >= self.failures {
            inner.state = BreakerState::Open {
                until: now + self.cooldown,
            };
            inner.streak = 0;
            inner.streak_started = None;
        }
    }
}

pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, jitter: f64) -> Duration {
    let base = policy.base_delay_ms as f64;
    let cap = policy.max_delay_ms as f64;
    let exp = base * 2f64.powi(attempt as i32);
    let capped = exp.min(cap);
    Duration::from_millis((capped * (1.0 + jitter.clamp(0.0, 0.999_999))) as u64)
}

/// A mapped attempt failure plus the `Retry-After` hint when the provider
/// sent one on a 429.
pub struct AttemptError {
    pub error: ProviderError,
    pub retry_after: Option<Duration>,
}

impl From<ProviderError> for AttemptError {
    fn from(error: ProviderError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

/// Blocking HTTP channel to the provider: timeouts, retry with backoff,
/// `Retry-After` honoring, breaker admission, cancellation observation.
pub struct Transport {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    cancel: CancelFlag,
}

impl Transport {
    pub fn new(
        base_url: &str,
        api_key: &str,
        policy: RetryPolicy,
        timeout: Duration,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            policy,
            breaker: CircuitBreaker::from_policy(&policy),
            cancel,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    pub fn request_json(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Value, ProviderError> {
        self.with_retry(|| {
            let mut request = self
                .agent
                .request(method, &self.url(path))
                .set("Authorization", &self.auth_header());
            if let Some(key) = idempotency_key {
                request = request.set("Idempotency-Key", key);
            }
            let response = match body {
                Some(json) => request.send_json(json.clone()),
                None => request.call(),
            }
            .map_err(map_ureq_error)?;
            response
                .into_json::<Value>()
                .map_err(|err| ProviderError::transport(format!("json decode failed: {err}")).into())
        })
    }

    pub fn download(&self, path: &str) -> Result<Vec<u8>, ProviderError> {
        self.with_retry(|| {
            let response = self
                .agent
                .get(&self.url(path))
                .set("Authorization", &self.auth_header())
                .call()
                .map_err(map_ureq_error)?;
            let mut bytes = Vec::new();
            response
                .into_reader()
                .read_to_end(&mut bytes)
                .map_err(|err| {
                    AttemptError::from(ProviderError::transport(format!(
                        "body read failed: {err}"
                    )))
                })?;
            Ok(bytes)
        })
    }

    pub fn upload_multipart(
        &self,
        path: &str,
        file_name: &str,
        file_bytes: &[u8],
        purpose: &str,
    ) -> Result<Value, ProviderError> {
        let boundary = format!(
            "cascader-{}-{}",
            std::process::id(),
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        );
        let body = multipart_body(&boundary, file_name, file_bytes, purpose);
        self.with_retry(|| {
            let response = self
                .agent
                .post(&self.url(path))
                .set("Authorization", &self.auth_header())
                .set(
                    "Content-Type",
                    &format!("multipart/form-data; boundary={boundary}"),
                )
                .send_bytes(&body)
                .map_err(map_ureq_error)?;
            response
                .into_json::<Value>()
                .map_err(|err| ProviderError::transport(format!("json decode failed: {err}")).into())
        })
    }

    fn with_retry<T>(
        &self,
        send: impl Fn() -> Result<T, AttemptError>,
    ) -> Result<T, ProviderError> {
        let mut retry_after_honored = false;
        let mut last: Option<ProviderError> = None;
        for attempt in 0..self.policy.max_attempts {
            if self.cancel.is_tripped() {
                return Err(ProviderError::cancelled());
            }
            self.breaker.admit(Instant::now())?;

            match send() {
                Ok(outcome) => {
                    self.breaker.on_success();
                    return Ok(outcome);
                }
                Err(AttemptError { error, retry_after }) => {
                    if !error.retryable {
                        return Err(error);
                    }
                    self.breaker.on_retryable_failure(Instant::now());
                    let delay = match retry_after {
                        Some(hinted) if !retry_after_honored => {
                            retry_after_honored = true;
                            hinted
                        }
                        _ => backoff_delay(
                            &self.policy,
                            attempt,
                            rand::thread_rng().gen_range(0.0..1.0),
                        ),
                    };
                    last = Some(error);
                    if attempt + 1 < self.policy.max_attempts
                        && !self.cancel.sleep_unless_cancelled(delay)
                    {
                        return Err(ProviderError::cancelled());
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| ProviderError::transport("retry budget exhausted")))
    }
}

fn map_ureq_error(error: ureq::Error) -> AttemptError {
    match error {
        ureq::Error::Status(status, response) => {
            let retry_after = response
                .header("retry-after")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.into_string().unwrap_or_default();
            AttemptError {
                error: ProviderError::from_status(status, &body),
                retry_after: if status == 429 { retry_after } else { None },
            }
        }
        ureq::Error::Transport(transport) => {
            AttemptError::from(ProviderError::transport(transport.to_string()))
        }
    }
}

fn multipart_body(boundary: &str, file_name: &str, file_bytes: &[u8], purpose: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(file_bytes.len() + 512);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"purpose\"\r\n\r\n");
    body.extend_from_slice(purpose.as_bytes());
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(file_bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}
