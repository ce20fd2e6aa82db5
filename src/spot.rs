//! Spot interruption detection.
//!
//! The remote bootstrap serves `GET /interrupt-status`. The monitor polls it
//! and latches an interruption the first time any of three signals fires:
//! the provider reports one, the endpoint stops answering for a configured
//! number of consecutive polls, or an operator forces it. The latch is
//! one-way for the lifetime of the monitor.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alert::AlertEvent;
use crate::ticker::ticker;

/// Port served by the remote bootstrap.
pub const DEFAULT_SPOT_PORT: u16 = 9876;

/// Path of the status endpoint.
pub const INTERRUPT_STATUS_PATH: &str = "/interrupt-status";

/// Body returned by the status endpoint.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct InterruptStatus {
    /// Whether the provider announced reclamation.
    pub interrupted: bool,
    /// Provider supplied reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// Announced termination time.
    #[serde(default)]
    pub termination_time: Option<DateTime<Utc>>,
    /// Free-form provider message.
    #[serde(default)]
    pub message: Option<String>,
}

/// Why an interruption latched.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    /// The provider reported reclamation with the given reason.
    Provider(String),
    /// The status endpoint stopped answering.
    ConnectionLost,
    /// An operator forced the interruption.
    Manual(String),
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provider(detail) => write!(f, "provider: {detail}"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::Manual(detail) => write!(f, "manual: {detail}"),
        }
    }
}

/// A latched interruption.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Interruption {
    /// Signal that latched.
    pub reason: InterruptReason,
    /// Announced termination time, if any.
    pub termination_time: Option<DateTime<Utc>>,
    /// Provider message, if any.
    pub message: Option<String>,
    /// When the monitor latched.
    pub detected_at: DateTime<Utc>,
}

impl From<&Interruption> for AlertEvent {
    fn from(interruption: &Interruption) -> Self {
        Self::SpotInterrupted {
            reason: interruption.reason.clone(),
            termination_time: interruption.termination_time,
            message: interruption.message.clone(),
        }
    }
}

/// Errors raised while polling the status endpoint.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SpotError {
    /// The request failed or timed out.
    #[error("interrupt status request failed: {0}")]
    Request(String),
    /// The endpoint answered with a non-success status.
    #[error("interrupt status endpoint returned HTTP {0}")]
    Status(u16),
    /// The body was not valid JSON.
    #[error("interrupt status body is invalid: {0}")]
    Decode(String),
}

/// Boxed future returned by [`InterruptSource::poll`].
pub type SourceFuture<'a> = Pin<Box<dyn Future<Output = Result<InterruptStatus, SpotError>> + Send + 'a>>;

/// Where interruption status comes from.
pub trait InterruptSource: Send + Sync {
    /// Fetches the current status once.
    fn poll(&self) -> SourceFuture<'_>;
}

/// Polls the remote status endpoint over HTTP.
#[derive(Clone, Debug)]
pub struct HttpInterruptSource {
    url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpInterruptSource {
    /// Targets `http://<host>:<port>/interrupt-status` with a per-request
    /// timeout.
    #[must_use]
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            url: format!("http://{host}:{port}{INTERRUPT_STATUS_PATH}"),
            timeout,
            http: reqwest::Client::new(),
        }
    }

    /// Endpoint being polled.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl InterruptSource for HttpInterruptSource {
    fn poll(&self) -> SourceFuture<'_> {
        Box::pin(async move {
            let response = self
                .http
                .get(&self.url)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|err| SpotError::Request(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(SpotError::Status(status.as_u16()));
            }
            response
                .json::<InterruptStatus>()
                .await
                .map_err(|err| SpotError::Decode(err.to_string()))
        })
    }
}

/// Polling cadence and failure heuristic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpotMonitorConfig {
    /// Delay between polls, raised to [`MIN_TICK_INTERVAL`] when smaller.
    ///
    /// [`MIN_TICK_INTERVAL`]: crate::MIN_TICK_INTERVAL
    pub interval: Duration,
    /// Consecutive unanswered polls that latch
    /// [`InterruptReason::ConnectionLost`]. HTTP errors and bad bodies reset
    /// the count because the instance still answered.
    pub failure_threshold: u32,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for SpotMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            failure_threshold: 3,
            request_timeout: Duration::from_secs(3),
        }
    }
}

type Callback = Box<dyn FnOnce(Interruption) + Send>;

#[derive(Default)]
struct MonitorState {
    interruption: Option<Interruption>,
    consecutive_failures: u32,
    callback: Option<Callback>,
}

struct Shared {
    source: Box<dyn InterruptSource>,
    config: SpotMonitorConfig,
    state: Mutex<MonitorState>,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn poll_once(&self) -> Option<Interruption> {
        let outcome = self.source.poll().await;
        let latched = {
            let mut state = self.state();
            if state.interruption.is_some() {
                return state.interruption.clone();
            }
            match outcome {
                Ok(status) => {
                    state.consecutive_failures = 0;
                    status.interrupted.then(|| Interruption {
                        reason: InterruptReason::Provider(
                            status.reason.unwrap_or_else(|| String::from("unspecified")),
                        ),
                        termination_time: status.termination_time,
                        message: status.message,
                        detected_at: Utc::now(),
                    })
                }
                Err(err @ (SpotError::Status(_) | SpotError::Decode(_))) => {
                    // The instance answered, so it has not been reclaimed.
                    state.consecutive_failures = 0;
                    tracing::warn!(error = %err, "interrupt status response unusable");
                    None
                }
                Err(err @ SpotError::Request(_)) => {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    tracing::warn!(
                        failures = state.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        error = %err,
                        "interrupt status poll failed"
                    );
                    (state.consecutive_failures >= self.config.failure_threshold).then(|| {
                        Interruption {
                            reason: InterruptReason::ConnectionLost,
                            termination_time: None,
                            message: Some(err.to_string()),
                            detected_at: Utc::now(),
                        }
                    })
                }
            }
        };
        latched.and_then(|interruption| self.latch(interruption))
    }

    /// Records `interruption` unless one is already latched. Returns the
    /// interruption in effect.
    fn latch(&self, interruption: Interruption) -> Option<Interruption> {
        let callback = {
            let mut state = self.state();
            if let Some(existing) = &state.interruption {
                return Some(existing.clone());
            }
            tracing::warn!(reason = %interruption.reason, "spot interruption detected");
            state.interruption = Some(interruption.clone());
            state.callback.take()
        };
        if let Some(notify) = callback {
            fire(notify, interruption.clone());
        }
        Some(interruption)
    }
}

fn fire(callback: Callback, interruption: Interruption) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { callback(interruption) });
        }
        Err(_) => callback(interruption),
    }
}

/// Watches for spot reclamation.
pub struct SpotInterruptMonitor {
    shared: Arc<Shared>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl fmt::Debug for SpotInterruptMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpotInterruptMonitor")
            .field("config", &self.shared.config)
            .field("interrupted", &self.is_interrupted())
            .finish_non_exhaustive()
    }
}

impl SpotInterruptMonitor {
    /// Creates a stopped monitor.
    #[must_use]
    pub fn new(source: impl InterruptSource + 'static, config: SpotMonitorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                source: Box::new(source),
                config,
                state: Mutex::new(MonitorState::default()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Creates a monitor polling `host` over HTTP.
    #[must_use]
    pub fn http(host: &str, port: u16, config: SpotMonitorConfig) -> Self {
        Self::new(HttpInterruptSource::new(host, port, config.request_timeout), config)
    }

    /// Registers the callback fired once, on a spawned task, when the first
    /// interruption latches. Registering after a latch fires immediately.
    pub fn on_interrupt(&self, callback: impl FnOnce(Interruption) + Send + 'static) {
        let boxed: Callback = Box::new(callback);
        let existing = {
            let mut state = self.shared.state();
            let Some(existing) = state.interruption.clone() else {
                state.callback = Some(boxed);
                return;
            };
            existing
        };
        fire(boxed, existing);
    }

    /// Polls once and applies the result. Returns the interruption in
    /// effect, if any.
    pub async fn poll_once(&self) -> Option<Interruption> {
        self.shared.poll_once().await
    }

    /// Latches a manual interruption. Has no effect once latched.
    pub fn force_interrupt(&self, reason: impl Into<String>) -> Option<Interruption> {
        self.shared.latch(Interruption {
            reason: InterruptReason::Manual(reason.into()),
            termination_time: None,
            message: None,
            detected_at: Utc::now(),
        })
    }

    /// Whether an interruption has latched.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.shared.state().interruption.is_some()
    }

    /// The latched interruption, if any.
    #[must_use]
    pub fn last_interruption(&self) -> Option<Interruption> {
        self.shared.state().interruption.clone()
    }

    /// Current count of consecutive failed polls.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.shared.state().consecutive_failures
    }

    /// Spawns the poll loop. The loop ends when `cancel` fires, [`stop`] is
    /// called, or an interruption latches. Starting twice is a no-op.
    ///
    /// [`stop`]: Self::stop
    pub fn start(&self, cancel: &CancellationToken) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            tracing::debug!("spot monitor already running");
            return;
        }
        let token = cancel.child_token();
        let loop_token = token.clone();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticks = ticker(shared.config.interval);
            loop {
                tokio::select! {
                    biased;
                    () = loop_token.cancelled() => break,
                    _ = ticks.tick() => {
                        if shared.poll_once().await.is_some() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("spot monitor loop exited");
        });
        *task = Some((token, handle));
    }

    /// Stops the poll loop and waits for it to exit.
    pub async fn stop(&self) {
        let running = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some((token, handle)) = running else {
            return;
        };
        token.cancel();
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "spot monitor task failed");
        }
    }
}

impl Drop for SpotInterruptMonitor {
    fn drop(&mut self) {
        if let Some((token, _)) = self.task.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            token.cancel();
        }
    }
}
