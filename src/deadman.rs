//! Deadman switch.
//!
//! A foreground process records heartbeats in the session. When no heartbeat
//! arrives within the configured timeout the rental is presumed abandoned and
//! [`DeadmanMonitor::enforce`] terminates it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle, spawn_blocking};
use tokio_util::sync::CancellationToken;

use crate::alert::{AlertDispatcher, AlertEvent};
use crate::provider::{InstanceTerminator, ProviderError};
use crate::session::{Deadman, Instance, SessionError, SessionStore};
use crate::ticker::ticker;

const SECONDS_PER_HOUR: u64 = 3600;

/// Errors raised while enforcing the deadman switch.
#[derive(Debug, Error)]
pub enum DeadmanError {
    /// Reading or clearing the session failed.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The termination collaborator failed; the session is kept so the next
    /// check retries.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// A blocking session read or write panicked or was aborted.
    #[error("session task failed: {0}")]
    Task(#[from] JoinError),
}

/// Time left before `deadman` expires at `now`, clamped at zero. A heartbeat
/// in the future counts as "just now".
#[must_use]
pub fn remaining(deadman: &Deadman, now: DateTime<Utc>) -> Duration {
    let timeout = timeout_of(deadman);
    let elapsed = now
        .signed_duration_since(deadman.last_heartbeat)
        .to_std()
        .unwrap_or(Duration::ZERO);
    timeout.saturating_sub(elapsed)
}

fn timeout_of(deadman: &Deadman) -> Duration {
    Duration::from_secs(u64::from(deadman.timeout_hours).saturating_mul(SECONDS_PER_HOUR))
}

/// Snapshot of the deadman switch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeadmanStatus {
    /// Instance guarded by the switch.
    pub instance_id: String,
    /// Configured timeout in hours.
    pub timeout_hours: u32,
    /// Configured timeout.
    pub timeout: Duration,
    /// Time left before expiry.
    pub remaining: Duration,
    /// Whether the timeout has elapsed.
    pub expired: bool,
    /// Last recorded heartbeat.
    pub last_heartbeat: DateTime<Utc>,
}

/// Result of [`DeadmanMonitor::enforce`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Enforcement {
    /// The switch has not expired; nothing was done.
    Alive(DeadmanStatus),
    /// The instance was terminated and the session cleared.
    Terminated(DeadmanStatus),
}

/// Reads and enforces the deadman switch recorded in a [`SessionStore`].
#[derive(Clone, Debug)]
pub struct DeadmanMonitor {
    store: SessionStore,
}

impl DeadmanMonitor {
    /// Creates a monitor over `store`.
    #[must_use]
    pub const fn new(store: SessionStore) -> Self {
        Self { store }
    }

    /// Time left before expiry.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoActiveInstance`] when the session, instance,
    /// or deadman record is absent.
    pub fn remaining(&self, now: DateTime<Utc>) -> Result<Duration, SessionError> {
        Ok(self.check(now)?.remaining)
    }

    /// Whether the switch has expired.
    ///
    /// # Errors
    ///
    /// See [`DeadmanMonitor::remaining`].
    pub fn is_expired(&self, now: DateTime<Utc>) -> Result<bool, SessionError> {
        Ok(self.check(now)?.expired)
    }

    /// Full snapshot of the switch.
    ///
    /// # Errors
    ///
    /// See [`DeadmanMonitor::remaining`].
    pub fn check(&self, now: DateTime<Utc>) -> Result<DeadmanStatus, SessionError> {
        self.snapshot(now).map(|(_, status)| status)
    }

    /// Terminates the instance when the switch has expired, then alerts and
    /// clears the session. Session reads and writes run on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns [`DeadmanError::Provider`] when termination fails (the
    /// session is left in place) or [`DeadmanError::Session`] on store
    /// failures.
    pub async fn enforce(
        &self,
        terminator: &dyn InstanceTerminator,
        alerts: &AlertDispatcher,
        now: DateTime<Utc>,
    ) -> Result<Enforcement, DeadmanError> {
        let reader = self.clone();
        let (instance, status) = spawn_blocking(move || reader.snapshot(now)).await??;
        if !status.expired {
            return Ok(Enforcement::Alive(status));
        }

        tracing::error!(
            instance_id = %instance.id,
            provider = %instance.provider,
            last_heartbeat = %status.last_heartbeat,
            "deadman switch expired; terminating instance"
        );
        terminator.terminate(&instance.provider, &instance.id).await?;
        alerts.dispatch(&AlertEvent::DeadmanExpired {
            instance_id: instance.id.clone(),
            timeout_hours: status.timeout_hours,
        });
        let store = self.store.clone();
        spawn_blocking(move || store.clear()).await??;
        Ok(Enforcement::Terminated(status))
    }

    fn snapshot(&self, now: DateTime<Utc>) -> Result<(Instance, DeadmanStatus), SessionError> {
        let state = self.store.load()?.ok_or_else(|| {
            SessionError::NoActiveInstance(String::from("no session has been recorded"))
        })?;
        let instance = state
            .instance
            .ok_or_else(|| SessionError::NoActiveInstance(String::from("session has no instance")))?;
        let deadman = state.deadman.ok_or_else(|| {
            SessionError::NoActiveInstance(String::from("session has no deadman record"))
        })?;

        let left = remaining(&deadman, now);
        let status = DeadmanStatus {
            instance_id: instance.id.clone(),
            timeout_hours: deadman.timeout_hours,
            timeout: timeout_of(&deadman),
            remaining: left,
            expired: left.is_zero(),
            last_heartbeat: deadman.last_heartbeat,
        };
        Ok((instance, status))
    }
}

/// Background task that records a heartbeat on every interval.
#[derive(Debug)]
pub struct HeartbeatTask {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatTask {
    /// Starts recording heartbeats in `store` every `interval`. The first
    /// heartbeat is recorded immediately and intervals below
    /// [`MIN_TICK_INTERVAL`] are raised to it. Must be called inside a tokio
    /// runtime.
    ///
    /// [`MIN_TICK_INTERVAL`]: crate::MIN_TICK_INTERVAL
    #[must_use]
    pub fn start(store: SessionStore, interval: Duration, cancel: &CancellationToken) -> Self {
        let token = cancel.child_token();
        let loop_token = token.clone();
        let task = tokio::spawn(async move {
            let mut ticks = ticker(interval);
            loop {
                tokio::select! {
                    biased;
                    () = loop_token.cancelled() => break,
                    _ = ticks.tick() => record_heartbeat(&store).await,
                }
            }
        });
        Self {
            cancel: token,
            task: Some(task),
        }
    }

    /// Stops the task and waits for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "heartbeat task failed");
            }
        }
    }
}

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Store writes take a file lock and fsync, so they run on the blocking pool.
async fn record_heartbeat(store: &SessionStore) {
    let store = store.clone();
    match spawn_blocking(move || store.update_heartbeat()).await {
        Ok(Ok(_)) => tracing::debug!("heartbeat recorded"),
        Ok(Err(err)) => tracing::warn!(error = %err, "heartbeat not recorded"),
        Err(err) => tracing::error!(error = %err, "heartbeat write task failed"),
    }
}
