//! Alert fan-out for the safety nets.
//!
//! Every alert is logged. When configured, alerts are also pushed to a UI
//! channel and posted as JSON to a webhook. Webhook delivery is best-effort
//! and supervised by a [`TaskTracker`] so shutdown can wait for it.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::task::TaskTracker;

use crate::budget::BudgetThreshold;
use crate::spot::InterruptReason;

/// Upper bound on a single webhook delivery.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Something an operator should know about.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEvent {
    /// Accumulated cost crossed a budget tier.
    Budget {
        /// Tier that was crossed.
        threshold: BudgetThreshold,
        /// Accumulated cost at the time of the check.
        accumulated: f64,
        /// Configured budget.
        budget: f64,
    },
    /// No heartbeat arrived within the deadman timeout.
    DeadmanExpired {
        /// Instance that was terminated.
        instance_id: String,
        /// Configured timeout.
        timeout_hours: u32,
    },
    /// The spot instance is being reclaimed or lost.
    SpotInterrupted {
        /// Why the interruption latched.
        reason: InterruptReason,
        /// Announced termination time, if any.
        termination_time: Option<DateTime<Utc>>,
        /// Provider message, if any.
        message: Option<String>,
    },
}

impl AlertEvent {
    /// Short machine readable kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Budget { .. } => "budget",
            Self::DeadmanExpired { .. } => "deadman_expired",
            Self::SpotInterrupted { .. } => "spot_interrupted",
        }
    }
}

impl fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Budget {
                threshold,
                accumulated,
                budget,
            } => write!(f, "spend {accumulated:.2} reached {threshold} of budget {budget:.2}"),
            Self::DeadmanExpired {
                instance_id,
                timeout_hours,
            } => write!(
                f,
                "no heartbeat for {timeout_hours}h; instance {instance_id} was terminated"
            ),
            Self::SpotInterrupted {
                reason,
                termination_time,
                message,
            } => {
                write!(f, "spot instance interrupted ({reason})")?;
                if let Some(at) = termination_time {
                    write!(f, ", terminating at {}", at.to_rfc3339())?;
                }
                if let Some(text) = message {
                    write!(f, ": {text}")?;
                }
                Ok(())
            }
        }
    }
}

/// Fans alerts out to the log, a UI channel, and a webhook.
#[derive(Debug, Default)]
pub struct AlertDispatcher {
    webhook: Option<String>,
    ui: Option<UnboundedSender<AlertEvent>>,
    http: reqwest::Client,
    tracker: TaskTracker,
}

impl AlertDispatcher {
    /// Creates a dispatcher that only logs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts every alert as JSON to `url`.
    #[must_use]
    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook = Some(url.into());
        self
    }

    /// Forwards every alert to a UI channel.
    #[must_use]
    pub fn with_ui_channel(mut self, sender: UnboundedSender<AlertEvent>) -> Self {
        self.ui = Some(sender);
        self
    }

    /// Delivers `event` to every configured sink. Never blocks on the
    /// webhook.
    pub fn dispatch(&self, event: &AlertEvent) {
        tracing::warn!(kind = event.kind(), "{event}");

        if let Some(sender) = &self.ui {
            if sender.send(event.clone()).is_err() {
                tracing::debug!(kind = event.kind(), "alert UI channel is closed");
            }
        }

        if let Some(url) = &self.webhook {
            let Ok(handle) = Handle::try_current() else {
                tracing::warn!(%url, "no async runtime; webhook alert dropped");
                return;
            };
            let request = self.http.post(url).timeout(WEBHOOK_TIMEOUT).json(event);
            let url_for_log = url.clone();
            let kind = event.kind();
            self.tracker.spawn_on(
                async move {
                    match request.send().await {
                        Ok(response) if response.status().is_success() => {
                            tracing::debug!(url = %url_for_log, kind, "webhook alert delivered");
                        }
                        Ok(response) => {
                            tracing::error!(
                                url = %url_for_log,
                                kind,
                                status = %response.status(),
                                "webhook rejected alert"
                            );
                        }
                        Err(err) => {
                            tracing::error!(url = %url_for_log, kind, error = %err, "webhook delivery failed");
                        }
                    }
                },
                &handle,
            );
        }
    }

    /// Stops accepting deliveries and waits for in-flight webhooks.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
