//! Budget threshold tracking.
//!
//! Spend is compared against the configured budget at two tiers. Each tier
//! fires once until [`BudgetTracker::reset`] is called.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::{JoinHandle, spawn_blocking};
use tokio_util::sync::CancellationToken;

use crate::alert::{AlertDispatcher, AlertEvent};
use crate::session::SessionStore;
use crate::ticker::ticker;

const WARNING_RATIO: f64 = 0.8;
const EXHAUSTED_RATIO: f64 = 1.0;

/// Budget tier reached by the accumulated spend.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetThreshold {
    /// Below 80 % or budgeting disabled.
    None,
    /// At least 80 % and below 100 %.
    Eighty,
    /// At least 100 %.
    Hundred,
}

impl fmt::Display for BudgetThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::None => "no threshold",
            Self::Eighty => "80%",
            Self::Hundred => "100%",
        };
        f.write_str(label)
    }
}

/// Classifies `accumulated` against `budget`. A non-positive budget disables
/// tracking.
#[must_use]
#[expect(
    clippy::float_arithmetic,
    reason = "spend ratios are inherently fractional"
)]
pub fn threshold(accumulated: f64, budget: f64) -> BudgetThreshold {
    if budget <= 0.0 {
        return BudgetThreshold::None;
    }
    let ratio = accumulated / budget;
    if ratio >= EXHAUSTED_RATIO {
        BudgetThreshold::Hundred
    } else if ratio >= WARNING_RATIO {
        BudgetThreshold::Eighty
    } else {
        BudgetThreshold::None
    }
}

/// A tier crossing that should be reported.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BudgetAlert {
    /// Tier that was crossed.
    pub threshold: BudgetThreshold,
    /// Spend at the time of the check.
    pub accumulated: f64,
    /// Configured budget.
    pub budget: f64,
}

impl From<BudgetAlert> for AlertEvent {
    fn from(alert: BudgetAlert) -> Self {
        Self::Budget {
            threshold: alert.threshold,
            accumulated: alert.accumulated,
            budget: alert.budget,
        }
    }
}

/// Remembers which tiers already fired.
#[derive(Clone, Debug, PartialEq)]
pub struct BudgetTracker {
    budget: f64,
    alerted_80: bool,
    alerted_100: bool,
}

impl BudgetTracker {
    /// Creates a tracker for `budget`.
    #[must_use]
    pub const fn new(budget: f64) -> Self {
        Self {
            budget,
            alerted_80: false,
            alerted_100: false,
        }
    }

    /// Configured budget.
    #[must_use]
    pub const fn budget(&self) -> f64 {
        self.budget
    }

    /// Returns an alert the first time each tier is reached. Reaching 100 %
    /// also marks the 80 % tier as fired.
    pub fn check_and_alert(&mut self, accumulated: f64) -> Option<BudgetAlert> {
        let tier = threshold(accumulated, self.budget);
        let fire = match tier {
            BudgetThreshold::Hundred if !self.alerted_100 => {
                self.alerted_100 = true;
                self.alerted_80 = true;
                true
            }
            BudgetThreshold::Eighty if !self.alerted_80 => {
                self.alerted_80 = true;
                true
            }
            BudgetThreshold::None | BudgetThreshold::Eighty | BudgetThreshold::Hundred => false,
        };
        fire.then_some(BudgetAlert {
            threshold: tier,
            accumulated,
            budget: self.budget,
        })
    }

    /// Re-arms both tiers.
    pub const fn reset(&mut self) {
        self.alerted_80 = false;
        self.alerted_100 = false;
    }
}

/// Background task feeding the stored spend into a [`BudgetTracker`].
#[derive(Debug)]
pub struct BudgetSampler {
    cancel: CancellationToken,
    task: Option<JoinHandle<BudgetTracker>>,
}

impl BudgetSampler {
    /// Samples `store` every `interval` until stopped, dispatching crossings
    /// through `alerts`. Intervals below [`MIN_TICK_INTERVAL`] are raised to
    /// it. Must be called inside a tokio runtime.
    ///
    /// [`MIN_TICK_INTERVAL`]: crate::MIN_TICK_INTERVAL
    #[must_use]
    pub fn start(
        store: SessionStore,
        tracker: BudgetTracker,
        alerts: Arc<AlertDispatcher>,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut budget_tracker = tracker;
            let mut ticks = ticker(interval);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticks.tick() => sample(&store, &mut budget_tracker, &alerts).await,
                }
            }
            budget_tracker
        });
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stops sampling and returns the tracker with its fired tiers.
    pub async fn stop(mut self) -> Option<BudgetTracker> {
        self.cancel.cancel();
        let task = self.task.take()?;
        match task.await {
            Ok(tracker) => Some(tracker),
            Err(err) => {
                tracing::error!(error = %err, "budget sampler task failed");
                None
            }
        }
    }
}

impl Drop for BudgetSampler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The session read takes the file lock, so it runs on the blocking pool.
async fn sample(store: &SessionStore, tracker: &mut BudgetTracker, alerts: &AlertDispatcher) {
    let reader = store.clone();
    let accumulated = match spawn_blocking(move || reader.load()).await {
        Ok(Ok(Some(state))) => state.cost.map(|cost| cost.accumulated),
        Ok(Ok(None)) => None,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "budget sample skipped");
            None
        }
        Err(err) => {
            tracing::error!(error = %err, "budget sample task failed");
            None
        }
    };
    if let Some(alert) = accumulated.and_then(|spend| tracker.check_and_alert(spend)) {
        alerts.dispatch(&alert.into());
    }
}
