use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use log::info;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::db::StateSeconds;
use crate::detection::{AgentState, DetectionMethod, MatchRect};

use super::state_machine::format_wait;

/// Everything a display needs, published as one value per update so readers
/// never see half of a cycle's changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub running: bool,
    pub paused: bool,
    pub muted: bool,
    pub session_id: Option<String>,
    /// State confirmed by the state machine.
    pub confirmed_state: AgentState,
    /// Latest stable classification, `Unknown` included.
    pub displayed_state: AgentState,
    /// Latest single-frame classification.
    pub raw_state: AgentState,
    pub last_confidence: Option<f64>,
    pub last_rect: Option<MatchRect>,
    pub last_method: Option<DetectionMethod>,
    pub scores: BTreeMap<AgentState, f64>,
    pub cycle_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
    pub last_failure: Option<String>,
    pub transition_counts: BTreeMap<AgentState, u64>,
    pub state_entered_at: Option<DateTime<Utc>>,
    pub state_seconds: StateSeconds,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MonitorSnapshot {
    pub fn time_in_state(&self, now: DateTime<Utc>) -> Duration {
        self.state_entered_at
            .map(|at| (now - at).max(Duration::zero()))
            .unwrap_or_else(Duration::zero)
    }

    pub fn status_line(&self, now: DateTime<Utc>) -> String {
        if !self.running {
            return "monitor stopped".to_string();
        }
        let mut line = format!(
            "{} for {} (showing {}, raw {}",
            self.confirmed_state,
            format_wait(self.time_in_state(now)),
            self.displayed_state,
            self.raw_state
        );
        if let Some(confidence) = self.last_confidence {
            line.push_str(&format!(" @ {confidence:.2}"));
        }
        line.push_str(&format!(
            ") cycles={} failures={}",
            self.cycle_count, self.failure_count
        ));
        if self.paused {
            line.push_str(" [paused]");
        }
        if self.muted {
            line.push_str(" [muted]");
        }
        line
    }

    fn headline(&self) -> (bool, bool, AgentState, AgentState, u64) {
        (
            self.running,
            self.paused,
            self.confirmed_state,
            self.displayed_state,
            self.failure_count,
        )
    }
}

/// Reads the published snapshot on its own cadence and logs it. Logs only
/// when the headline changes unless `verbose` is set.
pub async fn status_reporter(
    mut rx: watch::Receiver<MonitorSnapshot>,
    every: StdDuration,
    verbose: bool,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_headline = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = rx.borrow_and_update().clone();
                let headline = snapshot.headline();
                if verbose || last_headline != Some(headline) {
                    info!("status: {}", snapshot.status_line(Utc::now()));
                    last_headline = Some(headline);
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}
