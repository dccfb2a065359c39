//! Turns confirmed-state intervals into duration records and session totals.

pub mod queries;
pub mod report;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{error, info};

use crate::db::{Database, DurationRecord, StateSeconds};
use crate::detection::{AgentState, Detection, DetectionMethod};
use crate::monitor::StateTransition;

pub use queries::TimeRange;
pub use report::DailyReport;

/// Owns the active session's open interval. Records are written at each
/// accepted transition and once more when the session closes, so the records
/// of a session always add up to its wall-clock length.
pub struct DurationAccountant {
    db: Database,
    session_id: String,
    open_state: AgentState,
    open_since: DateTime<Utc>,
    open_confidence: Option<f64>,
    open_method: Option<DetectionMethod>,
    totals: StateSeconds,
}

impl DurationAccountant {
    /// Creates the session row and starts accounting in `Unknown`.
    pub async fn begin(
        db: Database,
        session_id: String,
        started_at: DateTime<Utc>,
        config_snapshot: Option<String>,
    ) -> Result<Self> {
        db.create_session(&session_id, started_at, config_snapshot)
            .await?;
        info!("Monitoring session {session_id} started");

        Ok(Self {
            db,
            session_id,
            open_state: AgentState::Unknown,
            open_since: started_at,
            open_confidence: None,
            open_method: None,
            totals: StateSeconds::default(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn totals(&self) -> StateSeconds {
        self.totals
    }

    /// Seconds per state including the still-open interval up to `now`.
    pub fn totals_at(&self, now: DateTime<Utc>) -> StateSeconds {
        let mut totals = self.totals;
        totals.add(self.open_state, seconds_between(self.open_since, now));
        totals
    }

    /// Closes the interval of the state being left. `entered_by` is the
    /// detection that confirmed the new state; its confidence and method are
    /// kept for the record written when that state is left in turn.
    pub async fn on_transition(&mut self, transition: &StateTransition, entered_by: Option<&Detection>) {
        self.close_interval(transition.occurred_at).await;
        self.open_state = transition.to;
        self.open_since = transition.occurred_at;
        self.open_confidence = entered_by.and_then(|d| d.confidence);
        self.open_method = entered_by.map(|d| d.method);
    }

    /// Writes the final open interval and marks the session completed.
    pub async fn close(mut self, ended_at: DateTime<Utc>) -> Result<StateSeconds> {
        self.close_interval(ended_at).await;
        self.db
            .end_session(&self.session_id, ended_at, self.totals)
            .await?;
        info!(
            "Monitoring session {} closed after {:.1}s",
            self.session_id,
            self.totals.total()
        );
        Ok(self.totals)
    }

    async fn close_interval(&mut self, ended_at: DateTime<Utc>) {
        let seconds = seconds_between(self.open_since, ended_at);
        self.totals.add(self.open_state, seconds);

        let record = DurationRecord {
            id: None,
            session_id: self.session_id.clone(),
            state: self.open_state,
            seconds,
            started_at: self.open_since,
            ended_at,
            confidence: self.open_confidence,
            method: self.open_method,
        };
        if let Err(err) = self.db.insert_duration_record(&record).await {
            error!(
                "Failed to persist {} duration for session {}: {err:#}",
                record.state, self.session_id
            );
        }
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let micros = (end - start).num_microseconds().unwrap_or(i64::MAX);
    micros.max(0) as f64 / 1_000_000.0
}
