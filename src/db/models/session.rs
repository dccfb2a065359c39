//! Monitoring session records.
//!
//! A session spans one continuous monitoring run and carries the per-state
//! seconds accumulated by the duration accountant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detection::AgentState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Running,
    Completed,
    /// Left running by a crash and closed at the next startup.
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "Running",
            SessionStatus::Completed => "Completed",
            SessionStatus::Interrupted => "Interrupted",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSeconds {
    pub idle: f64,
    pub active: f64,
    pub run_command: f64,
    pub unknown: f64,
}

impl StateSeconds {
    pub fn get(&self, state: AgentState) -> f64 {
        match state {
            AgentState::Idle => self.idle,
            AgentState::Active => self.active,
            AgentState::RunCommand => self.run_command,
            AgentState::Unknown => self.unknown,
        }
    }

    pub fn add(&mut self, state: AgentState, seconds: f64) {
        let slot = match state {
            AgentState::Idle => &mut self.idle,
            AgentState::Active => &mut self.active,
            AgentState::RunCommand => &mut self.run_command,
            AgentState::Unknown => &mut self.unknown,
        };
        *slot += seconds;
    }

    pub fn total(&self) -> f64 {
        self.idle + self.active + self.run_command + self.unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub seconds: StateSeconds,
    /// Settings in effect when the session started, as JSON.
    pub config_snapshot: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MonitoringSession {
    pub fn start(id: String, started_at: DateTime<Utc>, config_snapshot: Option<String>) -> Self {
        Self {
            id,
            started_at,
            ended_at: None,
            status: SessionStatus::Running,
            seconds: StateSeconds::default(),
            config_snapshot,
            created_at: started_at,
            updated_at: started_at,
        }
    }
}
