//! Telemetry events: one row per detection, transition, failure or note.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detection::{AgentState, DetectionMethod, MatchRect};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IdleDetection,
    ActiveDetection,
    CommandExecution,
    DetectionFailure,
    StateChange,
    Error,
    Info,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::IdleDetection => "idle_detection",
            EventKind::ActiveDetection => "active_detection",
            EventKind::CommandExecution => "command_execution",
            EventKind::DetectionFailure => "detection_failure",
            EventKind::StateChange => "state_change",
            EventKind::Error => "error",
            EventKind::Info => "info",
        }
    }

    /// Event recorded when `state` is confirmed; `Unknown` has none.
    pub fn for_detection(state: AgentState) -> Option<Self> {
        match state {
            AgentState::Idle => Some(EventKind::IdleDetection),
            AgentState::Active => Some(EventKind::ActiveDetection),
            AgentState::RunCommand => Some(EventKind::CommandExecution),
            AgentState::Unknown => None,
        }
    }

    pub fn is_detection(&self) -> bool {
        matches!(
            self,
            EventKind::IdleDetection | EventKind::ActiveDetection | EventKind::CommandExecution
        )
    }
}

impl FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "idle_detection" => Ok(EventKind::IdleDetection),
            "active_detection" => Ok(EventKind::ActiveDetection),
            "command_execution" => Ok(EventKind::CommandExecution),
            "detection_failure" => Ok(EventKind::DetectionFailure),
            "state_change" => Ok(EventKind::StateChange),
            "error" => Ok(EventKind::Error),
            "info" => Ok(EventKind::Info),
            other => Err(anyhow!("unknown event kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub message: Option<String>,
    pub confidence: Option<f64>,
    pub state: Option<AgentState>,
    pub detection_method: Option<DetectionMethod>,
    pub rect: Option<MatchRect>,
    pub session_id: Option<String>,
    pub duration_secs: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}

impl TelemetryEvent {
    pub fn new(kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: None,
            timestamp,
            kind,
            message: None,
            confidence: None,
            state: None,
            detection_method: None,
            rect: None,
            session_id: None,
            duration_secs: None,
            metadata: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub kind: Option<EventKind>,
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub counts: BTreeMap<EventKind, u64>,
    pub average_confidence: Option<f64>,
    pub first_event: Option<DateTime<Utc>>,
    pub last_event: Option<DateTime<Utc>>,
}

impl EventStats {
    pub fn count(&self, kind: EventKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn detections(&self) -> u64 {
        self.counts
            .iter()
            .filter(|(kind, _)| kind.is_detection())
            .map(|(_, count)| count)
            .sum()
    }
}
