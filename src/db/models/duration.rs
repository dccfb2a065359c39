use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detection::{AgentState, DetectionMethod};

use super::StateSeconds;

/// Time spent in one confirmed state, written when that state is left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationRecord {
    pub id: Option<i64>,
    pub session_id: String,
    pub state: AgentState,
    pub seconds: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub confidence: Option<f64>,
    pub method: Option<DetectionMethod>,
}

/// Summed seconds per state over a time range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTotals {
    pub seconds: StateSeconds,
    pub record_count: u64,
}
