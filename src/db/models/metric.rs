use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetric {
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub cycle_ms: f64,
    pub capture_ms: f64,
    pub detect_ms: f64,
    pub memory_mb: f64,
    pub cpu_percent: f32,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
}
