use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detection::AgentState;

/// Timing of one monitoring cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub timestamp: DateTime<Utc>,
    pub capture_ms: u64,
    pub detect_ms: u64,
    pub total_ms: u64,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub raw_state: AgentState,
    pub failed: bool,
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub recent_cycles: Vec<CycleMetrics>,
    pub cycle_count: u64,
    pub failure_count: u64,
    pub average_cycle_ms: Option<f64>,
}
