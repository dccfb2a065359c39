//! SQLite persistence for telemetry, sessions, durations and cycle metrics.

mod connection;
mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::Database;
pub use models::{
    DurationRecord, EventFilter, EventKind, EventStats, MonitoringSession, PerformanceMetric,
    SessionStatus, StateSeconds, StateTotals, TelemetryEvent,
};
