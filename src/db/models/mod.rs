pub mod duration;
pub mod event;
pub mod metric;
pub mod session;

pub use duration::{DurationRecord, StateTotals};
pub use event::{EventFilter, EventKind, EventStats, TelemetryEvent};
pub use metric::PerformanceMetric;
pub use session::{MonitoringSession, SessionStatus, StateSeconds};
