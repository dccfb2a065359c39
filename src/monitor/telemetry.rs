use chrono::{DateTime, Utc};
use log::{error, warn};
use serde_json::json;

use crate::db::{Database, EventKind, TelemetryEvent};
use crate::detection::Detection;

use super::cycle::CycleFailure;
use super::effects::TELEMETRY_TIMEOUT;
use super::state_machine::StateTransition;

/// Best-effort event writer. Failures and slow writes are logged and dropped.
#[derive(Clone)]
pub struct Telemetry {
    db: Database,
}

impl Telemetry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// One detection event for the destination state plus a `state_change`.
    pub async fn record_transition(
        &self,
        session_id: &str,
        transition: &StateTransition,
        detection: Option<&Detection>,
    ) {
        if let Some(kind) = EventKind::for_detection(transition.to) {
            let mut event = TelemetryEvent::new(kind, transition.occurred_at)
                .with_session(Some(session_id))
                .with_message(format!("{} detected", transition.to));
            event.state = Some(transition.to);
            if let Some(detection) = detection {
                event.confidence = detection.confidence;
                event.detection_method = Some(detection.method);
                event.rect = detection.rect;
                event.metadata = Some(json!({
                    "scores": detection
                        .scores
                        .values()
                        .map(|m| (m.state.as_str(), m.confidence))
                        .collect::<std::collections::BTreeMap<_, _>>(),
                    "reference": detection
                        .scores
                        .get(&transition.to)
                        .and_then(|m| m.reference_id.clone()),
                }));
            }
            self.write(event).await;
        }

        let mut change = TelemetryEvent::new(EventKind::StateChange, transition.occurred_at)
            .with_session(Some(session_id))
            .with_message(format!("{} -> {}", transition.from, transition.to));
        change.state = Some(transition.to);
        change.metadata = Some(json!({ "from": transition.from, "to": transition.to }));
        self.write(change).await;
    }

    pub async fn record_failure(&self, session_id: &str, failure: &CycleFailure, at: DateTime<Utc>) {
        let event = TelemetryEvent::new(EventKind::DetectionFailure, at)
            .with_session(Some(session_id))
            .with_message(failure.to_string());
        self.write(event).await;
    }

    pub async fn record_info(&self, session_id: Option<&str>, message: &str, at: DateTime<Utc>) {
        let event = TelemetryEvent::new(EventKind::Info, at)
            .with_session(session_id)
            .with_message(message);
        self.write(event).await;
    }

    async fn write(&self, event: TelemetryEvent) {
        let kind = event.kind;
        match tokio::time::timeout(TELEMETRY_TIMEOUT, self.db.log_event(&event)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!(
                "Failed to record {} event for session {:?}: {err:#}",
                kind.as_str(),
                event.session_id
            ),
            Err(_) => warn!(
                "Telemetry write for {} timed out after {:?}",
                kind.as_str(),
                TELEMETRY_TIMEOUT
            ),
        }
    }
}
