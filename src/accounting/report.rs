use anyhow::Result;
use chrono::{NaiveDate, Timelike};
use serde::{Deserialize, Serialize};

use crate::db::{Database, EventFilter, EventKind, StateSeconds};

use super::queries::TimeRange;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyReport {
    pub date: NaiveDate,
    pub seconds: StateSeconds,
    pub idle_detections: u64,
    pub active_detections: u64,
    pub command_detections: u64,
    pub detection_failures: u64,
    /// Successful detections over all attempts, in percent.
    pub accuracy_percent: f64,
    pub average_confidence: Option<f64>,
    /// Event counts per UTC hour.
    pub hourly_events: [u64; 24],
    pub peak_hour: Option<u32>,
}

pub async fn daily_report(db: &Database, date: NaiveDate) -> Result<DailyReport> {
    let range = TimeRange::day(date);
    let stats = db.get_event_stats(range.start, range.end).await?;
    let totals = db.sum_durations_by_state(range.start, range.end).await?;
    let events = db
        .get_events(EventFilter {
            start: Some(range.start),
            end: Some(range.end),
            ..EventFilter::default()
        })
        .await?;

    let mut hourly_events = [0u64; 24];
    for event in &events {
        hourly_events[event.timestamp.hour() as usize] += 1;
    }
    // earliest hour wins ties
    let peak_hour = hourly_events
        .iter()
        .enumerate()
        .filter(|(_, count)| **count > 0)
        .fold(None::<(usize, u64)>, |best, (hour, count)| match best {
            Some((_, top)) if top >= *count => best,
            _ => Some((hour, *count)),
        })
        .map(|(hour, _)| hour as u32);

    let detections = stats.detections();
    let failures = stats.count(EventKind::DetectionFailure);
    let attempts = detections + failures;
    let accuracy_percent = if attempts > 0 {
        detections as f64 / attempts as f64 * 100.0
    } else {
        0.0
    };

    Ok(DailyReport {
        date,
        seconds: totals.seconds,
        idle_detections: stats.count(EventKind::IdleDetection),
        active_detections: stats.count(EventKind::ActiveDetection),
        command_detections: stats.count(EventKind::CommandExecution),
        detection_failures: failures,
        accuracy_percent,
        average_confidence: stats.average_confidence,
        hourly_events,
        peak_hour,
    })
}
