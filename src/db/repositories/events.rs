use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, types::Value, Row};

use crate::db::{
    connection::Database,
    helpers::{
        format_datetime, parse_datetime, parse_method, parse_optional_datetime, parse_state,
        to_u64,
    },
    models::{EventFilter, EventKind, EventStats, TelemetryEvent},
};
use crate::detection::MatchRect;

fn row_to_event(row: &Row) -> Result<TelemetryEvent> {
    let timestamp: String = row.get("timestamp")?;
    let kind: String = row.get("kind")?;
    let state: Option<String> = row.get("state")?;
    let method: Option<String> = row.get("detection_method")?;
    let metadata: Option<String> = row.get("metadata")?;

    let rect = match (
        row.get::<_, Option<i64>>("match_rect_x")?,
        row.get::<_, Option<i64>>("match_rect_y")?,
        row.get::<_, Option<i64>>("match_rect_width")?,
        row.get::<_, Option<i64>>("match_rect_height")?,
    ) {
        (Some(x), Some(y), Some(width), Some(height)) => Some(MatchRect {
            x: to_u64(x, "match_rect_x")? as u32,
            y: to_u64(y, "match_rect_y")? as u32,
            width: to_u64(width, "match_rect_width")? as u32,
            height: to_u64(height, "match_rect_height")? as u32,
        }),
        _ => None,
    };

    Ok(TelemetryEvent {
        id: row.get("id")?,
        timestamp: parse_datetime(&timestamp, "timestamp")?,
        kind: kind.parse()?,
        message: row.get("message")?,
        confidence: row.get("confidence")?,
        state: state.map(|s| parse_state(&s, "state")).transpose()?,
        detection_method: method.as_deref().map(parse_method).transpose()?,
        rect,
        session_id: row.get("session_id")?,
        duration_secs: row.get("duration_secs")?,
        metadata: metadata
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("failed to parse event metadata")?,
    })
}

impl Database {
    pub async fn log_event(&self, event: &TelemetryEvent) -> Result<i64> {
        let record = event.clone();
        self.execute(move |conn| {
            let metadata = record
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to serialize event metadata")?;

            conn.execute(
                "INSERT INTO telemetry_events (
                    timestamp, kind, message, confidence, state, detection_method,
                    match_rect_x, match_rect_y, match_rect_width, match_rect_height,
                    session_id, duration_secs, metadata
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    format_datetime(record.timestamp),
                    record.kind.as_str(),
                    record.message,
                    record.confidence,
                    record.state.map(|s| s.as_str()),
                    record.detection_method.map(|m| m.as_str()),
                    record.rect.map(|r| r.x),
                    record.rect.map(|r| r.y),
                    record.rect.map(|r| r.width),
                    record.rect.map(|r| r.height),
                    record.session_id,
                    record.duration_secs,
                    metadata,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Events matching `filter`, newest first.
    pub async fn get_events(&self, filter: EventFilter) -> Result<Vec<TelemetryEvent>> {
        self.execute(move |conn| {
            let mut clauses = Vec::new();
            let mut values: Vec<Value> = Vec::new();

            if let Some(start) = filter.start {
                clauses.push("timestamp >= ?");
                values.push(Value::Text(format_datetime(start)));
            }
            if let Some(end) = filter.end {
                clauses.push("timestamp < ?");
                values.push(Value::Text(format_datetime(end)));
            }
            if let Some(kind) = filter.kind {
                clauses.push("kind = ?");
                values.push(Value::Text(kind.as_str().to_string()));
            }
            if let Some(session_id) = filter.session_id {
                clauses.push("session_id = ?");
                values.push(Value::Text(session_id));
            }

            let mut sql = String::from(
                "SELECT id, timestamp, kind, message, confidence, state, detection_method,
                        match_rect_x, match_rect_y, match_rect_width, match_rect_height,
                        session_id, duration_secs, metadata
                 FROM telemetry_events",
            );
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY timestamp DESC, id DESC");
            if let Some(limit) = filter.limit {
                sql.push_str(" LIMIT ?");
                values.push(Value::Integer(limit as i64));
            }

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(values))?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
            Ok(events)
        })
        .await
    }

    /// Counts per kind plus confidence and time bounds over `[start, end)`.
    pub async fn get_event_stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<EventStats> {
        self.execute(move |conn| {
            let start = format_datetime(start);
            let end = format_datetime(end);
            let mut stats = EventStats::default();

            let mut stmt = conn.prepare(
                "SELECT kind, COUNT(*)
                 FROM telemetry_events
                 WHERE timestamp >= ?1 AND timestamp < ?2
                 GROUP BY kind",
            )?;
            let mut rows = stmt.query(params![start, end])?;
            while let Some(row) = rows.next()? {
                let kind: String = row.get(0)?;
                let kind: EventKind = kind.parse()?;
                stats.counts.insert(kind, to_u64(row.get(1)?, "count")?);
            }

            let (average, first, last): (Option<f64>, Option<String>, Option<String>) = conn
                .query_row(
                    "SELECT AVG(confidence), MIN(timestamp), MAX(timestamp)
                     FROM telemetry_events
                     WHERE timestamp >= ?1 AND timestamp < ?2",
                    params![start, end],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
            stats.average_confidence = average;
            stats.first_event = parse_optional_datetime(first, "first_event")?;
            stats.last_event = parse_optional_datetime(last, "last_event")?;

            Ok(stats)
        })
        .await
    }

    /// Deletes events older than `days_to_keep` days; returns rows removed.
    pub async fn cleanup_old_events(&self, days_to_keep: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(days_to_keep));
        self.execute(move |conn| {
            let removed = conn.execute(
                "DELETE FROM telemetry_events WHERE timestamp < ?1",
                params![format_datetime(cutoff)],
            )?;
            Ok(removed)
        })
        .await
    }
}
