use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, parse_method, parse_state, to_u64},
    models::{DurationRecord, StateSeconds, StateTotals},
};

fn row_to_record(row: &Row) -> Result<DurationRecord> {
    let state: String = row.get("state")?;
    let started_at: String = row.get("started_at")?;
    let ended_at: String = row.get("ended_at")?;
    let method: Option<String> = row.get("method")?;

    Ok(DurationRecord {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        state: parse_state(&state, "state")?,
        seconds: row.get("seconds")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        ended_at: parse_datetime(&ended_at, "ended_at")?,
        confidence: row.get("confidence")?,
        method: method.as_deref().map(parse_method).transpose()?,
    })
}

impl Database {
    pub async fn insert_duration_record(&self, record: &DurationRecord) -> Result<i64> {
        let record = record.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO duration_records (
                    session_id, state, seconds, started_at, ended_at, confidence, method
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.session_id,
                    record.state.as_str(),
                    record.seconds,
                    format_datetime(record.started_at),
                    format_datetime(record.ended_at),
                    record.confidence,
                    record.method.map(|m| m.as_str()),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_duration_records_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<DurationRecord>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, state, seconds, started_at, ended_at, confidence, method
                 FROM duration_records
                 WHERE session_id = ?1
                 ORDER BY ended_at ASC, id ASC",
            )?;

            let mut rows = stmt.query(params![session_id])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
        .await
    }

    /// Seconds per state for records whose `ended_at` lies in `[start, end)`.
    pub async fn sum_durations_by_state(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<StateTotals> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT state, SUM(seconds), COUNT(*)
                 FROM duration_records
                 WHERE ended_at >= ?1 AND ended_at < ?2
                 GROUP BY state",
            )?;

            let mut rows = stmt.query(params![format_datetime(start), format_datetime(end)])?;
            let mut seconds = StateSeconds::default();
            let mut record_count = 0;
            while let Some(row) = rows.next()? {
                let state: String = row.get(0)?;
                seconds.add(parse_state(&state, "state")?, row.get(1)?);
                record_count += to_u64(row.get(2)?, "count")?;
            }

            Ok(StateTotals {
                seconds,
                record_count,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{AgentState, DetectionMethod};
    use chrono::{Duration, TimeZone};

    fn record(state: AgentState, ended_at: DateTime<Utc>, seconds: f64) -> DurationRecord {
        DurationRecord {
            id: None,
            session_id: "s".into(),
            state,
            seconds,
            started_at: ended_at - Duration::milliseconds((seconds * 1000.0) as i64),
            ended_at,
            confidence: None,
            method: Some(DetectionMethod::Template),
        }
    }

    #[tokio::test]
    async fn sums_by_state_with_half_open_range() {
        let db = Database::open_in_memory().unwrap();
        let day = Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).unwrap();
        db.create_session("s", day, None).await.unwrap();

        for rec in [
            record(AgentState::Idle, day + Duration::hours(1), 12.5),
            record(AgentState::Idle, day + Duration::hours(2), 7.5),
            record(AgentState::Active, day + Duration::hours(3), 40.0),
            // exactly on the end boundary: next day
            record(AgentState::Active, day + Duration::days(1), 99.0),
        ] {
            db.insert_duration_record(&rec).await.unwrap();
        }

        let totals = db
            .sum_durations_by_state(day, day + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(totals.seconds.idle, 20.0);
        assert_eq!(totals.seconds.active, 40.0);
        assert_eq!(totals.record_count, 3);

        let records = db.get_duration_records_for_session("s").await.unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].state, AgentState::Idle);
        assert_eq!(records[0].method, Some(DetectionMethod::Template));
    }
}
