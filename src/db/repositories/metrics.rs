use anyhow::Result;
use rusqlite::params;

use crate::db::{connection::Database, helpers::format_datetime, models::PerformanceMetric};

impl Database {
    pub async fn insert_performance_metric(&self, metric: &PerformanceMetric) -> Result<()> {
        let record = metric.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO performance_metrics (
                    timestamp, session_id, cycle_ms, capture_ms, detect_ms,
                    memory_mb, cpu_percent, frame_width, frame_height
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    format_datetime(record.timestamp),
                    record.session_id,
                    record.cycle_ms,
                    record.capture_ms,
                    record.detect_ms,
                    record.memory_mb,
                    f64::from(record.cpu_percent),
                    record.frame_width,
                    record.frame_height,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn stores_cycle_metric() {
        let db = Database::open_in_memory().unwrap();
        db.insert_performance_metric(&PerformanceMetric {
            timestamp: Utc::now(),
            session_id: Some("s1".into()),
            cycle_ms: 48.5,
            capture_ms: 12.0,
            detect_ms: 30.25,
            memory_mb: 80.0,
            cpu_percent: 3.5,
            frame_width: Some(1920),
            frame_height: Some(1080),
        })
        .await
        .unwrap();

        let (count, detect_ms): (i64, f64) = db
            .execute(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), MAX(detect_ms) FROM performance_metrics",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(detect_ms, 30.25);
    }
}
