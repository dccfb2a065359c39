use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{
        format_datetime, parse_datetime, parse_optional_datetime, parse_state, parse_status,
    },
    models::{MonitoringSession, SessionStatus, StateSeconds},
};

const SESSION_COLUMNS: &str = "id, started_at, ended_at, status, idle_secs, active_secs, \
     run_command_secs, unknown_secs, config_snapshot, created_at, updated_at";

fn row_to_session(row: &Row) -> Result<MonitoringSession> {
    let started_at: String = row.get("started_at")?;
    let ended_at: Option<String> = row.get("ended_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let status: String = row.get("status")?;

    Ok(MonitoringSession {
        id: row.get("id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        ended_at: parse_optional_datetime(ended_at, "ended_at")?,
        status: parse_status(&status)?,
        seconds: StateSeconds {
            idle: row.get("idle_secs")?,
            active: row.get("active_secs")?,
            run_command: row.get("run_command_secs")?,
            unknown: row.get("unknown_secs")?,
        },
        config_snapshot: row.get("config_snapshot")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

impl Database {
    pub async fn insert_session(&self, session: &MonitoringSession) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO monitoring_sessions (
                    id, started_at, ended_at, status,
                    idle_secs, active_secs, run_command_secs, unknown_secs,
                    config_snapshot, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id,
                    format_datetime(record.started_at),
                    record.ended_at.map(format_datetime),
                    record.status.as_str(),
                    record.seconds.idle,
                    record.seconds.active,
                    record.seconds.run_command,
                    record.seconds.unknown,
                    record.config_snapshot,
                    format_datetime(record.created_at),
                    format_datetime(record.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Opens a new running session and returns it.
    pub async fn create_session(
        &self,
        session_id: &str,
        started_at: DateTime<Utc>,
        config_snapshot: Option<String>,
    ) -> Result<MonitoringSession> {
        let session = MonitoringSession::start(session_id.to_string(), started_at, config_snapshot);
        self.insert_session(&session).await?;
        Ok(session)
    }

    pub async fn end_session(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
        seconds: StateSeconds,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE monitoring_sessions
                 SET status = ?1,
                     ended_at = ?2,
                     idle_secs = ?3,
                     active_secs = ?4,
                     run_command_secs = ?5,
                     unknown_secs = ?6,
                     updated_at = ?2
                 WHERE id = ?7",
                params![
                    SessionStatus::Completed.as_str(),
                    format_datetime(ended_at),
                    seconds.idle,
                    seconds.active,
                    seconds.run_command,
                    seconds.unknown,
                    session_id,
                ],
            )?;

            if rows_affected == 0 {
                return Err(anyhow!("Session {session_id} not found"));
            }
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<MonitoringSession>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM monitoring_sessions WHERE id = ?1"
            ))?;

            stmt.query_row(params![session_id], |row| Ok(row_to_session(row)))
                .optional()?
                .transpose()
        })
        .await
    }

    pub async fn get_incomplete_session(&self) -> Result<Option<MonitoringSession>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS}
                 FROM monitoring_sessions
                 WHERE status = 'Running'
                 ORDER BY started_at DESC
                 LIMIT 1"
            ))?;

            let mut rows = stmt.query([])?;
            let session = match rows.next()? {
                Some(row) => Some(row_to_session(row)?),
                None => None,
            };
            Ok(session)
        })
        .await
    }

    /// Closes a session the process never got to finish. Per-state seconds are
    /// rebuilt from the duration records that did make it to disk.
    pub async fn mark_session_interrupted(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let mut seconds = StateSeconds::default();
            {
                let mut stmt = tx.prepare(
                    "SELECT state, SUM(seconds) FROM duration_records
                     WHERE session_id = ?1
                     GROUP BY state",
                )?;
                let mut rows = stmt.query(params![session_id])?;
                while let Some(row) = rows.next()? {
                    let state: String = row.get(0)?;
                    let total: f64 = row.get(1)?;
                    seconds.add(parse_state(&state, "state")?, total);
                }
            }

            tx.execute(
                "UPDATE monitoring_sessions
                 SET status = ?1,
                     ended_at = ?2,
                     idle_secs = ?3,
                     active_secs = ?4,
                     run_command_secs = ?5,
                     unknown_secs = ?6,
                     updated_at = ?2
                 WHERE id = ?7",
                params![
                    SessionStatus::Interrupted.as_str(),
                    format_datetime(ended_at),
                    seconds.idle,
                    seconds.active,
                    seconds.run_command,
                    seconds.unknown,
                    session_id,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn list_sessions_paginated(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MonitoringSession>> {
        let limit = limit as i64;
        let offset = offset as i64;
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS}
                 FROM monitoring_sessions
                 WHERE status IN ('Completed', 'Interrupted')
                 ORDER BY started_at DESC
                 LIMIT ?1 OFFSET ?2"
            ))?;

            let mut rows = stmt.query(params![limit, offset])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }

            Ok(sessions)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::DurationRecord;
    use crate::detection::AgentState;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn create_end_and_reload_session() {
        let db = Database::open_in_memory().unwrap();
        db.create_session("s1", t0(), Some("{}".into())).await.unwrap();

        let running = db.get_incomplete_session().await.unwrap().unwrap();
        assert_eq!(running.id, "s1");
        assert_eq!(running.status, SessionStatus::Running);

        let seconds = StateSeconds {
            idle: 30.0,
            active: 60.0,
            run_command: 0.0,
            unknown: 10.0,
        };
        db.end_session("s1", t0() + Duration::seconds(100), seconds)
            .await
            .unwrap();

        let ended = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(ended.status, SessionStatus::Completed);
        assert_eq!(ended.seconds, seconds);
        assert_eq!(ended.ended_at, Some(t0() + Duration::seconds(100)));
        assert!(db.get_incomplete_session().await.unwrap().is_none());
        assert!(db.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ending_unknown_session_fails() {
        let db = Database::open_in_memory().unwrap();
        assert!(db
            .end_session("nope", t0(), StateSeconds::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn interrupted_session_recovers_recorded_seconds() {
        let db = Database::open_in_memory().unwrap();
        db.create_session("crashed", t0(), None).await.unwrap();
        db.insert_duration_record(&DurationRecord {
            id: None,
            session_id: "crashed".into(),
            state: AgentState::Active,
            seconds: 42.0,
            started_at: t0(),
            ended_at: t0() + Duration::seconds(42),
            confidence: Some(0.93),
            method: None,
        })
        .await
        .unwrap();

        db.mark_session_interrupted("crashed", t0() + Duration::seconds(50))
            .await
            .unwrap();

        let session = db.get_session("crashed").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Interrupted);
        assert_eq!(session.seconds.active, 42.0);

        let listed = db.list_sessions_paginated(10, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(db.list_sessions_paginated(10, 1).await.unwrap().is_empty());
    }
}
