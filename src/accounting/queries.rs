//! Calendar ranges over duration records. All boundaries are UTC and
//! half-open: a record counts when its `ended_at` lies in `[start, end)`.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{Database, StateTotals};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < start {
            return Err(anyhow!("range end {end} is before start {start}"));
        }
        Ok(Self { start, end })
    }

    pub fn day(date: NaiveDate) -> Self {
        let start = midnight(date);
        Self {
            start,
            end: start + Duration::days(1),
        }
    }

    /// ISO week (Monday to Monday) containing `date`.
    pub fn week(date: NaiveDate) -> Self {
        let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
        let start = midnight(monday);
        Self {
            start,
            end: start + Duration::days(7),
        }
    }

    pub fn month(year: i32, month: u32) -> Result<Self> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| anyhow!("invalid month {year}-{month}"))?;
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        }
        .ok_or_else(|| anyhow!("month after {year}-{month} is out of range"))?;

        Ok(Self {
            start: midnight(first),
            end: midnight(next),
        })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

pub async fn totals_for(db: &Database, range: TimeRange) -> Result<StateTotals> {
    db.sum_durations_by_state(range.start, range.end).await
}

pub async fn daily_totals(db: &Database, date: NaiveDate) -> Result<StateTotals> {
    totals_for(db, TimeRange::day(date)).await
}

pub async fn weekly_totals(db: &Database, date: NaiveDate) -> Result<StateTotals> {
    totals_for(db, TimeRange::week(date)).await
}

pub async fn monthly_totals(db: &Database, year: i32, month: u32) -> Result<StateTotals> {
    totals_for(db, TimeRange::month(year, month)?).await
}
