// crates/core/src/time.rs
//! Time bucket boundaries and timestamp parsing.
//!
//! Buckets are computed in UTC. A week starts at 00:00 on the configured
//! weekday; a month at 00:00 on its first day.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::TimestampError;

/// Latest date a bucket or style key may carry. Keeps the fixed-width
/// `YYYYMMDD` encodings lexically ordered.
pub const MAX_SUPPORTED_YEAR: i32 = 9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Week,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }
}

/// Start of the bucket containing `at`.
pub fn bucket_start(at: DateTime<Utc>, granularity: Granularity, week_start: Weekday) -> DateTime<Utc> {
    let date = at.date_naive();
    let first_day = match granularity {
        Granularity::Week => {
            let offset = (7 + date.weekday().num_days_from_monday()
                - week_start.num_days_from_monday())
                % 7;
            date - Duration::days(i64::from(offset))
        }
        Granularity::Month => date.with_day(1).unwrap_or(date),
    };
    midnight(first_day)
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// Parse a raw timestamp as handed over by importers.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (taken as UTC), and integer Unix
/// seconds.
pub fn parse_timestamp(raw: Option<&str>) -> Result<DateTime<Utc>, TimestampError> {
    let input = raw.map(str::trim).filter(|s| !s.is_empty()).ok_or(TimestampError::Missing)?;

    let parsed = if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        Some(dt.with_timezone(&Utc))
    } else if let Ok(naive) = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S") {
        Some(Utc.from_utc_datetime(&naive))
    } else if input.bytes().all(|b| b.is_ascii_digit()) {
        input
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    } else {
        None
    };

    let at = parsed.ok_or_else(|| TimestampError::Unparseable {
        input: input.to_string(),
    })?;
    check_supported(at).map_err(|_| TimestampError::OutOfRange {
        input: input.to_string(),
    })
}

/// Reject instants whose year would break fixed-width date encodings.
pub fn check_supported(at: DateTime<Utc>) -> Result<DateTime<Utc>, TimestampError> {
    if (0..=MAX_SUPPORTED_YEAR).contains(&at.year()) {
        Ok(at)
    } else {
        Err(TimestampError::OutOfRange {
            input: at.to_rfc3339(),
        })
    }
}
