//! Shared value types: timestamps, periods and the injectable clock

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Format a timestamp the way the ledger hashes it: RFC 3339, microseconds, `Z`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp into UTC
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

// ============================================================================
// Clock
// ============================================================================

/// Source of "now" for event stamping and confirmation deadlines
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(std::sync::Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Anchor Period
// ============================================================================

/// Half-open UTC day `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnchorPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AnchorPeriod {
    /// The UTC day containing `date`
    pub fn for_day(date: NaiveDate) -> Self {
        let start = Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN));
        Self {
            start,
            end: start + Duration::days(1),
        }
    }

    /// The UTC day before the one containing `now`
    pub fn previous_day(now: DateTime<Utc>) -> Self {
        Self::for_day(now.date_naive() - Duration::days(1))
    }

    pub fn day(&self) -> NaiveDate {
        self.start.date_naive()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Period bounds in the stored/hashed string form
    pub fn bounds(&self) -> (String, String) {
        (format_timestamp(self.start), format_timestamp(self.end))
    }
}

impl fmt::Display for AnchorPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.day())
    }
}

/// Every UTC day from `from` through `to`, inclusive
pub fn days_inclusive(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    from.iter_days().take_while(|d| *d <= to).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_format_has_micros_and_z() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        assert_eq!(format_timestamp(ts), "2026-01-05T10:00:00.000000Z");
        assert_eq!(parse_timestamp("2026-01-05T10:00:00.000000Z"), Some(ts));
        assert_eq!(parse_timestamp("2026-01-05T11:00:00+01:00"), Some(ts));
    }

    #[test]
    fn test_period_is_half_open_day() {
        let day = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let period = AnchorPeriod::for_day(day);

        assert!(period.contains(Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap()));
        assert!(period.contains(Utc.with_ymd_and_hms(2026, 1, 5, 23, 59, 59).unwrap()));
        assert!(!period.contains(Utc.with_ymd_and_hms(2026, 1, 6, 0, 0, 0).unwrap()));
        assert_eq!(
            period.bounds(),
            (
                "2026-01-05T00:00:00.000000Z".to_string(),
                "2026-01-06T00:00:00.000000Z".to_string()
            )
        );
    }

    #[test]
    fn test_previous_day() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 30, 0).unwrap();
        assert_eq!(
            AnchorPeriod::previous_day(now).day(),
            NaiveDate::from_ymd_opt(2026, 2, 28).unwrap()
        );
    }

    #[test]
    fn test_days_inclusive() {
        let from = NaiveDate::from_ymd_opt(2026, 1, 30).unwrap();
        let to = NaiveDate::from_ymd_opt(2026, 2, 2).unwrap();
        assert_eq!(days_inclusive(from, to).len(), 4);
        assert!(days_inclusive(to, from).is_empty());
    }

    #[test]
    fn test_fixed_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        clock.advance(Duration::seconds(5));
        assert_eq!(clock.now(), start + Duration::seconds(5));
    }
}
