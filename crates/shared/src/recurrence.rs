//! Recurring booking date math
//!
//! Occurrences keep the practitioner's local wall-clock time across DST changes:
//! a 10:00 weekly session stays at 10:00 local even when the UTC offset moves.
//! All arithmetic happens on naive local datetimes and each occurrence is
//! resolved to UTC independently.

use chrono::{NaiveDateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use time::{Date, Month, OffsetDateTime};

use crate::types::RecurrencePattern;

/// Upper bound on occurrences generated for one series (one year of weekly sessions)
pub const MAX_OCCURRENCES: u32 = 52;

/// Longest single appointment, in minutes
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecurrenceError {
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("occurrence count must be between 1 and 52, got {0}")]
    InvalidCount(u32),
    #[error("duration must be between 1 and 1440 minutes, got {0}")]
    InvalidDuration(i64),
    #[error("local time {0} cannot be resolved in the practitioner timezone")]
    UnresolvableLocalTime(NaiveDateTime),
    #[error("date out of range")]
    OutOfRange,
}

/// A single generated appointment slot, in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub start_utc: OffsetDateTime,
    pub end_utc: OffsetDateTime,
}

/// Parse an IANA timezone name ("Europe/Berlin")
pub fn parse_timezone(name: &str) -> Result<Tz, RecurrenceError> {
    name.parse::<Tz>()
        .map_err(|_| RecurrenceError::UnknownTimezone(name.to_string()))
}

/// Resolve a local wall-clock time to UTC.
///
/// Ambiguous times (clocks going back) take the earlier instant. Times inside a
/// spring-forward gap are moved one hour later.
pub fn resolve_local(tz: &Tz, local: NaiveDateTime) -> Result<OffsetDateTime, RecurrenceError> {
    let resolved = tz
        .from_local_datetime(&local)
        .earliest()
        .or_else(|| {
            let shifted = local.checked_add_signed(TimeDelta::hours(1))?;
            tz.from_local_datetime(&shifted).earliest()
        })
        .ok_or(RecurrenceError::UnresolvableLocalTime(local))?;

    let utc = resolved.with_timezone(&Utc);
    OffsetDateTime::from_unix_timestamp(utc.timestamp()).map_err(|_| RecurrenceError::OutOfRange)
}

/// End of an appointment starting at `start_utc`
pub fn occurrence_end(
    start_utc: OffsetDateTime,
    duration_minutes: i64,
) -> Result<OffsetDateTime, RecurrenceError> {
    if !(1..=MAX_DURATION_MINUTES).contains(&duration_minutes) {
        return Err(RecurrenceError::InvalidDuration(duration_minutes));
    }
    start_utc
        .checked_add(time::Duration::minutes(duration_minutes))
        .ok_or(RecurrenceError::OutOfRange)
}

/// Generate `count` occurrences starting at `first_start_local`
pub fn generate_occurrences(
    first_start_local: NaiveDateTime,
    duration_minutes: i64,
    tz: &Tz,
    pattern: RecurrencePattern,
    count: u32,
) -> Result<Vec<Occurrence>, RecurrenceError> {
    if count == 0 || count > MAX_OCCURRENCES {
        return Err(RecurrenceError::InvalidCount(count));
    }
    if !(1..=MAX_DURATION_MINUTES).contains(&duration_minutes) {
        return Err(RecurrenceError::InvalidDuration(duration_minutes));
    }

    let step = pattern.interval_days();
    let mut occurrences = Vec::with_capacity(count as usize);

    for i in 0..i64::from(count) {
        let local = first_start_local
            .checked_add_signed(TimeDelta::days(step * i))
            .ok_or(RecurrenceError::OutOfRange)?;
        let start_utc = resolve_local(tz, local)?;
        let end_utc = occurrence_end(start_utc, duration_minutes)?;
        occurrences.push(Occurrence { start_utc, end_utc });
    }

    Ok(occurrences)
}

/// First and last day of the calendar month containing `date`
pub fn month_period(date: Date) -> Result<(Date, Date), RecurrenceError> {
    let year = date.year();
    let month = date.month();
    let first =
        Date::from_calendar_date(year, month, 1).map_err(|_| RecurrenceError::OutOfRange)?;
    let last = Date::from_calendar_date(year, month, time::util::days_in_year_month(year, month))
        .map_err(|_| RecurrenceError::OutOfRange)?;
    Ok((first, last))
}

/// First day of the month after the one containing `date`
pub fn first_of_next_month(date: Date) -> Result<Date, RecurrenceError> {
    let (year, month) = match date.month() {
        Month::December => (date.year() + 1, Month::January),
        m => (date.year(), m.next()),
    };
    Date::from_calendar_date(year, month, 1).map_err(|_| RecurrenceError::OutOfRange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use time::macros::{date, datetime};

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_weekly_keeps_local_time_across_dst() {
        let tz = parse_timezone("America/New_York").unwrap();
        // US DST starts 2026-03-08
        let occ = generate_occurrences(
            local(2026, 3, 2, 10, 0),
            50,
            &tz,
            RecurrencePattern::Weekly,
            2,
        )
        .unwrap();

        assert_eq!(occ[0].start_utc, datetime!(2026-03-02 15:00 UTC));
        assert_eq!(occ[1].start_utc, datetime!(2026-03-09 14:00 UTC));
        assert_eq!(occ[1].end_utc, datetime!(2026-03-09 14:50 UTC));
    }

    #[test]
    fn test_biweekly_interval() {
        let tz = parse_timezone("UTC").unwrap();
        let occ = generate_occurrences(
            local(2026, 1, 5, 9, 0),
            60,
            &tz,
            RecurrencePattern::Biweekly,
            3,
        )
        .unwrap();

        assert_eq!(occ.len(), 3);
        assert_eq!(occ[1].start_utc - occ[0].start_utc, time::Duration::days(14));
        assert_eq!(occ[2].start_utc, datetime!(2026-02-02 09:00 UTC));
    }

    #[test]
    fn test_spring_forward_gap_shifts_later() {
        let tz = parse_timezone("America/New_York").unwrap();
        // 02:30 does not exist on 2026-03-08; resolves to 03:30 EDT
        let utc = resolve_local(&tz, local(2026, 3, 8, 2, 30)).unwrap();
        assert_eq!(utc, datetime!(2026-03-08 07:30 UTC));
    }

    #[test]
    fn test_fall_back_takes_earlier_instant() {
        let tz = parse_timezone("America/New_York").unwrap();
        // 01:30 happens twice on 2026-11-01; the EDT one comes first
        let utc = resolve_local(&tz, local(2026, 11, 1, 1, 30)).unwrap();
        assert_eq!(utc, datetime!(2026-11-01 05:30 UTC));
    }

    #[test]
    fn test_count_bounds() {
        let tz = parse_timezone("UTC").unwrap();
        let start = local(2026, 1, 5, 9, 0);
        assert_eq!(
            generate_occurrences(start, 60, &tz, RecurrencePattern::Weekly, 0),
            Err(RecurrenceError::InvalidCount(0))
        );
        assert_eq!(
            generate_occurrences(start, 60, &tz, RecurrencePattern::Weekly, 53),
            Err(RecurrenceError::InvalidCount(53))
        );
        assert!(generate_occurrences(start, 60, &tz, RecurrencePattern::Weekly, 52).is_ok());
    }

    #[test]
    fn test_duration_bounds() {
        let tz = parse_timezone("UTC").unwrap();
        let start = local(2026, 1, 5, 9, 0);
        for bad in [0, -30, MAX_DURATION_MINUTES + 1, 1_000_000_000_000, i64::MAX] {
            assert_eq!(
                generate_occurrences(start, bad, &tz, RecurrencePattern::Weekly, 1),
                Err(RecurrenceError::InvalidDuration(bad))
            );
        }
        let occ =
            generate_occurrences(start, MAX_DURATION_MINUTES, &tz, RecurrencePattern::Weekly, 1)
                .unwrap();
        assert_eq!(occ[0].end_utc, datetime!(2026-01-06 09:00 UTC));
    }

    #[test]
    fn test_occurrence_end_near_max_date_is_out_of_range() {
        let start = time::PrimitiveDateTime::MAX.assume_utc();
        assert_eq!(occurrence_end(start, 60), Err(RecurrenceError::OutOfRange));
        assert_eq!(
            occurrence_end(start, i64::MAX),
            Err(RecurrenceError::InvalidDuration(i64::MAX))
        );
    }

    #[test]
    fn test_far_future_series_does_not_overflow() {
        let tz = parse_timezone("UTC").unwrap();
        let start = NaiveDateTime::MAX - TimeDelta::days(10);
        let result = generate_occurrences(start, 60, &tz, RecurrencePattern::Weekly, 3);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_timezone() {
        assert_eq!(
            parse_timezone("Mars/Olympus"),
            Err(RecurrenceError::UnknownTimezone("Mars/Olympus".to_string()))
        );
    }

    #[test]
    fn test_month_period() {
        assert_eq!(
            month_period(date!(2024 - 02 - 17)).unwrap(),
            (date!(2024 - 02 - 01), date!(2024 - 02 - 29))
        );
        assert_eq!(
            first_of_next_month(date!(2025 - 12 - 31)).unwrap(),
            date!(2026 - 01 - 01)
        );
    }
}
