//! Working-day generation and calendar derivation.

use crate::status::{day_mark, DayMark};
use crate::types::AttendanceRecord;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Weekdays on which no attendance is expected by default.
pub const DEFAULT_NON_WORKING: [Weekday; 2] = [Weekday::Sat, Weekday::Sun];

/// All dates of `year`/`month` except Saturdays and Sundays.
///
/// Returns an empty set for an invalid month.
pub fn working_days(year: i32, month: u32) -> BTreeSet<NaiveDate> {
    working_days_except(year, month, &DEFAULT_NON_WORKING)
}

/// All dates of `year`/`month` whose weekday is not in `non_working`.
pub fn working_days_except(year: i32, month: u32, non_working: &[Weekday]) -> BTreeSet<NaiveDate> {
    let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return BTreeSet::new();
    };
    first
        .iter_days()
        .take_while(|d| d.month() == month)
        .filter(|d| !non_working.contains(&d.weekday()))
        .collect()
}

/// Half-open UTC range `[start, end)` covering `date` in the given offset.
pub fn day_bounds(date: NaiveDate, offset: &FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = local_midnight(date, offset);
    (start, start + Duration::days(1))
}

/// Half-open UTC range covering a whole month in the given offset.
///
/// `None` for an invalid month.
pub fn month_bounds(
    year: i32,
    month: u32,
    offset: &FixedOffset,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((local_midnight(first, offset), local_midnight(next, offset)))
}

fn local_midnight(date: NaiveDate, offset: &FixedOffset) -> DateTime<Utc> {
    let local = date.and_time(NaiveTime::MIN);
    Utc.from_utc_datetime(&(local - Duration::seconds(offset.local_minus_utc() as i64)))
}

/// Present and late dates for one identity within one month.
///
/// Each date is decided by its earliest counting record (timestamp, then
/// id), so the result is independent of the order records were learned in
/// and a date lands in at most one of the two sets.
pub fn classify_days<'a>(
    records: impl IntoIterator<Item = &'a AttendanceRecord>,
    identity_id: &str,
    year: i32,
    month: u32,
    offset: &FixedOffset,
) -> (BTreeSet<NaiveDate>, BTreeSet<NaiveDate>) {
    let mut first_by_day: BTreeMap<NaiveDate, (&AttendanceRecord, DayMark)> = BTreeMap::new();

    for record in records {
        let Some(mark) = day_mark(record, identity_id) else {
            continue;
        };
        let date = record.local_date(offset);
        if date.year() != year || date.month() != month {
            continue;
        }
        first_by_day
            .entry(date)
            .and_modify(|(current, current_mark)| {
                if (record.timestamp, &record.id) < (current.timestamp, &current.id) {
                    *current = record;
                    *current_mark = mark;
                }
            })
            .or_insert((record, mark));
    }

    let mut present = BTreeSet::new();
    let mut late = BTreeSet::new();
    for (date, (_, mark)) in first_by_day {
        match mark {
            DayMark::Present => present.insert(date),
            DayMark::Late => late.insert(date),
        };
    }
    (present, late)
}

/// Working days on or before `today` that are neither present nor late.
pub fn derive_absent(
    working: &BTreeSet<NaiveDate>,
    present: &BTreeSet<NaiveDate>,
    late: &BTreeSet<NaiveDate>,
    today: NaiveDate,
) -> BTreeSet<NaiveDate> {
    working
        .iter()
        .filter(|d| **d <= today && !present.contains(d) && !late.contains(d))
        .copied()
        .collect()
}

/// Coarse per-day summary used when no record list is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayBadge {
    Present,
    Late,
    Absent,
    /// The date is in the future: nothing can be known yet.
    NoData,
    /// A past non-working day without records.
    Unknown,
}

impl DayBadge {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Present => "Present",
            Self::Late => "Late",
            Self::Absent => "Absent",
            Self::NoData => "No data available",
            Self::Unknown => "Unknown",
        }
    }
}

/// Detail shown for the selected date.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", content = "value", rename_all = "snake_case")]
pub enum DailyDetail {
    /// Records from the live feed, ordered by timestamp.
    Live(Vec<AttendanceRecord>),
    /// Records from the per-day historical query.
    Historical(Vec<AttendanceRecord>),
    Badge(DayBadge),
}

/// Derived calendar view for one identity and one month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalendarState {
    pub year: i32,
    pub month: u32,
    pub present_days: BTreeSet<NaiveDate>,
    pub late_days: BTreeSet<NaiveDate>,
    pub absent_days: BTreeSet<NaiveDate>,
    pub working_days: BTreeSet<NaiveDate>,
    pub selected_date: Option<NaiveDate>,
    pub daily_detail: Option<DailyDetail>,
}

impl CalendarState {
    /// Empty calendar for a month with its working days filled in.
    pub fn empty(year: i32, month: u32, non_working: &[Weekday]) -> Self {
        Self {
            year,
            month,
            present_days: BTreeSet::new(),
            late_days: BTreeSet::new(),
            absent_days: BTreeSet::new(),
            working_days: working_days_except(year, month, non_working),
            selected_date: None,
            daily_detail: None,
        }
    }

    /// Badge for a date from set membership alone.
    pub fn badge_for(&self, date: NaiveDate, today: NaiveDate) -> DayBadge {
        if date > today {
            DayBadge::NoData
        } else if self.present_days.contains(&date) {
            DayBadge::Present
        } else if self.late_days.contains(&date) {
            DayBadge::Late
        } else if self.absent_days.contains(&date) {
            DayBadge::Absent
        } else {
            DayBadge::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttendanceStatus;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn record(id: &str, identity: &str, day: u32, hour: u32, status: AttendanceStatus) -> AttendanceRecord {
        AttendanceRecord {
            id: id.into(),
            identity_id: Some(identity.into()),
            timestamp: Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap(),
            status,
            confidence: Some(0.8),
            device_info: None,
        }
    }

    #[test]
    fn test_working_days_march_2026() {
        let days = working_days(2026, 3);
        // March 2026 starts on a Sunday: 22 weekdays.
        assert_eq!(days.len(), 22);
        assert!(!days.contains(&date(2026, 3, 1)));
        assert!(days.contains(&date(2026, 3, 2)));
        assert!(days.contains(&date(2026, 3, 31)));
        assert!(days.iter().all(|d| d.month() == 3));
    }

    #[test]
    fn test_working_days_february_leap_year() {
        let days = working_days(2028, 2);
        assert_eq!(days.len(), 21);
        assert!(days.contains(&date(2028, 2, 29)));
    }

    #[test]
    fn test_working_days_invalid_month() {
        assert!(working_days(2026, 13).is_empty());
    }

    #[test]
    fn test_working_days_custom_pattern() {
        let days = working_days_except(2026, 3, &[Weekday::Fri, Weekday::Sat]);
        assert!(days.contains(&date(2026, 3, 1)));
        assert!(!days.contains(&date(2026, 3, 6)));
    }

    #[test]
    fn test_day_bounds_with_offset() {
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let (start, end) = day_bounds(date(2026, 3, 3), &plus_two);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 2, 22, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 3, 3, 22, 0, 0).unwrap());
    }

    #[test]
    fn test_month_bounds_december() {
        let (start, end) = month_bounds(2026, 12, &utc()).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_classify_earliest_record_decides() {
        let records = vec![
            record("b", "ana", 2, 11, AttendanceStatus::Late),
            record("a", "ana", 2, 8, AttendanceStatus::Present),
            record("c", "ana", 3, 10, AttendanceStatus::Late),
        ];
        let (present, late) = classify_days(&records, "ana", 2026, 3, &utc());
        assert_eq!(present, BTreeSet::from([date(2026, 3, 2)]));
        assert_eq!(late, BTreeSet::from([date(2026, 3, 3)]));
    }

    #[test]
    fn test_classify_ignores_other_identities_and_months() {
        let mut other_month = record("x", "ana", 2, 8, AttendanceStatus::Present);
        other_month.timestamp = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap();
        let records = vec![record("y", "bob", 2, 8, AttendanceStatus::Present), other_month];
        let (present, late) = classify_days(&records, "ana", 2026, 3, &utc());
        assert!(present.is_empty());
        assert!(late.is_empty());
    }

    #[test]
    fn test_derive_absent_stops_at_today() {
        let working = working_days(2026, 3);
        let present = BTreeSet::from([date(2026, 3, 2)]);
        let late = BTreeSet::from([date(2026, 3, 3)]);
        let absent = derive_absent(&working, &present, &late, date(2026, 3, 5));
        assert_eq!(absent, BTreeSet::from([date(2026, 3, 4), date(2026, 3, 5)]));
    }

    #[test]
    fn test_badge_future_date_is_no_data() {
        let state = CalendarState::empty(2026, 3, &DEFAULT_NON_WORKING);
        assert_eq!(state.badge_for(date(2026, 3, 20), date(2026, 3, 10)), DayBadge::NoData);
        assert_eq!(DayBadge::NoData.label(), "No data available");
    }
}
