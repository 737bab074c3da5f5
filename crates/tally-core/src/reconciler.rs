//! Attendance reconciler.
//!
//! Folds two sources into one calendar for the selected identity: the
//! authoritative historical query (pulled) and the live event feed
//! (pushed, at-least-once, unordered). Records from both are kept in one
//! map keyed by record id and every derived set is recomputed from that
//! map, so merging is idempotent and the result does not depend on which
//! source answered first.
//!
//! Every selection hands out a [`SelectionTicket`]. Fetch results and live
//! events carry the ticket they were issued under; anything carrying an
//! older ticket is discarded.

use crate::calendar::{
    classify_days, day_bounds, derive_absent, working_days_except, CalendarState, DailyDetail,
    DEFAULT_NON_WORKING,
};
use crate::types::AttendanceRecord;
use chrono::{FixedOffset, NaiveDate, Weekday};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconcileError {
    #[error("historical fetch failed: {0}")]
    FetchFailure(String),
    #[error("no identity selected")]
    NoSelection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Unselected,
    Loading,
    Ready,
}

/// Identifies one identity selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectionTicket {
    generation: u64,
}

/// Outcome of feeding data into the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Merged,
    /// The data belonged to an older selection (or an unselected date) and was dropped.
    Stale,
}

pub struct Reconciler {
    offset: FixedOffset,
    non_working: Vec<Weekday>,
    today: NaiveDate,
    state: ReconcilerState,
    generation: u64,
    identity: Option<String>,
    records: BTreeMap<String, AttendanceRecord>,
    live_ids: BTreeSet<String>,
    day_history: Option<(NaiveDate, Vec<AttendanceRecord>)>,
    /// Refetch the selected date even when live records cover it.
    day_resync: bool,
    calendar: CalendarState,
}

impl Reconciler {
    /// Create an unselected reconciler showing `year`/`month`.
    ///
    /// `today` bounds absence derivation; `offset` decides which calendar
    /// date a timestamp falls on.
    pub fn new(year: i32, month: u32, today: NaiveDate, offset: FixedOffset) -> Self {
        Self {
            offset,
            non_working: DEFAULT_NON_WORKING.to_vec(),
            today,
            state: ReconcilerState::Unselected,
            generation: 0,
            identity: None,
            records: BTreeMap::new(),
            live_ids: BTreeSet::new(),
            day_history: None,
            day_resync: false,
            calendar: CalendarState::empty(year, month, &DEFAULT_NON_WORKING),
        }
    }

    /// Replace the non-working weekday pattern (default: Saturday, Sunday).
    pub fn with_non_working(mut self, non_working: Vec<Weekday>) -> Self {
        self.non_working = non_working;
        self.calendar.working_days =
            working_days_except(self.calendar.year, self.calendar.month, &self.non_working);
        self.recompute();
        self
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn calendar(&self) -> &CalendarState {
        &self.calendar
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn offset(&self) -> &FixedOffset {
        &self.offset
    }

    /// Ticket of the current selection, if any.
    pub fn ticket(&self) -> Option<SelectionTicket> {
        self.identity.as_ref().map(|_| SelectionTicket {
            generation: self.generation,
        })
    }

    fn is_current(&self, ticket: SelectionTicket) -> bool {
        self.identity.is_some() && ticket.generation == self.generation
    }

    /// Select an identity. Drops everything known about the previous one.
    pub fn select(&mut self, identity_id: impl Into<String>) -> SelectionTicket {
        let identity_id = identity_id.into();
        self.reset();
        tracing::debug!(identity = %identity_id, generation = self.generation, "identity selected");
        self.identity = Some(identity_id);
        self.state = ReconcilerState::Loading;
        self.recompute();
        SelectionTicket {
            generation: self.generation,
        }
    }

    /// Clear the selection. Results for any earlier ticket become stale.
    pub fn clear(&mut self) {
        self.reset();
        self.identity = None;
        self.state = ReconcilerState::Unselected;
        self.recompute();
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.records.clear();
        self.live_ids.clear();
        self.day_history = None;
        self.day_resync = false;
    }

    /// Merge the result of a historical fetch. Loading → Ready.
    pub fn apply_history(
        &mut self,
        ticket: SelectionTicket,
        records: Vec<AttendanceRecord>,
    ) -> Applied {
        if !self.is_current(ticket) {
            tracing::debug!(count = records.len(), "discarding stale history");
            return Applied::Stale;
        }
        let count = records.len();
        for record in records {
            self.insert(record);
        }
        self.state = ReconcilerState::Ready;
        self.recompute();
        tracing::debug!(count, known = self.records.len(), "history merged");
        Applied::Merged
    }

    /// Report a failed historical fetch. Calendar state is left as it was.
    pub fn fetch_failed(
        &mut self,
        ticket: SelectionTicket,
        reason: impl Into<String>,
    ) -> Result<Applied, ReconcileError> {
        let reason = reason.into();
        if !self.is_current(ticket) {
            tracing::debug!(reason = %reason, "ignoring failure of stale fetch");
            return Ok(Applied::Stale);
        }
        tracing::warn!(reason = %reason, "historical fetch failed; keeping calendar state");
        Err(ReconcileError::FetchFailure(reason))
    }

    /// Merge one live event. Accepted in both Loading and Ready.
    pub fn apply_live(&mut self, ticket: SelectionTicket, record: AttendanceRecord) -> Applied {
        if !self.is_current(ticket) {
            tracing::debug!(record = %record.id, "discarding stale live event");
            return Applied::Stale;
        }
        if self.owns(&record) {
            self.live_ids.insert(record.id.clone());
        }
        self.insert(record);
        self.recompute();
        Applied::Merged
    }

    /// Merge the per-day historical list fetched for `date`.
    ///
    /// Dropped when stale or when `date` is no longer the selected date.
    pub fn apply_day_history(
        &mut self,
        ticket: SelectionTicket,
        date: NaiveDate,
        records: Vec<AttendanceRecord>,
    ) -> Applied {
        if !self.is_current(ticket) || self.calendar.selected_date != Some(date) {
            return Applied::Stale;
        }
        let mut owned: Vec<AttendanceRecord> = records
            .into_iter()
            .filter(|r| self.owns(r))
            .collect();
        owned.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        for record in &owned {
            self.insert(record.clone());
        }
        self.day_history = Some((date, owned));
        self.day_resync = false;
        self.recompute();
        Applied::Merged
    }

    /// Change the selected date and re-derive its detail.
    pub fn select_date(&mut self, date: NaiveDate) {
        if self.calendar.selected_date != Some(date) {
            self.day_history = None;
        }
        self.calendar.selected_date = Some(date);
        self.recompute();
    }

    /// Date the caller should fetch a per-day list for, if the current
    /// selection has no live records and no fetched list for it.
    pub fn needs_day_history(&self) -> Option<NaiveDate> {
        self.identity.as_ref()?;
        let date = self.calendar.selected_date?;
        if date > self.today {
            return None;
        }
        match &self.calendar.daily_detail {
            _ if self.day_resync => Some(date),
            Some(DailyDetail::Live(_)) => None,
            _ if self.day_history.as_ref().map(|(d, _)| *d) == Some(date) => None,
            _ => Some(date),
        }
    }

    /// Drop the fetched per-day list so the selected date is fetched again,
    /// live records or not. Used after live events were lost.
    pub fn forget_day_history(&mut self) {
        self.day_history = None;
        self.day_resync = true;
        self.recompute();
    }

    /// Show a different month. Known records are kept.
    pub fn set_month(&mut self, year: i32, month: u32) {
        let selected = self.calendar.selected_date;
        self.calendar = CalendarState::empty(year, month, &self.non_working);
        self.calendar.selected_date = selected;
        self.recompute();
    }

    /// Move "today" forward (e.g. at midnight) and re-derive absence.
    pub fn set_today(&mut self, today: NaiveDate) {
        self.today = today;
        self.recompute();
    }

    fn owns(&self, record: &AttendanceRecord) -> bool {
        match (&self.identity, record.owner()) {
            (Some(selected), Some(owner)) => selected == owner,
            _ => false,
        }
    }

    fn insert(&mut self, record: AttendanceRecord) {
        if !self.owns(&record) {
            tracing::debug!(record = %record.id, "ignoring record not owned by selected identity");
            return;
        }
        self.records.entry(record.id.clone()).or_insert(record);
    }

    fn recompute(&mut self) {
        let (present, late) = match &self.identity {
            Some(identity) => classify_days(
                self.records.values(),
                identity,
                self.calendar.year,
                self.calendar.month,
                &self.offset,
            ),
            None => (BTreeSet::new(), BTreeSet::new()),
        };
        self.calendar.absent_days = if self.identity.is_some() {
            derive_absent(&self.calendar.working_days, &present, &late, self.today)
        } else {
            BTreeSet::new()
        };
        self.calendar.present_days = present;
        self.calendar.late_days = late;
        self.calendar.daily_detail = self.calendar.selected_date.map(|d| self.derive_detail(d));
    }

    fn derive_detail(&self, date: NaiveDate) -> DailyDetail {
        if date > self.today {
            return DailyDetail::Badge(self.calendar.badge_for(date, self.today));
        }

        let (start, end) = day_bounds(date, &self.offset);
        let mut live: Vec<AttendanceRecord> = self
            .records
            .values()
            .filter(|r| self.live_ids.contains(&r.id))
            .filter(|r| r.timestamp >= start && r.timestamp < end)
            .cloned()
            .collect();
        if !live.is_empty() {
            // A list fetched after a resync fills in live events that never arrived.
            if let Some((fetched_for, records)) = &self.day_history {
                if *fetched_for == date {
                    let known: BTreeSet<&str> = live.iter().map(|r| r.id.as_str()).collect();
                    let missing: Vec<AttendanceRecord> = records
                        .iter()
                        .filter(|r| !known.contains(r.id.as_str()))
                        .cloned()
                        .collect();
                    live.extend(missing);
                }
            }
            live.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
            return DailyDetail::Live(live);
        }

        if let Some((fetched_for, records)) = &self.day_history {
            if *fetched_for == date && !records.is_empty() {
                return DailyDetail::Historical(records.clone());
            }
        }

        DailyDetail::Badge(self.calendar.badge_for(date, self.today))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::DayBadge;
    use crate::types::{AttendanceStatus, DeviceInfo};
    use chrono::{TimeZone, Utc};

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn reconciler(today: u32) -> Reconciler {
        Reconciler::new(2026, 3, date(today), utc())
    }

    fn record(id: &str, identity: &str, day: u32, hour: u32, status: AttendanceStatus) -> AttendanceRecord {
        AttendanceRecord {
            id: id.into(),
            identity_id: Some(identity.into()),
            timestamp: Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap(),
            status,
            confidence: Some(0.9),
            device_info: None,
        }
    }

    fn march_history() -> Vec<AttendanceRecord> {
        vec![
            record("h1", "ana", 2, 8, AttendanceStatus::Present),
            record("h2", "ana", 3, 8, AttendanceStatus::Present),
            record("h3", "ana", 4, 8, AttendanceStatus::Present),
            record("h4", "ana", 5, 10, AttendanceStatus::Late),
        ]
    }

    fn assert_classification_total(r: &Reconciler) {
        let cal = r.calendar();
        for day in cal.working_days.iter().filter(|d| **d <= r.today()) {
            let hits = [&cal.present_days, &cal.late_days, &cal.absent_days]
                .iter()
                .filter(|set| set.contains(day))
                .count();
            assert_eq!(hits, 1, "{day} classified {hits} times");
        }
    }

    #[test]
    fn test_select_then_history_moves_to_ready() {
        let mut r = reconciler(10);
        assert_eq!(r.state(), ReconcilerState::Unselected);
        let ticket = r.select("ana");
        assert_eq!(r.state(), ReconcilerState::Loading);
        assert_eq!(r.apply_history(ticket, vec![]), Applied::Merged);
        assert_eq!(r.state(), ReconcilerState::Ready);
    }

    #[test]
    fn test_live_before_history_is_kept() {
        let mut r = reconciler(10);
        let ticket = r.select("ana");
        r.apply_live(ticket, record("l1", "ana", 6, 8, AttendanceStatus::Present));
        assert_eq!(r.state(), ReconcilerState::Loading);
        r.apply_history(ticket, march_history());
        assert!(r.calendar().present_days.contains(&date(6)));
        assert_eq!(r.calendar().present_days.len(), 4);
    }

    #[test]
    fn test_history_and_live_commute() {
        let live = vec![
            record("l1", "ana", 9, 8, AttendanceStatus::Late),
            record("l2", "ana", 5, 7, AttendanceStatus::Present),
            record("h2", "ana", 3, 8, AttendanceStatus::Present),
        ];

        let mut a = reconciler(10);
        let ta = a.select("ana");
        a.select_date(date(5));
        a.apply_history(ta, march_history());
        for e in live.iter().cloned() {
            a.apply_live(ta, e);
        }

        let mut b = reconciler(10);
        let tb = b.select("ana");
        b.select_date(date(5));
        for e in live.iter().rev().cloned() {
            b.apply_live(tb, e);
        }
        b.apply_history(tb, march_history());

        assert_eq!(a.calendar(), b.calendar());
        // The earlier present record on the 5th wins over the later late one.
        assert!(a.calendar().present_days.contains(&date(5)));
        assert!(!a.calendar().late_days.contains(&date(5)));
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let mut r = reconciler(10);
        let ticket = r.select("ana");
        r.apply_history(ticket, march_history());
        let before = r.calendar().clone();
        r.apply_history(ticket, march_history());
        r.apply_live(ticket, record("h1", "ana", 2, 8, AttendanceStatus::Present));
        r.apply_live(ticket, record("h1", "ana", 2, 8, AttendanceStatus::Present));
        assert_eq!(r.calendar().present_days, before.present_days);
        assert_eq!(r.calendar().late_days, before.late_days);
        assert_eq!(r.calendar().absent_days, before.absent_days);
    }

    #[test]
    fn test_march_live_event_fills_absent_day() {
        let mut r = reconciler(10);
        let ticket = r.select("ana");
        r.apply_history(ticket, march_history());

        let cal = r.calendar();
        assert_eq!(cal.present_days, BTreeSet::from([date(2), date(3), date(4)]));
        assert_eq!(cal.late_days, BTreeSet::from([date(5)]));
        assert!(cal.absent_days.contains(&date(6)));
        assert_classification_total(&r);

        r.apply_live(ticket, record("l1", "ana", 6, 10, AttendanceStatus::Late));
        let cal = r.calendar();
        assert!(!cal.absent_days.contains(&date(6)));
        assert!(cal.late_days.contains(&date(6)));
        assert_eq!(cal.present_days, BTreeSet::from([date(2), date(3), date(4)]));
        assert!(cal.late_days.contains(&date(5)));
        assert_eq!(cal.absent_days, BTreeSet::from([date(9), date(10)]));
        assert_classification_total(&r);
    }

    #[test]
    fn test_stale_history_after_reselect_is_dropped() {
        let mut r = reconciler(10);
        let old = r.select("ana");
        let new = r.select("bob");
        assert_eq!(r.apply_history(old, march_history()), Applied::Stale);
        assert_eq!(r.state(), ReconcilerState::Loading);
        assert!(r.calendar().present_days.is_empty());
        assert_eq!(r.apply_history(new, vec![]), Applied::Merged);
    }

    #[test]
    fn test_stale_live_after_clear_is_dropped() {
        let mut r = reconciler(10);
        let ticket = r.select("ana");
        r.clear();
        assert_eq!(r.state(), ReconcilerState::Unselected);
        assert_eq!(
            r.apply_live(ticket, record("l1", "ana", 6, 8, AttendanceStatus::Present)),
            Applied::Stale
        );
        assert!(r.calendar().present_days.is_empty());
        assert!(r.calendar().absent_days.is_empty());
    }

    #[test]
    fn test_fetch_failure_keeps_state() {
        let mut r = reconciler(10);
        let ticket = r.select("ana");
        r.apply_history(ticket, march_history());
        let before = r.calendar().clone();
        assert_eq!(
            r.fetch_failed(ticket, "connection reset"),
            Err(ReconcileError::FetchFailure("connection reset".into()))
        );
        assert_eq!(r.calendar(), &before);
        assert_eq!(r.state(), ReconcilerState::Ready);
    }

    #[test]
    fn test_fetch_failure_of_stale_ticket_is_silent() {
        let mut r = reconciler(10);
        let old = r.select("ana");
        r.select("bob");
        assert_eq!(r.fetch_failed(old, "timeout"), Ok(Applied::Stale));
    }

    #[test]
    fn test_unauthorized_record_never_counts() {
        let mut r = reconciler(10);
        let ticket = r.select("ana");
        let mut intruder = record("u1", "ana", 6, 8, AttendanceStatus::Unauthorized);
        intruder.identity_id = None;
        intruder.device_info = Some(DeviceInfo {
            original_status: Some(AttendanceStatus::Unauthorized),
            ..Default::default()
        });
        r.apply_live(ticket, intruder);
        r.apply_history(ticket, vec![]);
        assert!(r.calendar().present_days.is_empty());
        assert!(r.calendar().absent_days.contains(&date(6)));
    }

    #[test]
    fn test_other_identity_records_are_ignored() {
        let mut r = reconciler(10);
        let ticket = r.select("ana");
        r.apply_live(ticket, record("b1", "bob", 6, 8, AttendanceStatus::Present));
        assert!(r.calendar().present_days.is_empty());
    }

    #[test]
    fn test_future_date_reports_no_data() {
        let mut r = reconciler(10);
        let ticket = r.select("ana");
        r.apply_history(ticket, march_history());
        r.select_date(date(20));
        assert_eq!(
            r.calendar().daily_detail,
            Some(DailyDetail::Badge(DayBadge::NoData))
        );
        assert_eq!(r.needs_day_history(), None);
    }

    #[test]
    fn test_daily_detail_prefers_live_records() {
        let mut r = reconciler(10);
        let ticket = r.select("ana");
        r.apply_history(ticket, march_history());
        r.select_date(date(6));
        assert_eq!(r.needs_day_history(), Some(date(6)));

        let live = record("l1", "ana", 6, 9, AttendanceStatus::Present);
        r.apply_live(ticket, live.clone());
        assert_eq!(r.calendar().daily_detail, Some(DailyDetail::Live(vec![live])));
        assert_eq!(r.needs_day_history(), None);
    }

    #[test]
    fn test_daily_detail_falls_back_to_day_history_then_badge() {
        let mut r = reconciler(10);
        let ticket = r.select("ana");
        r.apply_history(ticket, march_history());

        r.select_date(date(2));
        assert_eq!(
            r.calendar().daily_detail,
            Some(DailyDetail::Badge(DayBadge::Present))
        );
        let fetched = vec![
            record("h1b", "ana", 2, 17, AttendanceStatus::Present),
            record("h1", "ana", 2, 8, AttendanceStatus::Present),
        ];
        assert_eq!(r.apply_day_history(ticket, date(2), fetched), Applied::Merged);
        match &r.calendar().daily_detail {
            Some(DailyDetail::Historical(list)) => {
                let ids: Vec<&str> = list.iter().map(|x| x.id.as_str()).collect();
                assert_eq!(ids, vec!["h1", "h1b"]);
            }
            other => panic!("unexpected detail {other:?}"),
        }

        r.select_date(date(9));
        assert_eq!(
            r.calendar().daily_detail,
            Some(DailyDetail::Badge(DayBadge::Absent))
        );
    }

    #[test]
    fn test_forgotten_day_history_is_requested_again() {
        let mut r = reconciler(10);
        let ticket = r.select("ana");
        r.apply_history(ticket, march_history());
        r.select_date(date(2));
        assert_eq!(r.needs_day_history(), Some(date(2)));

        r.apply_day_history(ticket, date(2), vec![record("h1", "ana", 2, 8, AttendanceStatus::Present)]);
        assert_eq!(r.needs_day_history(), None);

        r.forget_day_history();
        assert_eq!(r.needs_day_history(), Some(date(2)));
        assert!(r.calendar().present_days.contains(&date(2)));
    }

    #[test]
    fn test_forgotten_day_is_refetched_over_live_list() {
        let mut r = reconciler(10);
        let ticket = r.select("ana");
        r.apply_history(ticket, vec![]);
        r.select_date(date(2));
        r.apply_live(ticket, record("l2", "ana", 2, 10, AttendanceStatus::Present));
        assert_eq!(r.needs_day_history(), None);

        r.forget_day_history();
        assert_eq!(r.needs_day_history(), Some(date(2)));
        r.apply_day_history(
            ticket,
            date(2),
            vec![
                record("l1", "ana", 2, 8, AttendanceStatus::Present),
                record("l2", "ana", 2, 10, AttendanceStatus::Present),
            ],
        );
        assert_eq!(r.needs_day_history(), None);
        match &r.calendar().daily_detail {
            Some(DailyDetail::Live(list)) => {
                let ids: Vec<&str> = list.iter().map(|r| r.id.as_str()).collect();
                assert_eq!(ids, vec!["l1", "l2"]);
            }
            other => panic!("unexpected detail {other:?}"),
        }
    }

    #[test]
    fn test_day_history_for_unselected_date_is_stale() {
        let mut r = reconciler(10);
        let ticket = r.select("ana");
        r.select_date(date(3));
        r.select_date(date(4));
        assert_eq!(r.apply_day_history(ticket, date(3), vec![]), Applied::Stale);
    }

    #[test]
    fn test_set_month_keeps_records() {
        let mut r = Reconciler::new(2026, 2, date(10), utc());
        let ticket = r.select("ana");
        r.apply_history(ticket, march_history());
        assert!(r.calendar().present_days.is_empty());
        r.set_month(2026, 3);
        assert_eq!(r.calendar().present_days.len(), 3);
        assert_eq!(r.calendar().working_days.len(), 22);
    }

    #[test]
    fn test_set_today_extends_absence() {
        let mut r = reconciler(5);
        let ticket = r.select("ana");
        r.apply_history(ticket, march_history());
        assert!(r.calendar().absent_days.is_empty());
        r.set_today(date(6));
        assert_eq!(r.calendar().absent_days, BTreeSet::from([date(6)]));
    }

    #[test]
    fn test_unselected_has_no_absence() {
        let r = reconciler(31);
        assert!(r.calendar().absent_days.is_empty());
        assert!(r.ticket().is_none());
    }
}
