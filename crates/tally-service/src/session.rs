//! Calendar session: one reconciler, its live subscription, and the
//! historical fetch policy.
//!
//! Live events are queued on a bounded channel tagged with the selection
//! ticket they were subscribed under and merged when the session pumps
//! them, so all merging happens on the caller's task. Switching identity
//! closes the old subscription first; anything still queued for it is
//! dropped as stale.
//!
//! Events lost on the way (the feed reported lag, or the queue was full)
//! mark the session for a resync: the month history, and the selected
//! day's list, are fetched again on the next [`CalendarSession::sync`] or
//! [`CalendarSession::next_event`].

use crate::retry::RetryPolicy;
use crate::service::ServiceError;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tally_core::calendar::{day_bounds, month_bounds};
use tally_core::{
    Applied, AttendanceRecord, CalendarState, ReconcileError, Reconciler, ReconcilerState,
    SelectionTicket,
};
use tally_store::{
    AttendanceQuery, FeedEvent, LiveFeed, RecordQuery, SubscriptionHandle, Topic,
};
use tokio::sync::mpsc;

type LiveDelivery = (SelectionTicket, AttendanceRecord);

pub struct CalendarSession<S> {
    store: Arc<S>,
    feed: LiveFeed,
    reconciler: Reconciler,
    retry: RetryPolicy,
    events_tx: mpsc::Sender<LiveDelivery>,
    events_rx: mpsc::Receiver<LiveDelivery>,
    /// Set by the subscription when live events were lost.
    missed: Arc<AtomicBool>,
    subscription: Option<SubscriptionHandle>,
}

impl<S: AttendanceQuery + 'static> CalendarSession<S> {
    /// `queue_capacity` bounds how many live events wait for a pump.
    pub fn new(
        store: Arc<S>,
        feed: LiveFeed,
        reconciler: Reconciler,
        retry: RetryPolicy,
        queue_capacity: usize,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            store,
            feed,
            reconciler,
            retry,
            events_tx,
            events_rx,
            missed: Arc::new(AtomicBool::new(false)),
            subscription: None,
        }
    }

    pub fn calendar(&self) -> &CalendarState {
        self.reconciler.calendar()
    }

    pub fn state(&self) -> ReconcilerState {
        self.reconciler.state()
    }

    pub fn identity(&self) -> Option<&str> {
        self.reconciler.identity()
    }

    /// Whether live events were lost since the last resync.
    pub fn needs_resync(&self) -> bool {
        self.missed.load(Ordering::SeqCst)
    }

    /// Select an identity: subscribe to its live events, then load its
    /// history for the visible month.
    ///
    /// A failed history fetch is returned, but the subscription stays open
    /// and [`refresh`](Self::refresh) can be called again.
    pub async fn select_identity(&mut self, identity_id: &str) -> Result<(), ServiceError> {
        self.close_subscription();
        let ticket = self.reconciler.select(identity_id);

        // A fresh flag per selection; losses under the old one no longer matter.
        self.missed = Arc::new(AtomicBool::new(false));
        let missed = self.missed.clone();
        let tx = self.events_tx.clone();
        self.subscription = Some(self.feed.subscribe(
            Topic::Identity(identity_id.to_string()),
            move |event| match event {
                FeedEvent::Record(record) => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send((ticket, record)) {
                        missed.store(true, Ordering::SeqCst);
                    }
                }
                FeedEvent::Lagged { .. } => missed.store(true, Ordering::SeqCst),
            },
        ));
        tracing::info!(identity = identity_id, "calendar session selected identity");

        self.refresh().await
    }

    /// Clear the selection and release the live subscription.
    pub fn clear(&mut self) {
        self.close_subscription();
        self.reconciler.clear();
        self.missed.store(false, Ordering::SeqCst);
        let dropped = self.pump();
        tracing::debug!(dropped, "calendar session cleared");
    }

    /// Re-run the historical fetch for the visible month.
    pub async fn refresh(&mut self) -> Result<(), ServiceError> {
        let ticket = self.reconciler.ticket().ok_or(ReconcileError::NoSelection)?;
        let identity = self
            .reconciler
            .identity()
            .ok_or(ReconcileError::NoSelection)?
            .to_string();
        let calendar = self.reconciler.calendar();
        let (start, end) = month_bounds(calendar.year, calendar.month, self.reconciler.offset())
            .ok_or_else(|| {
                ServiceError::Validation(format!("invalid month {}-{}", calendar.year, calendar.month))
            })?;
        let query = RecordQuery::for_identity(identity).between(start, end);

        let store = self.store.clone();
        let fetched = self
            .retry
            .run("month history", || store.query_records(query.clone()))
            .await;
        self.pump();

        match fetched {
            Ok(records) => {
                self.reconciler.apply_history(ticket, records);
                Ok(())
            }
            Err(e) => self.report_failure(ticket, e),
        }
    }

    /// Select a date; fetch its record list if live data does not cover it.
    pub async fn select_date(&mut self, date: NaiveDate) -> Result<(), ServiceError> {
        self.pump();
        self.reconciler.select_date(date);
        self.fetch_day_history().await
    }

    /// Show another month, loading its history when an identity is selected.
    pub async fn show_month(&mut self, year: i32, month: u32) -> Result<(), ServiceError> {
        self.reconciler.set_month(year, month);
        if self.reconciler.identity().is_some() {
            self.refresh().await?;
        }
        Ok(())
    }

    pub fn set_today(&mut self, today: NaiveDate) {
        self.reconciler.set_today(today);
    }

    /// Merge every queued live event without waiting. Returns how many were merged.
    ///
    /// Does not resync; see [`sync`](Self::sync).
    pub fn pump(&mut self) -> usize {
        let mut merged = 0;
        while let Ok((ticket, record)) = self.events_rx.try_recv() {
            if self.reconciler.apply_live(ticket, record) == Applied::Merged {
                merged += 1;
            }
        }
        merged
    }

    /// Merge queued live events, then re-read history if any were lost.
    /// Returns how many queued events were merged.
    pub async fn sync(&mut self) -> Result<usize, ServiceError> {
        let merged = self.pump();
        self.resync_if_needed().await?;
        Ok(merged)
    }

    /// Wait for the next live event and merge it, resyncing first if
    /// events were lost.
    pub async fn next_event(&mut self) -> Result<Option<Applied>, ServiceError> {
        if self.resync_if_needed().await? {
            return Ok(Some(Applied::Merged));
        }
        let Some((ticket, record)) = self.events_rx.recv().await else {
            return Ok(None);
        };
        let applied = self.reconciler.apply_live(ticket, record);
        self.resync_if_needed().await?;
        Ok(Some(applied))
    }

    async fn resync_if_needed(&mut self) -> Result<bool, ServiceError> {
        if self.reconciler.identity().is_none() || !self.missed.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        tracing::info!(
            identity = ?self.reconciler.identity(),
            "live events were lost; reloading history"
        );
        let result = self.reload().await;
        if result.is_err() {
            // Try again next time.
            self.missed.store(true, Ordering::SeqCst);
        }
        result.map(|()| true)
    }

    async fn reload(&mut self) -> Result<(), ServiceError> {
        self.refresh().await?;
        if self.reconciler.calendar().selected_date.is_some() {
            self.reconciler.forget_day_history();
        }
        self.fetch_day_history().await
    }

    async fn fetch_day_history(&mut self) -> Result<(), ServiceError> {
        let Some(date) = self.reconciler.needs_day_history() else {
            return Ok(());
        };
        let Some(ticket) = self.reconciler.ticket() else {
            return Ok(());
        };
        let identity = self
            .reconciler
            .identity()
            .ok_or(ReconcileError::NoSelection)?
            .to_string();
        let (start, end) = day_bounds(date, self.reconciler.offset());
        let query = RecordQuery::for_identity(identity).between(start, end);

        let store = self.store.clone();
        let fetched = self
            .retry
            .run("day history", || store.query_records(query.clone()))
            .await;
        self.pump();

        match fetched {
            Ok(records) => {
                self.reconciler.apply_day_history(ticket, date, records);
                Ok(())
            }
            Err(e) => self.report_failure(ticket, e),
        }
    }

    /// Hand a failed fetch to the reconciler. Failures of stale fetches are
    /// dropped; current ones come back as [`ReconcileError::FetchFailure`].
    fn report_failure(&mut self, ticket: SelectionTicket, error: ServiceError) -> Result<(), ServiceError> {
        match self.reconciler.fetch_failed(ticket, error.to_string()) {
            Ok(_) => Ok(()),
            Err(failure) => Err(failure.into()),
        }
    }

    fn close_subscription(&mut self) {
        if let Some(handle) = self.subscription.take() {
            handle.close();
        }
    }
}
