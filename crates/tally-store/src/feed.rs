//! Live attendance event feed.
//!
//! Committed records are broadcast to subscribers with no ordering
//! guarantee; consumers deduplicate by record id. A subscriber that falls
//! more than the feed capacity behind loses the oldest undelivered records
//! and is told so with [`FeedEvent::Lagged`]; it must re-read history to
//! recover them.

use tally_core::AttendanceRecord;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default number of undelivered events kept per subscriber.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// What a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Global,
    Identity(String),
}

impl Topic {
    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        match self {
            Topic::Global => true,
            Topic::Identity(id) => record.owner() == Some(id.as_str()),
        }
    }
}

/// What a subscription callback receives.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Record(AttendanceRecord),
    /// `missed` records were dropped before this subscriber saw them.
    /// Sent regardless of topic, since the dropped records are unknown.
    Lagged { missed: u64 },
}

/// Broadcast hub for committed attendance records. Cheap to clone.
#[derive(Clone)]
pub struct LiveFeed {
    sender: broadcast::Sender<AttendanceRecord>,
}

impl LiveFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a record. Returns how many subscribers will see it.
    pub fn publish(&self, record: AttendanceRecord) -> usize {
        // No subscribers is not an error.
        self.sender.send(record).unwrap_or(0)
    }

    /// Deliver every future record matching `topic` to `callback`, plus a
    /// [`FeedEvent::Lagged`] whenever records were lost to overflow.
    ///
    /// Must be called within a tokio runtime. Delivery stops when the
    /// returned handle is closed or dropped.
    pub fn subscribe<F>(&self, topic: Topic, mut callback: F) -> SubscriptionHandle
    where
        F: FnMut(FeedEvent) + Send + 'static,
    {
        let mut rx = self.sender.subscribe();
        let filter = topic.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => {
                        if filter.matches(&record) {
                            callback(FeedEvent::Record(record));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(topic = ?filter, missed, "live feed subscriber lagged");
                        callback(FeedEvent::Lagged { missed });
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!(topic = ?filter, "live feed closed");
                        break;
                    }
                }
            }
        });

        tracing::debug!(topic = ?topic, "live feed subscription opened");
        SubscriptionHandle {
            topic,
            task: Some(task),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LiveFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

/// A live subscription. `close()` ends it; dropping the handle does too.
pub struct SubscriptionHandle {
    topic: Topic,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(topic = ?self.topic, "live feed subscription closed");
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}
