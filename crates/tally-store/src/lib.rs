//! tally-store — Persistence contract and live event feed.
//!
//! The traits in [`store`] are the only way the service layer reaches
//! storage. [`sqlite::SqliteStore`] implements them on SQLite and publishes
//! every committed attendance record on a [`feed::LiveFeed`].

pub mod feed;
pub mod sqlite;
pub mod store;

pub use feed::{FeedEvent, LiveFeed, SubscriptionHandle, Topic};
pub use sqlite::SqliteStore;
pub use store::{
    AttendanceQuery, AttendanceSink, AttendanceStore, IdentitySink, IdentitySource, NewAttendance,
    NewRegistration, Order, OwnerFilter, RecordQuery, StoreError,
};
