//! tally-core — Face descriptor matching and attendance reconciliation.
//!
//! Pure domain logic: the descriptor string codec, nearest-neighbour
//! matching against enrolled identities, status normalization, and the
//! reconciler that folds live and historical attendance records into a
//! per-month calendar.

pub mod calendar;
pub mod codec;
pub mod matcher;
pub mod reconciler;
pub mod status;
pub mod types;

pub use calendar::{working_days, CalendarState, DailyDetail, DayBadge};
pub use codec::CodecError;
pub use matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use reconciler::{Applied, ReconcileError, Reconciler, ReconcilerState, SelectionTicket};
pub use types::{
    AttendanceRecord, AttendanceStatus, DescriptorError, DeviceInfo, EnrolledIdentity,
    FaceDescriptor, MatchResult,
};
