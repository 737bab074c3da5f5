use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_core::{
    AttendanceRecord, AttendanceStatus, CodecError, DeviceInfo, EnrolledIdentity, FaceDescriptor,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("employee id already enrolled: {0}")]
    DuplicateEmployee(String),
    #[error("device info serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("descriptor encoding: {0}")]
    Codec(#[from] CodecError),
}

/// An attendance event to append. The store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub identity_id: Option<String>,
    pub status: AttendanceStatus,
    pub confidence: Option<f32>,
    pub device_info: Option<DeviceInfo>,
}

/// Everything needed to enroll a person. Validated by the caller.
#[derive(Debug, Clone)]
pub struct NewRegistration {
    pub display_name: String,
    pub employee_id: String,
    pub department: String,
    pub position: String,
    pub descriptor: FaceDescriptor,
    /// Captured image bytes (already checked to be a known image format).
    pub image: Vec<u8>,
    pub image_format: String,
    pub device_info: Option<DeviceInfo>,
}

/// Whose records a query returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerFilter {
    /// Records whose owner resolves to this identity.
    Identity(String),
    /// Records with no owner at all (unauthorized attempts, anonymous rows).
    Unattributed,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub owner: OwnerFilter,
    /// Half-open `[start, end)` range.
    pub range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub order: Order,
    pub limit: Option<usize>,
}

impl RecordQuery {
    /// All records of one identity, oldest first.
    pub fn for_identity(identity_id: impl Into<String>) -> Self {
        Self {
            owner: OwnerFilter::Identity(identity_id.into()),
            range: None,
            order: Order::Ascending,
            limit: None,
        }
    }

    /// Latest `limit` records of anybody, newest first.
    pub fn recent(limit: usize) -> Self {
        Self {
            owner: OwnerFilter::Any,
            range: None,
            order: Order::Descending,
            limit: Some(limit),
        }
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn owner(mut self, owner: OwnerFilter) -> Self {
        self.owner = owner;
        self
    }
}

#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Every enrolled identity with a stored descriptor. Rows without one
    /// are skipped.
    async fn list_enrolled(&self) -> Result<Vec<EnrolledIdentity>, StoreError>;
}

#[async_trait]
pub trait IdentitySink: Send + Sync {
    /// Write the identity, its image and a `registered` attendance record
    /// atomically.
    async fn register(
        &self,
        registration: NewRegistration,
    ) -> Result<(EnrolledIdentity, AttendanceRecord), StoreError>;
}

#[async_trait]
pub trait AttendanceSink: Send + Sync {
    async fn record_attendance(&self, new: NewAttendance) -> Result<AttendanceRecord, StoreError>;
}

#[async_trait]
pub trait AttendanceQuery: Send + Sync {
    async fn query_records(&self, query: RecordQuery) -> Result<Vec<AttendanceRecord>, StoreError>;
}

/// The full persistence contract.
pub trait AttendanceStore: IdentitySource + IdentitySink + AttendanceSink + AttendanceQuery {}

impl<T> AttendanceStore for T where T: IdentitySource + IdentitySink + AttendanceSink + AttendanceQuery {}
