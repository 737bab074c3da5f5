use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor dimensions differ: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("descriptor has no components")]
    Empty,
    #[error("descriptor component {index} is not finite")]
    NonFinite { index: usize },
}

/// Face descriptor produced by an external recognition model
/// (128-dimensional for the browser face-api models).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FaceDescriptor {
    values: Vec<f32>,
}

impl FaceDescriptor {
    /// Build a descriptor, rejecting empty vectors and NaN/infinite components.
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance to another descriptor of the same length.
    pub fn euclidean_distance(&self, other: &FaceDescriptor) -> Result<f32, DescriptorError> {
        if self.len() != other.len() {
            return Err(DescriptorError::DimensionMismatch {
                left: self.len(),
                right: other.len(),
            });
        }
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

impl<'de> Deserialize<'de> for FaceDescriptor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<f32>::deserialize(deserializer)?;
        FaceDescriptor::new(values).map_err(serde::de::Error::custom)
    }
}

/// A registered person, as loaded from persistence.
///
/// The descriptor is kept in its stored string form; it is decoded lazily
/// by the matcher so one bad row cannot fail a whole listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub identity_id: String,
    pub display_name: String,
    pub employee_id: String,
    pub department: String,
    pub position: String,
    pub descriptor: String,
    pub image_reference: String,
    pub created_at: DateTime<Utc>,
}

/// Attendance status as understood by the domain.
///
/// The storage schema only distinguishes `present`, `late` and `registered`;
/// see [`crate::status`] for how `Unauthorized` is written and read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Registered,
    Present,
    Late,
    Unauthorized,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Present => "present",
            Self::Late => "late",
            Self::Unauthorized => "unauthorized",
        }
    }
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capture metadata attached to an attendance record.
///
/// Keys the application does not know about are preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Denormalized name of the recognized or registered person.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Legacy owner reference, consulted when `identity_id` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_ref: Option<String>,
    /// Encoded descriptor, only present on registration records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
    /// Status before storage normalization, when it differs from the stored label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_status: Option<AttendanceStatus>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One attendance event. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub identity_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: AttendanceStatus,
    pub confidence: Option<f32>,
    pub device_info: Option<DeviceInfo>,
}

impl AttendanceRecord {
    /// The identity this record belongs to: `identity_id` first, then the
    /// legacy `device_info.identity_ref`. Unauthorized attempts have no owner.
    pub fn owner(&self) -> Option<&str> {
        if self.status == AttendanceStatus::Unauthorized {
            return None;
        }
        self.identity_id.as_deref().or_else(|| {
            self.device_info
                .as_ref()
                .and_then(|info| info.identity_ref.as_deref())
        })
    }

    /// Calendar date of the record in the given offset (time of day dropped).
    pub fn local_date(&self, offset: &FixedOffset) -> NaiveDate {
        self.timestamp.with_timezone(offset).date_naive()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.device_info
            .as_ref()
            .and_then(|info| info.display_name.as_deref())
    }
}

/// Result of matching a sample descriptor against enrolled identities.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub recognized: bool,
    /// Smallest distance seen across comparable candidates, if any.
    pub distance: Option<f32>,
    /// `1 - distance` when recognized.
    pub confidence: Option<f32>,
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    /// Candidates skipped for an undecodable or differently sized descriptor.
    pub skipped: usize,
}

impl MatchResult {
    pub fn unrecognized(distance: Option<f32>, skipped: usize) -> Self {
        Self {
            recognized: false,
            distance,
            confidence: None,
            identity_id: None,
            display_name: None,
            skipped,
        }
    }
}
