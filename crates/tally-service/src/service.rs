use crate::config::{Config, ConfigError};
use crate::retry::RetryPolicy;
use crate::session::CalendarSession;
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{
    AttendanceRecord, AttendanceStatus, DeviceInfo, EnrolledIdentity, EuclideanMatcher,
    FaceDescriptor, MatchResult, Matcher, ReconcileError, Reconciler,
};
use tally_store::{
    AttendanceQuery, AttendanceSink, AttendanceStore, IdentitySink, IdentitySource, LiveFeed,
    NewAttendance, NewRegistration, RecordQuery, StoreError,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("historical fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("matcher task failed: {0}")]
    Worker(String),
}

/// A registration as submitted by the capture front end.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub display_name: String,
    pub employee_id: String,
    pub department: String,
    pub position: String,
    pub descriptor: Vec<f32>,
    /// Captured face image (PNG, JPEG or WebP bytes).
    pub image: Vec<u8>,
    pub device_info: Option<DeviceInfo>,
}

/// Outcome of a recognition attempt.
///
/// `Unrecognized` is a normal result, not an error.
#[derive(Debug, Clone)]
pub enum Recognition {
    Recognized {
        result: MatchResult,
        record: AttendanceRecord,
    },
    Unrecognized {
        result: MatchResult,
        /// The unauthorized attempt, when such attempts are recorded.
        record: Option<AttendanceRecord>,
    },
}

impl Recognition {
    pub fn result(&self) -> &MatchResult {
        match self {
            Self::Recognized { result, .. } | Self::Unrecognized { result, .. } => result,
        }
    }

    pub fn is_recognized(&self) -> bool {
        matches!(self, Self::Recognized { .. })
    }
}

/// Present or late depending on the local time of the check-in.
pub fn check_in_status(at: DateTime<Utc>, offset: &FixedOffset, late_after: NaiveTime) -> AttendanceStatus {
    if at.with_timezone(offset).time() > late_after {
        AttendanceStatus::Late
    } else {
        AttendanceStatus::Present
    }
}

fn require(field: &str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::Validation(format!("{field} is required")));
    }
    Ok(())
}

fn parse_descriptor(values: Vec<f32>) -> Result<FaceDescriptor, ServiceError> {
    FaceDescriptor::new(values).map_err(|e| ServiceError::Validation(format!("face descriptor: {e}")))
}

/// Check that `bytes` is a readable image with a non-zero size; returns its format name.
fn validate_image(bytes: &[u8]) -> Result<String, ServiceError> {
    if bytes.is_empty() {
        return Err(ServiceError::Validation("captured image is empty".into()));
    }
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ServiceError::Validation(format!("captured image: {e}")))?;
    let format = reader
        .format()
        .ok_or_else(|| ServiceError::Validation("captured image has an unknown format".into()))?;
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| ServiceError::Validation(format!("captured image: {e}")))?;
    if width == 0 || height == 0 {
        return Err(ServiceError::Validation("captured image has no pixels".into()));
    }
    Ok(format
        .extensions_str()
        .first()
        .copied()
        .unwrap_or("bin")
        .to_string())
}

/// Attendance operations over a store.
pub struct AttendanceService<S> {
    store: Arc<S>,
    config: Config,
    offset: FixedOffset,
}

impl<S: AttendanceStore + 'static> AttendanceService<S> {
    pub fn new(store: Arc<S>, config: Config) -> Result<Self, ServiceError> {
        let offset = config.offset()?;
        Ok(Self {
            store,
            config,
            offset,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Enroll a person. Either everything is written or nothing is.
    pub async fn register(
        &self,
        request: RegistrationRequest,
    ) -> Result<(EnrolledIdentity, AttendanceRecord), ServiceError> {
        require("display name", &request.display_name)?;
        require("employee id", &request.employee_id)?;
        let descriptor = parse_descriptor(request.descriptor)?;
        let image_format = validate_image(&request.image)?;

        let registration = NewRegistration {
            display_name: request.display_name.trim().to_string(),
            employee_id: request.employee_id.trim().to_string(),
            department: request.department.trim().to_string(),
            position: request.position.trim().to_string(),
            descriptor,
            image: request.image,
            image_format,
            device_info: request.device_info,
        };
        Ok(self.store.register(registration).await?)
    }

    /// Match a sample against every enrolled identity and record the outcome.
    pub async fn recognize_and_record(
        &self,
        sample: Vec<f32>,
        device_info: Option<DeviceInfo>,
    ) -> Result<Recognition, ServiceError> {
        let sample = parse_descriptor(sample)?;
        let gallery = self.store.list_enrolled().await?;
        let threshold = self.config.match_threshold;
        tracing::debug!(candidates = gallery.len(), dims = sample.len(), "matching sample");

        let result = tokio::task::spawn_blocking(move || {
            EuclideanMatcher.compare(&sample, &gallery, threshold)
        })
        .await
        .map_err(|e| ServiceError::Worker(e.to_string()))?;

        if result.recognized {
            let status = check_in_status(Utc::now(), &self.offset, self.config.late_after);
            let mut info = device_info.unwrap_or_default();
            info.display_name = result.display_name.clone();
            let record = self
                .store
                .record_attendance(NewAttendance {
                    identity_id: result.identity_id.clone(),
                    status,
                    confidence: result.confidence,
                    device_info: Some(info),
                })
                .await?;
            tracing::info!(
                identity = ?result.identity_id,
                distance = ?result.distance,
                status = %status,
                "attendance recorded"
            );
            return Ok(Recognition::Recognized { result, record });
        }

        tracing::info!(distance = ?result.distance, skipped = result.skipped, "face not recognized");
        let record = if self.config.record_unauthorized {
            Some(
                self.store
                    .record_attendance(NewAttendance {
                        identity_id: None,
                        status: AttendanceStatus::Unauthorized,
                        confidence: None,
                        device_info,
                    })
                    .await?,
            )
        } else {
            None
        };
        Ok(Recognition::Unrecognized { result, record })
    }

    pub async fn enrolled(&self) -> Result<Vec<EnrolledIdentity>, ServiceError> {
        Ok(self.store.list_enrolled().await?)
    }

    /// Latest records of anybody, newest first.
    pub async fn recent_activity(&self, limit: usize) -> Result<Vec<AttendanceRecord>, ServiceError> {
        Ok(self.store.query_records(RecordQuery::recent(limit)).await?)
    }

    /// A calendar session showing the current month, fed by `feed`.
    pub fn calendar_session(&self, feed: LiveFeed) -> CalendarSession<S> {
        let today = Utc::now().with_timezone(&self.offset).date_naive();
        let reconciler = Reconciler::new(today.year(), today.month(), today, self.offset)
            .with_non_working(self.config.non_working_days.clone());
        CalendarSession::new(
            self.store.clone(),
            feed,
            reconciler,
            self.retry_policy(),
            self.config.feed_capacity,
        )
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config.retry_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tally_core::codec;
    use tally_store::SqliteStore;

    fn png() -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(4, 4));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn request(employee_id: &str, descriptor: Vec<f32>) -> RegistrationRequest {
        RegistrationRequest {
            display_name: format!("Person {employee_id}"),
            employee_id: employee_id.into(),
            department: "Ops".into(),
            position: "Analyst".into(),
            descriptor,
            image: png(),
            device_info: None,
        }
    }

    async fn service() -> AttendanceService<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        AttendanceService::new(store, Config::default()).unwrap()
    }

    #[test]
    fn test_check_in_status_uses_local_time() {
        let late_after = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let utc = FixedOffset::east_opt(0).unwrap();
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        assert_eq!(check_in_status(at, &utc, late_after), AttendanceStatus::Present);
        assert_eq!(check_in_status(at, &plus_two, late_after), AttendanceStatus::Late);
    }

    #[tokio::test]
    async fn test_register_validates_fields() {
        let svc = service().await;

        let mut missing_name = request("E1", vec![0.1, 0.2]);
        missing_name.display_name = "  ".into();
        assert!(matches!(svc.register(missing_name).await, Err(ServiceError::Validation(_))));

        let mut no_image = request("E1", vec![0.1, 0.2]);
        no_image.image.clear();
        assert!(matches!(svc.register(no_image).await, Err(ServiceError::Validation(_))));

        let mut junk_image = request("E1", vec![0.1, 0.2]);
        junk_image.image = b"definitely not an image".to_vec();
        assert!(matches!(svc.register(junk_image).await, Err(ServiceError::Validation(_))));

        let empty_descriptor = request("E1", vec![]);
        assert!(matches!(svc.register(empty_descriptor).await, Err(ServiceError::Validation(_))));

        assert!(svc.enrolled().await.unwrap().is_empty());
        assert!(svc.recent_activity(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_then_recognize() {
        let svc = service().await;
        let values = vec![0.12, -0.3, 0.44, 0.05];
        let (identity, registered) = svc.register(request("E1", values.clone())).await.unwrap();
        assert_eq!(registered.status, AttendanceStatus::Registered);
        assert_eq!(codec::decode(&identity.descriptor).unwrap().values(), values.as_slice());

        let outcome = svc.recognize_and_record(values, None).await.unwrap();
        let Recognition::Recognized { result, record } = outcome else {
            panic!("expected a match");
        };
        assert!((result.confidence.unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(record.identity_id.as_deref(), Some(identity.identity_id.as_str()));
        assert!(matches!(record.status, AttendanceStatus::Present | AttendanceStatus::Late));
        assert_eq!(record.display_name(), Some("Person E1"));
    }

    #[tokio::test]
    async fn test_unrecognized_records_unauthorized_attempt() {
        let svc = service().await;
        svc.register(request("E1", vec![0.0, 0.0])).await.unwrap();

        let outcome = svc.recognize_and_record(vec![5.0, 5.0], None).await.unwrap();
        assert!(!outcome.is_recognized());
        let Recognition::Unrecognized { record: Some(record), .. } = outcome else {
            panic!("expected an unauthorized record");
        };
        assert_eq!(record.status, AttendanceStatus::Unauthorized);
        assert_eq!(record.identity_id, None);
        assert_eq!(record.owner(), None);
    }

    #[tokio::test]
    async fn test_empty_gallery_is_not_an_error() {
        let mut config = Config::default();
        config.record_unauthorized = false;
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let svc = AttendanceService::new(store, config).unwrap();

        let outcome = svc.recognize_and_record(vec![0.1, 0.2], None).await.unwrap();
        assert!(matches!(outcome, Recognition::Unrecognized { record: None, .. }));
        assert_eq!(outcome.result().distance, None);
    }

    #[tokio::test]
    async fn test_invalid_sample_is_validation_error() {
        let svc = service().await;
        let err = svc.recognize_and_record(vec![f32::NAN], None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
}
