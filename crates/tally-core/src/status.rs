//! Status normalization between the domain enum and stored labels.
//!
//! Historical rows carry free-form status strings ("Present", "present
//! (late)", "LATE", ...). Reading folds them case-insensitively onto
//! [`AttendanceStatus`]. Writing maps onto the three labels the storage
//! schema accepts; an unauthorized attempt is stored as `present` with no
//! identity and `original_status = unauthorized` in its device info, which
//! reading restores.

use crate::types::{AttendanceRecord, AttendanceStatus, DeviceInfo};

/// Which calendar set a record contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayMark {
    Present,
    Late,
}

/// Fold a raw status string onto the domain enum.
///
/// Rules, checked in order on the lowercased string: contains `unauthor`,
/// contains `late`, contains `present`, contains `regist`. Anything else is
/// unrecognised.
pub fn parse_status(raw: &str) -> Option<AttendanceStatus> {
    let lower = raw.trim().to_lowercase();
    if lower.contains("unauthor") {
        Some(AttendanceStatus::Unauthorized)
    } else if lower.contains("late") {
        Some(AttendanceStatus::Late)
    } else if lower.contains("present") {
        Some(AttendanceStatus::Present)
    } else if lower.contains("regist") {
        Some(AttendanceStatus::Registered)
    } else {
        None
    }
}

/// The label written to storage for a domain status.
pub fn storage_label(status: AttendanceStatus) -> &'static str {
    match status {
        AttendanceStatus::Unauthorized | AttendanceStatus::Present => "present",
        AttendanceStatus::Late => "late",
        AttendanceStatus::Registered => "registered",
    }
}

/// Prepare a record's identity and device info for storage.
///
/// Unauthorized attempts lose any identity and get `original_status`
/// recorded so they can be told apart from true matches later.
pub fn prepare_for_storage(
    status: AttendanceStatus,
    identity_id: Option<String>,
    device_info: Option<DeviceInfo>,
) -> (&'static str, Option<String>, Option<DeviceInfo>) {
    if status != AttendanceStatus::Unauthorized {
        return (storage_label(status), identity_id, device_info);
    }
    let mut info = device_info.unwrap_or_default();
    info.original_status = Some(AttendanceStatus::Unauthorized);
    info.identity_ref = None;
    (storage_label(status), None, Some(info))
}

/// Rebuild the domain status of a stored row.
pub fn status_from_storage(
    raw: &str,
    identity_id: Option<&str>,
    device_info: Option<&DeviceInfo>,
) -> Option<AttendanceStatus> {
    let recorded_unauthorized = device_info
        .and_then(|info| info.original_status)
        .map(|s| s == AttendanceStatus::Unauthorized)
        .unwrap_or(false);
    if recorded_unauthorized && identity_id.is_none() {
        return Some(AttendanceStatus::Unauthorized);
    }
    parse_status(raw)
}

/// Calendar contribution of a record for the given identity.
///
/// Only present/late records owned by `identity_id` count.
pub fn day_mark(record: &AttendanceRecord, identity_id: &str) -> Option<DayMark> {
    if record.owner() != Some(identity_id) {
        return None;
    }
    match record.status {
        AttendanceStatus::Present => Some(DayMark::Present),
        AttendanceStatus::Late => Some(DayMark::Late),
        AttendanceStatus::Registered | AttendanceStatus::Unauthorized => None,
    }
}
