//! SQLite-backed store.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text so range filters
//! can compare them as strings. Device info is stored as JSON text and
//! queried with the JSON1 functions bundled with SQLite.

use crate::feed::LiveFeed;
use crate::store::{
    AttendanceQuery, AttendanceSink, IdentitySink, IdentitySource, NewAttendance,
    NewRegistration, Order, OwnerFilter, RecordQuery, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, params_from_iter, ErrorCode};
use std::collections::HashSet;
use std::path::Path;
use tally_core::status::{prepare_for_storage, status_from_storage};
use tally_core::{codec, AttendanceRecord, AttendanceStatus, DeviceInfo, EnrolledIdentity};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    identity_id     TEXT PRIMARY KEY,
    display_name    TEXT NOT NULL,
    employee_id     TEXT NOT NULL UNIQUE,
    department      TEXT NOT NULL DEFAULT '',
    position        TEXT NOT NULL DEFAULT '',
    descriptor      TEXT,
    image_reference TEXT NOT NULL DEFAULT '',
    created_at      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS images (
    image_id   TEXT PRIMARY KEY,
    format     TEXT NOT NULL,
    data       BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance (
    id          TEXT PRIMARY KEY,
    identity_id TEXT,
    timestamp   TEXT NOT NULL,
    status      TEXT NOT NULL,
    confidence  REAL,
    device_info TEXT
);
CREATE INDEX IF NOT EXISTS attendance_identity_ts ON attendance (identity_id, timestamp);
CREATE INDEX IF NOT EXISTS attendance_ts ON attendance (timestamp);
";

/// Legacy owner reference, NULL when device info is absent or not valid JSON.
const IDENTITY_REF: &str =
    "(CASE WHEN json_valid(device_info) THEN json_extract(device_info, '$.identity_ref') END)";

const RECORD_COLUMNS: &str = "id, identity_id, timestamp, status, confidence, device_info";

/// Attendance row as read, before status normalization.
struct RawRecord {
    id: String,
    identity_id: Option<String>,
    timestamp: String,
    status: String,
    confidence: Option<f64>,
    device_info: Option<String>,
}

pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
    feed: Option<LiveFeed>,
}

impl SqliteStore {
    /// Open (and create if needed) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = tokio_rusqlite::Connection::open(&path).await?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::init(conn).await
    }

    /// In-memory database, used by tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn, feed: None })
    }

    /// Publish every committed attendance record on `feed`.
    pub fn with_feed(mut self, feed: LiveFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    fn publish(&self, record: &AttendanceRecord) {
        if let Some(feed) = &self.feed {
            let receivers = feed.publish(record.clone());
            tracing::trace!(record = %record.id, receivers, "published attendance record");
        }
    }
}

/// Current time at the precision timestamps are stored with.
fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn is_unique_violation(err: &tokio_rusqlite::Error) -> bool {
    matches!(
        err,
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::ConstraintViolation
    )
}

fn encode_device_info(info: Option<&DeviceInfo>) -> Result<Option<String>, StoreError> {
    info.map(serde_json::to_string).transpose().map_err(StoreError::from)
}

/// Turn a raw row into a record. Rows that cannot be interpreted are
/// logged and dropped rather than failing the whole query.
fn into_record(raw: RawRecord) -> Option<AttendanceRecord> {
    let timestamp = match DateTime::parse_from_rfc3339(&raw.timestamp) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(e) => {
            tracing::warn!(record = %raw.id, error = %e, "skipping record with bad timestamp");
            return None;
        }
    };

    let device_info = match raw.device_info.as_deref().map(serde_json::from_str::<DeviceInfo>) {
        None => None,
        Some(Ok(info)) => Some(info),
        Some(Err(e)) => {
            tracing::warn!(record = %raw.id, error = %e, "ignoring malformed device info");
            None
        }
    };

    let Some(status) =
        status_from_storage(&raw.status, raw.identity_id.as_deref(), device_info.as_ref())
    else {
        tracing::warn!(record = %raw.id, status = %raw.status, "skipping record with unknown status");
        return None;
    };

    Some(AttendanceRecord {
        id: raw.id,
        identity_id: raw.identity_id,
        timestamp,
        status,
        confidence: raw.confidence.map(|c| c as f32),
        device_info,
    })
}

fn select_records(
    conn: &rusqlite::Connection,
    owner_clause: &str,
    mut args: Vec<String>,
    range: Option<&(String, String)>,
    order: Order,
    limit: Option<usize>,
) -> rusqlite::Result<Vec<RawRecord>> {
    let mut sql = format!("SELECT {RECORD_COLUMNS} FROM attendance WHERE {owner_clause}");
    if let Some((start, end)) = range {
        sql.push_str(&format!(
            " AND timestamp >= ?{} AND timestamp < ?{}",
            args.len() + 1,
            args.len() + 2
        ));
        args.push(start.clone());
        args.push(end.clone());
    }
    sql.push_str(match order {
        Order::Ascending => " ORDER BY timestamp ASC, id ASC",
        Order::Descending => " ORDER BY timestamp DESC, id DESC",
    });
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params_from_iter(args.iter()), |row| {
            Ok(RawRecord {
                id: row.get(0)?,
                identity_id: row.get(1)?,
                timestamp: row.get(2)?,
                status: row.get(3)?,
                confidence: row.get(4)?,
                device_info: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<RawRecord>>>()?;
    Ok(records)
}

#[async_trait]
impl IdentitySource for SqliteStore {
    async fn list_enrolled(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        type Row = (String, String, String, String, String, Option<String>, String, String);

        let rows: Vec<Row> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity_id, display_name, employee_id, department, position,
                            descriptor, image_reference, created_at
                     FROM identities ORDER BY created_at ASC, identity_id ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<Row>>>()?;
                Ok(rows)
            })
            .await?;

        let mut enrolled = Vec::with_capacity(rows.len());
        for (identity_id, display_name, employee_id, department, position, descriptor, image_reference, created_at) in rows {
            let Some(descriptor) = descriptor.filter(|d| !d.trim().is_empty()) else {
                tracing::warn!(identity = %identity_id, "skipping identity without descriptor");
                continue;
            };
            let created_at = match DateTime::parse_from_rfc3339(&created_at) {
                Ok(ts) => ts.with_timezone(&Utc),
                Err(e) => {
                    tracing::warn!(identity = %identity_id, error = %e, "skipping identity with bad created_at");
                    continue;
                }
            };
            enrolled.push(EnrolledIdentity {
                identity_id,
                display_name,
                employee_id,
                department,
                position,
                descriptor,
                image_reference,
                created_at,
            });
        }
        Ok(enrolled)
    }
}

#[async_trait]
impl IdentitySink for SqliteStore {
    async fn register(
        &self,
        registration: NewRegistration,
    ) -> Result<(EnrolledIdentity, AttendanceRecord), StoreError> {
        let now = now_micros();
        let identity = EnrolledIdentity {
            identity_id: uuid::Uuid::new_v4().to_string(),
            display_name: registration.display_name.clone(),
            employee_id: registration.employee_id.clone(),
            department: registration.department.clone(),
            position: registration.position.clone(),
            descriptor: codec::encode(&registration.descriptor)?,
            image_reference: uuid::Uuid::new_v4().to_string(),
            created_at: now,
        };

        let mut info = registration.device_info.clone().unwrap_or_default();
        info.display_name = Some(identity.display_name.clone());
        info.descriptor = Some(identity.descriptor.clone());
        let record = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            identity_id: Some(identity.identity_id.clone()),
            timestamp: now,
            status: AttendanceStatus::Registered,
            confidence: None,
            device_info: Some(info),
        };
        let device_info = encode_device_info(record.device_info.as_ref())?;

        let row_identity = identity.clone();
        let row_record = record.clone();
        let image = registration.image;
        let image_format = registration.image_format;
        let result = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO images (image_id, format, data) VALUES (?1, ?2, ?3)",
                    params![row_identity.image_reference, image_format, image],
                )?;
                tx.execute(
                    "INSERT INTO identities (identity_id, display_name, employee_id, department,
                                             position, descriptor, image_reference, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        row_identity.identity_id,
                        row_identity.display_name,
                        row_identity.employee_id,
                        row_identity.department,
                        row_identity.position,
                        row_identity.descriptor,
                        row_identity.image_reference,
                        format_ts(&row_identity.created_at),
                    ],
                )?;
                tx.execute(
                    &format!("INSERT INTO attendance ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                    params![
                        row_record.id,
                        row_record.identity_id,
                        format_ts(&row_record.timestamp),
                        tally_core::status::storage_label(row_record.status),
                        Option::<f64>::None,
                        device_info,
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::DuplicateEmployee(identity.employee_id));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            identity = %identity.identity_id,
            employee = %identity.employee_id,
            dims = registration.descriptor.len(),
            "identity registered"
        );
        self.publish(&record);
        Ok((identity, record))
    }
}

#[async_trait]
impl AttendanceSink for SqliteStore {
    async fn record_attendance(&self, new: NewAttendance) -> Result<AttendanceRecord, StoreError> {
        let (label, identity_id, device_info) =
            prepare_for_storage(new.status, new.identity_id, new.device_info);
        let record = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            identity_id,
            timestamp: now_micros(),
            status: new.status,
            confidence: new.confidence.map(|c| c.clamp(0.0, 1.0)),
            device_info,
        };
        let device_info_json = encode_device_info(record.device_info.as_ref())?;

        let row = record.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!("INSERT INTO attendance ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                    params![
                        row.id,
                        row.identity_id,
                        format_ts(&row.timestamp),
                        label,
                        row.confidence.map(f64::from),
                        device_info_json,
                    ],
                )?;
                Ok(())
            })
            .await?;

        tracing::debug!(record = %record.id, status = %record.status, "attendance recorded");
        self.publish(&record);
        Ok(record)
    }
}

#[async_trait]
impl AttendanceQuery for SqliteStore {
    async fn query_records(&self, query: RecordQuery) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut fetch_limit = query.limit;
        loop {
            let (records, saturated) = self.fetch_records(&query, fetch_limit).await?;
            match (query.limit, fetch_limit) {
                // Rows dropped while decoding left the page short; read further back.
                (Some(wanted), Some(fetched)) if records.len() < wanted && saturated => {
                    fetch_limit = Some(fetched.saturating_mul(2).max(wanted + 1));
                }
                (Some(wanted), _) => {
                    let mut records = records;
                    records.truncate(wanted);
                    return Ok(records);
                }
                (None, _) => return Ok(records),
            }
        }
    }
}

impl SqliteStore {
    /// One pass of `query` with at most `fetch_limit` rows per select.
    ///
    /// Returns the decoded, owner-filtered and sorted records, and whether
    /// any select hit the row limit (older rows may exist).
    async fn fetch_records(
        &self,
        query: &RecordQuery,
        fetch_limit: Option<usize>,
    ) -> Result<(Vec<AttendanceRecord>, bool), StoreError> {
        let range = query
            .range
            .as_ref()
            .map(|(start, end)| (format_ts(start), format_ts(end)));
        let order = query.order;
        let owner = query.owner.clone();

        let (raw, saturated) = self
            .conn
            .call(move |conn| {
                let full = |rows: &Vec<RawRecord>| fetch_limit.is_some_and(|l| rows.len() >= l);
                let result = match &owner {
                    OwnerFilter::Any => {
                        let rows = select_records(conn, "1 = 1", vec![], range.as_ref(), order, fetch_limit)?;
                        let saturated = full(&rows);
                        (rows, saturated)
                    }
                    OwnerFilter::Unattributed => {
                        let rows = select_records(
                            conn,
                            &format!("identity_id IS NULL AND {IDENTITY_REF} IS NULL"),
                            vec![],
                            range.as_ref(),
                            order,
                            fetch_limit,
                        )?;
                        let saturated = full(&rows);
                        (rows, saturated)
                    }
                    OwnerFilter::Identity(id) => {
                        // Owner is `identity_id`, or the legacy reference when that is empty.
                        let mut rows = select_records(
                            conn,
                            "identity_id = ?1",
                            vec![id.clone()],
                            range.as_ref(),
                            order,
                            fetch_limit,
                        )?;
                        let legacy = select_records(
                            conn,
                            &format!("identity_id IS NULL AND {IDENTITY_REF} = ?1"),
                            vec![id.clone()],
                            range.as_ref(),
                            order,
                            fetch_limit,
                        )?;
                        let saturated = full(&rows) || full(&legacy);
                        rows.extend(legacy);
                        (rows, saturated)
                    }
                };
                Ok(result)
            })
            .await?;

        let mut seen = HashSet::new();
        let mut records: Vec<AttendanceRecord> = raw
            .into_iter()
            .filter(|r| seen.insert(r.id.clone()))
            .filter_map(into_record)
            .filter(|r| match &query.owner {
                OwnerFilter::Identity(id) => r.owner() == Some(id.as_str()),
                OwnerFilter::Unattributed => r.owner().is_none(),
                OwnerFilter::Any => true,
            })
            .collect();

        match order {
            Order::Ascending => records.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id))),
            Order::Descending => records.sort_by(|a, b| (b.timestamp, &b.id).cmp(&(a.timestamp, &a.id))),
        }
        Ok((records, saturated))
    }
}
