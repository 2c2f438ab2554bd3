//! The flow database: a per-session, tiered-body-storage SQLite store for
//! observed flows, with background maintenance and streaming export.
//!
//! Connections are thread-local, one per OS thread per database path; a
//! single write lock serializes mutating statements (including `VACUUM`),
//! and a separate cleanup lock keeps maintenance passes from overlapping
//! each other without blocking readers.

mod body;
mod export;
mod maintenance;

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use self::body::{tier_body, BodyPlacement};
use crate::config::DbConfig;
use crate::flow::clock::now_secs;

pub use export::ExportFormat;
pub use maintenance::spawn_maintenance_thread;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database is locked")]
    Locked,
    #[error("database is busy")]
    Busy,
    #[error("database file is malformed")]
    Malformed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl DbError {
    fn from_sqlite(err: rusqlite::Error) -> Self {
        match classify(&err) {
            Some(classified) => classified,
            None => DbError::Sqlite(err),
        }
    }
}

fn classify(err: &rusqlite::Error) -> Option<DbError> {
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = err {
        return match ffi_err.code {
            rusqlite::ErrorCode::DatabaseLocked => Some(DbError::Locked),
            rusqlite::ErrorCode::DatabaseBusy => Some(DbError::Busy),
            rusqlite::ErrorCode::NotADatabase | rusqlite::ErrorCode::DatabaseCorrupt => {
                Some(DbError::Malformed)
            }
            _ => None,
        };
    }
    None
}

fn is_retryable(err: &rusqlite::Error) -> bool {
    matches!(
        classify(err),
        Some(DbError::Locked) | Some(DbError::Busy) | Some(DbError::Malformed)
    )
}

/// A session's flow grouped record, as the control channel and storage
/// layer both need it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub flow_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// The fully assembled record a caller (the traffic monitor / core addon)
/// hands to `store_flow`: index columns, the serialized detail (with bodies
/// still raw — tiering happens inside the store call), and the raw bodies
/// themselves.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub id: String,
    pub session_id: String,
    pub msg_ts: f64,
    pub host: String,
    pub method: String,
    pub status: i64,
    pub hits: serde_json::Value,
    pub detail: serde_json::Value,
    pub request_body: Vec<u8>,
    pub response_body: Option<Vec<u8>>,
}

/// An operator notification enqueued by background maintenance and drained
/// by the poll endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "titleKey")]
    pub title_key: String,
    #[serde(rename = "messageKey")]
    pub message_key: String,
    pub params: serde_json::Value,
    #[serde(rename = "type")]
    pub notif_type: String,
    pub priority: String,
    pub ts: f64,
}

thread_local! {
    static CONNECTIONS: RefCell<HashMap<PathBuf, Connection>> = RefCell::new(HashMap::new());
}

fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    for pragma in schema::PRAGMAS {
        conn.execute_batch(pragma)?;
    }
    conn.execute_batch(schema::CREATE_TABLES)?;
    Ok(conn)
}

mod schema;

/// The flow database handle. Cheap to clone-by-reference (wrap in `Arc`);
/// holds only paths, tuning knobs, and the write/cleanup locks — the actual
/// SQLite connections live in thread-local storage.
pub struct FlowDb {
    path: PathBuf,
    body_dir: PathBuf,
    config: DbConfig,
    write_lock: Mutex<()>,
    cleanup_lock: Mutex<()>,
    last_write: Mutex<Instant>,
    notifications: Mutex<std::collections::VecDeque<Notification>>,
}

impl FlowDb {
    pub fn open(data_dir: impl Into<PathBuf>, config: DbConfig) -> Result<Self, DbError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let path = data_dir.join("flows.sqlite3");
        let body_dir = data_dir.join("bodies");
        std::fs::create_dir_all(&body_dir)?;

        let db = Self {
            path,
            body_dir,
            config,
            write_lock: Mutex::new(()),
            cleanup_lock: Mutex::new(()),
            last_write: Mutex::new(Instant::now()),
            notifications: Mutex::new(std::collections::VecDeque::new()),
        };
        // Touch a connection up front so schema creation happens eagerly
        // rather than on the first caller.
        db.with_connection(|_conn| Ok(()))?;
        db.ensure_default_session()?;
        Ok(db)
    }

    fn ensure_default_session(&self) -> Result<(), DbError> {
        let exists: Option<i64> = self.with_connection(|conn| {
            conn.query_row("SELECT 1 FROM sessions LIMIT 1", [], |row| row.get(0))
                .optional()
        })?;
        if exists.is_none() {
            self.create_session("default")?;
        }
        Ok(())
    }

    /// Run `f` against this database's thread-local connection, retrying up
    /// to three times with linear backoff on a transient locked/busy/
    /// malformed error, reconnecting before each retry.
    fn with_connection<T>(&self, f: impl Fn(&mut Connection) -> rusqlite::Result<T>) -> Result<T, DbError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let path = self.path.clone();
            let outcome: rusqlite::Result<T> = CONNECTIONS.with(|cell| {
                let mut map = cell.borrow_mut();
                let conn = match map.get_mut(&path) {
                    Some(conn) => conn,
                    None => {
                        let conn = open_connection(&path)?;
                        map.insert(path.clone(), conn);
                        map.get_mut(&path).expect("just inserted")
                    }
                };
                f(conn)
            });
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if attempt < 3 && is_retryable(&err) => {
                    CONNECTIONS.with(|cell| {
                        cell.borrow_mut().remove(&path);
                    });
                    std::thread::sleep(Duration::from_millis(100 * attempt as u64));
                    continue;
                }
                Err(err) => return Err(DbError::from_sqlite(err)),
            }
        }
    }

    fn mark_write(&self) {
        *self.last_write.lock() = Instant::now();
    }

    fn write_idle_for(&self) -> Duration {
        self.last_write.lock().elapsed()
    }

    pub fn enqueue_notification(&self, notification: Notification) {
        let mut queue = self.notifications.lock();
        queue.push_back(notification);
    }

    /// Drain up to 50 queued notifications for the poll endpoint.
    pub fn drain_notifications(&self) -> Vec<Notification> {
        let mut queue = self.notifications.lock();
        let n = queue.len().min(50);
        queue.drain(..n).collect()
    }

    // ---- writes ----------------------------------------------------

    /// Persist one flow across `flow_indices`/`flow_details`/`flow_bodies`
    /// in a single transaction, tiering both bodies first.
    pub fn store_flow(&self, record: &FlowRecord, suppress_timestamp_update: bool) -> Result<(), DbError> {
        let _guard = self.write_lock.lock();
        let start = Instant::now();

        let req_tier = tier_body(&record.request_body, &self.body_dir, &record.session_id, &record.id, 'r')?;
        let resp_tier = match &record.response_body {
            Some(body) => Some(tier_body(body, &self.body_dir, &record.session_id, &record.id, 's')?),
            None => None,
        };

        let mut detail = record.detail.clone();
        patch_body_placeholder(&mut detail, "requestBody", &req_tier);
        if let Some(tier) = &resp_tier {
            patch_body_placeholder(&mut detail, "responseBody", tier);
        }

        let detail_json = serde_json::to_string(&detail).unwrap_or_default();
        let hits_json = serde_json::to_string(&record.hits).unwrap_or_default();
        let now = chrono::Utc::now().to_rfc3339();

        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO flow_indices (id, session_id, msg_ts, host, method, status, hits)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.id, record.session_id, record.msg_ts, record.host, record.method, record.status, hits_json
                ],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO flow_details (id, session_id, detail) VALUES (?1, ?2, ?3)",
                rusqlite::params![record.id, record.session_id, detail_json],
            )?;
            tx.execute(
                "DELETE FROM flow_bodies WHERE flow_id = ?1",
                rusqlite::params![record.id],
            )?;
            if let Some(blob) = &req_tier.compressed {
                tx.execute(
                    "INSERT INTO flow_bodies (flow_id, side, data) VALUES (?1, 'r', ?2)",
                    rusqlite::params![record.id, blob],
                )?;
            }
            if let Some(resp) = &resp_tier {
                if let Some(blob) = &resp.compressed {
                    tx.execute(
                        "INSERT INTO flow_bodies (flow_id, side, data) VALUES (?1, 's', ?2)",
                        rusqlite::params![record.id, blob],
                    )?;
                }
            }
            if !suppress_timestamp_update {
                tx.execute(
                    "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, record.session_id],
                )?;
            }
            tx.commit()
        })?;

        self.mark_write();
        let elapsed = start.elapsed();
        if elapsed > Duration::from_millis(200) {
            tracing::warn!(flow_id = %record.id, ms = elapsed.as_millis(), "slow flow store");
        }
        Ok(())
    }

    /// Pre-tier every body outside the write lock, then commit in batches of
    /// `batch_size` (default 500), updating session timestamps once at the
    /// end.
    pub fn store_flows_batch(&self, records: &[FlowRecord], batch_size: usize) -> Result<(), DbError> {
        let batch_size = if batch_size == 0 { 500 } else { batch_size };
        let mut touched_sessions: Vec<String> = Vec::new();

        for chunk in records.chunks(batch_size) {
            let _guard = self.write_lock.lock();
            self.with_connection(|conn| {
                let tx = conn.transaction()?;
                for record in chunk {
                    let req_tier = tier_body(&record.request_body, &self.body_dir, &record.session_id, &record.id, 'r')
                        .map_err(|_| rusqlite::Error::InvalidQuery)?;
                    let resp_tier = match &record.response_body {
                        Some(body) => Some(
                            tier_body(body, &self.body_dir, &record.session_id, &record.id, 's')
                                .map_err(|_| rusqlite::Error::InvalidQuery)?,
                        ),
                        None => None,
                    };
                    let mut detail = record.detail.clone();
                    patch_body_placeholder(&mut detail, "requestBody", &req_tier);
                    if let Some(tier) = &resp_tier {
                        patch_body_placeholder(&mut detail, "responseBody", tier);
                    }
                    let detail_json = serde_json::to_string(&detail).unwrap_or_default();
                    let hits_json = serde_json::to_string(&record.hits).unwrap_or_default();

                    tx.execute(
                        "INSERT OR REPLACE INTO flow_indices (id, session_id, msg_ts, host, method, status, hits)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        rusqlite::params![
                            record.id, record.session_id, record.msg_ts, record.host, record.method, record.status, hits_json
                        ],
                    )?;
                    tx.execute(
                        "INSERT OR REPLACE INTO flow_details (id, session_id, detail) VALUES (?1, ?2, ?3)",
                        rusqlite::params![record.id, record.session_id, detail_json],
                    )?;
                    tx.execute("DELETE FROM flow_bodies WHERE flow_id = ?1", rusqlite::params![record.id])?;
                    if let Some(blob) = &req_tier.compressed {
                        tx.execute(
                            "INSERT INTO flow_bodies (flow_id, side, data) VALUES (?1, 'r', ?2)",
                            rusqlite::params![record.id, blob],
                        )?;
                    }
                    if let Some(resp) = &resp_tier {
                        if let Some(blob) = &resp.compressed {
                            tx.execute(
                                "INSERT INTO flow_bodies (flow_id, side, data) VALUES (?1, 's', ?2)",
                                rusqlite::params![record.id, blob],
                            )?;
                        }
                    }
                }
                tx.commit()
            })?;
            self.mark_write();
            for record in chunk {
                if !touched_sessions.contains(&record.session_id) {
                    touched_sessions.push(record.session_id.clone());
                }
            }
        }

        if !touched_sessions.is_empty() {
            let now = chrono::Utc::now().to_rfc3339();
            let _guard = self.write_lock.lock();
            self.with_connection(|conn| {
                let tx = conn.transaction()?;
                for session_id in &touched_sessions {
                    tx.execute(
                        "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                        rusqlite::params![now, session_id],
                    )?;
                }
                tx.commit()
            })?;
        }
        Ok(())
    }

    // ---- reads -----------------------------------------------------

    /// Lightweight index rows for `session_id` with `msg_ts > since`, ordered
    /// ascending.
    pub fn get_indices(&self, session_id: &str, since: f64, limit: Option<u64>) -> Result<Vec<FlowIndexRow>, DbError> {
        self.with_connection(|conn| {
            let sql = match limit {
                Some(_) => {
                    "SELECT id, msg_ts, host, method, status, hits FROM flow_indices \
                     WHERE session_id = ?1 AND msg_ts > ?2 ORDER BY msg_ts ASC LIMIT ?3"
                }
                None => {
                    "SELECT id, msg_ts, host, method, status, hits FROM flow_indices \
                     WHERE session_id = ?1 AND msg_ts > ?2 ORDER BY msg_ts ASC"
                }
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = if let Some(limit) = limit {
                stmt.query_map(rusqlite::params![session_id, since, limit as i64], row_to_index)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            } else {
                stmt.query_map(rusqlite::params![session_id, since], row_to_index)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            Ok(rows)
        })
    }

    /// Full detail for one flow, with any compressed/file-backed bodies
    /// restored back into the JSON in place of their placeholders.
    pub fn get_detail(&self, flow_id: &str) -> Result<Option<serde_json::Value>, DbError> {
        let (session_id, detail_json) = match self.with_connection(|conn| {
            conn.query_row(
                "SELECT session_id, detail FROM flow_details WHERE id = ?1",
                rusqlite::params![flow_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
        })? {
            Some(row) => row,
            None => return Ok(None),
        };

        let mut detail: serde_json::Value = serde_json::from_str(&detail_json).unwrap_or(serde_json::Value::Null);

        let blobs: Vec<(String, Vec<u8>)> = self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT side, data FROM flow_bodies WHERE flow_id = ?1")?;
            stmt.query_map(rusqlite::params![flow_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
        })?;

        for (side, blob) in blobs {
            let restored = body::gzip_decompress(&blob)?;
            let key = if side == "r" { "requestBody" } else { "responseBody" };
            if let Some(obj) = detail.as_object_mut() {
                obj.insert(key.to_string(), serde_json::Value::String(String::from_utf8_lossy(&restored).to_string()));
            }
        }

        // File-backed bodies: the placeholder in `detail` still reads
        // `__FILE__`; resolve it from disk using the session/flow naming
        // convention `tier_body` wrote.
        for (side_key, suffix) in [("requestBody", 'r'), ("responseBody", 's')] {
            let is_file_placeholder = detail
                .get(side_key)
                .and_then(|v| v.as_str())
                .map(|s| s == body::FILE_PLACEHOLDER)
                .unwrap_or(false);
            if is_file_placeholder {
                let path = self.body_dir.join(&session_id).join(format!("{flow_id}_{suffix}.dat"));
                if let Ok(bytes) = body::read_file_body(&path) {
                    if let Some(obj) = detail.as_object_mut() {
                        obj.insert(side_key.to_string(), serde_json::Value::String(String::from_utf8_lossy(&bytes).to_string()));
                    }
                }
            }
        }

        Ok(Some(detail))
    }

    // ---- session lifecycle ------------------------------------------

    pub fn create_session(&self, name: &str) -> Result<Session, DbError> {
        let _guard = self.write_lock.lock();
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, name, is_active, flow_count, created_at, updated_at)
                 VALUES (?1, ?2, 0, 0, ?3, ?3)",
                rusqlite::params![id, name, now],
            )
        })?;
        self.mark_write();
        Ok(Session {
            id,
            name: name.to_string(),
            is_active: false,
            flow_count: 0,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Deactivate every session, then activate `session_id`.
    pub fn switch_session(&self, session_id: &str) -> Result<(), DbError> {
        let _guard = self.write_lock.lock();
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute("UPDATE sessions SET is_active = 0", [])?;
            let changed = tx.execute(
                "UPDATE sessions SET is_active = 1 WHERE id = ?1",
                rusqlite::params![session_id],
            )?;
            tx.commit()?;
            Ok(changed)
        })
        .and_then(|changed: usize| {
            if changed == 0 {
                Err(DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
            } else {
                Ok(())
            }
        })
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>, DbError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, is_active, flow_count, created_at, updated_at FROM sessions ORDER BY created_at ASC",
            )?;
            stmt.query_map([], |row| {
                Ok(Session {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    is_active: row.get::<_, i64>(2)? != 0,
                    flow_count: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    /// Refused for the currently active session.
    pub fn delete_session(&self, session_id: &str) -> Result<bool, DbError> {
        let is_active: bool = self.with_connection(|conn| {
            conn.query_row(
                "SELECT is_active FROM sessions WHERE id = ?1",
                rusqlite::params![session_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })?
        .map(|v| v != 0)
        .unwrap_or(false);
        if is_active {
            return Ok(false);
        }

        let _guard = self.write_lock.lock();
        let deleted = self.with_connection(|conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", rusqlite::params![session_id])
        })?;
        self.mark_write();
        if deleted > 0 {
            let dir = self.body_dir.join(session_id);
            let _ = std::fs::remove_dir_all(dir);
        }
        Ok(deleted > 0)
    }

    /// Purge all flows for `session_id` while keeping the session row.
    pub fn clear_session(&self, session_id: &str) -> Result<(), DbError> {
        let _guard = self.write_lock.lock();
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM flow_indices WHERE session_id = ?1", rusqlite::params![session_id])?;
            tx.execute("DELETE FROM flow_details WHERE session_id = ?1", rusqlite::params![session_id])?;
            tx.execute(
                "UPDATE sessions SET flow_count = 0 WHERE id = ?1",
                rusqlite::params![session_id],
            )?;
            tx.commit()
        })?;
        self.mark_write();
        let dir = self.body_dir.join(session_id);
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::create_dir_all(&dir);
        Ok(())
    }

    /// Bulk-delete every inactive session.
    pub fn delete_all_historical_sessions(&self) -> Result<u64, DbError> {
        let _guard = self.write_lock.lock();
        let deleted = self.with_connection(|conn| {
            conn.execute("DELETE FROM sessions WHERE is_active = 0", [])
        })?;
        self.mark_write();
        Ok(deleted as u64)
    }

    pub(crate) fn config(&self) -> &DbConfig {
        &self.config
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn body_dir(&self) -> &Path {
        &self.body_dir
    }

    pub(crate) fn write_lock(&self) -> &Mutex<()> {
        &self.write_lock
    }

    pub(crate) fn cleanup_lock(&self) -> &Mutex<()> {
        &self.cleanup_lock
    }
}

fn patch_body_placeholder(detail: &mut serde_json::Value, key: &str, tier: &body::TieredBody) {
    if let Some(obj) = detail.as_object_mut() {
        if let Some(placeholder) = tier.placeholder() {
            obj.insert(key.to_string(), serde_json::Value::String(placeholder.to_string()));
        } else if let Some(msg) = tier.skipped_message() {
            obj.insert(key.to_string(), serde_json::Value::String(msg));
        } else if let BodyPlacement::Inline = tier.placement {
            // Inline bodies are left exactly as the caller serialized them
            // (already text/base64-encoded by the traffic monitor).
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowIndexRow {
    pub id: String,
    pub msg_ts: f64,
    pub host: String,
    pub method: String,
    pub status: i64,
    pub hits: serde_json::Value,
}

fn row_to_index(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowIndexRow> {
    let hits_json: String = row.get(5)?;
    Ok(FlowIndexRow {
        id: row.get(0)?,
        msg_ts: row.get(1)?,
        host: row.get(2)?,
        method: row.get(3)?,
        status: row.get(4)?,
        hits: serde_json::from_str(&hits_json).unwrap_or(serde_json::Value::Array(Vec::new())),
    })
}

/// Deterministic id generator for flows constructed outside a live proxy
/// request (tests, batch import).
pub fn new_flow_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(session_id: &str, id: &str, host: &str, msg_ts: f64, body_len: usize) -> FlowRecord {
        FlowRecord {
            id: id.to_string(),
            session_id: session_id.to_string(),
            msg_ts,
            host: host.to_string(),
            method: "GET".to_string(),
            status: 200,
            hits: serde_json::json!([]),
            detail: serde_json::json!({
                "id": id,
                "requestBody": "",
                "responseBody": "",
            }),
            request_body: vec![0u8; body_len],
            response_body: Some(vec![1u8; body_len]),
        }
    }

    #[test]
    fn open_creates_schema_and_default_session() {
        let dir = tempfile::tempdir().unwrap();
        let db = FlowDb::open(dir.path(), DbConfig::default()).unwrap();
        let sessions = db.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "default");
    }

    #[test]
    fn store_and_read_back_small_flow() {
        let dir = tempfile::tempdir().unwrap();
        let db = FlowDb::open(dir.path(), DbConfig::default()).unwrap();
        let session = &db.list_sessions().unwrap()[0];
        let rec = record(&session.id, "f1", "example.com", now_secs(), 16);
        db.store_flow(&rec, false).unwrap();

        let indices = db.get_indices(&session.id, 0.0, None).unwrap();
        assert_eq!(indices.len(), 1);
        assert_eq!(indices[0].host, "example.com");

        let detail = db.get_detail("f1").unwrap().unwrap();
        assert_eq!(detail["id"], "f1");
    }

    #[test]
    fn store_compresses_medium_body_and_restores_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let db = FlowDb::open(dir.path(), DbConfig::default()).unwrap();
        let session = &db.list_sessions().unwrap()[0];
        let rec = record(&session.id, "f2", "example.com", now_secs(), 20 * 1024);
        db.store_flow(&rec, false).unwrap();

        let detail = db.get_detail("f2").unwrap().unwrap();
        // restored body should no longer be the placeholder
        assert_ne!(detail["requestBody"], serde_json::json!(body::COMPRESSED_PLACEHOLDER));
    }

    #[test]
    fn delete_session_refuses_active_session() {
        let dir = tempfile::tempdir().unwrap();
        let db = FlowDb::open(dir.path(), DbConfig::default()).unwrap();
        let session = db.list_sessions().unwrap()[0].clone();
        db.switch_session(&session.id).unwrap();
        assert!(!db.delete_session(&session.id).unwrap());
    }

    #[test]
    fn clear_session_removes_flows_but_keeps_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = FlowDb::open(dir.path(), DbConfig::default()).unwrap();
        let session = db.list_sessions().unwrap()[0].clone();
        let rec = record(&session.id, "f3", "example.com", now_secs(), 16);
        db.store_flow(&rec, false).unwrap();
        db.clear_session(&session.id).unwrap();
        assert!(db.get_indices(&session.id, 0.0, None).unwrap().is_empty());
        assert_eq!(db.list_sessions().unwrap().len(), 1);
    }

    #[test]
    fn batch_store_commits_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let db = FlowDb::open(dir.path(), DbConfig::default()).unwrap();
        let session = db.list_sessions().unwrap()[0].clone();
        let records: Vec<FlowRecord> = (0..5)
            .map(|i| record(&session.id, &format!("f{i}"), "example.com", i as f64, 8))
            .collect();
        db.store_flows_batch(&records, 2).unwrap();
        assert_eq!(db.get_indices(&session.id, -1.0, None).unwrap().len(), 5);
    }

    #[test]
    fn notifications_drain_at_most_fifty() {
        let dir = tempfile::tempdir().unwrap();
        let db = FlowDb::open(dir.path(), DbConfig::default()).unwrap();
        for i in 0..60 {
            db.enqueue_notification(Notification {
                title_key: "t".into(),
                message_key: "m".into(),
                params: serde_json::json!({ "i": i }),
                notif_type: "info".into(),
                priority: "low".into(),
                ts: i as f64,
            });
        }
        let drained = db.drain_notifications();
        assert_eq!(drained.len(), 50);
        assert_eq!(db.drain_notifications().len(), 10);
    }
}
