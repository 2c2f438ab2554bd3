//! Background maintenance daemon: WAL checkpointing, retention cleanup, and
//! disk reclamation. Runs on a plain OS thread — this is the one place a
//! blocking `rusqlite` call is acceptable without `spawn_blocking`, since
//! nothing else ever waits on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{open_connection, FlowDb, Notification};

const TICK: Duration = Duration::from_secs(10);
const WAL_IDLE_TRUNCATE_AFTER: Duration = Duration::from_secs(60);
const CLEANUP_WRITE_IDLE_GATE: Duration = Duration::from_secs(30);

/// Spawn the maintenance loop. The returned handle's thread exits once
/// `shutdown` is set to `true`; callers that never shut down cleanly (tests,
/// short-lived CLIs) can simply drop the handle.
pub fn spawn_maintenance_thread(db: Arc<FlowDb>, shutdown: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut last_cleanup = std::time::Instant::now();
        let mut last_passive_checkpoint = std::time::Instant::now();

        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(TICK);

            if let Err(err) = passive_checkpoint(&db, &mut last_passive_checkpoint) {
                tracing::warn!(error = %err, "wal passive checkpoint failed");
            }

            if db.write_idle_for() > WAL_IDLE_TRUNCATE_AFTER {
                if let Err(err) = truncate_checkpoint(&db) {
                    tracing::warn!(error = %err, "wal truncate checkpoint failed");
                }
            }

            let cleanup_due = last_cleanup.elapsed() >= Duration::from_secs(db.config().cleanup_interval_secs);
            if cleanup_due && db.write_idle_for() > CLEANUP_WRITE_IDLE_GATE {
                match run_cleanup(&db) {
                    Ok(removed) if removed > 0 => {
                        db.enqueue_notification(Notification {
                            title_key: "maintenance.cleanup.title".into(),
                            message_key: "maintenance.cleanup.removed".into(),
                            params: serde_json::json!({ "count": removed }),
                            notif_type: "info".into(),
                            priority: "low".into(),
                            ts: crate::flow::clock::now_secs(),
                        });
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "maintenance cleanup failed"),
                }
                last_cleanup = std::time::Instant::now();
            }
        }
    })
}

fn passive_checkpoint(db: &FlowDb, last: &mut std::time::Instant) -> Result<(), super::DbError> {
    if last.elapsed() < Duration::from_secs(30) {
        return Ok(());
    }
    let conn = open_connection(db.path())?;
    conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE)")?;
    *last = std::time::Instant::now();
    Ok(())
}

fn truncate_checkpoint(db: &FlowDb) -> Result<(), super::DbError> {
    let conn = open_connection(db.path())?;
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
    Ok(())
}

/// Enforce age, count, and size retention limits; refresh per-session flow
/// counts; drop empty non-default sessions; `VACUUM` under the write lock
/// when deletions were large enough to matter. Returns the number of flows
/// deleted.
fn run_cleanup(db: &FlowDb) -> Result<u64, super::DbError> {
    let _cleanup_guard = db.cleanup_lock().lock();
    let config = db.config();
    let mut removed: u64 = 0;
    let total_before: i64;

    {
        let _write_guard = db.write_lock().lock();
        let conn = open_connection(db.path())?;

        total_before = conn.query_row("SELECT COUNT(*) FROM flow_indices", [], |row| row.get(0))?;

        let cutoff = crate::flow::clock::now_secs() - (config.max_flow_age_days as f64 * 86_400.0);
        removed += conn.execute(
            "DELETE FROM flow_indices WHERE msg_ts < ?1",
            rusqlite::params![cutoff],
        )? as u64;

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM flow_indices", [], |row| row.get(0))?;
        if total as u64 > config.max_total_flows {
            let overflow = total as u64 - config.max_total_flows;
            removed += conn.execute(
                "DELETE FROM flow_indices WHERE id IN (
                     SELECT id FROM flow_indices ORDER BY msg_ts ASC LIMIT ?1
                 )",
                rusqlite::params![overflow as i64],
            )? as u64;
        }

        // flow_details/flow_bodies rows cascade via the foreign key
        // ON DELETE CASCADE declared in the schema, once SQLite's
        // foreign_keys pragma is enabled (it is, per schema::PRAGMAS).
        // TODO: file-tier bodies (tier_body's body_dir/<session>/<flow>_*.dat)
        // are not unlinked here, only when a whole session is cleared or
        // deleted; an age/cap-evicted flow above the file-tier threshold
        // leaks its file until its session is cleared.
        conn.execute(
            "DELETE FROM flow_details WHERE id NOT IN (SELECT id FROM flow_indices)",
            [],
        )?;

        conn.execute_batch(
            "UPDATE sessions SET flow_count = (
                 SELECT COUNT(*) FROM flow_indices WHERE flow_indices.session_id = sessions.id
             )",
        )?;
        conn.execute(
            "DELETE FROM sessions WHERE is_active = 0 AND name != 'default' AND flow_count = 0",
            [],
        )?;

        if let Some(size_mb) = db_file_size_mb(db) {
            if size_mb > config.max_db_size_mb as f64 {
                db.enqueue_notification(Notification {
                    title_key: "maintenance.dbsize.title".into(),
                    message_key: "maintenance.dbsize.exceeded".into(),
                    params: serde_json::json!({ "size_mb": size_mb, "limit_mb": config.max_db_size_mb }),
                    notif_type: "warning".into(),
                    priority: "medium".into(),
                    ts: crate::flow::clock::now_secs(),
                });
            }
        }

        conn.execute_batch("PRAGMA optimize")?;

        if let Some(size_mb) = db_file_size_mb(db) {
            if size_mb < 1024.0 {
                let status: String =
                    conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
                if status != "ok" {
                    tracing::warn!(status = %status, "flow database quick_check reported corruption");
                }
            }
        }

        let vacuum_threshold = (total_before as u64 / 10).max(1000);
        if removed >= vacuum_threshold {
            conn.execute_batch("VACUUM")?;
        }
    }

    Ok(removed)
}

fn db_file_size_mb(db: &FlowDb) -> Option<f64> {
    std::fs::metadata(db.path())
        .ok()
        .map(|meta| meta.len() as f64 / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::db::FlowRecord;

    #[test]
    fn cleanup_removes_flows_older_than_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DbConfig::default();
        config.max_flow_age_days = 1;
        let db = FlowDb::open(dir.path(), config).unwrap();
        let session = db.list_sessions().unwrap()[0].clone();

        let ancient = FlowRecord {
            id: "old".to_string(),
            session_id: session.id.clone(),
            msg_ts: 0.0,
            host: "example.com".to_string(),
            method: "GET".to_string(),
            status: 200,
            hits: serde_json::json!([]),
            detail: serde_json::json!({ "id": "old" }),
            request_body: Vec::new(),
            response_body: None,
        };
        db.store_flow(&ancient, false).unwrap();

        let removed = run_cleanup(&db).unwrap();
        assert_eq!(removed, 1);
        assert!(db.get_indices(&session.id, -1.0, None).unwrap().is_empty());
    }

    #[test]
    fn cleanup_enforces_max_total_flows() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DbConfig::default();
        config.max_total_flows = 2;
        let db = FlowDb::open(dir.path(), config).unwrap();
        let session = db.list_sessions().unwrap()[0].clone();

        for i in 0..5 {
            let rec = FlowRecord {
                id: format!("f{i}"),
                session_id: session.id.clone(),
                msg_ts: i as f64 + 1.0,
                host: "example.com".to_string(),
                method: "GET".to_string(),
                status: 200,
                hits: serde_json::json!([]),
                detail: serde_json::json!({ "id": format!("f{i}") }),
                request_body: Vec::new(),
                response_body: None,
            };
            db.store_flow(&rec, false).unwrap();
        }

        run_cleanup(&db).unwrap();
        assert_eq!(db.get_indices(&session.id, -1.0, None).unwrap().len(), 2);
    }

    #[test]
    fn cleanup_refreshes_flow_count_and_keeps_active_session() {
        let dir = tempfile::tempdir().unwrap();
        let db = FlowDb::open(dir.path(), DbConfig::default()).unwrap();
        let default_session = db.list_sessions().unwrap()[0].clone();
        let active = db.create_session("session").unwrap();
        db.switch_session(&active.id).unwrap();

        for i in 0..3 {
            let rec = FlowRecord {
                id: format!("f{i}"),
                session_id: active.id.clone(),
                msg_ts: i as f64 + 1.0,
                host: "example.com".to_string(),
                method: "GET".to_string(),
                status: 200,
                hits: serde_json::json!([]),
                detail: serde_json::json!({ "id": format!("f{i}") }),
                request_body: Vec::new(),
                response_body: None,
            };
            db.store_flow(&rec, false).unwrap();
        }

        run_cleanup(&db).unwrap();

        let sessions = db.list_sessions().unwrap();
        let active_row = sessions.iter().find(|s| s.id == active.id).unwrap();
        assert_eq!(active_row.flow_count, 3);
        assert!(active_row.is_active);
        assert!(
            sessions.iter().any(|s| s.id == default_session.id),
            "empty inactive default session must not be dropped"
        );
    }

    #[test]
    fn cleanup_drops_empty_inactive_non_default_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let db = FlowDb::open(dir.path(), DbConfig::default()).unwrap();
        let stale = db.create_session("abandoned").unwrap();

        run_cleanup(&db).unwrap();

        let sessions = db.list_sessions().unwrap();
        assert!(!sessions.iter().any(|s| s.id == stale.id));
    }
}
