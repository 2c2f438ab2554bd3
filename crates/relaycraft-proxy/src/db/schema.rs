//! Flow database schema.

pub const PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode=WAL",
    "PRAGMA synchronous=NORMAL",
    "PRAGMA foreign_keys=ON",
    "PRAGMA cache_size=-65536",
    "PRAGMA mmap_size=268435456",
    "PRAGMA temp_store=MEMORY",
    "PRAGMA wal_autocheckpoint=1000",
    "PRAGMA busy_timeout=30000",
];

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0,
    flow_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS flow_indices (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    msg_ts REAL NOT NULL,
    host TEXT NOT NULL,
    method TEXT NOT NULL,
    status INTEGER NOT NULL,
    hits TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS flow_details (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    detail TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS flow_bodies (
    flow_id TEXT NOT NULL REFERENCES flow_details(id) ON DELETE CASCADE,
    side TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (flow_id, side)
);

CREATE INDEX IF NOT EXISTS idx_flow_indices_session_ts
    ON flow_indices(session_id, msg_ts DESC);
CREATE INDEX IF NOT EXISTS idx_flow_indices_session_host
    ON flow_indices(session_id, host);
CREATE INDEX IF NOT EXISTS idx_flow_indices_session_status
    ON flow_indices(session_id, status);
CREATE INDEX IF NOT EXISTS idx_flow_details_session
    ON flow_details(session_id, id);
CREATE INDEX IF NOT EXISTS idx_flow_bodies_flow
    ON flow_bodies(flow_id);
"#;
