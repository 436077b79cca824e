//! Index schema versions.
//!
//! The version lives in `PRAGMA user_version`. Each migration moves the schema
//! one version forward and runs in its own transaction, so an interrupted
//! upgrade leaves the file at the last fully applied version.

use crate::error::{GlacioError, Result};
use rusqlite::Connection;

pub(crate) const MIGRATIONS: &[&str] = &[
    // v1: entries, bundle members, restore requests
    "CREATE TABLE IF NOT EXISTS entries (
        remote_key TEXT PRIMARY KEY,
        origin_path TEXT NOT NULL,
        kind TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        digest TEXT NOT NULL,
        archived_at TEXT NOT NULL,
        storage_tier TEXT NOT NULL,
        storage_class TEXT NOT NULL,
        restore_expiry TEXT,
        integrity TEXT NOT NULL,
        remote_etag TEXT,
        superseded_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_entries_origin ON entries(origin_path, superseded_at);
    CREATE INDEX IF NOT EXISTS idx_entries_tier ON entries(storage_tier);
    CREATE TABLE IF NOT EXISTS entry_members (
        remote_key TEXT NOT NULL,
        name TEXT NOT NULL,
        member_path TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        digest TEXT NOT NULL,
        PRIMARY KEY (remote_key, name),
        FOREIGN KEY (remote_key) REFERENCES entries(remote_key) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_entry_members_path ON entry_members(member_path);
    CREATE TABLE IF NOT EXISTS restore_requests (
        request_id TEXT PRIMARY KEY,
        remote_key TEXT NOT NULL,
        destination TEXT NOT NULL,
        requested_at TEXT NOT NULL,
        status TEXT NOT NULL,
        poll_count INTEGER NOT NULL DEFAULT 0,
        last_polled_at TEXT,
        last_error TEXT
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_restore_requests_active
        ON restore_requests(remote_key)
        WHERE status IN ('PENDING', 'IN_PROGRESS', 'READY', 'EXPIRED');",
    // v2: who archived the entry
    "ALTER TABLE entries ADD COLUMN archived_by TEXT;",
    // v3: download claims count as active; one entry per path and archive time
    "DROP INDEX IF EXISTS idx_restore_requests_active;
    CREATE UNIQUE INDEX idx_restore_requests_active
        ON restore_requests(remote_key)
        WHERE status IN ('PENDING', 'IN_PROGRESS', 'READY', 'DOWNLOADING', 'EXPIRED');
    CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_origin_archived
        ON entries(origin_path, archived_at);",
];

pub(crate) fn current_version() -> u32 {
    MIGRATIONS.len() as u32
}

pub(crate) fn schema_version(conn: &Connection) -> Result<u32> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    u32::try_from(version)
        .map_err(|_| GlacioError::IndexCorrupt(format!("invalid schema version {}", version)))
}

/// Bring the schema up to `target` (at most the current version).
pub(crate) fn migrate_to(conn: &mut Connection, target: u32) -> Result<u32> {
    let mut version = schema_version(conn)?;
    if version > current_version() {
        return Err(GlacioError::IndexCorrupt(format!(
            "index schema version {} is newer than supported version {}",
            version,
            current_version()
        )));
    }

    while version < target.min(current_version()) {
        let sql = MIGRATIONS[version as usize];
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version + 1)?;
        tx.commit()?;

        version += 1;
        tracing::info!("Index schema migrated to version {}", version);
    }

    Ok(version)
}

pub(crate) fn migrate(conn: &mut Connection) -> Result<u32> {
    migrate_to(conn, current_version())
}
