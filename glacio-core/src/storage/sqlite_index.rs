use super::index_store::{
    EntryFilter, EntryLookup, IndexStore, PutMode, RestoreBegin, RestoreChange, Transition,
};
use super::schema;
use crate::error::{GlacioError, Result};
use crate::model::{
    ArchiveEntry, BundleMember, EntryKind, IntegrityState, RestoreRequest, RestoreStatus,
    StorageTier, format_timestamp, parse_timestamp, timestamp_now,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENTRY_COLUMNS: &str = "remote_key, origin_path, kind, size_bytes, digest, archived_at,
    storage_tier, storage_class, restore_expiry, integrity, remote_etag, archived_by, superseded_at";

const RESTORE_COLUMNS: &str = "request_id, remote_key, destination, requested_at, status,
    poll_count, last_polled_at, last_error";

const ACTIVE_RESTORE_STATUSES: &str =
    "('PENDING', 'IN_PROGRESS', 'READY', 'DOWNLOADING', 'EXPIRED')";

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Index store backed by a single SQLite file in WAL mode.
///
/// Each call opens its own connection, so readers never wait on each other and
/// writers are serialized by SQLite itself.
pub struct SqliteIndexStore {
    db_path: PathBuf,
}

impl SqliteIndexStore {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let mut conn = store.get_conn()?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("Index {} opened in {} mode", store.db_path.display(), mode);
        schema::migrate(&mut conn)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    fn load_members(conn: &Connection, remote_key: &str) -> Result<Vec<BundleMember>> {
        let mut stmt = conn.prepare(
            "SELECT name, size_bytes, digest FROM entry_members
             WHERE remote_key = ?1 ORDER BY name",
        )?;

        let rows = stmt.query_map([remote_key], |row| {
            let size: i64 = row.get(1)?;
            Ok(BundleMember {
                name: row.get(0)?,
                size_bytes: size as u64,
                digest: row.get(2)?,
            })
        })?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    fn query_entries(
        conn: &Connection,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<ArchiveEntry>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, EntryRow::from_row)?;

        let mut raw = Vec::new();
        for row in rows {
            raw.push(row?);
        }

        raw.into_iter()
            .map(|row| {
                let members = if row.kind == EntryKind::Bundle.as_str() {
                    Self::load_members(conn, &row.remote_key)?
                } else {
                    Vec::new()
                };
                row.into_entry(members)
            })
            .collect()
    }

    fn query_one(
        conn: &Connection,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Option<ArchiveEntry>> {
        Ok(Self::query_entries(conn, sql, params)?.into_iter().next())
    }

    fn query_restores(
        conn: &Connection,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<RestoreRequest>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, RestoreRow::from_row)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?.into_request()?);
        }
        Ok(requests)
    }

    fn active_restore(conn: &Connection, remote_key: &str) -> Result<Option<RestoreRequest>> {
        let sql = format!(
            "SELECT {} FROM restore_requests
             WHERE remote_key = ?1 AND status IN {} LIMIT 1",
            RESTORE_COLUMNS, ACTIVE_RESTORE_STATUSES
        );
        Ok(Self::query_restores(conn, &sql, &[&remote_key as &dyn ToSql])?
            .into_iter()
            .next())
    }

    fn restore_by_id(conn: &Connection, request_id: &str) -> Result<RestoreRequest> {
        let sql = format!(
            "SELECT {} FROM restore_requests WHERE request_id = ?1",
            RESTORE_COLUMNS
        );
        Self::query_restores(conn, &sql, &[&request_id as &dyn ToSql])?
            .into_iter()
            .next()
            .ok_or_else(|| GlacioError::NotFound(format!("restore request {}", request_id)))
    }
}

impl IndexStore for SqliteIndexStore {
    fn put(&self, entry: &ArchiveEntry, mode: PutMode) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if mode == PutMode::Supersede {
            let superseded = tx.execute(
                "UPDATE entries SET superseded_at = ?1
                 WHERE origin_path = ?2 AND superseded_at IS NULL",
                params![format_timestamp(&timestamp_now()), entry.origin_path],
            )?;
            if superseded > 0 {
                tracing::debug!(
                    "Superseded {} earlier entries for {}",
                    superseded,
                    entry.origin_path
                );
            }
        }

        let archived_at = format_timestamp(&entry.archived_at);
        let taken: Option<String> = tx
            .query_row(
                "SELECT remote_key FROM entries WHERE origin_path = ?1 AND archived_at = ?2",
                params![entry.origin_path, archived_at],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = taken {
            return Err(GlacioError::Policy(format!(
                "{} already has an entry archived at {} ({})",
                entry.origin_path, archived_at, existing
            )));
        }

        tx.execute(
            "INSERT INTO entries (
                remote_key, origin_path, kind, size_bytes, digest, archived_at,
                storage_tier, storage_class, restore_expiry, integrity, remote_etag,
                archived_by, superseded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.remote_key,
                entry.origin_path,
                entry.kind.as_str(),
                entry.size_bytes as i64,
                entry.digest,
                archived_at,
                entry.storage_tier.as_str(),
                entry.storage_class,
                entry.restore_expiry.as_ref().map(format_timestamp),
                entry.integrity.as_str(),
                entry.remote_etag,
                entry.archived_by,
                entry.superseded_at.as_ref().map(format_timestamp),
            ],
        )?;

        for member in &entry.members {
            let member_path = Path::new(&entry.origin_path).join(&member.name);
            tx.execute(
                "INSERT INTO entry_members (remote_key, name, member_path, size_bytes, digest)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.remote_key,
                    member.name,
                    member_path.to_string_lossy(),
                    member.size_bytes as i64,
                    member.digest,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn get(&self, lookup: &EntryLookup) -> Result<ArchiveEntry> {
        let conn = self.get_conn()?;

        let found = match lookup {
            EntryLookup::RemoteKey(key) => {
                let sql = format!("SELECT {} FROM entries WHERE remote_key = ?1", ENTRY_COLUMNS);
                Self::query_one(&conn, &sql, &[key as &dyn ToSql])?
            }
            EntryLookup::OriginPath(path) => {
                let sql = format!(
                    "SELECT {} FROM entries
                     WHERE origin_path = ?1 AND superseded_at IS NULL
                     ORDER BY archived_at DESC LIMIT 1",
                    ENTRY_COLUMNS
                );
                match Self::query_one(&conn, &sql, &[path as &dyn ToSql])? {
                    Some(entry) => Some(entry),
                    None => {
                        let sql = format!(
                            "SELECT {} FROM entries
                             WHERE superseded_at IS NULL AND remote_key IN (
                                 SELECT remote_key FROM entry_members WHERE member_path = ?1
                             )
                             ORDER BY archived_at DESC LIMIT 1",
                            ENTRY_COLUMNS
                        );
                        Self::query_one(&conn, &sql, &[path as &dyn ToSql])?
                    }
                }
            }
        };

        found.ok_or_else(|| GlacioError::NotFound(lookup.describe().to_string()))
    }

    fn list_page(
        &self,
        filter: &EntryFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ArchiveEntry>> {
        let conn = self.get_conn()?;

        let tier = filter.tier.map(|tier| tier.as_str().to_string());
        let before = filter.archived_before.as_ref().map(format_timestamp);
        let since = filter.archived_after.as_ref().map(format_timestamp);
        let limit = limit as i64;

        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<&dyn ToSql> = Vec::new();

        if let Some(tier) = tier.as_ref() {
            values.push(tier);
            clauses.push(format!("storage_tier = ?{}", values.len()));
        }
        if let Some(before) = before.as_ref() {
            values.push(before);
            clauses.push(format!("archived_at < ?{}", values.len()));
        }
        if let Some(since) = since.as_ref() {
            values.push(since);
            clauses.push(format!("archived_at >= ?{}", values.len()));
        }
        if let Some(prefix) = filter.path_prefix.as_ref() {
            values.push(prefix);
            clauses.push(format!("instr(origin_path, ?{}) = 1", values.len()));
        }
        if let Some(after) = after.as_ref() {
            values.push(after);
            clauses.push(format!("remote_key > ?{}", values.len()));
        }
        if !filter.include_superseded {
            clauses.push("superseded_at IS NULL".to_string());
        }
        if filter.integrity_failed_only {
            clauses.push("integrity = 'INTEGRITY_FAILED'".to_string());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        values.push(&limit);
        let sql = format!(
            "SELECT {} FROM entries {} ORDER BY remote_key LIMIT ?{}",
            ENTRY_COLUMNS,
            where_clause,
            values.len()
        );

        Self::query_entries(&conn, &sql, &values)
    }

    fn update_tier(
        &self,
        remote_key: &str,
        tier: StorageTier,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE entries SET storage_tier = ?1, restore_expiry = ?2 WHERE remote_key = ?3",
            params![
                tier.as_str(),
                expiry.as_ref().map(format_timestamp),
                remote_key
            ],
        )?;

        if affected == 0 {
            return Err(GlacioError::NotFound(remote_key.to_string()));
        }
        Ok(())
    }

    fn mark_integrity_failed(&self, remote_key: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE entries SET integrity = ?1 WHERE remote_key = ?2",
            params![IntegrityState::IntegrityFailed.as_str(), remote_key],
        )?;

        if affected == 0 {
            return Err(GlacioError::NotFound(remote_key.to_string()));
        }
        Ok(())
    }

    fn delete(&self, remote_key: &str) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM entry_members WHERE remote_key = ?1",
            [remote_key],
        )?;
        tx.execute(
            "DELETE FROM restore_requests WHERE remote_key = ?1",
            [remote_key],
        )?;
        let affected = tx.execute("DELETE FROM entries WHERE remote_key = ?1", [remote_key])?;
        if affected == 0 {
            return Err(GlacioError::NotFound(remote_key.to_string()));
        }

        tx.commit()?;
        Ok(())
    }

    fn is_path_archived(&self, path: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM entries
                 WHERE superseded_at IS NULL AND (
                     origin_path = ?1 OR remote_key IN (
                         SELECT remote_key FROM entry_members WHERE member_path = ?1
                     )
                 )
                 LIMIT 1",
                [path],
                |row| row.get(0),
            )
            .optional()?;

        Ok(found.is_some())
    }

    fn begin_restore(&self, request: &RestoreRequest) -> Result<RestoreBegin> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = Self::active_restore(&tx, &request.remote_key)? {
            tx.commit()?;
            return Ok(RestoreBegin::Existing(existing));
        }

        tx.execute(
            "INSERT INTO restore_requests (
                request_id, remote_key, destination, requested_at, status,
                poll_count, last_polled_at, last_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                request.request_id,
                request.remote_key,
                request.destination,
                format_timestamp(&request.requested_at),
                request.status.as_str(),
                request.poll_count,
                request.last_polled_at.as_ref().map(format_timestamp),
                request.last_error,
            ],
        )?;

        tx.commit()?;
        Ok(RestoreBegin::Created(request.clone()))
    }

    fn get_active_restore(&self, remote_key: &str) -> Result<Option<RestoreRequest>> {
        let conn = self.get_conn()?;
        Self::active_restore(&conn, remote_key)
    }

    fn update_restore(&self, request: &RestoreRequest) -> Result<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE restore_requests
             SET destination = ?1, status = ?2, poll_count = ?3, last_polled_at = ?4, last_error = ?5
             WHERE request_id = ?6",
            params![
                request.destination,
                request.status.as_str(),
                request.poll_count,
                request.last_polled_at.as_ref().map(format_timestamp),
                request.last_error,
                request.request_id,
            ],
        )?;

        if affected == 0 {
            return Err(GlacioError::NotFound(format!(
                "restore request {}",
                request.request_id
            )));
        }
        Ok(())
    }

    fn get_restore(&self, request_id: &str) -> Result<RestoreRequest> {
        let conn = self.get_conn()?;
        Self::restore_by_id(&conn, request_id)
    }

    fn transition_restore(
        &self,
        request_id: &str,
        from: &[RestoreStatus],
        change: &RestoreChange,
    ) -> Result<Transition> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::restore_by_id(&tx, request_id)?;
        let now = format_timestamp(&timestamp_now());
        if change.polled {
            tx.execute(
                "UPDATE restore_requests SET poll_count = poll_count + 1, last_polled_at = ?1
                 WHERE request_id = ?2",
                params![now, request_id],
            )?;
        }

        let applies = from.contains(&current.status);
        if applies {
            let status = change.status.unwrap_or(current.status);
            tx.execute(
                "UPDATE restore_requests SET status = ?1, last_error = ?2, last_polled_at = ?3
                 WHERE request_id = ?4",
                params![status.as_str(), change.last_error, now, request_id],
            )?;
        }

        let stored = Self::restore_by_id(&tx, request_id)?;
        tx.commit()?;

        Ok(if applies {
            Transition::Applied(stored)
        } else {
            Transition::Rejected(stored)
        })
    }

    fn list_restores(&self, statuses: &[RestoreStatus]) -> Result<Vec<RestoreRequest>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.get_conn()?;
        let names: Vec<&str> = statuses.iter().map(|status| status.as_str()).collect();
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT {} FROM restore_requests WHERE status IN ({}) ORDER BY requested_at, request_id",
            RESTORE_COLUMNS,
            placeholders.join(", ")
        );
        let values: Vec<&dyn ToSql> = names.iter().map(|name| name as &dyn ToSql).collect();

        Self::query_restores(&conn, &sql, &values)
    }
}

/// Raw column values; conversion happens outside the rusqlite row closure so
/// that malformed rows surface as `IndexCorrupt`.
struct EntryRow {
    remote_key: String,
    origin_path: String,
    kind: String,
    size_bytes: i64,
    digest: String,
    archived_at: String,
    storage_tier: String,
    storage_class: String,
    restore_expiry: Option<String>,
    integrity: String,
    remote_etag: Option<String>,
    archived_by: Option<String>,
    superseded_at: Option<String>,
}

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            remote_key: row.get(0)?,
            origin_path: row.get(1)?,
            kind: row.get(2)?,
            size_bytes: row.get(3)?,
            digest: row.get(4)?,
            archived_at: row.get(5)?,
            storage_tier: row.get(6)?,
            storage_class: row.get(7)?,
            restore_expiry: row.get(8)?,
            integrity: row.get(9)?,
            remote_etag: row.get(10)?,
            archived_by: row.get(11)?,
            superseded_at: row.get(12)?,
        })
    }

    fn into_entry(self, members: Vec<BundleMember>) -> Result<ArchiveEntry> {
        Ok(ArchiveEntry {
            kind: EntryKind::parse(&self.kind)?,
            size_bytes: u64::try_from(self.size_bytes).map_err(|_| {
                GlacioError::IndexCorrupt(format!(
                    "negative size for {}: {}",
                    self.remote_key, self.size_bytes
                ))
            })?,
            archived_at: parse_timestamp(&self.archived_at)?,
            storage_tier: self.storage_tier.parse()?,
            restore_expiry: self
                .restore_expiry
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            integrity: IntegrityState::parse(&self.integrity)?,
            superseded_at: self
                .superseded_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            remote_key: self.remote_key,
            origin_path: self.origin_path,
            digest: self.digest,
            storage_class: self.storage_class,
            remote_etag: self.remote_etag,
            archived_by: self.archived_by,
            members,
        })
    }
}

struct RestoreRow {
    request_id: String,
    remote_key: String,
    destination: String,
    requested_at: String,
    status: String,
    poll_count: u32,
    last_polled_at: Option<String>,
    last_error: Option<String>,
}

impl RestoreRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            request_id: row.get(0)?,
            remote_key: row.get(1)?,
            destination: row.get(2)?,
            requested_at: row.get(3)?,
            status: row.get(4)?,
            poll_count: row.get(5)?,
            last_polled_at: row.get(6)?,
            last_error: row.get(7)?,
        })
    }

    fn into_request(self) -> Result<RestoreRequest> {
        Ok(RestoreRequest {
            requested_at: parse_timestamp(&self.requested_at)?,
            status: RestoreStatus::parse(&self.status)?,
            last_polled_at: self
                .last_polled_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            request_id: self.request_id,
            remote_key: self.remote_key,
            destination: self.destination,
            poll_count: self.poll_count,
            last_error: self.last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EntryCursor;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    fn entry(key: &str, origin: &str, tier: StorageTier) -> ArchiveEntry {
        ArchiveEntry {
            remote_key: key.to_string(),
            origin_path: origin.to_string(),
            kind: EntryKind::File,
            size_bytes: 42,
            digest: crate::compute_hash(key.as_bytes()),
            archived_at: timestamp_now(),
            storage_tier: tier,
            storage_class: "DEEP_ARCHIVE".to_string(),
            restore_expiry: None,
            integrity: IntegrityState::Verified,
            remote_etag: Some("etag".to_string()),
            archived_by: Some("alice".to_string()),
            superseded_at: None,
            members: Vec::new(),
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> SqliteIndexStore {
        SqliteIndexStore::open(dir.path().join("index").join("glacio.db")).unwrap()
    }

    #[test]
    fn test_put_get_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original = entry("glacio/a/data.bin", "/data/a/data.bin", StorageTier::Cold);
        {
            let store = open_store(&temp_dir);
            store.put(&original, PutMode::Insert).unwrap();
        }

        let store = open_store(&temp_dir);
        let by_key = store
            .get(&EntryLookup::RemoteKey(original.remote_key.clone()))
            .unwrap();
        assert_eq!(by_key, original);

        let by_path = store
            .get(&EntryLookup::OriginPath("/data/a/data.bin".to_string()))
            .unwrap();
        assert_eq!(by_path.remote_key, original.remote_key);

        let missing = store
            .get(&EntryLookup::RemoteKey("nope".to_string()))
            .unwrap_err();
        assert!(matches!(missing, GlacioError::NotFound(_)));
    }

    #[test]
    fn test_rearchive_inserts_and_supersede_hides_older() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(&temp_dir);

        let mut first = entry("k1", "/data/x.bin", StorageTier::Cold);
        first.archived_at = timestamp_now() - ChronoDuration::hours(2);
        store.put(&first, PutMode::Insert).unwrap();

        let mut second = entry("k2", "/data/x.bin", StorageTier::Cold);
        second.archived_at = timestamp_now() - ChronoDuration::hours(1);
        store.put(&second, PutMode::Insert).unwrap();

        let all = store.list_page(&EntryFilter::default(), None, 10).unwrap();
        assert_eq!(all.len(), 2);
        let latest = store
            .get(&EntryLookup::OriginPath("/data/x.bin".to_string()))
            .unwrap();
        assert_eq!(latest.remote_key, "k2");

        let third = entry("k3", "/data/x.bin", StorageTier::Cold);
        store.put(&third, PutMode::Supersede).unwrap();

        let live = store.list_page(&EntryFilter::default(), None, 10).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].remote_key, "k3");

        let everything = EntryFilter {
            include_superseded: true,
            ..EntryFilter::default()
        };
        let all = store.list_page(&everything, None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().filter(|e| e.superseded_at.is_some()).count() == 2);
    }

    #[test]
    fn test_bundle_members_are_indexed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(&temp_dir);

        let mut bundle = entry("glacio/b/bundle.tar", "/data/small", StorageTier::Cold);
        bundle.kind = EntryKind::Bundle;
        bundle.members = vec![
            BundleMember {
                name: "a.txt".to_string(),
                size_bytes: 3,
                digest: crate::compute_hash(b"aaa"),
            },
            BundleMember {
                name: "b.txt".to_string(),
                size_bytes: 3,
                digest: crate::compute_hash(b"bbb"),
            },
        ];
        store.put(&bundle, PutMode::Insert).unwrap();

        assert!(store.is_path_archived("/data/small/a.txt").unwrap());
        assert!(store.is_path_archived("/data/small").unwrap());
        assert!(!store.is_path_archived("/data/small/c.txt").unwrap());

        let found = store
            .get(&EntryLookup::OriginPath("/data/small/b.txt".to_string()))
            .unwrap();
        assert_eq!(found.remote_key, bundle.remote_key);
        assert_eq!(found.members, bundle.members);
    }

    #[test]
    fn test_filters_and_cursor() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn IndexStore> = Arc::new(open_store(&temp_dir));

        for i in 0..7 {
            let tier = if i % 2 == 0 {
                StorageTier::Cold
            } else {
                StorageTier::Standard
            };
            let mut e = entry(&format!("k{:02}", i), &format!("/data/{}/f", i), tier);
            e.archived_at = timestamp_now() - ChronoDuration::days(i);
            store.put(&e, PutMode::Insert).unwrap();
        }

        let cold = EntryFilter {
            tier: Some(StorageTier::Cold),
            ..EntryFilter::default()
        };
        let keys: Vec<String> = EntryCursor::with_page_size(store.clone(), cold, 2)
            .map(|e| e.unwrap().remote_key)
            .collect();
        assert_eq!(keys, vec!["k00", "k02", "k04", "k06"]);

        let old = EntryFilter {
            archived_before: Some(timestamp_now() - ChronoDuration::hours(60)),
            ..EntryFilter::default()
        };
        let keys: Vec<String> = EntryCursor::with_page_size(store.clone(), old, 3)
            .map(|e| e.unwrap().remote_key)
            .collect();
        assert_eq!(keys, vec!["k03", "k04", "k05", "k06"]);

        let prefixed = EntryFilter {
            path_prefix: Some("/data/5".to_string()),
            ..EntryFilter::default()
        };
        assert_eq!(EntryCursor::new(store.clone(), prefixed).count(), 1);
    }

    #[test]
    fn test_tier_updates_and_integrity() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(&temp_dir);
        store
            .put(&entry("k", "/data/f", StorageTier::Cold), PutMode::Insert)
            .unwrap();

        let expiry = timestamp_now() + ChronoDuration::days(3);
        store
            .update_tier("k", StorageTier::RestoredTemp, Some(expiry))
            .unwrap();
        let updated = store.get(&EntryLookup::RemoteKey("k".to_string())).unwrap();
        assert_eq!(updated.storage_tier, StorageTier::RestoredTemp);
        assert_eq!(updated.restore_expiry, Some(expiry));

        store.mark_integrity_failed("k").unwrap();
        let failed = EntryFilter {
            integrity_failed_only: true,
            ..EntryFilter::default()
        };
        assert_eq!(store.list_page(&failed, None, 10).unwrap().len(), 1);

        assert!(matches!(
            store.update_tier("missing", StorageTier::Cold, None),
            Err(GlacioError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_removes_entry_and_requests() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(&temp_dir);
        store
            .put(&entry("k", "/data/f", StorageTier::Cold), PutMode::Insert)
            .unwrap();
        store
            .begin_restore(&RestoreRequest::new("k", "/data/f"))
            .unwrap();

        store.delete("k").unwrap();
        assert!(!store.is_path_archived("/data/f").unwrap());
        assert!(store.get_active_restore("k").unwrap().is_none());
        assert!(matches!(store.delete("k"), Err(GlacioError::NotFound(_))));
    }

    #[test]
    fn test_begin_restore_is_deduplicated() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(&temp_dir);

        let first = store
            .begin_restore(&RestoreRequest::new("k", "/data/f"))
            .unwrap();
        assert!(matches!(first, RestoreBegin::Created(_)));

        let second = store
            .begin_restore(&RestoreRequest::new("k", "/data/f"))
            .unwrap();
        assert!(matches!(second, RestoreBegin::Existing(_)));
        assert_eq!(second.request().request_id, first.request().request_id);

        let mut done = first.into_request();
        done.status = RestoreStatus::Completed;
        store.update_restore(&done).unwrap();
        assert!(store.get_active_restore("k").unwrap().is_none());

        let third = store
            .begin_restore(&RestoreRequest::new("k", "/data/f"))
            .unwrap();
        assert!(matches!(third, RestoreBegin::Created(_)));
        assert_eq!(
            store.list_restores(&[RestoreStatus::Completed]).unwrap().len(),
            1
        );
        assert_eq!(store.list_restores(&RestoreStatus::ACTIVE).unwrap().len(), 1);
    }

    #[test]
    fn test_same_path_and_time_is_refused() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(&temp_dir);
        let first = entry("k1", "/data/dir", StorageTier::Cold);
        store.put(&first, PutMode::Insert).unwrap();

        let mut twin = entry("k2", "/data/dir", StorageTier::Cold);
        twin.archived_at = first.archived_at;
        let err = store.put(&twin, PutMode::Insert).unwrap_err();
        assert!(matches!(err, GlacioError::Policy(_)));
        assert!(!err.is_fatal());
        assert!(matches!(
            store.get(&EntryLookup::RemoteKey("k2".to_string())),
            Err(GlacioError::NotFound(_))
        ));
    }

    #[test]
    fn test_parallel_begin_restore_creates_one_request() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("glacio.db");
        SqliteIndexStore::open(&db_path).unwrap();

        let created: Vec<RestoreBegin> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let db_path = db_path.clone();
                    scope.spawn(move || {
                        let store = SqliteIndexStore::open(db_path).unwrap();
                        store
                            .begin_restore(&RestoreRequest::new("k", "/data/f"))
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = created
            .iter()
            .filter(|begin| matches!(begin, RestoreBegin::Created(_)))
            .count();
        assert_eq!(winners, 1);
        let ids: std::collections::HashSet<&str> = created
            .iter()
            .map(|begin| begin.request().request_id.as_str())
            .collect();
        assert_eq!(ids.len(), 1);

        let store = SqliteIndexStore::open(&db_path).unwrap();
        assert_eq!(store.list_restores(&RestoreStatus::ACTIVE).unwrap().len(), 1);
    }

    #[test]
    fn test_parallel_polls_and_claims_do_not_lose_updates() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("glacio.db");
        let request = SqliteIndexStore::open(&db_path)
            .unwrap()
            .begin_restore(&RestoreRequest::new("k", "/data/f"))
            .unwrap()
            .into_request();

        let claims: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..6)
                .map(|_| {
                    let db_path = db_path.clone();
                    let request_id = request.request_id.clone();
                    scope.spawn(move || {
                        let store = SqliteIndexStore::open(db_path).unwrap();
                        for _ in 0..5 {
                            store
                                .transition_restore(
                                    &request_id,
                                    &RestoreStatus::POLLABLE,
                                    &RestoreChange::to(RestoreStatus::Ready).polled(),
                                )
                                .unwrap();
                        }
                        store
                            .transition_restore(
                                &request_id,
                                &[RestoreStatus::Ready],
                                &RestoreChange::to(RestoreStatus::Downloading),
                            )
                            .unwrap()
                            .applied() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(claims, 1);
        let store = SqliteIndexStore::open(&db_path).unwrap();
        let stored = store.get_restore(&request.request_id).unwrap();
        assert_eq!(stored.poll_count, 30);
        assert_eq!(stored.status, RestoreStatus::Downloading);
        assert!(store.get_active_restore("k").unwrap().is_some());
        assert!(matches!(
            store
                .begin_restore(&RestoreRequest::new("k", "/data/f"))
                .unwrap(),
            RestoreBegin::Existing(_)
        ));
    }

    #[test]
    fn test_older_schema_is_migrated_forward() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("old.db");
        {
            let mut conn = Connection::open(&db_path).unwrap();
            schema::migrate_to(&mut conn, 1).unwrap();
            conn.execute(
                "INSERT INTO entries (
                    remote_key, origin_path, kind, size_bytes, digest, archived_at,
                    storage_tier, storage_class, restore_expiry, integrity, remote_etag, superseded_at
                ) VALUES ('old', '/data/old', 'FILE', 5, 'abc', '2023-04-01T10:00:00.000000Z',
                          'COLD', 'GLACIER', NULL, 'VERIFIED', NULL, NULL)",
                [],
            )
            .unwrap();
        }

        let store = SqliteIndexStore::open(&db_path).unwrap();
        let conn = store.get_conn().unwrap();
        assert_eq!(schema::schema_version(&conn).unwrap(), schema::current_version());

        let old = store.get(&EntryLookup::RemoteKey("old".to_string())).unwrap();
        assert_eq!(old.archived_by, None);
        assert_eq!(old.storage_tier, StorageTier::Cold);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("future.db");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.pragma_update(None, "user_version", 99).unwrap();
        }

        let err = SqliteIndexStore::open(&db_path).err().unwrap();
        assert!(matches!(err, GlacioError::IndexCorrupt(_)));
    }
}
