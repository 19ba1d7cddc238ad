//! SQLite dialect, via `rusqlite`. [see spec 4.1.1]
//!
//! SQLite is an embedded, single-writer database: there is no server to
//! dial, no async driver, and no distinct "serialization failure" class the
//! way a multi-writer RDBMS has. `BEGIN IMMEDIATE` takes the write lock up
//! front, which is this dialect's reading of "serializable" (spec 4.1); a
//! process-wide `Mutex` around the connection is the reading of "backends
//! that cannot safely issue concurrent writes" (spec 5).

use std::sync::Mutex;

use rusqlite::{Connection, ErrorCode, OptionalExtension};

use super::{is_fill, with_retry, Dialect, Tx, TransientClassifier};
use crate::error::{CResult, Error};
use crate::event::COMPACT_REV_KEY;
use crate::row::{Row, RowSet};

/// A SQL-backed log store over a single SQLite database file (or `:memory:`).
pub struct SqliteDialect {
    conn: Mutex<Connection>,
    table: String,
}

const COLUMNS: &str = "id, name, created, deleted, create_revision, prev_revision, lease, value, old_value";

impl SqliteDialect {
    /// Opens (creating if absent) the database at `path` and ensures the
    /// schema described in spec 3.1 exists. `table` lets more than one
    /// logical log share a physical database file.
    pub fn open(path: &str, table: &str) -> CResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, table)
    }

    /// Opens a private, non-shared in-memory database. Used by tests.
    pub fn open_in_memory(table: &str) -> CResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, table)
    }

    fn from_connection(conn: Connection, table: &str) -> CResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "busy_timeout", 5000i64)?;
        let dialect = SqliteDialect { conn: Mutex::new(conn), table: table.to_string() };
        dialect.ensure_schema()?;
        Ok(dialect)
    }

    fn ensure_schema(&self) -> CResult<()> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name BLOB NOT NULL,
                created INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                create_revision INTEGER,
                prev_revision INTEGER,
                lease INTEGER,
                value BLOB,
                old_value BLOB
            );
            CREATE INDEX IF NOT EXISTS {table}_name_index ON {table} (name);
            CREATE INDEX IF NOT EXISTS {table}_name_id_index ON {table} (name, id);
            CREATE INDEX IF NOT EXISTS {table}_id_index ON {table} (id);
            CREATE INDEX IF NOT EXISTS {table}_prev_revision_index ON {table} (prev_revision);
            CREATE UNIQUE INDEX IF NOT EXISTS {table}_name_prev_revision_uindex ON {table} (name, prev_revision);",
            table = self.table,
        ))?;
        Ok(())
    }

    fn row_from_sqlite(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
        Ok(Row {
            id: row.get(0)?,
            name: row.get(1)?,
            created: row.get::<_, i64>(2)? != 0,
            deleted: row.get::<_, i64>(3)? != 0,
            create_revision: row.get(4)?,
            prev_revision: row.get(5)?,
            lease: row.get(6)?,
            value: row.get(7)?,
            old_value: row.get(8)?,
        })
    }

    fn current_revision_locked(conn: &Connection, table: &str) -> CResult<i64> {
        let revision: i64 = conn.query_row(
            &format!("SELECT COALESCE(MAX(id), 0) FROM {table}"),
            [],
            |row| row.get(0),
        )?;
        Ok(revision)
    }

    fn compact_revision_locked(conn: &Connection, table: &str) -> CResult<i64> {
        let revision: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT prev_revision FROM {table} WHERE name = ?1 ORDER BY id DESC LIMIT 1"
                ),
                rusqlite::params![COMPACT_REV_KEY.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(revision.unwrap_or(0))
    }
}

impl TransientClassifier for SqliteDialect {
    fn is_transient(&self, err: &Error) -> bool {
        matches!(
            err,
            Error::Sqlite(rusqlite::Error::SqliteFailure(ffi_err, _))
                if matches!(ffi_err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }
}

fn map_insert_error(err: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = &err {
        if ffi_err.code == ErrorCode::ConstraintViolation {
            return Error::Conflict;
        }
    }
    Error::Sqlite(err)
}

impl Dialect for SqliteDialect {
    fn list_current(&self, prefix: &str, limit: i64, include_deleted: bool) -> CResult<RowSet> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let sql = format!(
            "SELECT {COLUMNS} FROM {table}
             WHERE id IN (SELECT MAX(id) FROM {table} WHERE name LIKE ?1 GROUP BY name)
             AND (deleted = 0 OR ?2 = 1)
             ORDER BY id ASC
             LIMIT ?3",
            table = self.table,
        );
        let limit = if limit > 0 { limit } else { i64::MAX };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params![prefix, include_deleted as i64, limit],
                Self::row_from_sqlite,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        let current_revision = Self::current_revision_locked(&conn, &self.table)?;
        let compact_revision = Self::compact_revision_locked(&conn, &self.table)?;
        Ok(RowSet { rows, current_revision, compact_revision })
    }

    fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
        include_deleted: bool,
    ) -> CResult<RowSet> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let cursor: i64 = if start_key.is_empty() {
            0
        } else {
            conn.query_row(
                &format!(
                    "SELECT COALESCE(MAX(id), 0) FROM {table} WHERE name = ?1 AND id <= ?2",
                    table = self.table
                ),
                rusqlite::params![start_key.as_bytes(), revision],
                |row| row.get(0),
            )?
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM {table}
             WHERE id IN (SELECT MAX(id) FROM {table} WHERE name LIKE ?1 AND id <= ?2 GROUP BY name)
             AND (deleted = 0 OR ?3 = 1)
             AND id > ?4
             ORDER BY id ASC
             LIMIT ?5",
            table = self.table,
        );
        let limit = if limit > 0 { limit } else { i64::MAX };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params![prefix, revision, include_deleted as i64, cursor, limit],
                Self::row_from_sqlite,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        let current_revision = Self::current_revision_locked(&conn, &self.table)?;
        let compact_revision = Self::compact_revision_locked(&conn, &self.table)?;
        Ok(RowSet { rows, current_revision, compact_revision })
    }

    fn count(&self, prefix: &str) -> CResult<(i64, i64)> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let sql = format!(
            "SELECT COUNT(*) FROM (
                 SELECT r.deleted AS deleted FROM {table} r
                 WHERE r.id IN (SELECT MAX(id) FROM {table} WHERE name LIKE ?1 GROUP BY name)
             ) t WHERE t.deleted = 0",
            table = self.table,
        );
        let count: i64 = conn.query_row(&sql, [prefix], |row| row.get(0))?;
        let current_revision = Self::current_revision_locked(&conn, &self.table)?;
        Ok((current_revision, count))
    }

    fn current_revision(&self) -> CResult<i64> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        Self::current_revision_locked(&conn, &self.table)
    }

    fn after(&self, prefix: &str, since_revision: i64, limit: i64) -> CResult<RowSet> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let sql = format!(
            "SELECT {COLUMNS} FROM {table}
             WHERE name LIKE ?1 AND id > ?2
             ORDER BY id ASC
             LIMIT ?3",
            table = self.table,
        );
        let limit = if limit > 0 { limit } else { i64::MAX };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params![prefix, since_revision, limit], Self::row_from_sqlite)?
            .collect::<Result<Vec<_>, _>>()?;
        let current_revision = Self::current_revision_locked(&conn, &self.table)?;
        let compact_revision = Self::compact_revision_locked(&conn, &self.table)?;
        Ok(RowSet { rows, current_revision, compact_revision })
    }

    fn insert(
        &self,
        key: &[u8],
        created: bool,
        deleted: bool,
        create_revision: i64,
        prev_revision: i64,
        lease: i64,
        value: &[u8],
        old_value: &[u8],
    ) -> CResult<i64> {
        with_retry(self, || {
            let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
            let sql = format!(
                "INSERT INTO {table}
                 (name, created, deleted, create_revision, prev_revision, lease, value, old_value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 RETURNING id",
                table = self.table,
            );
            conn.query_row(
                &sql,
                rusqlite::params![
                    key,
                    created as i64,
                    deleted as i64,
                    create_revision,
                    prev_revision,
                    lease,
                    value,
                    old_value
                ],
                |row| row.get(0),
            )
            .map_err(map_insert_error)
        })
    }

    fn get_revision(&self, id: i64) -> CResult<Option<Row>> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let sql = format!("SELECT {COLUMNS} FROM {table} WHERE id = ?1", table = self.table);
        conn.query_row(&sql, [id], Self::row_from_sqlite).optional().map_err(Error::from)
    }

    fn delete_revision(&self, id: i64) -> CResult<()> {
        with_retry(self, || {
            let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
            conn.execute(&format!("DELETE FROM {table} WHERE id = ?1", table = self.table), [id])?;
            Ok(())
        })
    }

    fn get_compact_revision(&self) -> CResult<i64> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        Self::compact_revision_locked(&conn, &self.table)
    }

    fn set_compact_revision(&self, revision: i64) -> CResult<()> {
        with_retry(self, || {
            let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
            conn.execute(
                &format!(
                    "UPDATE {table} SET prev_revision = ?1 WHERE name = ?2",
                    table = self.table
                ),
                rusqlite::params![revision, COMPACT_REV_KEY.as_bytes()],
            )?;
            Ok(())
        })
    }

    fn compact(&self, target_revision: i64) -> CResult<u64> {
        with_retry(self, || {
            let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
            let superseded = conn.execute(
                &format!(
                    "DELETE FROM {table}
                     WHERE id <= ?1 AND name != ?2
                     AND id NOT IN (SELECT MAX(id) FROM {table} WHERE id <= ?1 GROUP BY name)",
                    table = self.table,
                ),
                rusqlite::params![target_revision, COMPACT_REV_KEY.as_bytes()],
            )?;
            let deleted_tips = conn.execute(
                &format!(
                    "DELETE FROM {table}
                     WHERE id <= ?1 AND name != ?2 AND deleted = 1
                     AND id IN (SELECT MAX(id) FROM {table} WHERE id <= ?1 GROUP BY name)",
                    table = self.table,
                ),
                rusqlite::params![target_revision, COMPACT_REV_KEY.as_bytes()],
            )?;
            Ok((superseded + deleted_tips) as u64)
        })
    }

    fn fill(&self, id: i64) -> CResult<()> {
        with_retry(self, || {
            let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
            let name = crate::event::fill_name(id);
            debug_assert!(is_fill(&name));
            conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {table}
                     (id, name, created, deleted, create_revision, prev_revision, lease, value, old_value)
                     VALUES (?1, ?2, 1, 0, ?1, 0, 0, X'', X'')",
                    table = self.table,
                ),
                rusqlite::params![id, name.as_bytes()],
            )?;
            Ok(())
        })
    }

    fn begin_tx(&self) -> CResult<Box<dyn Tx + '_>> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTx { conn, table: self.table.clone(), finished: false }))
    }
}

struct SqliteTx<'a> {
    conn: std::sync::MutexGuard<'a, Connection>,
    table: String,
    finished: bool,
}

impl<'a> Tx for SqliteTx<'a> {
    fn current_revision(&mut self) -> CResult<i64> {
        SqliteDialect::current_revision_locked(&self.conn, &self.table)
    }

    fn get_compact_revision(&mut self) -> CResult<i64> {
        SqliteDialect::compact_revision_locked(&self.conn, &self.table)
    }

    fn set_compact_revision(&mut self, revision: i64) -> CResult<()> {
        self.conn.execute(
            &format!("UPDATE {table} SET prev_revision = ?1 WHERE name = ?2", table = self.table),
            rusqlite::params![revision, COMPACT_REV_KEY.as_bytes()],
        )?;
        Ok(())
    }

    fn after(&mut self, prefix: &str, since_revision: i64, limit: i64) -> CResult<RowSet> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} WHERE name LIKE ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
            table = self.table,
        );
        let limit = if limit > 0 { limit } else { i64::MAX };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params![prefix, since_revision, limit],
                SqliteDialect::row_from_sqlite,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        let current_revision = SqliteDialect::current_revision_locked(&self.conn, &self.table)?;
        let compact_revision = SqliteDialect::compact_revision_locked(&self.conn, &self.table)?;
        Ok(RowSet { rows, current_revision, compact_revision })
    }

    fn delete_revision(&mut self, id: i64) -> CResult<()> {
        self.conn
            .execute(&format!("DELETE FROM {table} WHERE id = ?1", table = self.table), [id])?;
        Ok(())
    }

    fn compact(&mut self, target_revision: i64) -> CResult<u64> {
        let superseded = self.conn.execute(
            &format!(
                "DELETE FROM {table}
                 WHERE id <= ?1 AND name != ?2
                 AND id NOT IN (SELECT MAX(id) FROM {table} WHERE id <= ?1 GROUP BY name)",
                table = self.table,
            ),
            rusqlite::params![target_revision, COMPACT_REV_KEY.as_bytes()],
        )?;
        let deleted_tips = self.conn.execute(
            &format!(
                "DELETE FROM {table}
                 WHERE id <= ?1 AND name != ?2 AND deleted = 1
                 AND id IN (SELECT MAX(id) FROM {table} WHERE id <= ?1 GROUP BY name)",
                table = self.table,
            ),
            rusqlite::params![target_revision, COMPACT_REV_KEY.as_bytes()],
        )?;
        Ok((superseded + deleted_tips) as u64)
    }

    fn commit(mut self: Box<Self>) -> CResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> CResult<()> {
        self.conn.execute_batch("ROLLBACK")?;
        self.finished = true;
        Ok(())
    }
}

impl<'a> Drop for SqliteTx<'a> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dialect() -> SqliteDialect {
        SqliteDialect::open_in_memory("kine").expect("open in-memory dialect")
    }

    #[test]
    fn insert_assigns_increasing_revisions() {
        let d = dialect();
        let r1 = d.insert(b"/a", true, false, 0, 0, 0, b"v1", b"").unwrap();
        let r2 = d.insert(b"/b", true, false, 0, 0, 0, b"v2", b"").unwrap();
        assert!(r2 > r1);
    }

    #[test]
    fn insert_conflicts_on_duplicate_name_prev_revision() {
        let d = dialect();
        let r1 = d.insert(b"/a", true, false, 0, 0, 0, b"v1", b"").unwrap();
        d.insert(b"/a", false, false, r1, r1, 0, b"v2", b"v1").unwrap();
        let err = d.insert(b"/a", false, false, r1, r1, 0, b"v2-conflict", b"v1").unwrap_err();
        assert!(matches!(err, Error::Conflict));
    }

    #[test]
    fn insert_accepts_non_utf8_keys() {
        let d = dialect();
        let key: &[u8] = &[0xff, 0xfe, b'/', 0x00];
        let r1 = d.insert(key, true, false, 0, 0, 0, b"v1", b"").unwrap();
        let row = d.get_revision(r1).unwrap().expect("row exists");
        assert_eq!(row.name, key);
    }

    #[test]
    fn current_revision_is_zero_for_empty_table() {
        let d = dialect();
        assert_eq!(d.current_revision().unwrap(), 0);
    }

    #[test]
    fn list_current_returns_only_live_tips() {
        let d = dialect();
        let r1 = d.insert(b"/a", true, false, 0, 0, 0, b"v1", b"").unwrap();
        d.insert(b"/a", false, true, r1, r1, 0, b"", b"v1").unwrap();
        d.insert(b"/b", true, false, 0, 0, 0, b"v2", b"").unwrap();

        let set = d.list_current("/%", 0, false).unwrap();
        assert_eq!(set.rows.len(), 1);
        assert_eq!(set.rows[0].name, b"/b");

        let with_deleted = d.list_current("/%", 0, true).unwrap();
        assert_eq!(with_deleted.rows.len(), 2);
    }

    #[test]
    fn fill_is_idempotent() {
        let d = dialect();
        d.fill(5).unwrap();
        d.fill(5).unwrap();
        let row = d.get_revision(5).unwrap().expect("fill row exists");
        assert!(row.is_fill());
    }

    #[test]
    fn compact_retains_live_tip_and_compact_rev_key() {
        let d = dialect();
        d.insert(COMPACT_REV_KEY.as_bytes(), true, false, 0, 0, 0, b"", b"").unwrap();
        let mut prev = d.insert(b"/a", true, false, 0, 0, 0, b"v0", b"").unwrap();
        for i in 1..10 {
            let next = d.insert(b"/a", false, false, prev, prev, 0, format!("v{i}").as_bytes(), b"").unwrap();
            prev = next;
        }
        let deleted = d.compact(prev - 1).unwrap();
        assert!(deleted > 0);
        let remaining = d.list_current("/%", 0, true).unwrap();
        assert_eq!(remaining.rows.len(), 1);
        assert_eq!(remaining.rows[0].id, prev);
    }

    #[test]
    fn transaction_rolls_back_on_drop_without_commit() {
        let d = dialect();
        {
            let mut tx = d.begin_tx().unwrap();
            tx.set_compact_revision(99).unwrap();
            // dropped without commit
        }
        assert_eq!(d.get_compact_revision().unwrap(), 0);
    }

    #[test]
    fn transaction_commit_persists_changes() {
        let d = dialect();
        let mut tx = d.begin_tx().unwrap();
        tx.set_compact_revision(7).unwrap();
        tx.commit().unwrap();
        assert_eq!(d.get_compact_revision().unwrap(), 7);
    }
}
