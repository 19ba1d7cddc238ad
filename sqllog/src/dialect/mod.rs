//! The dialect adapter: translates logical log operations into SQL for a
//! specific backend, and owns the retry policy around transient errors.
//! [see spec 4.1]

pub mod sqlite;

use std::time::Duration;

use crate::error::{CResult, Error};
use crate::row::{Row, RowSet};

/// Number of attempts `with_retry` makes before giving up and surfacing
/// [`Error::Transient`].
pub const MAX_RETRY_ATTEMPTS: u32 = 20;

/// Starting backoff; grows linearly with the attempt number.
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// A single logical database transaction, opened at serializable isolation.
/// Used by startup's duplicate `compact_rev_key` cleanup and by the
/// compactor's sliding-window steps.
pub trait Tx {
    fn current_revision(&mut self) -> CResult<i64>;
    fn get_compact_revision(&mut self) -> CResult<i64>;
    fn set_compact_revision(&mut self, revision: i64) -> CResult<()>;
    fn after(&mut self, prefix: &str, since_revision: i64, limit: i64) -> CResult<RowSet>;
    fn delete_revision(&mut self, id: i64) -> CResult<()>;
    fn compact(&mut self, target_revision: i64) -> CResult<u64>;
    fn commit(self: Box<Self>) -> CResult<()>;
    fn rollback(self: Box<Self>) -> CResult<()>;
}

/// The operation vocabulary a concrete SQL backend must implement. All
/// methods are synchronous; callers from async contexts run them inside
/// `tokio::task::spawn_blocking` (see `log::SQLLog`), matching how the
/// underlying drivers this crate targets (e.g. `rusqlite`) are themselves
/// synchronous.
pub trait Dialect: Send + Sync + 'static {
    /// For each key matching `prefix`, the row with the greatest `id`,
    /// filtered by `deleted` unless `include_deleted`. Ordered by `id`
    /// ascending.
    fn list_current(&self, prefix: &str, limit: i64, include_deleted: bool) -> CResult<RowSet>;

    /// Same as `list_current`, restricted to `id <= revision`. If `start_key`
    /// is non-empty it resumes after the tip of that key as of `revision`.
    fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
        include_deleted: bool,
    ) -> CResult<RowSet>;

    /// `(current_revision, live_key_count)` for keys matching `prefix`.
    fn count(&self, prefix: &str) -> CResult<(i64, i64)>;

    /// The maximum `id` in the table, or 0 if empty.
    fn current_revision(&self) -> CResult<i64>;

    /// Every row with `name LIKE prefix AND id > since_revision`, ascending.
    fn after(&self, prefix: &str, since_revision: i64, limit: i64) -> CResult<RowSet>;

    /// Appends a single row, returning its assigned `id`. Atomic with respect
    /// to `id` assignment. A uniqueness violation on `(name, prev_revision)`
    /// must be surfaced as [`Error::Conflict`]. `key` is an opaque byte
    /// string (spec 3): no UTF-8 validity is assumed or required.
    #[allow(clippy::too_many_arguments)]
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
    ) -> CResult<i64>;

    /// Point lookup of a single historical row.
    fn get_revision(&self, id: i64) -> CResult<Option<Row>>;

    /// Unconditional delete of a single row by id.
    fn delete_revision(&self, id: i64) -> CResult<()>;

    /// The stored compact marker, 0 if absent.
    fn get_compact_revision(&self) -> CResult<i64>;

    /// Updates the compact marker in place.
    fn set_compact_revision(&self, revision: i64) -> CResult<()>;

    /// Deletes rows superseded by or deleted at revisions `<= target`,
    /// retaining the live tip per key and the `compact_rev_key` row. Returns
    /// the number of rows deleted.
    fn compact(&self, target_revision: i64) -> CResult<u64>;

    /// Writes a `gap-`-prefixed placeholder row at `id`, closing a revision
    /// gap. Idempotent: a concurrent real row at `id` is not an error the
    /// caller relies on.
    fn fill(&self, id: i64) -> CResult<()>;

    /// Opens a transaction at serializable isolation.
    fn begin_tx(&self) -> CResult<Box<dyn Tx + '_>>;
}

/// True iff `name` starts with the reserved gap-fill prefix. Re-exported here
/// because the spec lists it as part of the dialect's vocabulary even though
/// it needs no SQL of its own.
pub fn is_fill(name: &str) -> bool {
    crate::event::is_fill_name(name.as_bytes())
}

/// True iff `err` names a condition the backend considers transient
/// (typically lock contention) rather than a real conflict or fatal error.
pub trait TransientClassifier {
    fn is_transient(&self, err: &Error) -> bool;
}

/// Retries `op` up to [`MAX_RETRY_ATTEMPTS`] times with linear backoff,
/// starting at [`RETRY_BACKOFF_BASE`], whenever `classifier` judges the
/// returned error transient. Reads never go through this helper -- only
/// executing statements do (spec 4.1's retry policy).
pub fn with_retry<T>(
    classifier: &dyn TransientClassifier,
    mut op: impl FnMut() -> CResult<T>,
) -> CResult<T> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if classifier.is_transient(&err) && attempt < MAX_RETRY_ATTEMPTS => {
                attempt += 1;
                std::thread::sleep(RETRY_BACKOFF_BASE * attempt);
            }
            Err(err) if classifier.is_transient(&err) => {
                return Err(Error::Transient(format!(
                    "exhausted {MAX_RETRY_ATTEMPTS} attempts: {err}"
                )));
            }
            Err(err) => return Err(err),
        }
    }
}
