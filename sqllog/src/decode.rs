//! Row-to-event decoder. [see spec 4.2, 4.2.1]
//!
//! Consumes whatever a dialect read returned and yields, in one pass, the
//! current revision, the current compact revision, and an ordered list of
//! change events.

use crate::event::{Event, EventKind, KeyValue, PrevKeyValue};
use crate::row::{Row, RowSet};

/// The decoded form of a [`RowSet`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Decoded {
    pub current_revision: i64,
    pub compact_revision: i64,
    pub events: Vec<Event>,
}

impl Decoded {
    /// True iff `revision` is strictly older than what the store still
    /// retains -- the trigger for surfacing a `compacted` error (spec 4.3.3).
    pub fn is_stale(&self, revision: i64) -> bool {
        revision > 0 && revision < self.compact_revision
    }
}

/// Decodes a single [`Row`] into an [`Event`].
///
/// A row whose name starts with the gap-fill prefix is always tagged
/// [`EventKind::Fill`], overriding whatever the stored `created`/`deleted`
/// flags say -- fill rows are written as plain creates (crate::log::Append),
/// the tag is recovered from the name, not a persisted column.
pub fn decode_row(row: &Row) -> Event {
    let kind = if row.is_fill() {
        EventKind::Fill
    } else {
        EventKind::from_flags(row.created, row.deleted)
    };

    let create_revision = if kind.is_create() { row.id } else { row.create_revision };

    let kv = KeyValue {
        key: row.name.clone(),
        mod_revision: row.id,
        create_revision,
        lease: row.lease,
        value: row.value.clone(),
    };

    let prev_kv = if kind.is_create() || matches!(kind, EventKind::Fill) {
        None
    } else {
        Some(PrevKeyValue { mod_revision: row.prev_revision, value: row.old_value.clone() })
    };

    Event { kind, kv, prev_kv }
}

/// Decodes a whole [`RowSet`] in ascending `id` order.
pub fn decode(row_set: &RowSet) -> Decoded {
    let events = row_set.rows.iter().map(decode_row).collect();
    Decoded {
        current_revision: row_set.current_revision,
        compact_revision: row_set.compact_revision,
        events,
    }
}
