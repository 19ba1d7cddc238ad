//! The in-memory change-event model. [see spec 4.2, 4.2.1, design note 9.1]
//!
//! The persisted schema only has room for two booleans (`created`, `deleted`),
//! but the in-memory representation is a proper tagged variant: collapsing it
//! back into a pair of bools at the call site is easy, recovering the tag from
//! a pair of bools scattered across the codebase is not.

use serde_derive::{Deserialize, Serialize};

/// What an [`Event`] represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Create,
    Update,
    Delete,
    /// A synthetic row written by the poll loop to close a revision gap.
    /// Never persisted as its own column; see [`EventKind::is_fill`].
    Fill,
}

impl EventKind {
    /// Reconstructs the kind from the two persisted booleans. `Fill` is never
    /// derived from storage this way -- the poll loop assigns it explicitly
    /// once it recognizes a `gap-` key name.
    pub fn from_flags(created: bool, deleted: bool) -> Self {
        if deleted {
            EventKind::Delete
        } else if created {
            EventKind::Create
        } else {
            EventKind::Update
        }
    }

    /// The `(created, deleted)` pair this kind persists as. `Fill` rows are
    /// written through the same path as `Create`, so it maps to `(true, false)`.
    pub fn to_flags(self) -> (bool, bool) {
        match self {
            EventKind::Create | EventKind::Fill => (true, false),
            EventKind::Update => (false, false),
            EventKind::Delete => (false, true),
        }
    }

    pub fn is_create(self) -> bool {
        matches!(self, EventKind::Create)
    }

    pub fn is_delete(self) -> bool {
        matches!(self, EventKind::Delete)
    }
}

/// The live key/value half of an event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub mod_revision: i64,
    pub create_revision: i64,
    pub lease: i64,
    pub value: Vec<u8>,
}

/// The previous key/value half of an event, absent on creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrevKeyValue {
    pub mod_revision: i64,
    pub value: Vec<u8>,
}

/// A single committed change, as delivered to watchers and read responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub kv: KeyValue,
    pub prev_kv: Option<PrevKeyValue>,
}

impl Event {
    pub fn is_create(&self) -> bool {
        self.kind.is_create()
    }

    pub fn is_delete(&self) -> bool {
        self.kind.is_delete()
    }

    /// True iff this event's key is a `gap-` placeholder written by the poll
    /// loop's fill step. These are dropped before reaching any subscriber.
    pub fn is_fill(&self) -> bool {
        is_fill_name(&self.kv.key)
    }
}

/// Inputs to an Append call. Mirrors the shape of an [`Event`] without the
/// fields only the dialect can fill in (`mod_revision`, `create_revision`
/// when not itself a create).
#[derive(Clone, Debug, Default)]
pub struct AppendRequest {
    pub key: Vec<u8>,
    pub create_revision: i64,
    pub lease: i64,
    pub value: Vec<u8>,
    pub prev_revision: i64,
    pub prev_value: Vec<u8>,
    pub create: bool,
    pub delete: bool,
}

/// The reserved key name holding the compact-revision marker.
pub const COMPACT_REV_KEY: &str = "compact_rev_key";

/// Prefix reserved for gap-fill placeholder rows.
pub const GAP_FILL_PREFIX: &str = "gap-";

/// True iff `name` starts with the reserved gap-fill prefix.
pub fn is_fill_name(name: &[u8]) -> bool {
    name.starts_with(GAP_FILL_PREFIX.as_bytes())
}

/// Builds the synthetic key name for a gap-fill placeholder at `revision`.
pub fn fill_name(revision: i64) -> String {
    format!("{GAP_FILL_PREFIX}{revision}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flags_round_trip_through_kind() {
        for kind in [EventKind::Create, EventKind::Update, EventKind::Delete] {
            let (created, deleted) = kind.to_flags();
            assert_eq!(EventKind::from_flags(created, deleted), kind);
        }
    }

    #[test]
    fn fill_is_recognized_by_prefix() {
        assert!(is_fill_name(fill_name(42).as_bytes()));
        assert!(!is_fill_name(b"/registry/pods/default/foo"));
    }
}
