//! The persisted row, the only entity the dialect ever writes. [see spec 3]

/// One immutable row of the log. `id` is the revision.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    pub id: i64,
    pub name: Vec<u8>,
    pub created: bool,
    pub deleted: bool,
    pub create_revision: i64,
    pub prev_revision: i64,
    pub lease: i64,
    pub value: Vec<u8>,
    pub old_value: Vec<u8>,
}

/// The result of any dialect read: the rows themselves, plus the current
/// revision and compact revision snapshotted at query time. The real SQL
/// decorates every row with these as constant columns (spec 4.1); we carry
/// them once per result set instead of duplicating them onto each `Row`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowSet {
    pub rows: Vec<Row>,
    pub current_revision: i64,
    pub compact_revision: i64,
}

impl Row {
    /// Whether this row's key starts with the reserved gap-fill prefix.
    pub fn is_fill(&self) -> bool {
        crate::event::is_fill_name(&self.name)
    }

    /// Whether this row's key is the reserved compact-revision marker.
    pub fn is_compact_rev_key(&self) -> bool {
        self.name == crate::event::COMPACT_REV_KEY.as_bytes()
    }
}
