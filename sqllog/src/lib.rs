//! A SQL-backed, log-structured key-value store with MVCC-style revisions
//! and watch semantics.
//!
//! Each write is appended as an immutable row; the row's autoincrement id is
//! the global revision. Reads and watches project the latest-wins view over
//! that log. See [`log::SQLLog`] for the engine and [`log::KvLog`] for the
//! interface it implements.

pub mod broadcaster;
pub mod compactor;
pub mod config;
pub mod decode;
pub mod dialect;
pub mod error;
pub mod event;
pub mod log;
pub mod notify;
pub mod row;

pub use config::Options;
pub use decode::{decode, decode_row, Decoded};
pub use dialect::{Dialect, Tx};
pub use error::{CResult, Error};
pub use event::{AppendRequest, Event, EventKind, KeyValue, PrevKeyValue};
pub use log::{KvLog, SQLLog};
pub use row::{Row, RowSet};
