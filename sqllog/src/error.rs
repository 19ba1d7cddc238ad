//! Error taxonomy for the log engine. [see spec 7]

use std::fmt;

use crate::event::Event;

/// The result type used throughout this crate.
pub type CResult<T> = std::result::Result<T, Error>;

/// Errors surfaced across the `sqllog` boundary.
///
/// `Compacted` and `Conflict` are conditions a caller is expected to see in
/// normal operation and handle; `Transient` means the retry budget inside the
/// dialect was exhausted; `Decode`/`Fatal`/`Io`/`Sqlite` are hard failures.
#[derive(Debug)]
pub enum Error {
    /// The requested revision is older than what the store still retains.
    /// `revision`/`events` carry the best-effort partial read the engine
    /// already had in hand when it noticed staleness -- List and After
    /// surface this rather than throwing the read away.
    Compacted { compact_revision: i64, requested_revision: i64, revision: i64, events: Vec<Event> },

    /// Append was rejected because the caller's `prev_revision` no longer
    /// matches the key's current tip.
    Conflict,

    /// A dialect-declared retryable error survived the retry budget.
    Transient(String),

    /// A row could not be decoded into an event.
    Decode(String),

    /// An unrecoverable condition: missing schema, closed channel, cancelled
    /// context.
    Fatal(String),

    Io(std::io::Error),

    Sqlite(rusqlite::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Compacted { compact_revision, requested_revision, .. } => write!(
                f,
                "requested revision {requested_revision} is compacted (compact revision {compact_revision})"
            ),
            Error::Conflict => write!(f, "revision mismatch, key has been updated concurrently"),
            Error::Transient(msg) => write!(f, "transient error: {msg}"),
            Error::Decode(msg) => write!(f, "decode error: {msg}"),
            Error::Fatal(msg) => write!(f, "fatal error: {msg}"),
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Sqlite(err) => write!(f, "sqlite error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Sqlite(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Sqlite(err)
    }
}

impl Error {
    /// True for the `compacted` kind, used by callers that want to attach
    /// partial results rather than discard them.
    pub fn is_compacted(&self) -> bool {
        matches!(self, Error::Compacted { .. })
    }
}
