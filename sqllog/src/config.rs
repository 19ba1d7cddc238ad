//! Tunable constants, gathered into one struct so tests can shrink them
//! instead of waiting on production-sized intervals. [see spec 4.4, 5]

use std::time::Duration;

/// Knobs governing the poll loop, the compactor, and the broadcaster.
/// [`Options::default`] matches the values named in the specification.
#[derive(Clone, Debug)]
pub struct Options {
    /// Rows fetched per poll-loop iteration.
    pub poll_batch_size: i64,
    /// The poll loop's liveness ticker: when `wait_for_more` is set and the
    /// doorbell has not rung, this is the longest it ever waits before
    /// re-checking for new rows (spec 4.3.5 step 1c: "a 1-second ticker
    /// fires").
    pub poll_idle_interval: Duration,
    /// How long between compactor runs.
    pub compact_interval: Duration,
    /// Per-step timeout for a single compaction transaction.
    pub compact_timeout: Duration,
    /// Revisions younger than `current - compact_min_retain` are never
    /// compacted, regardless of how old the last compaction was.
    pub compact_min_retain: i64,
    /// Rows removed per compaction transaction; a large compaction runs as
    /// many small transactions rather than one long one.
    pub compact_batch_size: i64,
    /// Per-subscriber buffered channel capacity in the broadcaster.
    pub subscriber_buffer: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            poll_batch_size: 500,
            poll_idle_interval: Duration::from_secs(1),
            compact_interval: Duration::from_secs(5 * 60),
            compact_timeout: Duration::from_secs(5),
            compact_min_retain: 1000,
            compact_batch_size: 1000,
            subscriber_buffer: 100,
        }
    }
}

impl Options {
    /// Small intervals and batch sizes, for tests that need the background
    /// tasks to actually do something within a test's lifetime.
    pub fn for_tests() -> Self {
        Options {
            poll_batch_size: 50,
            poll_idle_interval: Duration::from_millis(10),
            compact_interval: Duration::from_millis(50),
            compact_timeout: Duration::from_secs(5),
            compact_min_retain: 5,
            compact_batch_size: 50,
            subscriber_buffer: 100,
        }
    }
}
