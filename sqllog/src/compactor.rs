//! Background compaction. [see spec 4.4]
//!
//! Runs on a fixed interval, advancing the compact revision towards
//! `current_revision - compact_min_retain` in small steps rather than one
//! long transaction, so a large backlog never holds a write lock for the
//! full duration of a compaction pass.
//!
//! Follows the spec's two-variable protocol literally: `target_compact_rev`
//! is a snapshot of `current_revision`, frozen once per outer tick and only
//! refreshed once the cursor catches up to it; each step reads the DB's
//! compact-revision marker (`db_compact_rev`) inside its own transaction and
//! compares it against the `from_rev` the caller expected, so that a
//! concurrently-run compaction (another process, or a second compactor
//! instance) is detected as a rebase rather than silently double-applied.

use std::sync::{Arc, Mutex as StdMutex};

use tokio_util::sync::CancellationToken;

use crate::dialect::Dialect;
use crate::error::{CResult, Error};

fn spawn_err(err: tokio::task::JoinError) -> Error {
    Error::Fatal(format!("compaction task panicked: {err}"))
}

/// What a single compaction step accomplished.
enum StepOutcome {
    /// `db_compact_rev` matched the expected `from_rev`; advanced the marker
    /// to the returned revision and deleted this many rows.
    Advanced(u64),
    /// `db_compact_rev` no longer matched `from_rev` -- another actor moved
    /// the marker between our read and our write. Recoverable: the caller
    /// re-reads the marker and retries from there.
    Rebase,
    /// Nothing left to do at this target (already caught up, or the retain
    /// window leaves nothing eligible yet).
    NothingToDo,
}

/// Drives periodic compaction against a [`Dialect`].
pub struct Compactor<D: Dialect> {
    dialect: Arc<D>,
    min_retain: i64,
    batch_size: i64,
    interval: std::time::Duration,
    timeout: std::time::Duration,
    /// Frozen once per outer tick (spec 4.4's `targetCompactRev`): `None`
    /// until the first tick runs, then `Some(current_revision)` as of the
    /// moment the cursor last caught up to it.
    target_compact_rev: StdMutex<Option<i64>>,
}

impl<D: Dialect> Compactor<D> {
    pub fn new(dialect: Arc<D>, options: &crate::config::Options) -> Self {
        Compactor {
            dialect,
            min_retain: options.compact_min_retain,
            batch_size: options.compact_batch_size,
            interval: options.compact_interval,
            timeout: options.compact_timeout,
            target_compact_rev: StdMutex::new(None),
        }
    }

    /// Spawns the periodic task. Exits cleanly once `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once().await {
                            log::warn!("compaction step failed: {err}");
                        }
                    }
                }
            }
        })
    }

    /// One outer tick (spec 4.4): advances the cursor towards
    /// `target_compact_rev` in `batch_size`-sized steps until caught up or
    /// `compact_timeout` elapses, whichever comes first. Returns the total
    /// number of rows deleted.
    pub async fn run_once(&self) -> CResult<u64> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut total_deleted = 0u64;
        loop {
            if tokio::time::Instant::now() >= deadline {
                break;
            }

            let from_rev = self.read_compact_revision().await?;
            let target = self.target_for(from_rev).await?;
            if from_rev >= target {
                // Caught up: refresh the frozen target for the next tick and
                // yield (spec 4.4 step 1).
                self.refresh_target().await?;
                break;
            }

            let step_target = (from_rev + self.batch_size).min(target);
            match self.step(from_rev, step_target).await? {
                StepOutcome::Advanced(deleted) => total_deleted += deleted,
                StepOutcome::Rebase => continue,
                StepOutcome::NothingToDo => break,
            }
        }
        Ok(total_deleted)
    }

    async fn read_compact_revision(&self) -> CResult<i64> {
        let dialect = self.dialect.clone();
        tokio::task::spawn_blocking(move || dialect.get_compact_revision()).await.map_err(spawn_err)?
    }

    /// Returns the frozen `target_compact_rev`, refreshing it first if it
    /// has never been set or the cursor has already reached it.
    async fn target_for(&self, from_rev: i64) -> CResult<i64> {
        let cached = *self.target_compact_rev.lock().expect("compactor mutex poisoned");
        match cached {
            Some(target) if from_rev < target => Ok(target),
            _ => self.refresh_target().await,
        }
    }

    async fn refresh_target(&self) -> CResult<i64> {
        let dialect = self.dialect.clone();
        let current = tokio::task::spawn_blocking(move || dialect.current_revision()).await.map_err(spawn_err)??;
        *self.target_compact_rev.lock().expect("compactor mutex poisoned") = Some(current);
        Ok(current)
    }

    /// One serializable-transaction step (spec 4.4's `compact(fromRev,
    /// toRev)`): detects a concurrent compaction via `db_compact_rev !=
    /// from_rev`, computes `safe_rev = min(to_rev, current - min_retain)`
    /// clamped at 0, and -- if there is anything left to do -- deletes
    /// superseded rows up to `safe_rev` and advances the marker.
    async fn step(&self, from_rev: i64, to_rev: i64) -> CResult<StepOutcome> {
        let dialect = self.dialect.clone();
        let min_retain = self.min_retain;
        tokio::task::spawn_blocking(move || -> CResult<StepOutcome> {
            let mut tx = dialect.begin_tx()?;
            let current = tx.current_revision()?;
            let db_compact_rev = tx.get_compact_revision()?;
            if db_compact_rev != from_rev {
                tx.rollback()?;
                return Ok(StepOutcome::Rebase);
            }

            let safe_rev = to_rev.min(current - min_retain).max(0);
            if safe_rev <= from_rev {
                tx.rollback()?;
                return Ok(StepOutcome::NothingToDo);
            }

            let deleted = tx.compact(safe_rev)?;
            tx.set_compact_revision(safe_rev)?;
            tx.commit()?;
            Ok(StepOutcome::Advanced(deleted))
        })
        .await
        .map_err(spawn_err)?
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dialect::sqlite::SqliteDialect;
    use crate::event::COMPACT_REV_KEY;

    fn seeded(key_count: i64, revisions_per_key: i64) -> SqliteDialect {
        let dialect = SqliteDialect::open_in_memory("kine").unwrap();
        dialect.insert(COMPACT_REV_KEY.as_bytes(), true, false, 0, 0, 0, b"", b"").unwrap();
        for key in 0..key_count {
            let name = format!("/key-{key}");
            let mut prev = dialect.insert(name.as_bytes(), true, false, 0, 0, 0, b"v0", b"").unwrap();
            for i in 1..revisions_per_key {
                let next = dialect
                    .insert(name.as_bytes(), false, false, prev, prev, 0, format!("v{i}").as_bytes(), b"")
                    .unwrap();
                prev = next;
            }
        }
        dialect
    }

    #[tokio::test]
    async fn run_once_leaves_min_retain_revisions_uncompacted() {
        let dialect = Arc::new(seeded(5, 10));
        let options = crate::config::Options { compact_min_retain: 5, compact_batch_size: 1000, ..crate::config::Options::for_tests() };
        let compactor = Compactor::new(dialect.clone(), &options);

        let deleted = compactor.run_once().await.unwrap();
        assert!(deleted > 0);

        let current = dialect.current_revision().unwrap();
        let compact_revision = dialect.get_compact_revision().unwrap();
        assert!(current - compact_revision >= 5);
    }

    #[tokio::test]
    async fn run_once_is_a_no_op_when_nothing_exceeds_retain_window() {
        let dialect = Arc::new(seeded(2, 2));
        let options = crate::config::Options { compact_min_retain: 1000, ..crate::config::Options::for_tests() };
        let compactor = Compactor::new(dialect.clone(), &options);
        let deleted = compactor.run_once().await.unwrap();
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn large_backlog_is_compacted_in_multiple_small_steps() {
        let dialect = Arc::new(seeded(50, 5));
        let options = crate::config::Options {
            compact_min_retain: 5,
            compact_batch_size: 10,
            compact_timeout: std::time::Duration::from_secs(10),
            ..crate::config::Options::for_tests()
        };
        let compactor = Compactor::new(dialect.clone(), &options);
        let deleted = compactor.run_once().await.unwrap();
        assert!(deleted > 0);
        let current = dialect.current_revision().unwrap();
        let compact_revision = dialect.get_compact_revision().unwrap();
        assert!(current - compact_revision >= 5);
    }

    #[tokio::test]
    async fn step_rebases_instead_of_erroring_when_the_marker_moved_underneath_it() {
        // Simulates spec 4.4's "another actor compacted concurrently" case:
        // a step computed `from_rev` from a stale read, but by the time its
        // transaction opens, `db_compact_rev` has moved past it.
        let dialect = Arc::new(seeded(10, 5));
        let options = crate::config::Options { compact_min_retain: 5, compact_batch_size: 1000, ..crate::config::Options::for_tests() };
        let compactor = Compactor::new(dialect.clone(), &options);

        let stale_from_rev = compactor.read_compact_revision().await.unwrap();
        dialect.set_compact_revision(stale_from_rev + 1).unwrap();

        let current = dialect.current_revision().unwrap();
        let outcome = compactor.step(stale_from_rev, current).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Rebase));

        // The marker is exactly as the concurrent actor left it: the rebased
        // step must not have touched it or deleted anything.
        assert_eq!(dialect.get_compact_revision().unwrap(), stale_from_rev + 1);
    }
}
