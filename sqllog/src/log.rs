//! The log engine. [see spec 4.3, 6]
//!
//! `SQLLog<D>` is the sole implementer of [`KvLog`]. It owns the doorbell,
//! the broadcaster, and the lifecycle of the poll loop and compactor, which
//! both start lazily on the first `watch` subscription (spec 9: "subscribe
//! starts producer").

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::broadcaster::Broadcaster;
use crate::compactor::Compactor;
use crate::config::Options;
use crate::decode;
use crate::dialect::Dialect;
use crate::error::{CResult, Error};
use crate::event::{AppendRequest, Event, COMPACT_REV_KEY};
use crate::notify::{self, Doorbell, Listener};

/// The contract the log engine exposes to whatever higher-level key-value
/// API sits on top of it. [see spec 6]
#[async_trait]
pub trait KvLog: Send + Sync {
    /// Idempotent. Performs startup `compact_rev_key` maintenance. Does not
    /// itself start the poll loop or compactor -- those start on first
    /// `watch`.
    async fn start(&self) -> CResult<()>;

    /// Appends one event, returning its assigned revision.
    async fn append(&self, request: AppendRequest) -> CResult<i64>;

    /// Lists the state of keys matching `prefix` as of `revision` (current
    /// tip if `revision == 0`), resuming after `start_key` if given.
    async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
        include_deleted: bool,
    ) -> CResult<(i64, Vec<Event>)>;

    /// Every committed event on keys matching `prefix` strictly after
    /// `since_revision`.
    async fn after(&self, prefix: &str, since_revision: i64, limit: i64) -> CResult<(i64, Vec<Event>)>;

    /// `(current_revision, live_key_count)` for keys matching `prefix`.
    async fn count(&self, prefix: &str) -> CResult<(i64, i64)>;

    /// The maximum assigned revision, 0 if the store is empty.
    async fn current_revision(&self) -> CResult<i64>;

    /// Subscribes to committed events on keys matching `prefix`, delivered
    /// in batches of events committed within the same poll iteration.
    async fn watch(&self, prefix: &str) -> CResult<mpsc::Receiver<Vec<Event>>>;
}

/// A SQL-backed log engine over dialect `D`.
pub struct SQLLog<D: Dialect> {
    dialect: Arc<D>,
    options: Options,
    doorbell: Doorbell,
    listener: StdMutex<Option<Listener>>,
    broadcaster: Arc<Broadcaster<Vec<Event>>>,
    start_signal: Arc<Notify>,
    cancel: CancellationToken,
    background_started: AtomicI64,
}

fn spawn_err(err: tokio::task::JoinError) -> Error {
    Error::Fatal(format!("background task panicked: {err}"))
}

/// Mirrors the dialect's `%`-wildcard convention: a prefix ending in `/` is
/// a namespace and matches everything under it; anything else is a single
/// key lookup. [see spec 4.3.3]
fn normalize_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        format!("{prefix}%")
    } else {
        prefix.to_string()
    }
}

struct PrefixMatcher {
    exact: Option<Vec<u8>>,
    prefix: Option<Vec<u8>>,
}

impl PrefixMatcher {
    fn new(pattern: &str) -> Self {
        match pattern.strip_suffix('%') {
            Some(stripped) => PrefixMatcher { exact: None, prefix: Some(stripped.as_bytes().to_vec()) },
            None => PrefixMatcher { exact: Some(pattern.as_bytes().to_vec()), prefix: None },
        }
    }

    fn matches(&self, key: &[u8]) -> bool {
        if let Some(prefix) = &self.prefix {
            key.starts_with(prefix)
        } else if let Some(exact) = &self.exact {
            key == exact.as_slice()
        } else {
            false
        }
    }
}

async fn forward_filtered(
    mut raw: mpsc::Receiver<Vec<Event>>,
    out: mpsc::Sender<Vec<Event>>,
    pattern: String,
) {
    let matcher = PrefixMatcher::new(&pattern);
    while let Some(batch) = raw.recv().await {
        let filtered: Vec<Event> = batch.into_iter().filter(|e| matcher.matches(&e.kv.key)).collect();
        if filtered.is_empty() {
            continue;
        }
        if out.send(filtered).await.is_err() {
            break;
        }
    }
}

impl<D: Dialect> SQLLog<D> {
    pub fn new(dialect: D, options: Options) -> Self {
        let (doorbell, listener) = notify::doorbell();
        let start_signal = Arc::new(Notify::new());
        let broadcaster = Arc::new(Broadcaster::new(options.subscriber_buffer, start_signal.clone()));
        SQLLog {
            dialect: Arc::new(dialect),
            options,
            doorbell,
            listener: StdMutex::new(Some(listener)),
            broadcaster,
            start_signal,
            cancel: CancellationToken::new(),
            background_started: AtomicI64::new(0),
        }
    }

    /// Cancels the poll loop and compactor, if they were ever started.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn startup_cleanup(&self) -> CResult<()> {
        let dialect = self.dialect.clone();
        let row_set = tokio::task::spawn_blocking(move || dialect.after(COMPACT_REV_KEY, 0, 0))
            .await
            .map_err(spawn_err)??;

        match row_set.rows.len() {
            0 => {
                self.append(AppendRequest {
                    key: COMPACT_REV_KEY.as_bytes().to_vec(),
                    create: true,
                    ..Default::default()
                })
                .await?;
            }
            1 => {}
            _ => {
                let dialect = self.dialect.clone();
                tokio::task::spawn_blocking(move || -> CResult<()> {
                    // Invariant 5: keep the row with the greatest `prev_revision`,
                    // not the greatest `id` -- a prior buggy run may have left the
                    // higher-id row holding a stale marker.
                    let keep_id = row_set
                        .rows
                        .iter()
                        .max_by_key(|row| row.prev_revision)
                        .map(|row| row.id)
                        .unwrap_or(0);
                    let mut tx = dialect.begin_tx()?;
                    for row in &row_set.rows {
                        if row.id != keep_id {
                            tx.delete_revision(row.id)?;
                        }
                    }
                    tx.commit()?;
                    Ok(())
                })
                .await
                .map_err(spawn_err)??;
            }
        }
        Ok(())
    }

    /// Waits for the first `watch` subscription, then spawns the poll loop
    /// and the compactor. Runs once per `SQLLog`; a second `start()` call is
    /// a no-op here since the background task itself only ever fires once
    /// (`start_signal` is a one-shot notify).
    fn spawn_lifecycle(&self) {
        if self.background_started.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        let listener = self.listener.lock().expect("listener mutex poisoned").take();
        let Some(listener) = listener else { return };

        let dialect = self.dialect.clone();
        let broadcaster = self.broadcaster.clone();
        let doorbell = self.doorbell.clone();
        let options = self.options.clone();
        let cancel = self.cancel.clone();
        let start_signal = self.start_signal.clone();

        tokio::spawn(async move {
            start_signal.notified().await;

            let seed_dialect = dialect.clone();
            let compact_revision = tokio::task::spawn_blocking(move || seed_dialect.get_compact_revision())
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or(0);

            spawn_poll_loop(dialect.clone(), broadcaster, doorbell, listener, options.clone(), compact_revision, cancel.clone());

            let compactor = Arc::new(Compactor::new(dialect, &options));
            compactor.spawn(cancel);
        });
    }
}

/// The poll loop. [see spec 4.3.5]
///
/// A single task serves every watcher. `last` is the last revision it has
/// folded into its local state; `skip`/`skip_time` track a revision gap it
/// is waiting out before escalating to `fill`, then to the safety-valve
/// advance.
fn spawn_poll_loop<D: Dialect>(
    dialect: Arc<D>,
    broadcaster: Arc<Broadcaster<Vec<Event>>>,
    doorbell: Doorbell,
    mut listener: Listener,
    options: Options,
    start_revision: i64,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = start_revision;
        let mut skip: i64 = 0;
        let mut skip_time = tokio::time::Instant::now();
        let mut wait_for_more = false;
        let mut ticker = tokio::time::interval(options.poll_idle_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if wait_for_more {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = listener.wait() => {}
                    _ = ticker.tick() => {}
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            wait_for_more = true;

            let d = dialect.clone();
            let batch_size = options.poll_batch_size;
            let row_set = match tokio::task::spawn_blocking(move || d.after("%", last, batch_size)).await {
                Ok(Ok(row_set)) => row_set,
                Ok(Err(err)) => {
                    log::warn!("poll loop: reading changes after {last} failed: {err}");
                    continue;
                }
                Err(err) => {
                    log::warn!("poll loop: read task panicked: {err}");
                    continue;
                }
            };

            let decoded = decode::decode(&row_set);
            if decoded.events.is_empty() {
                continue;
            }
            wait_for_more = decoded.events.len() < 100;

            let mut rev = last;
            let mut sequential = Vec::with_capacity(decoded.events.len());
            let mut save_last = false;
            let mut index = 0;
            while index < decoded.events.len() {
                let event = &decoded.events[index];
                let next = rev + 1;
                if event.kv.mod_revision != next {
                    let now = tokio::time::Instant::now();
                    if skip == next && now.duration_since(skip_time) > Duration::from_secs(1) {
                        log::warn!("GAP: revision {next} never arrived, advancing past it");
                        rev = next;
                        skip = 0;
                        save_last = true;
                        // re-evaluate this same event against the bumped revision
                        continue;
                    } else if skip != next {
                        skip = next;
                        skip_time = now;
                        doorbell.ring(next);
                        break;
                    } else {
                        let d = dialect.clone();
                        if let Err(err) = tokio::task::spawn_blocking(move || d.fill(next)).await.map_err(spawn_err) {
                            log::warn!("poll loop: fill task for {next} panicked: {err}");
                        }
                        doorbell.ring(next);
                        break;
                    }
                } else {
                    rev = event.kv.mod_revision;
                    skip = 0;
                    save_last = true;
                    if !event.is_fill() {
                        sequential.push(event.clone());
                    }
                    index += 1;
                }
            }

            if save_last {
                last = rev;
                if !sequential.is_empty() {
                    broadcaster.publish(sequential).await;
                }
            }
        }
    })
}

#[async_trait]
impl<D: Dialect> KvLog for SQLLog<D> {
    async fn start(&self) -> CResult<()> {
        self.startup_cleanup().await?;
        self.spawn_lifecycle();
        Ok(())
    }

    async fn append(&self, request: AppendRequest) -> CResult<i64> {
        let dialect = self.dialect.clone();
        let revision = tokio::task::spawn_blocking(move || {
            dialect.insert(
                &request.key,
                request.create,
                request.delete,
                request.create_revision,
                request.prev_revision,
                request.lease,
                &request.value,
                &request.prev_value,
            )
        })
        .await
        .map_err(spawn_err)??;
        self.doorbell.ring(revision);
        Ok(revision)
    }

    async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
        include_deleted: bool,
    ) -> CResult<(i64, Vec<Event>)> {
        let normalized = normalize_prefix(prefix);
        let mut start_key = start_key.to_string();
        if start_key == prefix {
            start_key.clear();
        }
        if !normalized.ends_with('%') {
            start_key.clear();
        }

        let dialect = self.dialect.clone();
        let query_prefix = normalized.clone();
        let query_start_key = start_key.clone();
        let row_set = tokio::task::spawn_blocking(move || {
            if revision == 0 {
                dialect.list_current(&query_prefix, limit, include_deleted)
            } else {
                dialect.list(&query_prefix, &query_start_key, limit, revision, include_deleted)
            }
        })
        .await
        .map_err(spawn_err)??;

        // The dialect already decorates empty result sets with the current
        // and compact revisions (spec 4.1), so there is no separate fetch
        // needed here for the empty-but-stale case spec 4.3.3 describes.
        let decoded = decode::decode(&row_set);
        self.doorbell.ring(decoded.current_revision);
        if decoded.is_stale(revision) {
            return Err(Error::Compacted {
                compact_revision: decoded.compact_revision,
                requested_revision: revision,
                revision: decoded.current_revision,
                events: decoded.events,
            });
        }
        Ok((decoded.current_revision, decoded.events))
    }

    async fn after(&self, prefix: &str, since_revision: i64, limit: i64) -> CResult<(i64, Vec<Event>)> {
        let normalized = normalize_prefix(prefix);
        let dialect = self.dialect.clone();
        let query_prefix = normalized.clone();
        let row_set = tokio::task::spawn_blocking(move || dialect.after(&query_prefix, since_revision, limit))
            .await
            .map_err(spawn_err)??;

        let decoded = decode::decode(&row_set);
        self.doorbell.ring(decoded.current_revision);
        if decoded.is_stale(since_revision) {
            return Err(Error::Compacted {
                compact_revision: decoded.compact_revision,
                requested_revision: since_revision,
                revision: decoded.current_revision,
                events: decoded.events,
            });
        }
        Ok((decoded.current_revision, decoded.events))
    }

    async fn count(&self, prefix: &str) -> CResult<(i64, i64)> {
        let normalized = normalize_prefix(prefix);
        let dialect = self.dialect.clone();
        tokio::task::spawn_blocking(move || dialect.count(&normalized)).await.map_err(spawn_err)?
    }

    async fn current_revision(&self) -> CResult<i64> {
        let dialect = self.dialect.clone();
        tokio::task::spawn_blocking(move || dialect.current_revision()).await.map_err(spawn_err)?
    }

    async fn watch(&self, prefix: &str) -> CResult<mpsc::Receiver<Vec<Event>>> {
        let normalized = normalize_prefix(prefix);
        let raw = self.broadcaster.subscribe().await;
        let (tx, rx) = mpsc::channel(self.options.subscriber_buffer);
        tokio::spawn(forward_filtered(raw, tx, normalized));
        Ok(rx)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dialect::sqlite::SqliteDialect;
    use std::time::Duration as StdDuration;

    fn new_log() -> SQLLog<SqliteDialect> {
        let dialect = SqliteDialect::open_in_memory("kine").expect("open in-memory dialect");
        SQLLog::new(dialect, Options::for_tests())
    }

    fn create_request(key: &str, value: &[u8]) -> AppendRequest {
        AppendRequest { key: key.as_bytes().to_vec(), value: value.to_vec(), create: true, ..Default::default() }
    }

    async fn recv_within(rx: &mut mpsc::Receiver<Vec<Event>>, millis: u64) -> Option<Vec<Event>> {
        tokio::time::timeout(StdDuration::from_millis(millis), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn append_and_observe() {
        let log = new_log();
        log.start().await.unwrap();

        let mut watch = log.watch("/k/").await.unwrap();
        let revision = log.append(create_request("/k/a", b"v1")).await.unwrap();

        let batch = recv_within(&mut watch, 500).await.expect("expected a batch");
        assert_eq!(batch.len(), 1);
        assert!(batch[0].is_create());
        assert_eq!(batch[0].kv.key, b"/k/a");
        assert_eq!(batch[0].kv.mod_revision, revision);
        assert_eq!(batch[0].kv.value, b"v1");
    }

    #[tokio::test]
    async fn concurrent_cas_append_conflicts() {
        let log = new_log();
        log.start().await.unwrap();

        let r1 = log.append(create_request("/k/a", b"v1")).await.unwrap();

        let update = AppendRequest {
            key: b"/k/a".to_vec(),
            value: b"v2".to_vec(),
            prev_revision: r1,
            create_revision: r1,
            ..Default::default()
        };
        let second = update.clone();

        let r2 = log.append(update).await.unwrap();
        assert!(r2 > r1);

        let err = log.append(second).await.unwrap_err();
        assert!(matches!(err, Error::Conflict));
    }

    #[tokio::test]
    async fn list_at_historical_revision_returns_only_that_event() {
        let log = new_log();
        log.start().await.unwrap();

        let r1 = log.append(create_request("/k/a", b"v1")).await.unwrap();
        let update = AppendRequest {
            key: b"/k/a".to_vec(),
            value: b"v2".to_vec(),
            prev_revision: r1,
            create_revision: r1,
            ..Default::default()
        };
        let r2 = log.append(update).await.unwrap();
        assert!(r2 > r1);

        let (revision, events) = log.list("/k/", "", 0, r1, false).await.unwrap();
        assert_eq!(revision, r2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kv.mod_revision, r1);

        let (_, current) = log.list("/k/", "", 0, 0, false).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].kv.mod_revision, r2);
    }

    #[tokio::test]
    async fn startup_collapses_duplicate_compact_rev_key_rows() {
        let dialect = SqliteDialect::open_in_memory("kine").expect("open in-memory dialect");
        let x = dialect.insert(COMPACT_REV_KEY.as_bytes(), true, false, 0, 0, 0, b"", b"").unwrap();
        let y = dialect.insert(COMPACT_REV_KEY.as_bytes(), false, false, 0, x, 0, b"", b"").unwrap();

        let log = SQLLog::new(dialect, Options::for_tests());
        log.start().await.unwrap();

        let (_, events) = log.after(COMPACT_REV_KEY, 0, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kv.mod_revision, y);
    }
}
