//! Single-producer, multi-subscriber fan-out from the poll loop to watchers.
//! [see spec 4.3.4, design note 9.3]
//!
//! Every subscriber gets its own bounded channel. A slow subscriber fills
//! its own buffer and makes the next `publish` wait -- it never causes
//! another subscriber to miss events, and it is never silently dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};

/// Fans a stream of `T` out to however many subscribers are currently
/// registered. `T` must be cheap to clone: one value is cloned once per
/// subscriber on every publish.
pub struct Broadcaster<T> {
    subscribers: Mutex<Vec<mpsc::Sender<T>>>,
    buffer: usize,
    started: AtomicBool,
    start_signal: Arc<Notify>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// `buffer` is the per-subscriber channel capacity (spec default: 100).
    /// `start_signal` is notified exactly once, on the first call to
    /// [`subscribe`](Self::subscribe) -- the poll loop awaits it before
    /// doing any work, so no database polling happens until at least one
    /// watcher actually exists.
    pub fn new(buffer: usize, start_signal: Arc<Notify>) -> Self {
        Broadcaster { subscribers: Mutex::new(Vec::new()), buffer, started: AtomicBool::new(false), start_signal }
    }

    /// Registers a new subscriber and returns its receiving end. Triggers
    /// the producer start signal the first time it is called.
    pub async fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.lock().await.push(tx);
        if self.started.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            self.start_signal.notify_one();
        }
        rx
    }

    /// Current subscriber count, including any that have since closed but
    /// have not yet been reaped by a `publish`.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Delivers `item` to every live subscriber, in registration order,
    /// waiting for buffer space rather than dropping. Subscribers whose
    /// receiver has been dropped are reaped from the list.
    pub async fn publish(&self, item: T) {
        let mut subscribers = self.subscribers.lock().await;
        let mut dead = Vec::new();
        for (index, tx) in subscribers.iter().enumerate() {
            if tx.send(item.clone()).await.is_err() {
                dead.push(index);
            }
        }
        for index in dead.into_iter().rev() {
            subscribers.remove(index);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn subscribing_fires_the_start_signal_exactly_once() {
        let signal = Arc::new(Notify::new());
        let broadcaster: Broadcaster<i32> = Broadcaster::new(4, signal.clone());

        let waited = tokio::time::timeout(Duration::from_millis(50), signal.notified()).await;
        assert!(waited.is_err(), "signal must not fire before any subscriber exists");

        let _rx1 = broadcaster.subscribe().await;
        tokio::time::timeout(Duration::from_millis(50), signal.notified())
            .await
            .expect("signal must fire on first subscribe");

        let _rx2 = broadcaster.subscribe().await;
        assert_eq!(broadcaster.subscriber_count().await, 2);
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let signal = Arc::new(Notify::new());
        let broadcaster: Broadcaster<i32> = Broadcaster::new(4, signal);
        let mut rx1 = broadcaster.subscribe().await;
        let mut rx2 = broadcaster.subscribe().await;

        broadcaster.publish(7).await;

        assert_eq!(rx1.recv().await, Some(7));
        assert_eq!(rx2.recv().await, Some(7));
    }

    #[tokio::test]
    async fn dropped_subscriber_is_reaped_on_next_publish() {
        let signal = Arc::new(Notify::new());
        let broadcaster: Broadcaster<i32> = Broadcaster::new(4, signal);
        let rx1 = broadcaster.subscribe().await;
        drop(rx1);
        let mut rx2 = broadcaster.subscribe().await;

        broadcaster.publish(1).await;
        assert_eq!(rx2.recv().await, Some(1));
        assert_eq!(broadcaster.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn a_full_subscriber_buffer_makes_publish_wait_rather_than_drop() {
        let signal = Arc::new(Notify::new());
        let broadcaster: Arc<Broadcaster<i32>> = Arc::new(Broadcaster::new(1, signal));
        let mut rx = broadcaster.subscribe().await;

        broadcaster.publish(1).await; // fills the one slot of capacity

        let b = broadcaster.clone();
        let publisher = tokio::spawn(async move {
            b.publish(2).await;
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!publisher.is_finished(), "publish must block while the buffer is full");

        assert_eq!(rx.recv().await, Some(1));
        publisher.await.unwrap();
        assert_eq!(rx.recv().await, Some(2));
    }
}
