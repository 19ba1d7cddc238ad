//! The "doorbell": a coalescing wakeup signal between the append path and
//! the poll loop. [see spec 9.2]
//!
//! Many appends can happen between two wakeups of the poll loop; the
//! doorbell only needs to guarantee "at least one wakeup happens after the
//! last append", not one wakeup per append. `tokio::sync::watch` already has
//! exactly that coalescing behavior built in, so this module is a thin,
//! named wrapper rather than a new primitive.

use tokio::sync::watch;

/// Rings the doorbell. `ring` never blocks and never fails: a watch channel
/// always has a receiver-side slot, so a send only overwrites whatever
/// revision was last waiting to be observed.
#[derive(Clone)]
pub struct Doorbell {
    tx: watch::Sender<i64>,
}

/// The listening end. Call [`Listener::wait`] to block until the doorbell
/// has rung since the last observation.
pub struct Listener {
    rx: watch::Receiver<i64>,
}

/// Creates a doorbell pair seeded at revision 0.
pub fn doorbell() -> (Doorbell, Listener) {
    let (tx, rx) = watch::channel(0);
    (Doorbell { tx }, Listener { rx })
}

impl Doorbell {
    /// Rings the doorbell for `revision`. If `revision` is not newer than
    /// whatever is currently pending, this is a harmless no-op -- the
    /// listener only cares that *a* ring at least this recent happened.
    pub fn ring(&self, revision: i64) {
        self.tx.send_if_modified(|current| {
            if revision > *current {
                *current = revision;
                true
            } else {
                false
            }
        });
    }
}

impl Listener {
    /// Blocks until the doorbell rings at a revision newer than the last one
    /// this listener observed, then returns that revision. Ringing that
    /// happened before this call is captured immediately (a watch channel
    /// does not lose the most recent value), so a listener can never miss a
    /// wakeup, only coalesce several into one.
    pub async fn wait(&mut self) -> i64 {
        let _ = self.rx.changed().await;
        *self.rx.borrow_and_update()
    }

    /// Non-blocking read of the last rung revision, without marking it seen.
    /// Used by the poll loop to decide whether it has more work queued up
    /// without giving up its place in line.
    pub fn peek(&self) -> i64 {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_if_already_rung() {
        let (bell, mut listener) = doorbell();
        bell.ring(5);
        let revision = tokio::time::timeout(std::time::Duration::from_millis(100), listener.wait())
            .await
            .expect("wait should not time out");
        assert_eq!(revision, 5);
    }

    #[tokio::test]
    async fn repeated_rings_coalesce_into_one_wakeup() {
        let (bell, mut listener) = doorbell();
        bell.ring(1);
        bell.ring(2);
        bell.ring(3);
        let revision = listener.wait().await;
        assert_eq!(revision, 3);

        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), listener.wait()).await;
        assert!(timed_out.is_err(), "no further ring happened, wait should still be pending");
    }

    #[tokio::test]
    async fn ring_with_stale_revision_does_not_wake_a_listener_past_it() {
        let (bell, mut listener) = doorbell();
        bell.ring(10);
        let _ = listener.wait().await;
        bell.ring(3);
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), listener.wait()).await;
        assert!(timed_out.is_err());
    }
}
