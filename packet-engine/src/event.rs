//! Level-triggered, awaitable events.
//!
//! An [`Event`] is a boolean flag that callers can poll with
//! [`Event::is_set`] or await with [`Event::wait`]. The engine sets a
//! stream's source event while in-order bytes are waiting to be read and its
//! sink event while the send window has room.

use std::time::Duration;

use tokio::sync::watch;

/// A set/reset flag that tasks can wait on.
#[derive(Debug)]
pub struct Event {
    tx: watch::Sender<bool>,
}

impl Event {
    /// Create an event in the given initial state.
    pub fn new(set: bool) -> Self {
        let (tx, _rx) = watch::channel(set);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_if_modified(|v| !std::mem::replace(v, true));
    }

    pub fn reset(&self) {
        self.tx.send_if_modified(|v| std::mem::replace(v, false));
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the event is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|set| *set).await;
    }

    /// Wait until the event is set or `timeout` elapses; returns whether it
    /// was set.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn set_wakes_waiter() {
        let ev = Arc::new(Event::new(false));
        let waiter = {
            let ev = Arc::clone(&ev);
            tokio::spawn(async move { ev.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ev.set();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_timeout_reports_state() {
        let ev = Event::new(false);
        assert!(!ev.wait_timeout(Duration::from_millis(20)).await);
        ev.set();
        assert!(ev.is_set());
        assert!(ev.wait_timeout(Duration::from_millis(20)).await);
        ev.reset();
        assert!(!ev.is_set());
    }
}
