//! Replay-on-subscribe observables.
//!
//! Every per-session event surface (local media, remote media, lifecycle
//! state, hangup) has the same shape: a late subscriber must immediately see
//! the last known value if one exists, and every subscriber sees all values
//! emitted afterwards. [`Observable`] names that primitive once instead of
//! re-implementing the bookkeeping per event.

use std::sync::Mutex;

use tokio::sync::mpsc;

/// Last-value cache plus listener list.
pub struct Observable<T: Clone> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    last: Option<T>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

impl<T: Clone> Observable<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                last: None,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Subscribe to this observable.
    ///
    /// If a value was ever emitted, the receiver immediately yields the most
    /// recent one before any new emissions.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        if let Some(last) = &inner.last {
            // Unbounded send only fails when the receiver is gone, which it
            // cannot be here.
            let _ = tx.send(last.clone());
        }
        inner.subscribers.push(tx);
        rx
    }

    /// Emit a value: cache it and fan out to all live subscribers.
    pub fn emit(&self, value: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        inner.last = Some(value);
    }

    /// Peek at the most recently emitted value.
    pub fn latest(&self) -> Option<T> {
        self.inner.lock().unwrap().last.clone()
    }
}

impl<T: Clone> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_late_subscriber_sees_last_value() {
        let obs = Observable::new();
        obs.emit(1u32);
        obs.emit(2u32);

        let mut rx = obs.subscribe();
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_subscriber_without_prior_value_waits() {
        let obs: Observable<u32> = Observable::new();
        let mut rx = obs.subscribe();
        assert!(rx.try_recv().is_err());

        obs.emit(7);
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let obs = Observable::new();
        let mut a = obs.subscribe();
        let mut b = obs.subscribe();

        obs.emit("x");
        assert_eq!(a.recv().await, Some("x"));
        assert_eq!(b.recv().await, Some("x"));
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let obs = Observable::new();
        let rx = obs.subscribe();
        drop(rx);

        // Must not fail or leak; the dead sender is dropped on next emit.
        obs.emit(1u8);
        assert_eq!(obs.latest(), Some(1));
    }

    #[test]
    fn test_latest_reflects_most_recent_emission() {
        let obs = Observable::new();
        assert_eq!(obs.latest(), None);
        obs.emit(10i64);
        obs.emit(20i64);
        assert_eq!(obs.latest(), Some(20));
    }
}
