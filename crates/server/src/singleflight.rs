//! Collapse concurrent identical work into one execution.
//!
//! The first caller for a key becomes the leader and receives a
//! [`FlightGuard`]; later callers for the same key receive a receiver that
//! yields the leader's result. The guard removes the key when it completes or
//! is dropped, so a panicking leader never wedges the key: waiters see the
//! channel close instead.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A keyed set of in-flight operations.
pub struct SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    inflight: Arc<DashMap<K, broadcast::Sender<V>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }
}

impl<K, V> Clone for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inflight: self.inflight.clone(),
        }
    }
}

/// How a caller joined a flight.
pub enum Flight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// No flight was running; the caller must run the work and complete the guard.
    Leader {
        guard: FlightGuard<K, V>,
        receiver: broadcast::Receiver<V>,
    },
    /// A flight was already running.
    Follower { receiver: broadcast::Receiver<V> },
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, starting one if none is running.
    pub fn join(&self, key: K) -> Flight<K, V> {
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(existing) => Flight::Follower {
                receiver: existing.get().subscribe(),
            },
            Entry::Vacant(slot) => {
                // One slot is enough: each flight sends exactly once.
                let (sender, receiver) = broadcast::channel(1);
                slot.insert(sender.clone());
                Flight::Leader {
                    guard: FlightGuard {
                        key: Some(key),
                        sender,
                        inflight: self.inflight.clone(),
                    },
                    receiver,
                }
            }
        }
    }

    /// Number of keys with a running flight.
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

/// Held by the leader of a flight.
pub struct FlightGuard<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    key: Option<K>,
    sender: broadcast::Sender<V>,
    inflight: Arc<DashMap<K, broadcast::Sender<V>>>,
}

impl<K, V> FlightGuard<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Publish the result to every waiter and retire the key.
    ///
    /// The key is removed before sending: a caller arriving afterwards starts
    /// a fresh flight (and finds whatever the leader persisted) instead of
    /// subscribing to a channel that already fired.
    pub fn complete(mut self, value: V) {
        self.retire();
        // No receivers left is fine: every waiter may have timed out.
        let _ = self.sender.send(value);
    }

    fn retire(&mut self) {
        if let Some(key) = self.key.take() {
            self.inflight.remove(&key);
        }
    }
}

impl<K, V> Drop for FlightGuard<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        self.retire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_followers_receive_leader_result() {
        let flights: SingleFlight<&'static str, u32> = SingleFlight::new();

        let (guard, mut leader_rx) = match flights.join("a") {
            Flight::Leader { guard, receiver } => (guard, receiver),
            Flight::Follower { .. } => panic!("first caller must lead"),
        };
        let mut follower_rx = match flights.join("a") {
            Flight::Follower { receiver } => receiver,
            Flight::Leader { .. } => panic!("second caller must follow"),
        };

        guard.complete(7);
        assert_eq!(leader_rx.recv().await.unwrap(), 7);
        assert_eq!(follower_rx.recv().await.unwrap(), 7);
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_share() {
        let flights: SingleFlight<u8, u8> = SingleFlight::new();
        assert!(matches!(flights.join(1), Flight::Leader { .. }));
        // The guard from the first join was dropped, so key 1 is free again.
        assert!(matches!(flights.join(1), Flight::Leader { .. }));
        let _held = flights.join(2);
        assert!(matches!(flights.join(3), Flight::Leader { .. }));
    }

    #[tokio::test]
    async fn test_panicking_leader_releases_key() {
        let flights: SingleFlight<u8, u8> = SingleFlight::new();
        let Flight::Leader { guard, .. } = flights.join(9) else {
            panic!("expected leader");
        };
        let Flight::Follower { mut receiver } = flights.join(9) else {
            panic!("expected follower");
        };

        let handle = tokio::spawn(async move {
            let _guard = guard;
            panic!("fetch blew up");
        });
        assert!(handle.await.unwrap_err().is_panic());

        assert!(receiver.recv().await.is_err());
        assert!(flights.is_empty());
        assert!(matches!(flights.join(9), Flight::Leader { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_joiners_run_work_once() {
        let flights: SingleFlight<u8, usize> = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let flights = flights.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                match flights.join(1) {
                    Flight::Leader { guard, mut receiver } => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
                        guard.complete(n);
                        receiver.recv().await.unwrap()
                    }
                    Flight::Follower { mut receiver } => receiver.recv().await.unwrap(),
                }
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| *r == 1));
    }
}
