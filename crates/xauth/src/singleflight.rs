use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::error::{Error, Result};

/// Coalesces concurrent loads for the same key into one underlying operation.
///
/// The first caller for a key becomes the leader and runs the load; callers
/// arriving while it is in flight await the leader and share its outcome. The
/// leader's cancellation cancels all waiters: if the leader future is dropped
/// the channel closes and waiters observe [`Error::LoadCancelled`].
pub(crate) struct Flight<T> {
    calls: Mutex<HashMap<String, broadcast::Sender<Result<T>>>>,
}

enum Role<T> {
    Leader(broadcast::Sender<Result<T>>),
    Follower(broadcast::Receiver<Result<T>>),
}

impl<T: Clone + Send + 'static> Flight<T> {
    pub(crate) fn new() -> Self {
        Flight {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `load` under the single-flight guard for `key`.
    pub(crate) async fn run<F, Fut>(&self, key: &str, load: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let role = {
            let mut calls = self.calls.lock().expect("Non-poisoned lock");
            match calls.get(key) {
                Some(tx) => Role::Follower(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    calls.insert(key.to_string(), tx.clone());
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => match rx.recv().await {
                Ok(result) => result,
                Err(_) => Err(Error::LoadCancelled),
            },
            Role::Leader(tx) => {
                // Remove the entry even if the load future is dropped
                // mid-flight, so a stale sender never strands later callers.
                let guard = FlightGuard { flight: self, key };
                let result = load().await;
                drop(guard);
                // Deregistered before fan-out: a caller arriving now starts a
                // fresh flight instead of subscribing to a spent channel.
                let _ = tx.send(result.clone());
                result
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.calls.lock().expect("Non-poisoned lock").len()
    }
}

impl<T> std::fmt::Debug for Flight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.calls.lock().expect("Non-poisoned lock").len();
        f.debug_struct("Flight").field("in_flight", &len).finish()
    }
}

struct FlightGuard<'a, T> {
    flight: &'a Flight<T>,
    key: &'a str,
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        self.flight
            .calls
            .lock()
            .expect("Non-poisoned lock")
            .remove(self.key);
    }
}
