//! Single-flight request coalescing.
//!
//! Concurrent callers asking for the same key while no fetch is registered
//! share one underlying future. The flight deregisters itself when it settles,
//! before any waiter observes the result, so the next call after a failure
//! starts fresh.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub type FlightFuture<O> = Shared<BoxFuture<'static, O>>;

struct Flight<O: Clone> {
    id: u64,
    future: FlightFuture<O>,
    detached: Arc<AtomicBool>,
}

/// Handed to the fetch so it can tell whether it was invalidated mid-flight
#[derive(Debug, Clone)]
pub struct FlightTicket {
    detached: Arc<AtomicBool>,
}

impl FlightTicket {
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

/// Whether the caller started the fetch or joined an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

pub struct SingleFlight<O: Clone> {
    flights: Arc<DashMap<String, Flight<O>>>,
    next_id: AtomicU64,
}

impl<O> SingleFlight<O>
where
    O: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Return the registered flight for `key`, or register the one built by `start`.
    ///
    /// `start` runs under the registry lock and must only construct the future.
    pub fn join_or_start<F, Fut>(&self, key: &str, start: F) -> (FlightFuture<O>, FlightRole)
    where
        F: FnOnce(FlightTicket) -> Fut,
        Fut: Future<Output = O> + Send + 'static,
    {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                debug!(cache_key = key, "Joining in-flight fetch");
                (existing.get().future.clone(), FlightRole::Follower)
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let flights = Arc::clone(&self.flights);
                let owned_key = key.to_string();
                let detached = Arc::new(AtomicBool::new(false));
                let inner = start(FlightTicket {
                    detached: Arc::clone(&detached),
                });

                let future = async move {
                    let output = inner.await;
                    // A newer flight may have replaced this one after a detach
                    flights.remove_if(&owned_key, |_, flight| flight.id == id);
                    output
                }
                .boxed()
                .shared();

                slot.insert(Flight {
                    id,
                    future: future.clone(),
                    detached,
                });
                (future, FlightRole::Leader)
            }
        }
    }

    /// Run `thunk` at most once for all concurrent callers of `key`
    pub async fn run<F, Fut>(&self, key: &str, thunk: F) -> O
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = O> + Send + 'static,
    {
        let (future, _) = self.join_or_start(key, |_| thunk());
        future.await
    }

    /// Forget registrations under `prefix`; running fetches finish but new callers start over.
    ///
    /// A caller arriving before the detached fetch settles runs a second fetch for the same key.
    pub fn detach_prefix(&self, prefix: &str) -> usize {
        let mut detached = 0;
        self.flights.retain(|key, flight| {
            if key.starts_with(prefix) {
                flight.detached.store(true, Ordering::Release);
                detached += 1;
                false
            } else {
                true
            }
        });
        detached
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }

    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

impl<O> Default for SingleFlight<O>
where
    O: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let flights: Arc<SingleFlight<Result<u32, String>>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let flights = flights.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("questions.item.slug", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(7)
                    })
                    .await
            }));
        }

        // let every caller register before releasing the fetch
        while flights.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gate.notify_waiters();
        gate.notify_one();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_deregistered() {
        let flights: SingleFlight<Result<u32, String>> = SingleFlight::new();

        let (first, role_a) = flights.join_or_start("k", |_| async { Err("boom".to_string()) });
        let (second, role_b) = flights.join_or_start("k", |_| async { Ok(1) });
        assert_eq!(role_a, FlightRole::Leader);
        assert_eq!(role_b, FlightRole::Follower);

        assert_eq!(first.await, Err("boom".to_string()));
        assert_eq!(second.await, Err("boom".to_string()));
        assert!(!flights.is_in_flight("k"));

        // next call starts fresh
        assert_eq!(flights.run("k", || async { Ok(2) }).await, Ok(2));
    }

    #[tokio::test]
    async fn test_detached_flight_does_not_remove_its_replacement() {
        let flights: SingleFlight<u32> = SingleFlight::new();
        let (old, _) = flights.join_or_start("diseases.list", |ticket| async move {
            assert!(ticket.is_detached());
            1
        });

        assert_eq!(flights.detach_prefix("diseases"), 1);
        let (new, role) = flights.join_or_start("diseases.list", |ticket| async move {
            assert!(!ticket.is_detached());
            2
        });
        assert_eq!(role, FlightRole::Leader);

        assert_eq!(old.await, 1);
        assert!(flights.is_in_flight("diseases.list"));
        assert_eq!(new.await, 2);
        assert!(!flights.is_in_flight("diseases.list"));
    }
}
