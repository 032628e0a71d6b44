//! Request coalescing for identical concurrent resolutions.
//!
//! The first caller for a key becomes the leader and does the work; later callers
//! wait for its result. A leader that is dropped without completing (client
//! disconnect, cancellation) wakes its followers with no result so that they can
//! retry and elect a new leader.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Notify, OnceCell};
use tracing::debug;

pub struct InFlightState<V> {
    /// `None` once set means the leader gave up.
    result: OnceCell<Option<V>>,
    notify: Notify,
}

impl<V: Clone> InFlightState<V> {
    fn new() -> Self {
        Self {
            result: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    fn set_result(&self, result: Option<V>) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    /// Wait for the leader. `None` means it was abandoned and the caller should retry.
    pub async fn wait(&self) -> Option<V> {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}

/// Outcome of joining a flight.
pub enum Flight<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    Leader(LeaderGuard<'a, K, V>),
    Follower(Arc<InFlightState<V>>),
}

/// In-flight map keyed by resolution key.
pub struct SingleFlight<K, V> {
    in_flight: DashMap<K, Arc<InFlightState<V>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }

    /// Become the leader for `key`, or follow the existing one.
    pub fn join(&self, key: &K) -> Flight<'_, K, V> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => Flight::Follower(entry.get().clone()),
            Entry::Vacant(entry) => {
                let state = Arc::new(InFlightState::new());
                entry.insert(state.clone());
                Flight::Leader(LeaderGuard {
                    flight: self,
                    key: key.clone(),
                    state,
                    completed: false,
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Abandon every flight, waking all followers so they retry.
    pub fn clear(&self) {
        for entry in self.in_flight.iter() {
            entry.value().set_result(None);
        }
        self.in_flight.clear();
    }

    fn finish(&self, key: &K, state: &Arc<InFlightState<V>>, result: Option<V>) {
        self.in_flight
            .remove_if(key, |_, current| Arc::ptr_eq(current, state));
        state.set_result(result);
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Held by the leader. Dropping it without calling [`LeaderGuard::complete`] abandons the flight.
pub struct LeaderGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    flight: &'a SingleFlight<K, V>,
    key: K,
    state: Arc<InFlightState<V>>,
    completed: bool,
}

impl<K, V> LeaderGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Publish the result to every follower.
    pub fn complete(mut self, value: V) {
        self.completed = true;
        self.flight.finish(&self.key, &self.state, Some(value));
    }
}

impl<K, V> Drop for LeaderGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if !self.completed {
            debug!("Single-flight leader abandoned; followers will retry");
            self.flight.finish(&self.key, &self.state, None);
        }
    }
}
