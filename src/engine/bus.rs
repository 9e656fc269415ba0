//! Notification bus - in-process pub/sub keyed by run id
//!
//! Observers register a callback for one run id (or for every run via
//! [`NotificationBus::subscribe_all`]). [`NotificationBus::publish`] invokes
//! the callbacks registered at that moment, synchronously and in
//! registration order. There is no replay: a subscriber that registers after
//! a transition was published never sees it.
//!
//! A panicking callback is contained and logged; the remaining callbacks
//! still run and the publisher is unaffected.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::warn;

use super::run::Run;

pub type Callback = Arc<dyn Fn(&Run) + Send + Sync>;

#[derive(Default)]
struct BusState {
    by_run: HashMap<String, Vec<(u64, Callback)>>,
    wildcard: Vec<(u64, Callback)>,
}

/// Pub/sub for run snapshots. Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct NotificationBus {
    state: Arc<Mutex<BusState>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("NotificationBus")
            .field("runs", &state.by_run.len())
            .field("wildcard", &state.wildcard.len())
            .finish()
    }
}

/// Which list a subscription lives in
#[derive(Debug, Clone, PartialEq, Eq)]
enum Topic {
    Run(String),
    All,
}

/// Handle returned by `subscribe`; call [`Subscription::unsubscribe`] to stop
/// receiving updates. Dropping the handle keeps the subscription alive.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: Topic,
    bus: Weak<Mutex<BusState>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(state) = self.bus.upgrade() {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            remove_subscriber(&mut state, &self.topic, self.id);
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        match &self.topic {
            Topic::Run(id) => Some(id),
            Topic::All => None,
        }
    }
}

fn remove_subscriber(state: &mut BusState, topic: &Topic, id: u64) {
    match topic {
        Topic::Run(run_id) => {
            if let Some(list) = state.by_run.get_mut(run_id) {
                list.retain(|(sid, _)| *sid != id);
                if list.is_empty() {
                    state.by_run.remove(run_id);
                }
            }
        }
        Topic::All => state.wildcard.retain(|(sid, _)| *sid != id),
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // a callback never runs under the lock, so poisoning only means a
        // panic elsewhere; the map itself is still consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receive every snapshot published for `run_id`
    pub fn subscribe<F>(&self, run_id: &str, callback: F) -> Subscription
    where
        F: Fn(&Run) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .by_run
            .entry(run_id.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            topic: Topic::Run(run_id.to_string()),
            bus: Arc::downgrade(&self.state),
        }
    }

    /// Receive every snapshot for every run
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Run) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().wildcard.push((id, Arc::new(callback)));
        Subscription {
            id,
            topic: Topic::All,
            bus: Arc::downgrade(&self.state),
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        subscription.unsubscribe();
    }

    /// Deliver a snapshot to the current subscribers of `run_id`, then to
    /// wildcard subscribers. Returns how many callbacks ran without panicking.
    pub fn publish(&self, run_id: &str, snapshot: &Run) -> usize {
        // snapshot the callback list so callbacks may (un)subscribe freely
        let callbacks: Vec<Callback> = {
            let state = self.lock();
            state
                .by_run
                .get(run_id)
                .into_iter()
                .flatten()
                .chain(state.wildcard.iter())
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };

        let mut delivered = 0;
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(snapshot))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(run_id, "Run observer panicked; continuing with remaining observers"),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.lock().by_run.get(run_id).map_or(0, Vec::len)
    }
}
