//! Registry of connections pending routing.
//!
//! # Responsibilities
//! - Map `ConnectionId` to its `RoutingState`
//! - Provide the single atomic test-and-remove that decides which caller
//!   performs a connection's teardown or handoff
//!
//! # Design Decisions
//! - Backed by `DashMap`; no reference counting across call paths
//! - `remove` returning `None` is the normal outcome of a lost race, not an error
//! - Accessors take closures so no entry guard outlives a call; holding a
//!   guard while calling `remove` on the same shard would deadlock

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::RoutingError;
use crate::net::connection::ConnectionId;
use crate::routing::state::RoutingState;

/// Thread-safe store of pending routing states.
pub struct RoutingRegistry<K> {
    entries: DashMap<ConnectionId, RoutingState<K>>,
}

impl<K> RoutingRegistry<K> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a pending connection. Never overwrites an existing entry.
    pub fn insert(&self, id: ConnectionId, state: RoutingState<K>) -> Result<(), RoutingError> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(RoutingError::DuplicateConnection(id)),
            Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(())
            }
        }
    }

    /// Observe an entry without taking ownership.
    pub fn lookup<R>(&self, id: ConnectionId, f: impl FnOnce(&RoutingState<K>) -> R) -> Option<R> {
        self.entries.get(&id).map(|entry| f(entry.value()))
    }

    /// Mutate an entry in place. The entry stays locked for the duration of `f`.
    pub fn with_state_mut<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut RoutingState<K>) -> R,
    ) -> Option<R> {
        self.entries.get_mut(&id).map(|mut entry| f(entry.value_mut()))
    }

    /// Atomically take the entry out. At most one caller ever gets `Some`.
    pub fn remove(&self, id: ConnectionId) -> Option<RoutingState<K>> {
        self.entries.remove(&id).map(|(_, state)| state)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K> Default for RoutingRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}
