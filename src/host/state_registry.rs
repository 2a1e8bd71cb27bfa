//! In-process entity state registry.
//!
//! Holds the latest state of every known entity and the change callbacks
//! registered per entity. `set_state` stores the new state and invokes the
//! callbacks synchronously on the caller's thread.

use super::{
    Attributes, CancelHandle, EntityState, Host, StateCallback, StateChangedEvent,
    SubscriptionHandle, TickCallback, TimerHandle,
};
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Default)]
struct Inner {
    states: RwLock<HashMap<String, EntityState>>,
    listeners: RwLock<HashMap<String, Vec<(u64, StateCallback)>>>,
    next_listener_id: AtomicU64,
}

impl Inner {
    fn unsubscribe(&self, entity_id: &str, id: u64) {
        let mut listeners = self.listeners.write();
        if let Some(list) = listeners.get_mut(entity_id) {
            list.retain(|(listener_id, _)| *listener_id != id);
            if list.is_empty() {
                listeners.remove(entity_id);
            }
        }
    }
}

/// Thread-safe entity state store with change subscriptions.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone, Default)]
pub struct StateRegistry {
    inner: Arc<Inner>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new state for `entity_id` and notify its subscribers.
    pub fn set_state(&self, entity_id: &str, state: impl Into<String>, attributes: Attributes) {
        let new_state = EntityState::new(state, attributes);
        let old_state = self
            .inner
            .states
            .write()
            .insert(entity_id.to_string(), new_state.clone());

        self.notify(StateChangedEvent {
            entity_id: entity_id.to_string(),
            old_state,
            new_state: Some(new_state),
        });
    }

    /// Forget `entity_id`; subscribers see an event without a new state.
    pub fn remove_state(&self, entity_id: &str) {
        let old_state = self.inner.states.write().remove(entity_id);
        if old_state.is_none() {
            return;
        }

        self.notify(StateChangedEvent {
            entity_id: entity_id.to_string(),
            old_state,
            new_state: None,
        });
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.inner.states.read().get(entity_id).cloned()
    }

    /// Number of live subscriptions for `entity_id`.
    pub fn subscriber_count(&self, entity_id: &str) -> usize {
        self.inner
            .listeners
            .read()
            .get(entity_id)
            .map_or(0, Vec::len)
    }

    fn notify(&self, event: StateChangedEvent) {
        // Snapshot so callbacks may read state or (un)subscribe without deadlocking
        let callbacks: Vec<StateCallback> = self
            .inner
            .listeners
            .read()
            .get(&event.entity_id)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        debug!(
            "State of {} changed, notifying {} subscriber(s)",
            event.entity_id,
            callbacks.len()
        );

        for callback in callbacks {
            callback(&event);
        }
    }
}

impl Host for StateRegistry {
    fn subscribe(&self, entity_id: &str, callback: StateCallback) -> SubscriptionHandle {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .entry(entity_id.to_string())
            .or_default()
            .push((id, callback));

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let entity_id = entity_id.to_string();
        CancelHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.unsubscribe(&entity_id, id);
            }
        })
    }

    fn current_state(&self, entity_id: &str) -> Option<Attributes> {
        self.get(entity_id).map(|state| state.attributes)
    }

    fn schedule_recurring(&self, period: Duration, callback: TickCallback) -> TimerHandle {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                callback();
            }
        });

        let abort = task.abort_handle();
        CancelHandle::new(move || abort.abort())
    }
}
