//! Capabilities consumed from the host automation platform.
//!
//! Watchers only need three things from the host: subscribe to state changes
//! of an entity, read an entity's current attributes, and run a callback on a
//! fixed period. [`StateRegistry`] is the in-process implementation used by
//! the daemon; tests substitute their own.

mod state_registry;

pub use state_registry::StateRegistry;

use crate::geo::Position;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Attribute mapping of an entity.
pub type Attributes = serde_json::Map<String, Value>;

/// State of one entity as held by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub state: String,
    pub attributes: Attributes,
}

impl EntityState {
    pub fn new(state: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            state: state.into(),
            attributes,
        }
    }

    pub fn position(&self) -> Option<Position> {
        position_from_attributes(&self.attributes)
    }
}

/// Extract `latitude`/`longitude` attributes. Both must be numeric.
pub fn position_from_attributes(attributes: &Attributes) -> Option<Position> {
    let lat = attributes.get("latitude")?.as_f64()?;
    let lon = attributes.get("longitude")?.as_f64()?;
    Some(Position::new(lat, lon))
}

/// Notification delivered to subscribers when an entity changes.
#[derive(Debug, Clone)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub old_state: Option<EntityState>,
    /// `None` when the entity was removed
    pub new_state: Option<EntityState>,
}

pub type StateCallback = Arc<dyn Fn(&StateChangedEvent) + Send + Sync>;
pub type TickCallback = Arc<dyn Fn() + Send + Sync>;

/// Cancels a subscription or timer exactly once, explicitly or on drop.
pub struct CancelHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

pub type SubscriptionHandle = CancelHandle;
pub type TimerHandle = CancelHandle;

impl CancelHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Host platform capabilities used by the watchers.
pub trait Host: Send + Sync {
    /// Invoke `callback` on every state change of `entity_id` until the
    /// returned handle is cancelled.
    fn subscribe(&self, entity_id: &str, callback: StateCallback) -> SubscriptionHandle;

    /// Current attributes of `entity_id`, if the host knows the entity.
    fn current_state(&self, entity_id: &str) -> Option<Attributes>;

    /// Invoke `callback` every `period` (first call after one period) until
    /// the returned handle is cancelled. Must be called from within a tokio
    /// runtime.
    fn schedule_recurring(&self, period: Duration, callback: TickCallback) -> TimerHandle;
}
