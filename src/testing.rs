//! Test doubles for the host and delivery seams.

use crate::delivery::{Delivery, DeliveryOutcome, PositionReport};
use crate::host::{
    Attributes, CancelHandle, EntityState, Host, StateCallback, StateChangedEvent,
    SubscriptionHandle, TickCallback, TimerHandle,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub fn position_attrs(lat: f64, lon: f64) -> Attributes {
    json!({"latitude": lat, "longitude": lon, "gps_accuracy": 5})
        .as_object()
        .cloned()
        .unwrap()
}

#[derive(Default)]
struct HostInner {
    states: Mutex<HashMap<String, Attributes>>,
    listeners: Mutex<Vec<(u64, String, StateCallback)>>,
    timers: Mutex<Vec<(u64, Duration, TickCallback)>>,
    next_id: AtomicU64,
}

/// Host whose state changes and timer ticks are driven by the test.
#[derive(Clone, Default)]
pub struct ManualHost {
    inner: Arc<HostInner>,
}

impl ManualHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the entity and notify subscribers.
    pub fn set_position(&self, entity_id: &str, lat: f64, lon: f64) {
        self.set_attributes(entity_id, position_attrs(lat, lon));
    }

    pub fn set_attributes(&self, entity_id: &str, attributes: Attributes) {
        let old = self.set_silently(entity_id, attributes.clone());
        self.emit(StateChangedEvent {
            entity_id: entity_id.to_string(),
            old_state: old.map(|a| EntityState::new("not_home", a)),
            new_state: Some(EntityState::new("not_home", attributes)),
        });
    }

    /// Update the entity without a change notification.
    pub fn set_position_silently(&self, entity_id: &str, lat: f64, lon: f64) {
        self.set_silently(entity_id, position_attrs(lat, lon));
    }

    fn set_silently(&self, entity_id: &str, attributes: Attributes) -> Option<Attributes> {
        self.inner
            .states
            .lock()
            .insert(entity_id.to_string(), attributes)
    }

    pub fn emit(&self, event: StateChangedEvent) {
        let callbacks: Vec<StateCallback> = self
            .inner
            .listeners
            .lock()
            .iter()
            .filter(|(_, entity, _)| *entity == event.entity_id)
            .map(|(_, _, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(&event);
        }
    }

    /// Fire every armed timer once.
    pub fn fire_ticks(&self) {
        for callback in self.timer_callbacks() {
            callback();
        }
    }

    /// Callbacks currently subscribed to `entity_id`.
    pub fn subscribers(&self, entity_id: &str) -> Vec<StateCallback> {
        self.inner
            .listeners
            .lock()
            .iter()
            .filter(|(_, entity, _)| entity == entity_id)
            .map(|(_, _, cb)| cb.clone())
            .collect()
    }

    /// Callbacks of the currently armed timers.
    pub fn timer_callbacks(&self) -> Vec<TickCallback> {
        self.inner
            .timers
            .lock()
            .iter()
            .map(|(_, _, cb)| cb.clone())
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    pub fn timer_periods(&self) -> Vec<Duration> {
        self.inner
            .timers
            .lock()
            .iter()
            .map(|(_, period, _)| *period)
            .collect()
    }
}

impl Host for ManualHost {
    fn subscribe(&self, entity_id: &str, callback: StateCallback) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .push((id, entity_id.to_string(), callback));

        let weak: Weak<HostInner> = Arc::downgrade(&self.inner);
        CancelHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().retain(|(lid, _, _)| *lid != id);
            }
        })
    }

    fn current_state(&self, entity_id: &str) -> Option<Attributes> {
        self.inner.states.lock().get(entity_id).cloned()
    }

    fn schedule_recurring(&self, period: Duration, callback: TickCallback) -> TimerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.timers.lock().push((id, period, callback));

        let weak: Weak<HostInner> = Arc::downgrade(&self.inner);
        CancelHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.timers.lock().retain(|(tid, _, _)| *tid != id);
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub server_url: String,
    pub report: PositionReport,
    pub verify_ssl: bool,
}

/// Delivery that records every post and answers with a canned outcome.
pub struct RecordingDelivery {
    posts: Mutex<Vec<RecordedPost>>,
    outcome: Mutex<DeliveryOutcome>,
    hang: AtomicBool,
}

impl RecordingDelivery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            posts: Mutex::new(Vec::new()),
            outcome: Mutex::new(DeliveryOutcome::Delivered),
            hang: AtomicBool::new(false),
        })
    }

    /// Record posts but never complete them.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn respond_with(&self, outcome: DeliveryOutcome) {
        *self.outcome.lock() = outcome;
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.posts.lock().len()
    }

    /// Wait until at least `n` posts were recorded, then return them.
    pub async fn wait_for(&self, n: usize) -> Vec<RecordedPost> {
        for _ in 0..500 {
            if self.count() >= n {
                return self.posts();
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("expected {} posts, got {}", n, self.count());
    }

    /// Let spawned deliveries run, then assert exactly `n` posts exist.
    pub async fn settle_at(&self, n: usize) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(self.count(), n, "unexpected posts: {:?}", self.posts());
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn post(
        &self,
        server_url: &str,
        report: &PositionReport,
        verify_ssl: bool,
    ) -> DeliveryOutcome {
        self.posts.lock().push(RecordedPost {
            server_url: server_url.to_string(),
            report: report.clone(),
            verify_ssl,
        });
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.outcome.lock().clone()
    }
}
