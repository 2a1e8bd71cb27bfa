//! Per-device watcher deciding when a position is forwarded.
//!
//! A running watcher has two triggers:
//!
//! - change notifications for its entity, debounced against the last sent
//!   coordinates (exact match suppresses the send)
//! - an optional poll timer that re-reads the entity and sends when it moved
//!   at least [`POLL_MIN_DISTANCE_M`] since the last send
//!
//! `last_sent_position` is updated before a delivery is dispatched, so a
//! failed delivery is not retried for the same coordinates. Only movement or
//! the next poll gives another chance.
//!
//! Once `stop` returns, no callback dispatches again, even one the host
//! invokes concurrently with the stop.

use crate::config::DeviceConfig;
use crate::delivery::{Delivery, DeliveryOutcome, PositionReport};
use crate::geo::Position;
use crate::host::{Host, StateChangedEvent, SubscriptionHandle, TimerHandle, position_from_attributes};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

/// Minimum movement for a poll tick to send again.
pub const POLL_MIN_DISTANCE_M: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    Stopped,
    Running,
}

/// Watches one device tracker entity and forwards its position.
pub struct DeviceWatcher {
    config: DeviceConfig,
    host: Arc<dyn Host>,
    delivery: Arc<dyn Delivery>,
    last_sent: Arc<Mutex<Option<Position>>>,
    running: Option<Running>,
}

/// Resources held only while running.
struct Running {
    dispatch: Arc<Dispatch>,
    subscription: SubscriptionHandle,
    poll: Option<TimerHandle>,
}

/// Decision logic and delivery for a running watcher, shared with the host
/// callbacks (weakly) and with in-flight deliveries (strongly).
struct Dispatch {
    name: String,
    entity_id: String,
    key: String,
    server_url: String,
    verify_ssl: bool,
    host: Arc<dyn Host>,
    delivery: Arc<dyn Delivery>,
    last_sent: Arc<Mutex<Option<Position>>>,
    /// Set by `stop`; read under the `last_sent` lock
    stopped: AtomicBool,
    runtime: Handle,
}

impl DeviceWatcher {
    pub fn new(config: DeviceConfig, host: Arc<dyn Host>, delivery: Arc<dyn Delivery>) -> Self {
        Self {
            config,
            host,
            delivery,
            last_sent: Arc::new(Mutex::new(None)),
            running: None,
        }
    }

    /// Subscribe, send the current position if known, and arm the poll timer.
    ///
    /// A disabled or incompletely configured device stays stopped. Calling
    /// `start` on a running watcher does nothing.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }

        let name = self.config.name.as_str();
        if !self.config.enabled {
            info!("[Watcher] Device {} is disabled; not watching", name);
            return;
        }

        let (Some(entity_id), Some(key), Some(server_url)) = (
            self.config.entity_id(),
            self.config.key(),
            self.config.server_url(),
        ) else {
            warn!(
                "[Watcher] Device {} not fully configured (missing {}); skipping watcher",
                name,
                self.config.missing_fields().join(", ")
            );
            return;
        };

        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("[Watcher] Cannot start {} outside a tokio runtime: {}", name, e);
                return;
            }
        };

        let dispatch = Arc::new(Dispatch {
            name: name.to_string(),
            entity_id: entity_id.to_string(),
            key: key.to_string(),
            server_url: server_url.to_string(),
            verify_ssl: self.config.verify_ssl,
            host: Arc::clone(&self.host),
            delivery: Arc::clone(&self.delivery),
            last_sent: Arc::clone(&self.last_sent),
            stopped: AtomicBool::new(false),
            runtime,
        });

        let weak: Weak<Dispatch> = Arc::downgrade(&dispatch);
        let subscription = self.host.subscribe(
            entity_id,
            Arc::new(move |event: &StateChangedEvent| {
                if let Some(dispatch) = weak.upgrade() {
                    dispatch.on_state_changed(event);
                }
            }),
        );

        dispatch.send_current_position();

        let poll = (self.config.poll_seconds > 0).then(|| {
            let weak = Arc::downgrade(&dispatch);
            self.host.schedule_recurring(
                Duration::from_secs(self.config.poll_seconds),
                Arc::new(move || {
                    if let Some(dispatch) = weak.upgrade() {
                        dispatch.on_poll_tick();
                    }
                }),
            )
        });

        info!(
            "[Watcher] Started watcher for {} ({}), poll {}",
            name,
            entity_id,
            match self.config.poll_seconds {
                0 => "off".to_string(),
                secs => format!("every {}s", secs),
            }
        );

        self.running = Some(Running {
            dispatch,
            subscription,
            poll,
        });
    }

    /// Cancel the subscription and poll timer. Safe to call repeatedly.
    ///
    /// Deliveries already in flight are left to finish.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        // Taken so no dispatch is between its stop check and its spawn
        {
            let _last_sent = running.dispatch.last_sent.lock();
            running.dispatch.stopped.store(true, Ordering::SeqCst);
        }

        running.subscription.cancel();
        if let Some(poll) = running.poll {
            poll.cancel();
        }
        debug!("[Watcher] Stopped watcher for {}", self.config.name);
    }

    /// Send the entity's current position now, bypassing the debounce.
    ///
    /// Returns false when the watcher is not running or the entity has no
    /// position.
    pub fn send_now(&self) -> bool {
        match &self.running {
            Some(running) => running.dispatch.send_current_position(),
            None => {
                warn!(
                    "[Watcher] send_now ignored: watcher for {} is not running",
                    self.config.name
                );
                false
            }
        }
    }

    /// Deliver `position` immediately and wait for the outcome.
    ///
    /// Debounce and distance checks are skipped and `last_sent_position` is
    /// left untouched. Returns `None` when the watcher is not running.
    pub async fn test_post(&self, position: Position) -> Option<DeliveryOutcome> {
        let Some(running) = &self.running else {
            warn!(
                "[Watcher] test_post ignored: watcher for {} is not running",
                self.config.name
            );
            return None;
        };

        info!(
            "[Watcher] Test post for {}: {}, {}",
            self.config.name, position.lat, position.lon
        );
        Some(running.dispatch.deliver(position, unix_now()).await)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.config.entity_id()
    }

    pub fn status(&self) -> WatcherStatus {
        if self.running.is_some() {
            WatcherStatus::Running
        } else {
            WatcherStatus::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn has_poll_timer(&self) -> bool {
        self.running.as_ref().is_some_and(|r| r.poll.is_some())
    }

    pub fn last_sent_position(&self) -> Option<Position> {
        *self.last_sent.lock()
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Dispatch {
    fn on_state_changed(self: &Arc<Self>, event: &StateChangedEvent) {
        let Some(new_state) = &event.new_state else {
            return;
        };
        let Some(position) = new_state.position() else {
            debug!("[Watcher] No lat/lon in {} update; skipping", self.entity_id);
            return;
        };

        self.dispatch_if(position, |last| {
            !last.is_some_and(|last| last.same_as(&position))
        });
    }

    fn on_poll_tick(self: &Arc<Self>) {
        let Some(position) = self
            .host
            .current_state(&self.entity_id)
            .as_ref()
            .and_then(position_from_attributes)
        else {
            return;
        };

        self.dispatch_if(position, |last| {
            let Some(last) = last else {
                return true;
            };
            let moved = last.distance_to(&position);
            if moved.is_nan() || moved < POLL_MIN_DISTANCE_M {
                return false;
            }
            debug!(
                "[Watcher] {} moved {:.1} m since last send",
                self.entity_id, moved
            );
            true
        });
    }

    /// Send whatever position the host currently reports for the entity.
    fn send_current_position(self: &Arc<Self>) -> bool {
        let Some(position) = self
            .host
            .current_state(&self.entity_id)
            .as_ref()
            .and_then(position_from_attributes)
        else {
            debug!("[Watcher] No current position for {}", self.entity_id);
            return false;
        };

        self.dispatch_if(position, |_| true)
    }

    /// Record `position` as sent and spawn its delivery if the watcher is
    /// still running and `should_send` accepts it given the last sent
    /// position. Check, record and spawn all happen under the `last_sent`
    /// lock, which `stop` also takes.
    fn dispatch_if(
        self: &Arc<Self>,
        position: Position,
        should_send: impl FnOnce(Option<Position>) -> bool,
    ) -> bool {
        let ts = unix_now();
        let mut last_sent = self.last_sent.lock();
        if self.stopped.load(Ordering::SeqCst) || !should_send(*last_sent) {
            return false;
        }
        *last_sent = Some(position);
        self.spawn_delivery(position, ts);
        true
    }

    fn spawn_delivery(self: &Arc<Self>, position: Position, ts: i64) {
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            this.deliver(position, ts).await;
        });
    }

    async fn deliver(&self, position: Position, ts: i64) -> DeliveryOutcome {
        let report = PositionReport {
            key: self.key.clone(),
            lat: position.lat,
            lon: position.lon,
            ts,
            name: self.name.clone(),
            entity_id: self.entity_id.clone(),
        };

        let outcome = self
            .delivery
            .post(&self.server_url, &report, self.verify_ssl)
            .await;

        match &outcome {
            DeliveryOutcome::Delivered => debug!(
                "[Watcher] Sent {} position {}, {}",
                self.name, position.lat, position.lon
            ),
            other => debug!("[Watcher] Delivery for {} not accepted: {}", self.name, other),
        }
        outcome
    }
}
