//! Owns the watchers built from one set of device records.

use crate::config::DeviceConfig;
use crate::delivery::{Delivery, DeliveryOutcome};
use crate::geo::Position;
use crate::host::Host;
use crate::watcher::DeviceWatcher;
use log::{info, warn};
use std::sync::Arc;

/// Coordinates used by `test_post` when none are given.
pub const TEST_POSITION: Position = Position {
    lat: 48.137154,
    lon: 11.576124,
};

/// Watchers for one configuration scope, in device record order.
pub struct WatcherRegistry {
    watchers: Vec<DeviceWatcher>,
}

impl WatcherRegistry {
    /// Build and start one watcher per record.
    ///
    /// Never fails: a device that cannot start stays stopped and the others
    /// are unaffected.
    pub fn setup(
        configs: &[DeviceConfig],
        host: Arc<dyn Host>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        let mut watchers = Vec::with_capacity(configs.len());
        for config in configs {
            let mut watcher =
                DeviceWatcher::new(config.clone(), Arc::clone(&host), Arc::clone(&delivery));
            watcher.start();
            watchers.push(watcher);
        }

        let running = watchers.iter().filter(|w| w.is_running()).count();
        info!(
            "[Registry] {} of {} device watcher(s) running",
            running,
            watchers.len()
        );

        Self { watchers }
    }

    /// Stop every watcher.
    pub fn teardown(&mut self) {
        for watcher in &mut self.watchers {
            watcher.stop();
        }
        info!("[Registry] Stopped {} watcher(s)", self.watchers.len());
    }

    pub fn watchers(&self) -> &[DeviceWatcher] {
        &self.watchers
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Send the current position of the watcher for `entity_id` (first
    /// watcher when `None`). Returns whether a delivery was dispatched.
    pub fn dispatch_send_now(&self, entity_id: Option<&str>) -> bool {
        let watcher = match entity_id {
            Some(id) => self.watchers.iter().find(|w| w.entity_id() == Some(id)),
            None => self.watchers.first(),
        };

        match watcher {
            Some(watcher) => watcher.send_now(),
            None => {
                warn!(
                    "[Registry] send_now: no watcher for {}",
                    entity_id.unwrap_or("<first device>")
                );
                false
            }
        }
    }

    /// Force a delivery from the watcher at `index` (default 0), using
    /// [`TEST_POSITION`] for any coordinate not given.
    pub async fn dispatch_test_post(
        &self,
        index: Option<usize>,
        lat: Option<f64>,
        lon: Option<f64>,
    ) -> Option<DeliveryOutcome> {
        let index = index.unwrap_or(0);
        let Some(watcher) = self.watchers.get(index) else {
            warn!(
                "[Registry] test_post: invalid device index {} ({} configured)",
                index,
                self.watchers.len()
            );
            return None;
        };

        let position = Position::new(
            lat.unwrap_or(TEST_POSITION.lat),
            lon.unwrap_or(TEST_POSITION.lon),
        );
        watcher.test_post(position).await
    }
}
