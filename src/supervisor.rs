//! Composition root state: device store, shared transport and the current
//! watcher registry.
//!
//! Replaces any global lookup of running watchers. The daemon owns exactly
//! one `Supervisor`; operator commands are executed against it one at a time.

use crate::config::{DeviceStore, DeviceUpdate};
use crate::control::{Command, CommandReply, ControlRequest};
use crate::delivery::Delivery;
use crate::error::{BridgeError, Result};
use crate::host::Host;
use crate::registry::WatcherRegistry;
use log::{error, info, warn};
use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Supervisor {
    store: DeviceStore,
    host: Arc<dyn Host>,
    delivery: Arc<dyn Delivery>,
    registry: Option<WatcherRegistry>,
}

impl Supervisor {
    pub fn new(store: DeviceStore, host: Arc<dyn Host>, delivery: Arc<dyn Delivery>) -> Self {
        Self {
            store,
            host,
            delivery,
            registry: None,
        }
    }

    /// Build and start watchers for every stored device.
    pub fn start(&mut self) {
        if self.registry.is_some() {
            return;
        }
        self.registry = Some(WatcherRegistry::setup(
            self.store.devices(),
            Arc::clone(&self.host),
            Arc::clone(&self.delivery),
        ));
    }

    /// Stop all watchers.
    pub fn shutdown(&mut self) {
        if let Some(mut registry) = self.registry.take() {
            registry.teardown();
        }
    }

    /// Tear down the registry and rebuild it from the stored devices.
    pub fn reload(&mut self) {
        info!("Reloading device watchers");
        self.shutdown();
        self.start();
    }

    pub fn registry(&self) -> Option<&WatcherRegistry> {
        self.registry.as_ref()
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    /// Merge `update` into the record at `index`, persist, and reload.
    ///
    /// The record is validated before anything changes.
    pub fn update_device(&mut self, index: usize, update: &DeviceUpdate) -> Result<()> {
        let current = self
            .store
            .get(index)
            .ok_or(BridgeError::DeviceIndexOutOfRange {
                index,
                count: self.store.devices().len(),
            })?;

        let updated = update.apply_to(current);
        self.store.replace(index, updated)?;

        if let Err(e) = self.store.save() {
            error!("Failed to persist device store: {}", e);
            return Err(e);
        }

        self.reload();
        Ok(())
    }

    /// Answer control requests one at a time until `shutdown` completes.
    ///
    /// A command still running when `shutdown` completes is abandoned and
    /// its requester told the bridge is shutting down.
    pub async fn run(
        &mut self,
        mut requests: mpsc::Receiver<ControlRequest>,
        shutdown: impl Future<Output = ()>,
    ) {
        tokio::pin!(shutdown);

        loop {
            let request = tokio::select! {
                _ = &mut shutdown => return,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => {
                        shutdown.await;
                        return;
                    }
                },
            };

            info!("[Control] {:?}", request.command);
            let ControlRequest { command, reply } = request;
            tokio::select! {
                _ = &mut shutdown => {
                    let _ = reply.send(CommandReply::error("bridge is shutting down"));
                    return;
                }
                result = self.handle(command) => {
                    let _ = reply.send(result);
                }
            }
        }
    }

    /// Execute one operator command.
    pub async fn handle(&mut self, command: Command) -> CommandReply {
        match command {
            Command::SendNow { entity_id } => {
                let Some(registry) = &self.registry else {
                    return CommandReply::error("no watchers running");
                };
                if registry.dispatch_send_now(entity_id.as_deref()) {
                    CommandReply::ok("position dispatched")
                } else {
                    CommandReply::error("no running watcher with a current position")
                }
            }
            Command::TestPost {
                device_index,
                lat,
                lon,
            } => {
                let Some(registry) = &self.registry else {
                    return CommandReply::error("no watchers running");
                };
                match registry.dispatch_test_post(device_index, lat, lon).await {
                    Some(outcome) if outcome.is_delivered() => {
                        CommandReply::ok(format!("test post {}", outcome))
                    }
                    Some(outcome) => CommandReply::error(format!("test post {}", outcome)),
                    None => CommandReply::error(format!(
                        "no running watcher at index {}",
                        device_index.unwrap_or(0)
                    )),
                }
            }
            Command::UpdateDevice { index, fields } => {
                match self.update_device(index, &fields) {
                    Ok(()) => CommandReply::ok(format!("device {} updated", index)),
                    Err(e) => {
                        warn!("update_device {} rejected: {}", index, e);
                        CommandReply::error(e.to_string())
                    }
                }
            }
            Command::Reload => {
                self.reload();
                CommandReply::ok("reloaded")
            }
            Command::Status => CommandReply::ok(self.status_report()),
        }
    }

    fn status_report(&self) -> String {
        let Some(registry) = &self.registry else {
            return "stopped".to_string();
        };
        if registry.is_empty() {
            return "no devices configured".to_string();
        }

        let mut out = String::new();
        for (index, watcher) in registry.watchers().iter().enumerate() {
            let _ = write!(
                out,
                "{}: {} ({}) {}",
                index,
                watcher.name(),
                watcher.entity_id().unwrap_or("-"),
                if watcher.is_running() {
                    "running"
                } else {
                    "stopped"
                }
            );
            if let Some(last) = watcher.last_sent_position() {
                let _ = write!(out, ", last sent {}, {}", last.lat, last.lon);
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::delivery::DeliveryOutcome;
    use crate::testing::{ManualHost, RecordingDelivery};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn device(name: &str, entity_id: &str) -> DeviceConfig {
        DeviceConfig {
            name: name.to_string(),
            entity_id: Some(entity_id.to_string()),
            key: Some("KEY-1234".to_string()),
            server_url: Some("https://geo.example.org".to_string()),
            poll_seconds: 30,
            ..Default::default()
        }
    }

    fn supervisor(
        dir: &tempfile::TempDir,
        devices: Vec<DeviceConfig>,
    ) -> (ManualHost, Arc<RecordingDelivery>, Supervisor) {
        let host = ManualHost::new();
        let delivery = RecordingDelivery::new();
        let store = DeviceStore::with_devices(dir.path().join("devices.json"), devices);
        let mut sup = Supervisor::new(store, Arc::new(host.clone()), delivery.clone());
        sup.start();
        (host, delivery, sup)
    }

    #[tokio::test]
    async fn test_update_device_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _delivery, mut sup) = supervisor(
            &dir,
            vec![
                device("Phone", "device_tracker.phone"),
                device("Tablet", "device_tracker.tablet"),
            ],
        );
        assert_eq!(host.timer_periods().len(), 2);

        let reply = sup
            .handle(Command::UpdateDevice {
                index: 1,
                fields: DeviceUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            })
            .await;
        assert!(reply.is_ok(), "{:?}", reply);

        // Old watchers gone, only the still-enabled device is watched
        assert_eq!(host.subscription_count(), 1);
        assert_eq!(host.timer_periods().len(), 1);
        let registry = sup.registry().unwrap();
        assert!(registry.watchers()[0].is_running());
        assert!(!registry.watchers()[1].is_running());

        let reloaded = DeviceStore::load(dir.path().join("devices.json")).unwrap();
        assert!(!reloaded.devices()[1].enabled);
        assert!(reloaded.devices()[0].enabled);
    }

    #[tokio::test]
    async fn test_update_device_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _delivery, mut sup) =
            supervisor(&dir, vec![device("Phone", "device_tracker.phone")]);

        let reply = sup
            .handle(Command::UpdateDevice {
                index: 5,
                fields: DeviceUpdate::default(),
            })
            .await;
        assert!(!reply.is_ok());

        let reply = sup
            .handle(Command::UpdateDevice {
                index: 0,
                fields: DeviceUpdate {
                    server_url: Some("https://geo.example.org/api/ingest.php".to_string()),
                    ..Default::default()
                },
            })
            .await;
        assert!(!reply.is_ok());
        assert!(reply.message().contains("/api/ingest.php"));

        // Nothing was written and the watcher kept running
        assert!(!dir.path().join("devices.json").exists());
        assert_eq!(host.subscription_count(), 1);
        assert_eq!(
            sup.store().devices()[0].server_url.as_deref(),
            Some("https://geo.example.org")
        );
    }

    #[tokio::test]
    async fn test_operator_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (host, delivery, mut sup) =
            supervisor(&dir, vec![device("Phone", "device_tracker.phone")]);

        let reply = sup.handle(Command::SendNow { entity_id: None }).await;
        assert!(!reply.is_ok());

        host.set_position_silently("device_tracker.phone", 48.0, 11.0);
        let reply = sup
            .handle(Command::SendNow {
                entity_id: Some("device_tracker.phone".to_string()),
            })
            .await;
        assert!(reply.is_ok());
        delivery.wait_for(1).await;

        delivery.respond_with(DeliveryOutcome::RemoteRejected {
            status: 403,
            body: "bad key".to_string(),
        });
        let reply = sup
            .handle(Command::TestPost {
                device_index: None,
                lat: None,
                lon: None,
            })
            .await;
        assert_eq!(
            reply,
            CommandReply::error("test post rejected with status 403: bad key")
        );

        let reply = sup.handle(Command::Status).await;
        assert_eq!(
            reply.message(),
            "0: Phone (device_tracker.phone) running, last sent 48, 11"
        );
    }

    #[tokio::test]
    async fn test_run_answers_requests_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (_host, delivery, mut sup) =
            supervisor(&dir, vec![device("Phone", "device_tracker.phone")]);
        delivery.hang();

        let (tx, rx) = mpsc::channel(4);
        let (status_tx, status_rx) = oneshot::channel();
        let (post_tx, post_rx) = oneshot::channel();
        tx.send(ControlRequest {
            command: Command::Status,
            reply: status_tx,
        })
        .await
        .unwrap();
        tx.send(ControlRequest {
            command: Command::TestPost {
                device_index: None,
                lat: None,
                lon: None,
            },
            reply: post_tx,
        })
        .await
        .unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let stopper = tokio::spawn(async move {
            delivery.wait_for(1).await;
            let _ = stop_tx.send(());
        });

        // The test post never completes; shutdown must still get through
        tokio::time::timeout(
            Duration::from_secs(2),
            sup.run(rx, async {
                let _ = stop_rx.await;
            }),
        )
        .await
        .expect("run returns once shutdown completes");
        stopper.await.unwrap();

        assert!(status_rx.await.unwrap().is_ok());
        assert_eq!(
            post_rx.await.unwrap(),
            CommandReply::error("bridge is shutting down")
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _delivery, mut sup) = supervisor(
            &dir,
            vec![
                device("Phone", "device_tracker.phone"),
                device("Tablet", "device_tracker.tablet"),
            ],
        );

        sup.shutdown();
        sup.shutdown();
        assert_eq!(host.subscription_count(), 0);
        assert!(host.timer_periods().is_empty());
        assert_eq!(
            sup.handle(Command::Status).await,
            CommandReply::ok("stopped")
        );
    }
}
