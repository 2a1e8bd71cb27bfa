//! Entity state feed from MQTT into the state registry.
//!
//! Topic layout: `{base}/{domain}/{object_id}/attributes` for entity
//! `domain.object_id`. The payload is either a flat JSON object of attributes
//! or `{"state": "...", "attributes": {...}}`. An empty payload (a cleared
//! retained message) removes the entity.

use super::client::{MqttClient, MqttMessage};
use crate::config::MqttConfig;
use crate::host::{Attributes, StateRegistry};
use log::{info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const UNKNOWN_STATE: &str = "unknown";

/// Map a feed topic back to its entity id.
pub fn entity_id_from_topic(base_topic: &str, topic: &str) -> Option<String> {
    let rest = topic.strip_prefix(base_topic)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    let domain = parts.next().filter(|s| !s.is_empty())?;
    let object_id = parts.next().filter(|s| !s.is_empty())?;
    if parts.next() != Some("attributes") || parts.next().is_some() {
        return None;
    }
    Some(format!("{}.{}", domain, object_id))
}

fn parse_payload(payload: &str) -> Result<(String, Attributes), String> {
    let value: Value = serde_json::from_str(payload).map_err(|e| e.to_string())?;
    let Value::Object(mut object) = value else {
        return Err("payload is not a JSON object".to_string());
    };

    if let Some(Value::Object(attributes)) = object.remove("attributes") {
        let state = object
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_STATE)
            .to_string();
        return Ok((state, attributes));
    }

    Ok((UNKNOWN_STATE.to_string(), object))
}

/// Feeds entity attributes published on MQTT into a [`StateRegistry`].
pub struct StateFeed {
    config: MqttConfig,
    registry: StateRegistry,
}

impl StateFeed {
    pub fn new(config: MqttConfig, registry: StateRegistry) -> Self {
        Self { config, registry }
    }

    /// Wildcard subscription covering every entity.
    pub fn subscription_topic(&self) -> String {
        format!("{}/+/+/attributes", self.config.base_topic)
    }

    /// Apply one message to the registry. Returns whether it was used.
    pub fn handle_message(&self, topic: &str, payload: &str) -> bool {
        let Some(entity_id) = entity_id_from_topic(&self.config.base_topic, topic) else {
            return false;
        };

        if payload.trim().is_empty() {
            self.registry.remove_state(&entity_id);
            return true;
        }

        match parse_payload(payload) {
            Ok((state, attributes)) => {
                self.registry.set_state(&entity_id, state, attributes);
                true
            }
            Err(e) => {
                warn!("[MQTT] Failed to parse {} attributes: {}", entity_id, e);
                false
            }
        }
    }

    /// Connect and process messages until the returned task is aborted.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        info!(
            "[MQTT] Connecting to {}:{}",
            self.config.broker_host, self.config.broker_port
        );

        let client = MqttClient::new(&self.config, vec![self.subscription_topic()]);
        let (msg_tx, mut msg_rx) = mpsc::channel::<MqttMessage>(64);
        let mqtt_loop = tokio::spawn(client.run(msg_tx));

        while let Some(msg) = msg_rx.recv().await {
            self.handle_message(&msg.topic, &msg.payload);
        }

        mqtt_loop.abort();
    }
}
