//! MQTT client wrapper for the state feed.

use crate::config::MqttConfig;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;

/// Message received from MQTT broker.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

/// MQTT client that keeps a fixed set of subscriptions alive across
/// reconnects.
pub struct MqttClient {
    client: AsyncClient,
    event_loop: EventLoop,
    topics: Vec<String>,
}

impl MqttClient {
    /// Create a new MQTT client from configuration.
    pub fn new(config: &MqttConfig, topics: Vec<String>) -> Self {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 100);

        Self {
            client,
            event_loop,
            topics,
        }
    }

    /// Run the MQTT event loop and forward publishes to `tx`.
    ///
    /// Subscriptions are (re)issued on every ConnAck since the broker drops
    /// them with a clean session. Returns when the receiver is gone.
    pub async fn run(mut self, tx: mpsc::Sender<MqttMessage>) {
        info!("[MQTT] Starting event loop");

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("[MQTT] Connected, subscribing to {} topic(s)", self.topics.len());
                    for topic in &self.topics {
                        if let Err(e) = self.client.try_subscribe(topic, QoS::AtMostOnce) {
                            warn!("[MQTT] Failed to subscribe to {}: {:?}", topic, e);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = match String::from_utf8(publish.payload.to_vec()) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("[MQTT] Invalid UTF-8 payload on {}: {}", publish.topic, e);
                            continue;
                        }
                    };

                    debug!("[MQTT] Received on {}: {}", publish.topic, payload);

                    let msg = MqttMessage {
                        topic: publish.topic,
                        payload,
                    };
                    if tx.send(msg).await.is_err() {
                        debug!("[MQTT] Message channel closed, stopping event loop");
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[MQTT] Connection error: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}
