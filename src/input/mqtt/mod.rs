//! MQTT input source for device tracker state.
//!
//! The host platform publishes each entity's attributes as a JSON object;
//! this module feeds them into the [`StateRegistry`](crate::host::StateRegistry)
//! so the watchers see ordinary change notifications.

mod client;
mod state_feed;

pub use client::{MqttClient, MqttMessage};
pub use state_feed::{StateFeed, entity_id_from_topic};
