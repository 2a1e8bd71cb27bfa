//! Input sources that feed entity state into the bridge.
//!
//! Current input sources:
//! - `mqtt`: entity attribute snapshots published to an MQTT broker

pub mod mqtt;
