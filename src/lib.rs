//! Geomap bridge library.
//!
//! Watches device tracker entities on a home automation host and forwards
//! their positions to a remote ingestion endpoint, on change and on a
//! movement-threshold poll.

pub mod config;
pub mod control;
pub mod delivery;
pub mod error;
pub mod geo;
pub mod host;
pub mod input;
pub mod registry;
pub mod supervisor;
pub mod watcher;

#[cfg(test)]
mod testing;
