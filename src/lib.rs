//! Broker ingestion service
//!
//! Keeps one supervised MQTT connection per process, records every inbound
//! message and the health of the connection, and offers a guarded publish
//! path to the rest of the application.

pub mod config;
pub mod mqtt;
pub mod persistence;
