//! # MQTT Connection Core
//!
//! Maintains the single long-lived broker connection of the process: opens
//! and replaces sessions, turns everything the network loop observes into
//! state transitions and store writes, and guards outbound publishing.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── transport.rs   - Session/Connector contract and transport events
//! ├── rumqtt.rs      - rumqttc-backed transport with reconnect backoff
//! ├── dispatcher.rs  - Event consumer writing state and stores
//! ├── supervisor.rs  - Connection lifecycle and guarded publish
//! └── gateway.rs     - Publish entry point for external callers
//! ```
//!
//! ## Event Flow
//!
//! ```text
//! Supervisor ──open/subscribe/start──► Session ──► network task
//!                                                     │
//!                           mpsc<SessionEvent> ◄──────┘
//!                                   │
//!                              Dispatcher ──► watch<ConnectionState>
//!                                   │
//!                                   └──► MessageStore / StatusStore
//! ```
//!
//! The dispatcher is the only consumer of transport events, so every
//! broker-driven mutation happens on one task in the order the transport
//! produced it. Events carry the number of the session that produced them;
//! those from a replaced session are dropped.

pub mod dispatcher;
pub mod gateway;
pub mod rumqtt;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
