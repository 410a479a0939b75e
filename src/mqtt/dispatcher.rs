//! Callback dispatcher
//!
//! Single consumer of the transport event channel. Each event becomes a
//! connection state change, a store write, a log line, or several of these.
//! Handlers never fail: store errors are logged and the next event is
//! processed as usual.
//!
//! Every session the supervisor opens gets a fresh session number. Events
//! still in flight from a replaced session are dropped on arrival, so a late
//! `Disconnected` from a torn-down socket cannot overwrite the state of the
//! session that replaced it.

use super::supervisor::ConnectionState;
use super::transport::{qos_to_u8, ConnectCode, LogLevel, SessionEvent, TransportEvent};
use crate::persistence::{ConnectionUpdate, MessageStore, StatusStore};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Dispatcher {
    client_id: String,
    state: Arc<watch::Sender<ConnectionState>>,
    messages: Arc<dyn MessageStore>,
    status: Arc<dyn StatusStore>,
    tolerate_unprovisioned: bool,
    current_session: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(
        client_id: impl Into<String>,
        state: Arc<watch::Sender<ConnectionState>>,
        messages: Arc<dyn MessageStore>,
        status: Arc<dyn StatusStore>,
        tolerate_unprovisioned: bool,
        current_session: Arc<AtomicU64>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            state,
            messages,
            status,
            tolerate_unprovisioned,
            current_session,
        }
    }

    /// Runs the dispatcher until every sender is gone or `cancel` fires.
    /// On cancellation, events already queued are still handled.
    pub fn spawn(
        self,
        mut events: mpsc::Receiver<SessionEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Dispatcher started for {}", self.client_id);
            loop {
                tokio::select! {
                    biased;
                    event = events.recv() => match event {
                        Some(event) => self.route(event),
                        None => break,
                    },
                    _ = cancel.cancelled() => {
                        while let Ok(event) = events.try_recv() {
                            self.route(event);
                        }
                        break;
                    }
                }
            }
            debug!("Dispatcher stopped for {}", self.client_id);
        })
    }

    /// Handles `event` unless its session has been replaced.
    pub fn route(&self, tagged: SessionEvent) {
        let current = self.current_session.load(Ordering::Acquire);
        if tagged.session != current {
            debug!(
                "Dropping {:?} from replaced session {} (current {})",
                tagged.event, tagged.session, current
            );
            return;
        }
        self.handle(tagged.event);
    }

    pub fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectResult(code) => self.on_connect(code),
            TransportEvent::Disconnected { clean, reason } => self.on_disconnect(clean, reason),
            TransportEvent::Reconnecting { attempt, delay } => {
                info!("Reconnecting to MQTT broker in {:?} (attempt {})", delay, attempt);
                self.state.send_replace(ConnectionState::Connecting);
            }
            TransportEvent::Message {
                topic,
                payload,
                qos,
                retain,
            } => self.on_message(&topic, &payload, qos_to_u8(qos), retain),
            TransportEvent::PublishAck { pkid } => debug!("Message {} published", pkid),
            TransportEvent::SubscribeAck { pkid, granted } => {
                info!("Subscribed with QoS {:?} (packet {})", granted, pkid);
                let rejected = granted.iter().filter(|g| g.is_none()).count();
                if rejected > 0 {
                    warn!(
                        "Broker rejected {} of {} topic filters (packet {})",
                        rejected,
                        granted.len(),
                        pkid
                    );
                }
            }
            TransportEvent::Log { level, line } => match level {
                LogLevel::Debug => debug!(target: "mqtt_ingest::transport", "{}", line),
                LogLevel::Info | LogLevel::Notice => {
                    info!(target: "mqtt_ingest::transport", "{}", line)
                }
                LogLevel::Warning => warn!(target: "mqtt_ingest::transport", "{}", line),
                LogLevel::Error => error!(target: "mqtt_ingest::transport", "{}", line),
            },
        }
    }

    fn on_connect(&self, code: ConnectCode) {
        if code.is_success() {
            info!("Connected to MQTT broker as {}", self.client_id);
            self.record_status(ConnectionUpdate::connected(&self.client_id, Utc::now()));
            self.state.send_replace(ConnectionState::Connected);
        } else {
            let reason = code.reason();
            error!("Failed to connect to MQTT broker: {}", reason);
            self.record_status(ConnectionUpdate::error(&self.client_id, reason));
            self.state.send_replace(ConnectionState::Error);
        }
    }

    fn on_disconnect(&self, clean: bool, reason: Option<String>) {
        if clean {
            info!("Disconnected from MQTT broker");
        } else {
            warn!(
                "Unexpected disconnection from MQTT broker: {}",
                reason.as_deref().unwrap_or("unknown reason")
            );
        }
        self.record_status(ConnectionUpdate::disconnected(&self.client_id, Utc::now()));
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn on_message(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) {
        let text = decode_payload(payload);
        match self.messages.append(topic, &text, qos, retain) {
            Ok(msg) => debug!("Stored message {} on {}", msg.id, topic),
            Err(e) => error!("Error processing message on {}: {}", topic, e),
        }
    }

    fn record_status(&self, update: ConnectionUpdate) {
        match self.status.is_provisioned() {
            Ok(true) => {}
            Ok(false) => {
                if self.tolerate_unprovisioned {
                    debug!(
                        "Connection status storage not ready, skipping {} update",
                        update.status
                    );
                } else {
                    warn!(
                        "Connection status storage not provisioned, dropping {} update",
                        update.status
                    );
                }
                return;
            }
            Err(e) => {
                error!("Failed to check connection status storage: {}", e);
                return;
            }
        }

        match self.status.upsert(update) {
            Ok(record) => debug!("Connection status updated: {}", record),
            Err(e) => error!("Failed to update connection status: {}", e),
        }
    }
}

/// UTF-8 text when valid, otherwise an escaped byte-string literal such as
/// `b'\xff\x00'` so no byte is lost.
pub fn decode_payload(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let escaped: String = payload
                .iter()
                .flat_map(|b| std::ascii::escape_default(*b))
                .map(char::from)
                .collect();
            format!("b'{escaped}'")
        }
    }
}
