//! # rumqttc Transport
//!
//! Production implementation of the [`Connector`]/[`Session`] contract on top
//! of `rumqttc`'s `AsyncClient` and `EventLoop`.
//!
//! ## Why This Module Exists
//!
//! `rumqttc` does not use callbacks. Connection results, packets and failures
//! all come out of one `EventLoop::poll()` stream that somebody has to drive.
//! This module owns that loop and reduces it to the handful of
//! [`TransportEvent`]s the rest of the service understands. Nothing above this
//! module sees a rumqttc packet type.
//!
//! ## Driver Lifecycle
//!
//! ```text
//! open() ──► EventDriver<Configured> ──start()/launch──► EventDriver<Running>
//!                                                            │
//!                                   cancel / client dropped ─┴─► task ends
//! ```
//!
//! The typestate keeps the event loop out of reach until the session is
//! started, so subscriptions queued before `start()` are sent right after the
//! first CONNACK.
//!
//! ## Failure Handling
//!
//! - A poll error before any CONNACK becomes `ConnectResult` with the broker's
//!   refusal code or `ConnectCode::Transport` for I/O, DNS and TLS failures
//! - A poll error on a live connection becomes `Disconnected { clean: false }`
//! - Either is followed by `Reconnecting` and a backoff sleep; the next poll
//!   reconnects
//! - Sessions are clean, so the broker forgets subscriptions on every drop.
//!   Filters subscribed on the session are re-issued after each reconnect
//!
//! ## Shutdown
//!
//! `stop()` queues a DISCONNECT and cancels the driver. A connected driver
//! keeps polling for at most [`FLUSH_WINDOW`] so the packet reaches the broker,
//! then reports `Disconnected { clean: true }` and drops its event sender.

use super::transport::{
    Backoff, ConnectCode, Connector, EventSender, LogLevel, Session, SessionOptions,
    TransportError, TransportEvent,
};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode, Transport,
};
use statum::{machine, state};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a cancelled driver keeps polling so the DISCONNECT goes out
pub const FLUSH_WINDOW: Duration = Duration::from_millis(250);

type Subscriptions = Arc<Mutex<Vec<(String, QoS)>>>;

#[state]
#[derive(Debug, Clone)]
pub enum DriverState {
    Configured, // event loop built, nothing polled yet
    Running,    // owned by the network task
}

/// Network loop of one session.
///
/// `connected` tracks whether the current socket saw a CONNACK and decides
/// how a poll error is reported. `has_connected` survives reconnects and
/// triggers re-subscription on every CONNACK after the first.
#[machine]
pub struct EventDriver<S: DriverState> {
    client: AsyncClient,
    eventloop: EventLoop,
    events: EventSender,
    backoff: Backoff,
    cancel: CancellationToken,
    subscriptions: Subscriptions,
    connected: bool,
    has_connected: bool,
}

impl EventDriver<Configured> {
    fn create(
        client: AsyncClient,
        eventloop: EventLoop,
        events: EventSender,
        backoff: Backoff,
        cancel: CancellationToken,
        subscriptions: Subscriptions,
    ) -> Self {
        Self::new(
            client,
            eventloop,
            events,
            backoff,
            cancel,
            subscriptions,
            false, // connected
            false, // has_connected
        )
    }

    fn launch(self) -> EventDriver<Running> {
        debug!("Event driver transitioning to Running");
        self.transition()
    }
}

impl EventDriver<Running> {
    async fn run(mut self) {
        info!("MQTT network loop started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.flush_disconnect().await;
                    break;
                }
                polled = self.eventloop.poll() => {
                    let keep_running = match polled {
                        Ok(Event::Incoming(packet)) => self.on_incoming(packet).await,
                        Ok(Event::Outgoing(outgoing)) => {
                            self.emit(log_line(LogLevel::Debug, format!("Sending {outgoing:?}")))
                                .await
                        }
                        Err(e) => self.on_error(e).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        info!("MQTT network loop stopped");
    }

    async fn on_incoming(&mut self, packet: Packet) -> bool {
        if let Packet::ConnAck(ack) = &packet {
            if ack.code == ConnectReturnCode::Success {
                self.connected = true;
                self.backoff.reset();
                if self.has_connected {
                    self.resubscribe();
                }
                self.has_connected = true;
            }
        }
        self.emit(translate_incoming(packet)).await
    }

    async fn on_error(&mut self, err: ConnectionError) -> bool {
        if matches!(err, ConnectionError::RequestsDone) {
            debug!("All client handles dropped, stopping network loop");
            return false;
        }

        let reason = err.to_string();
        let reported = if self.connected {
            self.connected = false;
            warn!("Connection to broker lost: {}", reason);
            TransportEvent::Disconnected {
                clean: false,
                reason: Some(reason),
            }
        } else {
            error!("Broker handshake failed: {}", reason);
            let code = match &err {
                ConnectionError::ConnectionRefused(code) => connect_code(code),
                _ => ConnectCode::Transport(reason),
            };
            TransportEvent::ConnectResult(code)
        };
        if !self.emit(reported).await {
            return false;
        }

        let (attempt, delay) = self.backoff.next_delay();
        if !self.emit(TransportEvent::Reconnecting { attempt, delay }).await {
            return false;
        }

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn resubscribe(&self) {
        let subscriptions = self
            .subscriptions
            .lock()
            .map(|subs| subs.clone())
            .unwrap_or_default();
        for (filter, qos) in subscriptions {
            debug!("Re-subscribing to {} after reconnect", filter);
            if let Err(e) = self.client.try_subscribe(filter.clone(), qos) {
                error!("Failed to re-subscribe to {}: {}", filter, e);
            }
        }
    }

    async fn flush_disconnect(&mut self) {
        if !self.connected {
            return;
        }
        let flushed = tokio::time::timeout(FLUSH_WINDOW, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            debug!("DISCONNECT not flushed within {:?}", FLUSH_WINDOW);
        }

        self.connected = false;
        self.emit(TransportEvent::Disconnected {
            clean: true,
            reason: None,
        })
        .await;
    }

    /// Forwards an event; `false` once nobody is listening anymore.
    async fn emit(&mut self, event: TransportEvent) -> bool {
        match self.events.send(event).await {
            Ok(()) => true,
            Err(_) => {
                debug!("Event receiver dropped, stopping network loop");
                false
            }
        }
    }
}

fn log_line(level: LogLevel, line: String) -> TransportEvent {
    TransportEvent::Log { level, line }
}

fn connect_code(code: &ConnectReturnCode) -> ConnectCode {
    match code {
        ConnectReturnCode::Success => ConnectCode::Accepted,
        ConnectReturnCode::RefusedProtocolVersion => ConnectCode::RefusedProtocolVersion,
        ConnectReturnCode::BadClientId => ConnectCode::BadClientId,
        ConnectReturnCode::ServiceUnavailable => ConnectCode::ServiceUnavailable,
        ConnectReturnCode::BadUserNamePassword => ConnectCode::BadUserNamePassword,
        ConnectReturnCode::NotAuthorized => ConnectCode::NotAuthorized,
    }
}

fn translate_incoming(packet: Packet) -> TransportEvent {
    match packet {
        Packet::ConnAck(ack) => TransportEvent::ConnectResult(connect_code(&ack.code)),
        Packet::Publish(publish) => TransportEvent::Message {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
            qos: publish.qos,
            retain: publish.retain,
        },
        Packet::PubAck(ack) => TransportEvent::PublishAck { pkid: ack.pkid },
        Packet::PubComp(comp) => TransportEvent::PublishAck { pkid: comp.pkid },
        Packet::SubAck(ack) => TransportEvent::SubscribeAck {
            pkid: ack.pkid,
            granted: ack
                .return_codes
                .iter()
                .map(|code| match code {
                    SubscribeReasonCode::Success(qos) => Some(*qos),
                    SubscribeReasonCode::Failure => None,
                })
                .collect(),
        },
        other => log_line(LogLevel::Debug, format!("Received {other:?}")),
    }
}

/// Handle on one rumqttc session.
///
/// Requests go through the cloned `AsyncClient` and never block. The driver
/// task is detached; it ends on its own once cancelled.
pub struct RumqttSession {
    client: AsyncClient,
    driver: Option<EventDriver<Configured>>,
    cancel: CancellationToken,
    subscriptions: Subscriptions,
    task: Option<JoinHandle<()>>,
}

impl Session for RumqttSession {
    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.client.try_subscribe(filter, qos)?;
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.push((filter.to_string(), qos));
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), TransportError> {
        let driver = self.driver.take().ok_or(TransportError::AlreadyStarted)?;
        let running = driver.launch();
        self.task = Some(tokio::spawn(running.run()));
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if self.task.is_none() {
            return Err(TransportError::NotStarted);
        }
        self.client.try_publish(topic, qos, retain, payload)?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        let requested = self.client.try_disconnect();
        self.cancel.cancel();
        // the task finishes on its own once it observes the cancellation
        self.task.take();
        self.driver.take();
        requested.map_err(TransportError::from)
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens real broker sessions through `rumqttc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttConnector;

impl Connector for RumqttConnector {
    fn open(
        &self,
        options: &SessionOptions,
        events: EventSender,
    ) -> Result<Box<dyn Session>, TransportError> {
        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_clean_session(options.clean_session);

        if let Some((user, pw)) = &options.credentials {
            mqtt_options.set_credentials(user.clone(), pw.clone());
        }

        if options.tls {
            mqtt_options.set_transport(Transport::tls_with_default_config());
            info!("TLS enabled for MQTT connection");
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, options.request_capacity);
        let cancel = CancellationToken::new();
        let subscriptions: Subscriptions = Arc::new(Mutex::new(Vec::new()));
        let backoff = Backoff::new(options.reconnect_min_delay, options.reconnect_max_delay);

        let driver = EventDriver::create(
            client.clone(),
            eventloop,
            events,
            backoff,
            cancel.clone(),
            subscriptions.clone(),
        );

        debug!(
            "Opened session {} for {}:{}",
            options.client_id, options.host, options.port
        );
        Ok(Box::new(RumqttSession {
            client,
            driver: Some(driver),
            cancel,
            subscriptions,
            task: None,
        }))
    }
}
