//! # Connection Supervisor
//!
//! Owns the broker session and the observable [`ConnectionState`].
//!
//! ## Why This Module Exists
//!
//! The rest of the service wants one answer to "can I publish right now?"
//! and one place that decides when a session is opened, replaced or closed.
//! The supervisor is that place. It never talks to the network itself: it
//! asks a [`Connector`] for a [`Session`], hands that session an
//! [`EventSender`], and lets the [`Dispatcher`] turn the reported events into
//! state changes and store writes.
//!
//! ## State Machine
//!
//! ```text
//! Idle ──► Connecting ──► Connected ──► Disconnected
//!              │                             │
//!              └────────► Error ◄────────────┘ (reconnect goes back to Connecting)
//! ```
//!
//! `connect` and `disconnect` set `Connecting` and `Disconnected` directly.
//! Every other transition comes from the dispatcher.
//!
//! ## Concurrency
//!
//! Foreground calls (`initialize`, `connect`, `disconnect`, `publish`) run
//! concurrently with the dispatcher task:
//!
//! - `connect` is guarded by an atomic flag; a second call while one is
//!   running returns at once instead of opening a second session.
//! - the session slot sits behind a mutex that is never held across an
//!   `.await`.
//! - the state lives in a `watch` channel so readers never block writers.
//!
//! Only `publish` reports failure to its caller; the lifecycle calls log and
//! move on.
//!
//! ## Session Numbers
//!
//! Each `connect` takes the next session number before the old session is
//! torn down, and the dispatcher ignores events tagged with any other
//! number. A replaced network loop may still flush a `Disconnected` after
//! the new session reported `Connected`; that event is dropped instead of
//! flipping the state back. `disconnect` keeps the number, so the final
//! clean `Disconnected` of a stopped session still reaches the status store.

use super::dispatcher::Dispatcher;
use super::transport::{
    qos_from_u8, ConnectCode, Connector, EventSender, Session, SessionEvent, SessionOptions,
    TransportError, TransportEvent,
};
use crate::config::{BrokerSettings, Settings, SupervisorSettings};
use crate::persistence::{MessageStore, StatusStore};
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observable connection state, published through a `watch` channel.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Why a message was not handed to the transport.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Collected by [`Supervisor::shutdown`], never raised.
#[derive(Debug, thiserror::Error)]
pub enum TeardownError {
    #[error("Failed to stop session: {0}")]
    Session(#[from] TransportError),

    #[error("Dispatcher did not drain within {0:?}")]
    DrainTimeout(Duration),

    #[error("Dispatcher task failed: {0}")]
    Dispatcher(#[from] tokio::task::JoinError),
}

/// Resets the connecting flag however `connect` exits.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Lifecycle owner of the broker connection.
///
/// Shared as `Arc<Supervisor>`; every method takes `&self`.
pub struct Supervisor {
    broker: BrokerSettings,
    timing: SupervisorSettings,
    client_id: String,
    connector: Arc<dyn Connector>,
    session: Mutex<Option<Box<dyn Session>>>,
    connecting: AtomicBool,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Number of the live session, shared with the dispatcher
    generation: Arc<AtomicU64>,
    events: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    dispatcher_cancel: CancellationToken,
}

impl Supervisor {
    /// Builds the supervisor and starts its dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        settings: &Settings,
        connector: Arc<dyn Connector>,
        messages: Arc<dyn MessageStore>,
        status: Arc<dyn StatusStore>,
    ) -> Arc<Self> {
        let client_id = settings.broker.client_id();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let state = Arc::new(state);
        let (events_tx, events_rx) = mpsc::channel(settings.supervisor.event_capacity.max(1));
        let dispatcher_cancel = CancellationToken::new();
        let generation = Arc::new(AtomicU64::new(0));

        let dispatcher = Dispatcher::new(
            client_id.clone(),
            state.clone(),
            messages,
            status,
            settings.storage.tolerate_unprovisioned_status,
            generation.clone(),
        )
        .spawn(events_rx, dispatcher_cancel.clone());

        info!("MQTT supervisor created with client id {}", client_id);
        Arc::new(Self {
            broker: settings.broker.clone(),
            timing: settings.supervisor.clone(),
            client_id,
            connector,
            session: Mutex::new(None),
            connecting: AtomicBool::new(false),
            state,
            generation,
            events: Mutex::new(Some(events_tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            dispatcher_cancel,
        })
    }

    /// The process-wide cell holding the shared supervisor.
    pub fn global() -> &'static SupervisorCell {
        &INSTANCE
    }

    /// The process-wide supervisor, if [`Supervisor::global`] was initialized.
    pub fn get_instance() -> Option<Arc<Self>> {
        INSTANCE.get()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn initialize(&self) {
        info!("Initializing MQTT connection");
        self.connect().await;
    }

    /// Replaces any existing session with a fresh one.
    ///
    /// A call made while another is still running returns immediately.
    pub async fn connect(&self) {
        if self
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Connection attempt already in progress");
            return;
        }
        let _guard = ConnectingGuard(&self.connecting);

        // late events of the old session are dropped from here on
        let session_id = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.teardown_previous().await;
        self.state.send_replace(ConnectionState::Connecting);

        if let Err(e) = self.open_session(session_id) {
            error!("Failed to connect to MQTT broker: {}", e);
            self.state.send_replace(ConnectionState::Error);
            self.report(TransportEvent::ConnectResult(ConnectCode::Transport(
                e.to_string(),
            )));
        }
    }

    pub fn disconnect(&self) {
        if let Err(e) = self.stop_session() {
            error!("Error disconnecting from MQTT broker: {}", e);
        }
    }

    /// Sends through the current session. `false` means the message was not
    /// handed to the transport.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) -> bool {
        match self.try_publish(topic, payload, qos, retain) {
            Ok(()) => {
                debug!("Published message to {}", topic);
                true
            }
            Err(PublishError::NotConnected) => {
                warn!("Cannot publish to {}: not connected", topic);
                false
            }
            Err(e) => {
                error!("Failed to publish to {}: {}", topic, e);
                false
            }
        }
    }

    pub fn try_publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError> {
        let session = lock_or_recover(&self.session);
        let Some(session) = session.as_ref() else {
            return Err(PublishError::NotConnected);
        };
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        session.publish(topic, payload.into(), qos, retain)?;
        Ok(())
    }

    /// Disconnects and stops the dispatcher once queued events are handled.
    /// Always completes; whatever went wrong is returned for logging.
    pub async fn shutdown(&self) -> Vec<TeardownError> {
        info!("Shutting down MQTT supervisor");
        let mut errors = Vec::new();

        if let Err(e) = self.stop_session() {
            warn!("Error stopping MQTT session during shutdown: {}", e);
            errors.push(TeardownError::Session(e));
        }

        // the channel closes once the network loop has flushed its last events
        lock_or_recover(&self.events).take();

        let handle = lock_or_recover(&self.dispatcher).take();
        if let Some(mut handle) = handle {
            let timeout = self.timing.shutdown_timeout();
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(TeardownError::Dispatcher(e)),
                Err(_) => {
                    warn!("Dispatcher did not drain within {:?}, cancelling", timeout);
                    self.dispatcher_cancel.cancel();
                    errors.push(TeardownError::DrainTimeout(timeout));
                    if let Err(e) = handle.await {
                        errors.push(TeardownError::Dispatcher(e));
                    }
                }
            }
        }

        info!("MQTT supervisor stopped");
        errors
    }

    async fn teardown_previous(&self) {
        let previous = lock_or_recover(&self.session).take();
        if let Some(mut session) = previous {
            info!("Stopping previous MQTT session");
            if let Err(e) = session.stop() {
                warn!("Error stopping previous MQTT session: {}", e);
            }
            drop(session);
            tokio::time::sleep(self.timing.teardown_grace()).await;
        }
    }

    fn open_session(&self, session_id: u64) -> Result<(), TransportError> {
        let events = lock_or_recover(&self.events)
            .clone()
            .map(|tx| EventSender::new(session_id, tx))
            .ok_or(TransportError::Closed)?;
        let options = SessionOptions::from_settings(&self.broker, &self.client_id);
        info!(
            "Connecting to MQTT broker at {}:{} as {} (session {})",
            options.host, options.port, options.client_id, session_id
        );

        let mut session = self.connector.open(&options, events)?;
        let qos = qos_from_u8(self.broker.subscribe_qos).unwrap_or(QoS::AtMostOnce);
        let started = self
            .broker
            .topics
            .iter()
            .try_for_each(|topic| {
                session.subscribe(topic, qos)?;
                info!("Subscribed to topic: {}", topic);
                Ok(())
            })
            .and_then(|()| session.start());

        if let Err(e) = started {
            if let Err(stop_err) = session.stop() {
                debug!("Error discarding half-open session: {}", stop_err);
            }
            return Err(e);
        }

        *lock_or_recover(&self.session) = Some(session);
        Ok(())
    }

    fn stop_session(&self) -> Result<(), TransportError> {
        let current = lock_or_recover(&self.session).take();
        match current {
            Some(mut session) => {
                self.state.send_replace(ConnectionState::Disconnected);
                session.stop()?;
                info!("Disconnected from MQTT broker");
                Ok(())
            }
            None => {
                debug!("No MQTT session to disconnect");
                Ok(())
            }
        }
    }

    /// Feeds a locally detected failure through the dispatcher so it lands
    /// in the status store like any broker-reported one.
    fn report(&self, event: TransportEvent) {
        let events = lock_or_recover(&self.events).clone();
        match events {
            Some(tx) => {
                let events = EventSender::new(self.generation.load(Ordering::Acquire), tx);
                if let Err(e) = events.try_send(event) {
                    warn!("Could not queue connection event: {}", e);
                }
            }
            None => debug!("Supervisor shut down, dropping {:?}", event),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.dispatcher_cancel.cancel();
    }
}

/// Holds the single shared [`Supervisor`] of a process.
pub struct SupervisorCell(OnceLock<Arc<Supervisor>>);

impl SupervisorCell {
    pub const fn new() -> Self {
        Self(OnceLock::new())
    }

    /// Returns the stored supervisor, running `init` only on first access.
    pub fn get_or_init(&self, init: impl FnOnce() -> Arc<Supervisor>) -> Arc<Supervisor> {
        self.0.get_or_init(init).clone()
    }

    pub fn get(&self) -> Option<Arc<Supervisor>> {
        self.0.get().cloned()
    }
}

impl Default for SupervisorCell {
    fn default() -> Self {
        Self::new()
    }
}

static INSTANCE: SupervisorCell = SupervisorCell::new();
