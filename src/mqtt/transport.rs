//! Broker transport contract
//!
//! The connection core never talks to a wire-protocol library directly. It
//! opens a [`Session`] through a [`Connector`] and receives everything the
//! network side observes as [`TransportEvent`]s on a channel, in the order the
//! transport produced them.

use crate::config::BrokerSettings;
use rumqttc::QoS;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session not started")]
    NotStarted,

    #[error("Session closed")]
    Closed,

    #[error("Transport rejected request: {0}")]
    Rejected(String),
}

/// Everything needed to open one broker session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub credentials: Option<(String, String)>,
    pub tls: bool,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub request_capacity: usize,
}

impl SessionOptions {
    pub fn from_settings(settings: &BrokerSettings, client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            host: settings.host.clone(),
            port: settings.port,
            keep_alive: settings.keep_alive(),
            clean_session: true,
            credentials: settings.credentials(),
            tls: settings.use_tls(),
            reconnect_min_delay: Duration::from_secs(settings.reconnect_min_delay_secs),
            reconnect_max_delay: Duration::from_secs(settings.reconnect_max_delay_secs),
            request_capacity: settings.request_capacity,
        }
    }
}

/// Result of a connection handshake, modelled on the MQTT 3.1.1 CONNACK codes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectCode {
    Accepted,
    RefusedProtocolVersion,
    BadClientId,
    ServiceUnavailable,
    BadUserNamePassword,
    NotAuthorized,
    /// The handshake never completed (DNS, TCP, TLS, timeout, ...)
    Transport(String),
}

impl ConnectCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectCode::Accepted)
    }

    pub fn reason(&self) -> String {
        match self {
            ConnectCode::Accepted => "Connection Accepted.".into(),
            ConnectCode::RefusedProtocolVersion => {
                "Connection Refused: unacceptable protocol version.".into()
            }
            ConnectCode::BadClientId => "Connection Refused: identifier rejected.".into(),
            ConnectCode::ServiceUnavailable => "Connection Refused: broker unavailable.".into(),
            ConnectCode::BadUserNamePassword => {
                "Connection Refused: bad user name or password.".into()
            }
            ConnectCode::NotAuthorized => "Connection Refused: not authorised.".into(),
            ConnectCode::Transport(reason) => reason.clone(),
        }
    }
}

impl fmt::Display for ConnectCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    ConnectResult(ConnectCode),
    Disconnected {
        /// `false` when the connection dropped without a requested disconnect
        clean: bool,
        reason: Option<String>,
    },
    /// The transport is about to retry after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    Message {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    PublishAck { pkid: u16 },
    /// `granted[i]` is `None` when the broker rejected the i-th filter
    SubscribeAck {
        pkid: u16,
        granted: Vec<Option<QoS>>,
    },
    Log { level: LogLevel, line: String },
}

/// A [`TransportEvent`] tagged with the session that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionEvent {
    pub session: u64,
    pub event: TransportEvent,
}

/// Event sink handed to one session.
///
/// All sessions share the dispatcher channel; every event sent through this
/// handle carries the session number it was created with, so events of a
/// replaced session can be told apart from the live one.
#[derive(Clone, Debug)]
pub struct EventSender {
    session: u64,
    tx: mpsc::Sender<SessionEvent>,
}

impl EventSender {
    pub fn new(session: u64, tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Waits for channel capacity. Fails once the dispatcher is gone.
    pub async fn send(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub fn try_send(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.tx
            .try_send(SessionEvent {
                session: self.session,
                event,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    TransportError::Rejected("event queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }
}

/// A single broker session.
///
/// Requests are non-blocking: they are queued for the network loop or fail
/// immediately.
pub trait Session: Send {
    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    /// Launches the background network loop.
    fn start(&mut self) -> Result<(), TransportError>;

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Requests a clean disconnect and halts the network loop. Best-effort.
    fn stop(&mut self) -> Result<(), TransportError>;
}

/// Factory for sessions; each opened session reports through its `events`.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        options: &SessionOptions,
        events: EventSender,
    ) -> Result<Box<dyn Session>, TransportError>;
}

/// Exponential reconnect delay bounded by `[min, max]`.
#[derive(Clone, Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
            attempt: 0,
        }
    }

    /// Returns the attempt number and the delay to wait before it.
    pub fn next_delay(&mut self) -> (u32, Duration) {
        self.attempt += 1;
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        (self.attempt, delay)
    }

    pub fn reset(&mut self) {
        self.current = self.min;
        self.attempt = 0;
    }
}

pub fn qos_from_u8(qos: u8) -> Option<QoS> {
    match qos {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

pub fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(32));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().1.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32, 32]);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(32));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), (1, Duration::from_secs(1)));
    }

    #[test]
    fn test_backoff_saturates_on_huge_bounds() {
        let huge = Duration::from_secs(u64::MAX / 2 + 1);
        let mut backoff = Backoff::new(huge, Duration::MAX);
        assert_eq!(backoff.next_delay(), (1, huge));
        assert_eq!(backoff.next_delay(), (2, Duration::MAX));
        assert_eq!(backoff.next_delay(), (3, Duration::MAX));
    }

    #[tokio::test]
    async fn test_event_sender_tags_session() {
        let (tx, mut rx) = mpsc::channel(1);
        let events = EventSender::new(7, tx);
        events
            .send(TransportEvent::PublishAck { pkid: 1 })
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent {
                session: 7,
                event: TransportEvent::PublishAck { pkid: 1 },
            })
        );

        events.try_send(TransportEvent::PublishAck { pkid: 2 }).unwrap();
        assert!(matches!(
            events.try_send(TransportEvent::PublishAck { pkid: 3 }),
            Err(TransportError::Rejected(_))
        ));
        drop(rx);
        assert!(matches!(
            events.send(TransportEvent::PublishAck { pkid: 4 }).await,
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_connect_code_reasons() {
        assert!(ConnectCode::Accepted.is_success());
        assert!(!ConnectCode::NotAuthorized.is_success());
        assert_eq!(
            ConnectCode::BadUserNamePassword.reason(),
            "Connection Refused: bad user name or password."
        );
        assert_eq!(
            ConnectCode::Transport("dns lookup failed".into()).to_string(),
            "dns lookup failed"
        );
    }

    #[test]
    fn test_session_options_from_settings() {
        let settings = BrokerSettings {
            port: 8883,
            username: Some("svc".into()),
            password: Some("pw".into()),
            ..Default::default()
        };
        let options = SessionOptions::from_settings(&settings, "svc-42");
        assert_eq!(options.client_id, "svc-42");
        assert!(options.clean_session);
        assert!(options.tls);
        assert_eq!(options.credentials, Some(("svc".into(), "pw".into())));
        assert_eq!(options.reconnect_min_delay, Duration::from_secs(1));
        assert_eq!(options.reconnect_max_delay, Duration::from_secs(32));
    }

    #[test]
    fn test_qos_conversion() {
        for n in 0..=2 {
            assert_eq!(qos_to_u8(qos_from_u8(n).unwrap()), n);
        }
        assert_eq!(qos_from_u8(3), None);
    }
}
