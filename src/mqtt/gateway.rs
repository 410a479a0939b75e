//! Publish gateway for callers outside the connection core

use super::supervisor::{PublishError, Supervisor};
use rumqttc::QoS;
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct PublishGateway {
    supervisor: Arc<Supervisor>,
}

impl PublishGateway {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    /// Gateway over the process-wide supervisor, if one was created.
    pub fn from_instance() -> Option<Self> {
        Supervisor::get_instance().map(Self::new)
    }

    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) -> bool {
        self.supervisor.publish(topic, payload, qos, retain)
    }

    pub fn try_publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError> {
        self.supervisor.try_publish(topic, payload, qos, retain)
    }

    /// Serializes `value` as JSON and publishes it.
    pub fn publish_json<T: Serialize>(&self, topic: &str, value: &T, qos: QoS, retain: bool) -> bool {
        match serde_json::to_vec(value) {
            Ok(payload) => self.publish(topic, payload, qos, retain),
            Err(e) => {
                error!("Failed to serialize payload for {}: {}", topic, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::mqtt::testing::{eventually, MockConnector};
    use crate::mqtt::transport::{ConnectCode, TransportEvent};
    use crate::persistence::memory_store::{MemoryMessageStore, MemoryStatusStore};
    use serde::ser::Error as _;
    use serde_json::json;

    async fn gateway(connected: bool) -> (PublishGateway, MockConnector) {
        let mut settings = Settings::default();
        settings.supervisor.teardown_grace_ms = 0;
        let transport = MockConnector::new();
        let supervisor = Supervisor::spawn(
            &settings,
            Arc::new(transport.clone()),
            Arc::new(MemoryMessageStore::new()),
            Arc::new(MemoryStatusStore::new()),
        );
        supervisor.initialize().await;
        if connected {
            transport
                .emit(TransportEvent::ConnectResult(ConnectCode::Accepted))
                .await;
            let s = supervisor.clone();
            eventually(|| s.is_connected()).await;
        }
        (PublishGateway::new(supervisor), transport)
    }

    #[tokio::test]
    async fn test_gateway_refuses_when_not_connected() {
        let (gateway, transport) = gateway(false).await;
        assert!(!gateway.publish("cmd/led", "on", QoS::AtMostOnce, false));
        assert!(matches!(
            gateway.try_publish("cmd/led", "on", QoS::AtMostOnce, false),
            Err(PublishError::NotConnected)
        ));
        assert!(transport.publishes().is_empty());
    }

    #[tokio::test]
    async fn test_publish_json() {
        let (gateway, transport) = gateway(true).await;
        assert!(gateway.publish_json("cmd/led", &json!({"state": "on"}), QoS::AtLeastOnce, false));

        let sent = transport.publishes();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, br#"{"state":"on"}"#.to_vec());
        assert_eq!(sent[0].qos, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_from_instance_uses_global_supervisor() {
        let (gateway, _transport) = gateway(false).await;
        let shared = gateway.supervisor.clone();
        let global = Supervisor::global().get_or_init(|| shared);

        let resolved = PublishGateway::from_instance().unwrap();
        assert!(Arc::ptr_eq(&resolved.supervisor, &global));
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("not representable"))
        }
    }

    #[tokio::test]
    async fn test_publish_json_serialization_failure() {
        let (gateway, transport) = gateway(true).await;
        assert!(!gateway.publish_json("cmd/led", &Unserializable, QoS::AtMostOnce, false));
        assert!(transport.publishes().is_empty());
    }
}
