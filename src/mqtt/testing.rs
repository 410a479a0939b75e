//! Scripted in-process transport for tests
//!
//! [`MockConnector`] records every request its sessions receive and keeps the
//! event sender of every session it opened, so tests can play the broker side
//! by pushing [`TransportEvent`]s, including late ones from replaced sessions.

use super::transport::{
    Connector, EventSender, Session, SessionOptions, TransportError, TransportEvent,
};
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub opens: Vec<SessionOptions>,
    pub subscriptions: Vec<(String, QoS)>,
    pub starts: usize,
    pub stops: usize,
    pub publishes: Vec<Published>,
}

#[derive(Default)]
struct Shared {
    recorded: Mutex<Recorded>,
    senders: Mutex<Vec<EventSender>>,
    fail_open: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
}

impl Shared {
    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap()
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    shared: Arc<Shared>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(&self, fail: bool) {
        self.shared.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.shared.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.shared.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.shared.recorded()
    }

    pub fn opens(&self) -> usize {
        self.recorded().opens.len()
    }

    pub fn stops(&self) -> usize {
        self.recorded().stops
    }

    pub fn publishes(&self) -> Vec<Published> {
        self.recorded().publishes.clone()
    }

    /// Pushes an event as if the latest session's network loop produced it.
    pub async fn emit(&self, event: TransportEvent) {
        let sender = self.shared.senders.lock().unwrap().last().cloned();
        sender
            .expect("no session opened yet")
            .send(event)
            .await
            .expect("dispatcher gone");
    }

    /// Pushes an event through the sender of the `index`-th opened session.
    pub async fn emit_from(&self, index: usize, event: TransportEvent) {
        let sender = self.shared.senders.lock().unwrap().get(index).cloned();
        sender
            .expect("no such session")
            .send(event)
            .await
            .expect("dispatcher gone");
    }

    /// Session numbers handed out so far, oldest first.
    pub fn session_ids(&self) -> Vec<u64> {
        self.shared
            .senders
            .lock()
            .unwrap()
            .iter()
            .map(EventSender::session)
            .collect()
    }

    /// Forgets the captured senders so the event channel can close.
    pub fn release(&self) {
        self.shared.senders.lock().unwrap().clear();
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        options: &SessionOptions,
        events: EventSender,
    ) -> Result<Box<dyn Session>, TransportError> {
        if self.shared.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("connection refused".into()));
        }
        self.shared.recorded().opens.push(options.clone());
        self.shared.senders.lock().unwrap().push(events);
        Ok(Box::new(MockSession {
            shared: self.shared.clone(),
            started: false,
        }))
    }
}

struct MockSession {
    shared: Arc<Shared>,
    started: bool,
}

impl Session for MockSession {
    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        if self.shared.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(format!("subscribe {filter}")));
        }
        self.shared
            .recorded()
            .subscriptions
            .push((filter.to_string(), qos));
        Ok(())
    }

    fn start(&mut self) -> Result<(), TransportError> {
        if self.started {
            return Err(TransportError::AlreadyStarted);
        }
        self.started = true;
        self.shared.recorded().starts += 1;
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if self.shared.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("outgoing queue full".into()));
        }
        self.shared.recorded().publishes.push(Published {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.shared.recorded().stops += 1;
        if !self.started {
            return Err(TransportError::NotStarted);
        }
        self.started = false;
        Ok(())
    }
}

/// Polls `condition` until it holds, panicking after one second.
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
