//! In-process stores
//!
//! Every section of state sits behind its own `RwLock`. Locks are taken with
//! a bounded retry (see [`with_lock!`]) so a stuck writer surfaces as
//! [`StoreError::LockTimeout`] instead of hanging the event loop.

use super::{
    stats_of, validate_qos, ConnectionRecord, ConnectionUpdate, Message, MessageQuery,
    MessageStats, MessageStore, StatusStore, StoreError,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lock acquisition with 5 attempts, 10ms apart.
///
/// `@read` hands the guard to the closure by shared reference, `@write` by
/// mutable reference. Either arm evaluates to `Result<T, StoreError>` where
/// `T` is whatever the closure returns.
macro_rules! with_lock {
    (@write, $lock:expr, $operation:expr) => {{
        let mut attempts = 0;
        const MAX_ATTEMPTS: usize = 5;

        loop {
            match $lock.try_write() {
                Ok(mut guard) => break Ok($operation(&mut *guard)),
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        "Write lock blocked: {} (attempt {}/{})",
                        e,
                        attempts,
                        MAX_ATTEMPTS
                    );
                    if attempts >= MAX_ATTEMPTS {
                        break Err(StoreError::LockTimeout);
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }
    }};

    (@read, $lock:expr, $operation:expr) => {{
        let mut attempts = 0;
        const MAX_ATTEMPTS: usize = 5;

        loop {
            match $lock.try_read() {
                Ok(guard) => break Ok($operation(&*guard)),
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        "Read lock blocked: {} (attempt {}/{})",
                        e,
                        attempts,
                        MAX_ATTEMPTS
                    );
                    if attempts >= MAX_ATTEMPTS {
                        break Err(StoreError::LockTimeout);
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }
    }};
}

#[derive(Debug, Default)]
struct MessageLog {
    next_id: u64,
    last_timestamp: Option<DateTime<Utc>>,
    messages: Vec<Message>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryMessageStore {
    log: Arc<RwLock<MessageLog>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryMessageStore {
    fn append(
        &self,
        topic: &str,
        payload: &str,
        qos: u8,
        retain: bool,
    ) -> Result<Message, StoreError> {
        validate_qos(qos)?;
        with_lock!(@write, self.log, |log: &mut MessageLog| {
            log.next_id += 1;
            let now = Utc::now();
            let timestamp = match log.last_timestamp {
                Some(last) if last > now => last,
                _ => now,
            };
            log.last_timestamp = Some(timestamp);

            let msg = Message {
                id: log.next_id,
                topic: topic.to_string(),
                payload: payload.to_string(),
                qos,
                retain,
                timestamp,
                processed: false,
            };
            log.messages.push(msg.clone());
            msg
        })
    }

    fn get(&self, id: u64) -> Result<Message, StoreError> {
        with_lock!(@read, self.log, |log: &MessageLog| {
            log.messages.iter().find(|m| m.id == id).cloned()
        })?
        .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
    }

    fn list(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        with_lock!(@read, self.log, |log: &MessageLog| {
            query.apply(log.messages.iter().cloned())
        })
    }

    fn bulk_mark_processed(&self, topic: &str) -> Result<usize, StoreError> {
        with_lock!(@write, self.log, |log: &mut MessageLog| {
            let mut updated = 0;
            for msg in log
                .messages
                .iter_mut()
                .filter(|m| m.topic == topic && !m.processed)
            {
                msg.processed = true;
                updated += 1;
            }
            updated
        })
    }

    fn aggregate(&self) -> Result<MessageStats, StoreError> {
        with_lock!(@read, self.log, |log: &MessageLog| stats_of(&log.messages))
    }
}

#[derive(Debug)]
pub struct MemoryStatusStore {
    provisioned: AtomicBool,
    records: RwLock<HashMap<String, ConnectionRecord>>,
}

impl Default for MemoryStatusStore {
    fn default() -> Self {
        Self {
            provisioned: AtomicBool::new(true),
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose table does not exist until [`StatusStore::provision`]
    pub fn unprovisioned() -> Self {
        Self {
            provisioned: AtomicBool::new(false),
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl StatusStore for MemoryStatusStore {
    fn is_provisioned(&self) -> Result<bool, StoreError> {
        Ok(self.provisioned.load(Ordering::Acquire))
    }

    fn provision(&self) -> Result<(), StoreError> {
        self.provisioned.store(true, Ordering::Release);
        Ok(())
    }

    fn upsert(&self, update: ConnectionUpdate) -> Result<ConnectionRecord, StoreError> {
        if !self.is_provisioned()? {
            return Err(StoreError::NotProvisioned("connection_status"));
        }
        with_lock!(@write, self.records, |records: &mut HashMap<String, ConnectionRecord>| {
            let client_id = update.client_id.clone();
            let existing = records.remove(&client_id);
            let record = update.fold(existing, Utc::now());
            records.insert(client_id, record.clone());
            record
        })
    }

    fn latest(&self) -> Result<ConnectionRecord, StoreError> {
        if !self.is_provisioned()? {
            return Err(StoreError::NotFound("no connection status recorded".into()));
        }
        with_lock!(@read, self.records, |records: &HashMap<String, ConnectionRecord>| {
            records.values().max_by_key(|r| r.updated_at).cloned()
        })?
        .ok_or_else(|| StoreError::NotFound("no connection status recorded".into()))
    }

    fn get(&self, client_id: &str) -> Result<ConnectionRecord, StoreError> {
        if !self.is_provisioned()? {
            return Err(StoreError::NotFound(client_id.to_string()));
        }
        with_lock!(@read, self.records, |records: &HashMap<String, ConnectionRecord>| {
            records.get(client_id).cloned()
        })?
        .ok_or_else(|| StoreError::NotFound(client_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::ConnectionStatus;

    #[test]
    fn test_append_assigns_ids_and_ordered_timestamps() {
        let store = MemoryMessageStore::new();
        let first = store.append("a", "1", 0, false).unwrap();
        let second = store.append("a", "2", 1, true).unwrap();
        assert!(second.id > first.id);
        assert!(second.timestamp >= first.timestamp);
        assert!(!second.processed);
        assert_eq!(store.get(second.id).unwrap(), second);
    }

    #[test]
    fn test_append_rejects_invalid_qos() {
        let store = MemoryMessageStore::new();
        assert!(matches!(
            store.append("a", "x", 3, false),
            Err(StoreError::InvalidQos(3))
        ));
        assert_eq!(store.aggregate().unwrap().total, 0);
    }

    #[test]
    fn test_bulk_mark_processed_only_touches_topic() {
        let store = MemoryMessageStore::new();
        store.append("sensors/temp", "1", 0, false).unwrap();
        store.append("sensors/temp", "2", 0, false).unwrap();
        store.append("sensors/hum", "3", 0, false).unwrap();

        assert_eq!(store.bulk_mark_processed("sensors/temp").unwrap(), 2);
        assert_eq!(store.bulk_mark_processed("sensors/temp").unwrap(), 0);

        let untouched = store
            .list(&MessageQuery::default().topic("sensors/hum"))
            .unwrap();
        assert!(!untouched[0].processed);
        assert_eq!(store.aggregate().unwrap().unprocessed, 1);
    }

    #[test]
    fn test_status_upsert_and_latest() {
        let store = MemoryStatusStore::new();
        assert!(matches!(store.latest(), Err(StoreError::NotFound(_))));

        let created = store
            .upsert(ConnectionUpdate::connected("svc-42", Utc::now()))
            .unwrap();
        assert_eq!(created.status, ConnectionStatus::Connected);

        store
            .upsert(ConnectionUpdate::disconnected("svc-42", Utc::now()))
            .unwrap();
        let latest = store.latest().unwrap();
        assert_eq!(latest.status, ConnectionStatus::Disconnected);
        assert_eq!(latest.last_connected, created.last_connected);
        assert_eq!(latest.created_at, created.created_at);
    }

    #[test]
    fn test_unprovisioned_status_store() {
        let store = MemoryStatusStore::unprovisioned();
        assert!(!store.is_provisioned().unwrap());
        assert!(matches!(
            store.upsert(ConnectionUpdate::error("svc", "boom")),
            Err(StoreError::NotProvisioned(_))
        ));
        assert!(matches!(store.get("svc"), Err(StoreError::NotFound(_))));

        store.provision().unwrap();
        assert!(store.upsert(ConnectionUpdate::error("svc", "boom")).is_ok());
        assert_eq!(store.get("svc").unwrap().status, ConnectionStatus::Error);
    }
}
