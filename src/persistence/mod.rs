//! # Persistence Module
//!
//! Durable history for the broker connection: every inbound message is
//! appended to the message log, and every connection transition is folded
//! into a single status record per client identifier.
//!
//! ## Key Abstractions
//! - [`MessageStore`]: append-only message log with a mutable `processed` flag
//! - [`StatusStore`]: upsert-by-client-id connection record that tolerates
//!   being queried (or written) before its table has been provisioned
//! - [`MessageQuery`]: filtering, search and ordering shared by all backends
//!
//! ## Backends
//! - [`sled_store`]: embedded on-disk store used in production
//! - [`memory_store`]: in-process store for tests and throwaway runs
//!
//! Both backends accept concurrent writers; the stores serialize mutation of
//! a single record themselves so callers never need to lock around them.

pub mod memory_store;
pub mod sled_store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One message received from the broker.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
    /// Set once on insert, never decreases in insertion order
    pub timestamp: DateTime<Utc>,
    /// Only flipped by consumers, never by the connection core
    pub processed: bool,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {}", self.topic, self.timestamp)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Current connection health of one broker session.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub client_id: String,
    pub status: ConnectionStatus,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {}", self.client_id, self.status)
    }
}

/// A status transition to fold into the client's [`ConnectionRecord`].
///
/// `status` and `error_message` always overwrite the stored values; the
/// timestamps only overwrite when present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub client_id: String,
    pub status: ConnectionStatus,
    pub error_message: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
}

impl ConnectionUpdate {
    pub fn connected(client_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            client_id: client_id.into(),
            status: ConnectionStatus::Connected,
            error_message: None,
            last_connected: Some(at),
            last_disconnected: None,
        }
    }

    pub fn disconnected(client_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            client_id: client_id.into(),
            status: ConnectionStatus::Disconnected,
            error_message: None,
            last_connected: None,
            last_disconnected: Some(at),
        }
    }

    pub fn error(client_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            status: ConnectionStatus::Error,
            error_message: Some(message.into()),
            last_connected: None,
            last_disconnected: None,
        }
    }

    /// Applies this update to `existing`, or builds a fresh record.
    pub(crate) fn fold(self, existing: Option<ConnectionRecord>, now: DateTime<Utc>) -> ConnectionRecord {
        match existing {
            Some(mut record) => {
                record.status = self.status;
                record.error_message = self.error_message;
                if self.last_connected.is_some() {
                    record.last_connected = self.last_connected;
                }
                if self.last_disconnected.is_some() {
                    record.last_disconnected = self.last_disconnected;
                }
                record.updated_at = now;
                record
            }
            None => ConnectionRecord {
                client_id: self.client_id,
                status: self.status,
                last_connected: self.last_connected,
                last_disconnected: self.last_disconnected,
                error_message: self.error_message,
                created_at: now,
                updated_at: now,
            },
        }
    }
}

/// Sort order for message listings, spelled like `timestamp` / `-timestamp`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MessageOrdering {
    TimestampAsc,
    #[default]
    TimestampDesc,
    TopicAsc,
    TopicDesc,
}

impl FromStr for MessageOrdering {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "timestamp" => Ok(Self::TimestampAsc),
            "-timestamp" => Ok(Self::TimestampDesc),
            "topic" => Ok(Self::TopicAsc),
            "-topic" => Ok(Self::TopicDesc),
            other => Err(StoreError::InvalidQuery(format!(
                "unknown ordering field: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageQuery {
    pub topic: Option<String>,
    pub processed: Option<bool>,
    /// Case-insensitive substring over topic and payload
    pub search: Option<String>,
    pub ordering: MessageOrdering,
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn processed(mut self, processed: bool) -> Self {
        self.processed = Some(processed);
        self
    }

    pub fn search(mut self, needle: impl Into<String>) -> Self {
        self.search = Some(needle.into());
        self
    }

    pub fn ordering(mut self, ordering: MessageOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(topic) = &self.topic {
            if &msg.topic != topic {
                return false;
            }
        }
        if let Some(processed) = self.processed {
            if msg.processed != processed {
                return false;
            }
        }
        if let Some(needle) = &self.search {
            let needle = needle.to_lowercase();
            if !msg.topic.to_lowercase().contains(&needle)
                && !msg.payload.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }

    /// Filters, orders and truncates `messages` according to this query.
    pub fn apply(&self, messages: impl IntoIterator<Item = Message>) -> Vec<Message> {
        let mut selected: Vec<Message> = messages.into_iter().filter(|m| self.matches(m)).collect();

        match self.ordering {
            MessageOrdering::TimestampAsc => {
                selected.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)))
            }
            MessageOrdering::TimestampDesc => {
                selected.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)))
            }
            MessageOrdering::TopicAsc => {
                selected.sort_by(|a, b| a.topic.cmp(&b.topic).then(a.id.cmp(&b.id)))
            }
            MessageOrdering::TopicDesc => {
                selected.sort_by(|a, b| b.topic.cmp(&a.topic).then(b.id.cmp(&a.id)))
            }
        }

        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageStats {
    pub total: usize,
    pub unprocessed: usize,
    pub unique_topics: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Table {0} has not been provisioned")]
    NotProvisioned(&'static str),

    #[error("QoS must be 0, 1 or 2, got {0}")]
    InvalidQos(u8),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Could not acquire lock after maximum retry attempts")]
    LockTimeout,
}

/// Durable log of inbound broker messages.
pub trait MessageStore: Send + Sync {
    /// Appends a message, assigning its id and timestamp.
    fn append(&self, topic: &str, payload: &str, qos: u8, retain: bool)
        -> Result<Message, StoreError>;

    fn get(&self, id: u64) -> Result<Message, StoreError>;

    fn list(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError>;

    /// Marks every unprocessed message on `topic` as processed and returns how
    /// many were changed.
    fn bulk_mark_processed(&self, topic: &str) -> Result<usize, StoreError>;

    fn aggregate(&self) -> Result<MessageStats, StoreError>;
}

/// Connection health, one record per client identifier.
pub trait StatusStore: Send + Sync {
    /// Whether the backing table exists yet
    fn is_provisioned(&self) -> Result<bool, StoreError>;

    fn provision(&self) -> Result<(), StoreError>;

    /// Creates the record for `update.client_id` or folds the update into it.
    fn upsert(&self, update: ConnectionUpdate) -> Result<ConnectionRecord, StoreError>;

    /// The most recently updated record
    fn latest(&self) -> Result<ConnectionRecord, StoreError>;

    fn get(&self, client_id: &str) -> Result<ConnectionRecord, StoreError>;
}

pub(crate) fn validate_qos(qos: u8) -> Result<(), StoreError> {
    if qos > 2 {
        return Err(StoreError::InvalidQos(qos));
    }
    Ok(())
}

pub(crate) fn stats_of<'a>(messages: impl IntoIterator<Item = &'a Message>) -> MessageStats {
    let mut topics = std::collections::HashSet::new();
    let mut stats = MessageStats::default();
    for msg in messages {
        stats.total += 1;
        if !msg.processed {
            stats.unprocessed += 1;
        }
        topics.insert(msg.topic.as_str());
    }
    stats.unique_topics = topics.len();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn msg(id: u64, topic: &str, payload: &str, offset_secs: i64, processed: bool) -> Message {
        Message {
            id,
            topic: topic.into(),
            payload: payload.into(),
            qos: 0,
            retain: false,
            timestamp: DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(offset_secs),
            processed,
        }
    }

    fn sample() -> Vec<Message> {
        vec![
            msg(1, "sensors/temp", r#"{"v":21.5}"#, 10, false),
            msg(2, "sensors/hum", r#"{"v":55}"#, 20, true),
            msg(3, "alarms/fire", "HIGH_TEMP", 30, false),
            msg(4, "sensors/temp", r#"{"v":22.0}"#, 30, false),
        ]
    }

    #[test]
    fn test_ordering_parse() {
        assert_eq!("timestamp".parse::<MessageOrdering>().unwrap(), MessageOrdering::TimestampAsc);
        assert_eq!("-timestamp".parse::<MessageOrdering>().unwrap(), MessageOrdering::TimestampDesc);
        assert_eq!("-topic".parse::<MessageOrdering>().unwrap(), MessageOrdering::TopicDesc);
        assert!("payload".parse::<MessageOrdering>().is_err());
    }

    #[test]
    fn test_default_query_is_newest_first() {
        let ids: Vec<u64> = MessageQuery::default().apply(sample()).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_filters_combine() {
        let query = MessageQuery::default().topic("sensors/temp").processed(false);
        let ids: Vec<u64> = query.apply(sample()).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![4, 1]);
    }

    #[test]
    fn test_search_covers_topic_and_payload() {
        let by_payload = MessageQuery::default().search("high_temp").apply(sample());
        assert_eq!(by_payload.len(), 1);
        assert_eq!(by_payload[0].id, 3);

        let by_topic = MessageQuery::default().search("SENSORS").apply(sample());
        assert_eq!(by_topic.len(), 3);
    }

    #[test]
    fn test_topic_ordering_and_limit() {
        let query = MessageQuery::default()
            .ordering(MessageOrdering::TopicAsc)
            .limit(2);
        let topics: Vec<String> = query.apply(sample()).into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["alarms/fire", "sensors/hum"]);
    }

    #[test]
    fn test_stats() {
        let messages = sample();
        let stats = stats_of(&messages);
        assert_eq!(
            stats,
            MessageStats {
                total: 4,
                unprocessed: 3,
                unique_topics: 3
            }
        );
    }

    #[test]
    fn test_fold_preserves_last_connected() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);
        let record = ConnectionUpdate::connected("svc-42", t0).fold(None, t0);
        assert_eq!(record.last_disconnected, None);

        let record = ConnectionUpdate::disconnected("svc-42", t1).fold(Some(record), t1);
        assert_eq!(record.status, ConnectionStatus::Disconnected);
        assert_eq!(record.last_connected, Some(t0));
        assert_eq!(record.last_disconnected, Some(t1));
        assert_eq!(record.created_at, t0);
        assert_eq!(record.updated_at, t1);
    }

    #[test]
    fn test_fold_clears_error_message() {
        let now = Utc::now();
        let record = ConnectionUpdate::error("svc", "Connection Refused: not authorised.").fold(None, now);
        assert!(record.error_message.is_some());
        let record = ConnectionUpdate::connected("svc", now).fold(Some(record), now);
        assert_eq!(record.error_message, None);
    }
}
