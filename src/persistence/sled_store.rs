//! Persistence backed by `sled`
//!
//! Messages live in the `messages` tree keyed by their big-endian id, so a
//! plain scan yields insertion order. Connection records live in the
//! `connection_status` tree keyed by client id. The status tree is only
//! created by [`SledStatusStore::provision`]; until then status writes are
//! refused with [`StoreError::NotProvisioned`].
//!
//! All calls are synchronous. The dispatcher only issues point operations
//! (`append`, `is_provisioned`, `upsert`), which touch a single key. The
//! full-tree scans behind `list`, `aggregate`, `bulk_mark_processed` and
//! `latest` belong to read-side callers; from async code, run them through
//! `tokio::task::spawn_blocking`.

use super::{
    stats_of, validate_qos, ConnectionRecord, ConnectionUpdate, Message, MessageQuery,
    MessageStats, MessageStore, StatusStore, StoreError,
};
use chrono::{DateTime, Utc};
use sled::{Batch, Db, Tree};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const MESSAGES_TREE: &str = "messages";
const STATUS_TREE: &str = "connection_status";

/// Opens (or creates) the database directory shared by both stores.
pub fn open_db(path: &Path) -> Result<Db, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Sled(e.into()))?;
        }
    }
    let db = sled::open(path)?;
    info!("Opened message database at {}", path.display());
    Ok(db)
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    // the guarded section holds no data, a poisoned lock is still usable
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SledMessageStore {
    db: Db,
    tree: Tree,
    // last assigned timestamp
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
    write_lock: Mutex<()>,
}

impl SledMessageStore {
    pub fn new(db: Db) -> Result<Self, StoreError> {
        let tree = db.open_tree(MESSAGES_TREE)?;
        let last_timestamp = match tree.last()? {
            Some((_, value)) => Some(serde_json::from_slice::<Message>(&value)?.timestamp),
            None => None,
        };
        debug!("Message tree holds {} entries", tree.len());
        Ok(Self {
            db,
            tree,
            last_timestamp: Mutex::new(last_timestamp),
            write_lock: Mutex::new(()),
        })
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self
            .last_timestamp
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let timestamp = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(timestamp);
        timestamp
    }

    fn scan(&self) -> impl Iterator<Item = Result<Message, StoreError>> + '_ {
        self.tree.iter().map(|entry| {
            let (_, value) = entry?;
            Ok(serde_json::from_slice::<Message>(&value)?)
        })
    }
}

impl std::fmt::Debug for SledMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledMessageStore")
            .field("tree", &MESSAGES_TREE)
            .finish()
    }
}

impl MessageStore for SledMessageStore {
    fn append(
        &self,
        topic: &str,
        payload: &str,
        qos: u8,
        retain: bool,
    ) -> Result<Message, StoreError> {
        validate_qos(qos)?;
        let _guard = lock(&self.write_lock);

        // generated ids are monotonic across restarts
        let id = self.db.generate_id()?;
        let msg = Message {
            id,
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos,
            retain,
            timestamp: self.next_timestamp(),
            processed: false,
        };
        self.tree.insert(id.to_be_bytes(), serde_json::to_vec(&msg)?)?;
        Ok(msg)
    }

    fn get(&self, id: u64) -> Result<Message, StoreError> {
        match self.tree.get(id.to_be_bytes())? {
            Some(value) => Ok(serde_json::from_slice(&value)?),
            None => Err(StoreError::NotFound(format!("message {id}"))),
        }
    }

    fn list(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        let messages = self.scan().collect::<Result<Vec<_>, _>>()?;
        Ok(query.apply(messages))
    }

    fn bulk_mark_processed(&self, topic: &str) -> Result<usize, StoreError> {
        let _guard = lock(&self.write_lock);

        let mut batch = Batch::default();
        let mut updated = 0;
        for msg in self.scan() {
            let mut msg = msg?;
            if msg.topic == topic && !msg.processed {
                msg.processed = true;
                batch.insert(msg.id.to_be_bytes().to_vec(), serde_json::to_vec(&msg)?);
                updated += 1;
            }
        }
        self.tree.apply_batch(batch)?;
        debug!("Marked {} messages on {} as processed", updated, topic);
        Ok(updated)
    }

    fn aggregate(&self) -> Result<MessageStats, StoreError> {
        let messages = self.scan().collect::<Result<Vec<_>, _>>()?;
        Ok(stats_of(&messages))
    }
}

pub struct SledStatusStore {
    db: Db,
    write_lock: Mutex<()>,
}

impl SledStatusStore {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    /// The status tree, or `None` while it has not been provisioned.
    fn tree(&self) -> Result<Option<Tree>, StoreError> {
        if self.is_provisioned()? {
            Ok(Some(self.db.open_tree(STATUS_TREE)?))
        } else {
            Ok(None)
        }
    }
}

impl std::fmt::Debug for SledStatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStatusStore")
            .field("tree", &STATUS_TREE)
            .finish()
    }
}

impl StatusStore for SledStatusStore {
    fn is_provisioned(&self) -> Result<bool, StoreError> {
        Ok(self
            .db
            .tree_names()
            .iter()
            .any(|name| &name[..] == STATUS_TREE.as_bytes()))
    }

    fn provision(&self) -> Result<(), StoreError> {
        self.db.open_tree(STATUS_TREE)?;
        info!("Provisioned {} table", STATUS_TREE);
        Ok(())
    }

    fn upsert(&self, update: ConnectionUpdate) -> Result<ConnectionRecord, StoreError> {
        let tree = self
            .tree()?
            .ok_or(StoreError::NotProvisioned(STATUS_TREE))?;
        let _guard = lock(&self.write_lock);

        let existing = match tree.get(update.client_id.as_bytes())? {
            Some(value) => Some(serde_json::from_slice::<ConnectionRecord>(&value)?),
            None => None,
        };
        let record = update.fold(existing, Utc::now());
        tree.insert(record.client_id.as_bytes(), serde_json::to_vec(&record)?)?;
        Ok(record)
    }

    fn latest(&self) -> Result<ConnectionRecord, StoreError> {
        let not_found = || StoreError::NotFound("no connection status recorded".into());
        let tree = self.tree()?.ok_or_else(not_found)?;

        let mut latest: Option<ConnectionRecord> = None;
        for entry in tree.iter() {
            let (_, value) = entry?;
            let record: ConnectionRecord = serde_json::from_slice(&value)?;
            if latest
                .as_ref()
                .map_or(true, |current| record.updated_at > current.updated_at)
            {
                latest = Some(record);
            }
        }
        latest.ok_or_else(not_found)
    }

    fn get(&self, client_id: &str) -> Result<ConnectionRecord, StoreError> {
        let tree = self
            .tree()?
            .ok_or_else(|| StoreError::NotFound(client_id.to_string()))?;
        match tree.get(client_id.as_bytes())? {
            Some(value) => Ok(serde_json::from_slice(&value)?),
            None => Err(StoreError::NotFound(client_id.to_string())),
        }
    }
}
