//! Durable storage for broker topology and persistent messages.
//!
//! Only durable entities ever reach a store: durable exchanges, durable
//! non-exclusive queues, bindings between those, and persistent messages
//! enqueued into durable queues. Messages are keyed by their per-queue
//! sequence number so that loading yields arrival order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use warren_internals::{ExchangeKind, Message, QueueOptions, WarrenError};

const EXCHANGES_TREE: &str = "exchanges";
const QUEUES_TREE: &str = "queues";
const BINDINGS_TREE: &str = "bindings";
const MESSAGES_TREE_PREFIX: &str = "msg/";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupted record in {0}")]
    Corrupted(String),

    #[error("store lock poisoned")]
    Poisoned,
}

impl From<StoreError> for WarrenError {
    fn from(err: StoreError) -> Self {
        WarrenError::Persistence(err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub name: String,
    pub kind: ExchangeKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub name: String,
    pub options: QueueOptions,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BindingRecord {
    pub exchange: String,
    pub queue: String,
    pub pattern: String,
}

/// Everything a store holds, as read back on startup.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub exchanges: Vec<ExchangeRecord>,
    pub queues: Vec<QueueRecord>,
    pub bindings: Vec<BindingRecord>,
    /// Per queue, `(seq, message)` pairs in ascending `seq` order.
    pub messages: BTreeMap<String, Vec<(u64, Message)>>,
}

pub trait MessageStore: Send + Sync {
    fn save_exchange(&self, record: &ExchangeRecord) -> Result<(), StoreError>;

    /// Deletes the exchange and every binding that references it.
    fn delete_exchange(&self, name: &str) -> Result<(), StoreError>;

    fn save_queue(&self, record: &QueueRecord) -> Result<(), StoreError>;

    /// Deletes the queue, its messages, and every binding that references it.
    fn delete_queue(&self, name: &str) -> Result<(), StoreError>;

    fn save_binding(&self, record: &BindingRecord) -> Result<(), StoreError>;

    fn delete_binding(&self, record: &BindingRecord) -> Result<(), StoreError>;

    fn append_message(&self, queue: &str, seq: u64, message: &Message) -> Result<(), StoreError>;

    fn remove_message(&self, queue: &str, seq: u64) -> Result<(), StoreError>;

    fn load(&self) -> Result<StoreSnapshot, StoreError>;

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    exchanges: BTreeMap<String, ExchangeRecord>,
    queues: BTreeMap<String, QueueRecord>,
    bindings: BTreeSet<BindingRecord>,
    messages: BTreeMap<String, BTreeMap<u64, Message>>,
}

/// Process-local store. Share one instance between two brokers to model a restart.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl MessageStore for MemoryStore {
    fn save_exchange(&self, record: &ExchangeRecord) -> Result<(), StoreError> {
        self.lock()?
            .exchanges
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn delete_exchange(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.exchanges.remove(name);
        state.bindings.retain(|b| b.exchange != name);
        Ok(())
    }

    fn save_queue(&self, record: &QueueRecord) -> Result<(), StoreError> {
        self.lock()?.queues.insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn delete_queue(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.queues.remove(name);
        state.messages.remove(name);
        state.bindings.retain(|b| b.queue != name);
        Ok(())
    }

    fn save_binding(&self, record: &BindingRecord) -> Result<(), StoreError> {
        self.lock()?.bindings.insert(record.clone());
        Ok(())
    }

    fn delete_binding(&self, record: &BindingRecord) -> Result<(), StoreError> {
        self.lock()?.bindings.remove(record);
        Ok(())
    }

    fn append_message(&self, queue: &str, seq: u64, message: &Message) -> Result<(), StoreError> {
        self.lock()?
            .messages
            .entry(queue.to_string())
            .or_default()
            .insert(seq, message.clone());
        Ok(())
    }

    fn remove_message(&self, queue: &str, seq: u64) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if let Some(messages) = state.messages.get_mut(queue) {
            messages.remove(&seq);
            if messages.is_empty() {
                state.messages.remove(queue);
            }
        }
        Ok(())
    }

    fn load(&self) -> Result<StoreSnapshot, StoreError> {
        let state = self.lock()?;
        Ok(StoreSnapshot {
            exchanges: state.exchanges.values().cloned().collect(),
            queues: state.queues.values().cloned().collect(),
            bindings: state.bindings.iter().cloned().collect(),
            messages: state
                .messages
                .iter()
                .map(|(queue, messages)| {
                    let entries = messages
                        .iter()
                        .map(|(seq, message)| (*seq, message.clone()))
                        .collect();
                    (queue.clone(), entries)
                })
                .collect(),
        })
    }
}

/// On-disk store backed by sled.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn messages_tree(&self, queue: &str) -> Result<sled::Tree, StoreError> {
        Ok(self
            .db
            .open_tree(format!("{}{}", MESSAGES_TREE_PREFIX, queue))?)
    }

    fn remove_bindings_where(
        &self,
        predicate: impl Fn(&BindingRecord) -> bool,
    ) -> Result<(), StoreError> {
        let bindings = self.db.open_tree(BINDINGS_TREE)?;
        for entry in bindings.iter() {
            let (key, value) = entry?;
            let record: BindingRecord = serde_json::from_slice(&value)?;
            if predicate(&record) {
                bindings.remove(key)?;
            }
        }
        Ok(())
    }

    fn read_tree<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
        let tree = self.db.open_tree(name)?;
        tree.iter()
            .map(|entry| {
                let (_, value) = entry?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }
}

impl MessageStore for SledStore {
    fn save_exchange(&self, record: &ExchangeRecord) -> Result<(), StoreError> {
        self.db
            .open_tree(EXCHANGES_TREE)?
            .insert(record.name.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    fn delete_exchange(&self, name: &str) -> Result<(), StoreError> {
        self.db.open_tree(EXCHANGES_TREE)?.remove(name.as_bytes())?;
        self.remove_bindings_where(|b| b.exchange == name)
    }

    fn save_queue(&self, record: &QueueRecord) -> Result<(), StoreError> {
        self.db
            .open_tree(QUEUES_TREE)?
            .insert(record.name.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    fn delete_queue(&self, name: &str) -> Result<(), StoreError> {
        self.db.open_tree(QUEUES_TREE)?.remove(name.as_bytes())?;
        self.db
            .drop_tree(format!("{}{}", MESSAGES_TREE_PREFIX, name))?;
        self.remove_bindings_where(|b| b.queue == name)
    }

    fn save_binding(&self, record: &BindingRecord) -> Result<(), StoreError> {
        let key = serde_json::to_vec(record)?;
        self.db.open_tree(BINDINGS_TREE)?.insert(key.clone(), key)?;
        Ok(())
    }

    fn delete_binding(&self, record: &BindingRecord) -> Result<(), StoreError> {
        let key = serde_json::to_vec(record)?;
        self.db.open_tree(BINDINGS_TREE)?.remove(key)?;
        Ok(())
    }

    fn append_message(&self, queue: &str, seq: u64, message: &Message) -> Result<(), StoreError> {
        self.messages_tree(queue)?
            .insert(seq.to_be_bytes(), serde_json::to_vec(message)?)?;
        Ok(())
    }

    fn remove_message(&self, queue: &str, seq: u64) -> Result<(), StoreError> {
        self.messages_tree(queue)?.remove(seq.to_be_bytes())?;
        Ok(())
    }

    fn load(&self) -> Result<StoreSnapshot, StoreError> {
        let mut snapshot = StoreSnapshot {
            exchanges: self.read_tree(EXCHANGES_TREE)?,
            queues: self.read_tree(QUEUES_TREE)?,
            bindings: self.read_tree(BINDINGS_TREE)?,
            messages: BTreeMap::new(),
        };

        for tree_name in self.db.tree_names() {
            let Some(queue) = tree_name.strip_prefix(MESSAGES_TREE_PREFIX.as_bytes()) else {
                continue;
            };
            let queue = String::from_utf8(queue.to_vec())
                .map_err(|_| StoreError::Corrupted("message tree name".to_string()))?;

            let mut entries = Vec::new();
            for entry in self.db.open_tree(&tree_name)?.iter() {
                let (key, value) = entry?;
                let seq = <[u8; 8]>::try_from(key.as_ref())
                    .map(u64::from_be_bytes)
                    .map_err(|_| StoreError::Corrupted(format!("sequence key of '{}'", queue)))?;
                entries.push((seq, serde_json::from_slice(&value)?));
            }
            if !entries.is_empty() {
                snapshot.messages.insert(queue, entries);
            }
        }

        Ok(snapshot)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
