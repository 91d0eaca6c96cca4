mod sqlite;

pub use sqlite::SqliteStorage;

use crate::message::Message;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Durability backend for [`QueuesManager`](crate::queues::QueuesManager):
/// persistent messages are written through on push, deleted on pop or
/// expiry, and re-read on startup. Items are keyed by their uuid, which is
/// unique across queues.
#[cfg_attr(test, automock)]
pub trait QueuesStorage: Send {
    /// Names of all queues that have stored items.
    fn get_queues(&mut self) -> Result<Vec<String>, StorageError>;

    /// All stored items of one queue, in the order they were pushed.
    fn get_items(&mut self, queue_name: &str) -> Result<Vec<Message>, StorageError>;

    fn push(&mut self, queue_name: &str, item: &Message) -> Result<(), StorageError>;

    fn delete_items(&mut self, items: &[Message]) -> Result<(), StorageError>;

    fn update_items_ttl(&mut self, items: &[Message]) -> Result<(), StorageError>;
}

/// Non-durable [`QueuesStorage`] keeping everything in process memory.
/// Clones share state, which is what makes restart scenarios testable:
/// build a fresh manager over a clone and the "disk" content is still there.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    queues: Arc<Mutex<FxHashMap<String, Vec<Message>>>>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    pub fn item_count(&self) -> usize {
        self.queues.lock().values().map(Vec::len).sum()
    }
}

impl QueuesStorage for MemoryStorage {
    fn get_queues(&mut self) -> Result<Vec<String>, StorageError> {
        Ok(self.queues.lock().keys().cloned().collect())
    }

    fn get_items(&mut self, queue_name: &str) -> Result<Vec<Message>, StorageError> {
        Ok(self.queues.lock().get(queue_name).cloned().unwrap_or_default())
    }

    fn push(&mut self, queue_name: &str, item: &Message) -> Result<(), StorageError> {
        self.queues
            .lock()
            .entry(queue_name.to_string())
            .or_default()
            .push(item.clone());
        Ok(())
    }

    fn delete_items(&mut self, items: &[Message]) -> Result<(), StorageError> {
        let mut queues = self.queues.lock();
        for stored in queues.values_mut() {
            stored.retain(|s| !items.iter().any(|i| i.uuid == s.uuid));
        }
        queues.retain(|_, stored| !stored.is_empty());
        Ok(())
    }

    fn update_items_ttl(&mut self, items: &[Message]) -> Result<(), StorageError> {
        let mut queues = self.queues.lock();
        for stored in queues.values_mut().flatten() {
            if let Some(item) = items.iter().find(|i| i.uuid == stored.uuid) {
                stored.ttl = item.ttl;
            }
        }
        Ok(())
    }
}
