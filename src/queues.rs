use crate::message::Message;
use crate::storage::{QueuesStorage, StorageError};
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::ops::Deref;
use std::time::Instant;
use tracing::{debug, trace};

/// One destination peer's outgoing messages, FIFO.
///
/// A queue tracks whether its peer is connected. TTLs decay only by the time
/// spent disconnected: on reconnect, every message's remaining TTL shrinks
/// by the disconnected duration and messages below zero are dropped (a
/// remaining TTL of exactly zero survives until the next cycle). `ttl: None`
/// never decays.
pub struct Queue {
    name: String,
    items: VecDeque<Message>,
    connected: bool,
    last_disconnect: Instant,
}

impl Queue {
    fn new(name: String, items: Vec<Message>, now: Instant) -> Queue {
        Queue {
            name,
            items: items.into(),
            connected: false,
            last_disconnect: now,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Peek at the head message without consuming it.
    pub fn get(&self) -> Option<&Message> {
        self.items.front()
    }
}

/// Mutable access to one queue, paired with the manager's storage so every
/// mutation keeps the durable copy in sync.
pub struct QueueRef<'a> {
    queue: &'a mut Queue,
    storage: Option<&'a mut (dyn QueuesStorage + 'static)>,
}

impl Deref for QueueRef<'_> {
    type Target = Queue;

    fn deref(&self) -> &Queue {
        self.queue
    }
}

impl QueueRef<'_> {
    pub fn connect(&mut self) -> Result<(), StorageError> {
        self.connect_at(Instant::now())
    }

    /// Mark the peer connected and decay every TTL by the time spent
    /// disconnected. Expired messages are dropped here, including their
    /// stored copies.
    pub fn connect_at(&mut self, now: Instant) -> Result<(), StorageError> {
        self.queue.connected = true;
        let elapsed = now
            .saturating_duration_since(self.queue.last_disconnect)
            .as_secs_f32();

        let mut kept = VecDeque::with_capacity(self.queue.items.len());
        let mut decayed = Vec::new();
        let mut expired = Vec::new();
        for mut item in self.queue.items.drain(..) {
            match item.ttl {
                None => kept.push_back(item),
                Some(ttl) => {
                    let remaining = ttl - elapsed;
                    item.ttl = Some(remaining);
                    if remaining >= 0.0 {
                        if item.is_persistent() {
                            decayed.push(item.clone());
                        }
                        kept.push_back(item);
                    } else {
                        trace!("queue {:?}: message {} expired", self.queue.name, item.uuid);
                        if item.is_persistent() {
                            expired.push(item);
                        }
                    }
                }
            }
        }
        if !expired.is_empty() {
            debug!("queue {:?}: {} messages expired while disconnected", self.queue.name, expired.len());
        }
        self.queue.items = kept;

        if let Some(storage) = self.storage.as_deref_mut() {
            if !decayed.is_empty() {
                storage.update_items_ttl(&decayed)?;
            }
            if !expired.is_empty() {
                storage.delete_items(&expired)?;
            }
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.disconnect_at(Instant::now());
    }

    pub fn disconnect_at(&mut self, now: Instant) {
        self.queue.connected = false;
        self.queue.last_disconnect = now;
    }

    /// Append a message. While disconnected, a message with no time left is
    /// dropped right away. Persistent messages with time left (or no limit)
    /// are written through to storage.
    pub fn push(&mut self, message: Message) -> Result<(), StorageError> {
        if !self.queue.connected && matches!(message.ttl, Some(ttl) if ttl <= 0.0) {
            debug!("queue {:?}: dropping already-expired message {}", self.queue.name, message.uuid);
            return Ok(());
        }
        if message.is_persistent() && message.ttl.map_or(true, |ttl| ttl > 0.0) {
            if let Some(storage) = self.storage.as_deref_mut() {
                storage.push(&self.queue.name, &message)?;
            }
        }
        self.queue.items.push_back(message);
        Ok(())
    }

    /// Consume the head message, removing its stored copy if any.
    pub fn pop(&mut self) -> Result<Option<Message>, StorageError> {
        let Some(item) = self.queue.items.pop_front() else {
            return Ok(None);
        };
        if item.is_persistent() {
            if let Some(storage) = self.storage.as_deref_mut() {
                storage.delete_items(std::slice::from_ref(&item))?;
            }
        }
        Ok(Some(item))
    }
}

/// All destination queues of one messaging endpoint, keyed by peer
/// identifier, over an optional shared storage backend.
pub struct QueuesManager {
    queues: FxHashMap<String, Queue>,
    storage: Option<Box<dyn QueuesStorage>>,
}

impl QueuesManager {
    /// Build a manager over `storage`, rehydrating every queue it holds
    /// items for. Rehydrated queues start disconnected.
    pub fn new(mut storage: Box<dyn QueuesStorage>) -> Result<QueuesManager, StorageError> {
        let now = Instant::now();
        let mut queues = FxHashMap::default();
        for name in storage.get_queues()? {
            let items = storage.get_items(&name)?;
            debug!("rehydrated queue {:?} with {} messages", name, items.len());
            queues.insert(name.clone(), Queue::new(name, items, now));
        }
        Ok(QueuesManager {
            queues,
            storage: Some(storage),
        })
    }

    /// A manager without durability: persistent flags are accepted but have
    /// no effect.
    pub fn in_memory() -> QueuesManager {
        QueuesManager {
            queues: FxHashMap::default(),
            storage: None,
        }
    }

    /// Number of known queues.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Access (creating if needed) the queue for one peer.
    pub fn get_queue(&mut self, name: &str) -> Result<QueueRef<'_>, StorageError> {
        let queue = match self.queues.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let items = match &mut self.storage {
                    Some(storage) => storage.get_items(name)?,
                    None => Vec::new(),
                };
                entry.insert(Queue::new(name.to_string(), items, Instant::now()))
            }
        };
        Ok(QueueRef {
            queue,
            storage: self.storage.as_deref_mut(),
        })
    }

    /// Drop empty queues of disconnected peers.
    pub fn cleanup(&mut self) {
        self.queues
            .retain(|_, queue| queue.connected || !queue.items.is_empty());
    }

    /// Drop all queue state and release the storage backend.
    pub fn close(&mut self) {
        self.queues.clear();
        self.storage = None;
    }
}
