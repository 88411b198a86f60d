use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::{FlushMode, StoreConfig};
use crate::message_store::MessageStore;
use crate::queue::Queue;
use crate::scheduler::Scheduler;
use crate::types::{Result, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    pub topic: String,
    pub queue_id: u32,
}

impl QueueKey {
    pub fn new(topic: &str, queue_id: u32) -> Self {
        Self {
            topic: topic.to_string(),
            queue_id,
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.queue_id)
    }
}

/// Registry of every queue index of a store.
#[derive(Debug)]
pub struct QueueStore {
    config: StoreConfig,
    queues: RwLock<HashMap<QueueKey, Arc<Queue>>>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl QueueStore {
    /// Open every queue found under `{base_path}/queue-chunks/{topic}/{queue_id}`.
    pub fn load(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let mut queues = HashMap::new();

        if !config.memory_mode {
            let root = config.queue_root_dir();
            std::fs::create_dir_all(&root)?;
            for topic_entry in std::fs::read_dir(&root)? {
                let topic_entry = topic_entry?;
                if !topic_entry.file_type()?.is_dir() {
                    continue;
                }
                let Ok(topic) = topic_entry.file_name().into_string() else {
                    warn!("Skipping queue directory with a non UTF-8 name under '{}'", root.display());
                    continue;
                };
                for queue_entry in std::fs::read_dir(topic_entry.path())? {
                    let queue_entry = queue_entry?;
                    let Some(queue_id) = queue_entry
                        .file_name()
                        .to_str()
                        .and_then(|name| name.parse::<u32>().ok())
                    else {
                        continue;
                    };
                    if let Some(queue) = Queue::open(&topic, queue_id, &config)? {
                        queues.insert(QueueKey::new(&topic, queue_id), Arc::new(queue));
                    }
                }
            }
        }

        info!("Loaded {} queues", queues.len());
        Ok(Self {
            config,
            queues: RwLock::new(queues),
            scheduler: Mutex::new(None),
        })
    }

    /// Create a queue, or return the existing one.
    pub fn create_queue(&self, topic: &str, queue_id: u32) -> Result<Arc<Queue>> {
        validate_topic(topic)?;
        let key = QueueKey::new(topic, queue_id);
        let mut queues = self.queues.write();
        if let Some(queue) = queues.get(&key) {
            return Ok(queue.clone());
        }
        // a leftover deleted queue is cleaned up by the first open
        let queue = match Queue::open(topic, queue_id, &self.config)? {
            Some(queue) => queue,
            None => Queue::open(topic, queue_id, &self.config)?.ok_or_else(|| {
                StoreError::InconsistentChunks(format!("queue {key} could not be recreated"))
            })?,
        };
        let queue = Arc::new(queue);
        queues.insert(key.clone(), queue.clone());
        info!("Created queue {key}");
        Ok(queue)
    }

    pub fn get_queue(&self, topic: &str, queue_id: u32) -> Option<Arc<Queue>> {
        self.queues.read().get(&QueueKey::new(topic, queue_id)).cloned()
    }

    /// Queues of `topic`, by queue id.
    pub fn queues_of(&self, topic: &str) -> Vec<Arc<Queue>> {
        let mut queues: Vec<Arc<Queue>> = self
            .queues
            .read()
            .values()
            .filter(|q| q.topic() == topic)
            .cloned()
            .collect();
        queues.sort_by_key(|q| q.queue_id());
        queues
    }

    pub fn all_queues(&self) -> Vec<Arc<Queue>> {
        self.queues.read().values().cloned().collect()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.read().len()
    }

    /// Remove a queue and its data. Returns `false` for an unknown queue.
    pub fn delete_queue(&self, topic: &str, queue_id: u32) -> Result<bool> {
        let Some(queue) = self.queues.write().remove(&QueueKey::new(topic, queue_id)) else {
            return Ok(false);
        };
        queue.delete()?;
        Ok(true)
    }

    /// One retention pass over every queue index, against the lowest
    /// position still held by the message log.
    pub fn delete_queue_messages(&self, min_message_position: u64) -> usize {
        let mut removed = 0;
        for queue in self.all_queues() {
            match queue.delete_messages(min_message_position) {
                Ok(count) => removed += count,
                Err(e) => warn!(
                    "Retention of queue {}-{} failed: {e}",
                    queue.topic(),
                    queue.queue_id()
                ),
            }
        }
        removed
    }

    pub fn flush(&self) -> Result<()> {
        for queue in self.all_queues() {
            queue.flush()?;
        }
        Ok(())
    }

    /// Start the queue retention timer, driven by `message_store`, and the
    /// periodic flush.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>, message_store: &Arc<MessageStore>) {
        let mut scheduler = Scheduler::new();

        let queues: Weak<Self> = Arc::downgrade(self);
        let messages: Weak<MessageStore> = Arc::downgrade(message_store);
        scheduler.schedule("queue-retention", self.config.retention_interval, move || {
            if let (Some(queues), Some(messages)) = (queues.upgrade(), messages.upgrade()) {
                queues.delete_queue_messages(messages.min_message_position());
            }
        });

        if self.config.flush_mode == FlushMode::Periodic {
            let queues: Weak<Self> = Arc::downgrade(self);
            scheduler.schedule("queue-flush", self.config.flush_interval, move || {
                if let Some(queues) = queues.upgrade()
                    && let Err(e) = queues.flush()
                {
                    warn!("Periodic flush of queue indexes failed: {e}");
                }
            });
        }

        *self.scheduler.lock() = Some(scheduler);
    }

    /// Stop the timers, shut `message_store` down and close every queue.
    ///
    /// The message store's drain thread appends index entries, so it is
    /// drained and joined before any queue closes. Its shutdown result is
    /// returned once the queues are closed.
    pub async fn shutdown(&self, message_store: &MessageStore) -> Result<()> {
        let scheduler = self.scheduler.lock().take();
        if let Some(mut scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        let drained = message_store.shutdown().await;
        for queue in self.all_queues() {
            queue.close()?;
        }
        info!("Queue store shut down");
        drained
    }
}

/// Topic names become directory names.
fn validate_topic(topic: &str) -> Result<()> {
    let valid = !topic.is_empty()
        && topic != "."
        && topic != ".."
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTopic(topic.to_string()))
    }
}
