use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::codec::{Message, MessageRecord};
use crate::config::{FlushMode, StoreConfig};
use crate::manager::ChunkManager;
use crate::queue::Queue;
use crate::reader::ChunkReader;
use crate::retention::{RetentionPolicy, build_policy};
use crate::scheduler::Scheduler;
use crate::types::{Result, StoreError, now_ms};
use crate::write_queue::BufferedWriteQueue;
use crate::writer::ChunkWriter;

const WRITE_QUEUE_NAME: &str = "message-store";

/// Outcome of one persisted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStoreResult {
    pub message_id: String,
    /// Global address of the record in the message log.
    pub position: u64,
    /// Bytes the record occupies in its chunk.
    pub size: u64,
    pub topic: String,
    pub queue_id: u32,
    pub queue_offset: u64,
    pub tag_code: i32,
    pub stored_ms: i64,
}

/// Completion of a store call.
///
/// The queue offset is assigned when the message is accepted; awaiting the
/// handle yields the result once the message and its index entry are written.
#[derive(Debug)]
pub struct StoreHandle<T> {
    queue_offset: u64,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> StoreHandle<T> {
    /// Queue offset of the message, or of the first message of a batch.
    pub fn queue_offset(&self) -> u64 {
        self.queue_offset
    }

    pub async fn wait(self) -> Result<T> {
        self.receiver.await.map_err(|_| {
            StoreError::StreamFaulted("write was dropped before it was persisted".to_string())
        })?
    }
}

struct PendingMessage {
    record: MessageRecord,
    queue: Arc<Queue>,
}

enum WriteEntry {
    Single {
        message: PendingMessage,
        done: oneshot::Sender<Result<MessageStoreResult>>,
    },
    Batch {
        messages: Vec<PendingMessage>,
        done: oneshot::Sender<Result<Vec<MessageStoreResult>>>,
    },
}

/// The message log shared by every queue of a broker.
///
/// Producers call [`store_message`](Self::store_message); the message is
/// written by the write queue's drain thread, which then appends the queue
/// index entry and completes the handle, in enqueue order.
pub struct MessageStore {
    config: StoreConfig,
    manager: Arc<ChunkManager>,
    reader: ChunkReader,
    writer: Arc<Mutex<ChunkWriter>>,
    write_queue: RwLock<Option<Arc<BufferedWriteQueue<WriteEntry>>>>,
    store_lock: Mutex<()>,
    min_consumed_position: AtomicU64,
    retention: Box<dyn RetentionPolicy>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("dir", &self.manager.config().dir)
            .field("chunks", &self.manager.chunk_count())
            .field("min_consumed_position", &self.min_consumed_message_position())
            .field("retention", &self.retention)
            .finish()
    }
}

impl MessageStore {
    /// Open the message log and recover its chunks. Writing starts with
    /// [`start`](Self::start).
    pub fn load(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let manager = Arc::new(ChunkManager::new(config.message_chunk_config())?);
        manager.load::<MessageRecord>()?;

        info!(
            "Loaded message store '{}': {} chunks, positions [{}, {})",
            manager.config().dir.display(),
            manager.chunk_count(),
            manager.min_position(),
            manager.data_position()
        );

        let retention = build_policy(&config);
        Ok(Self {
            reader: ChunkReader::new(manager.clone()),
            writer: Arc::new(Mutex::new(ChunkWriter::new(manager.clone()))),
            manager,
            write_queue: RwLock::new(None),
            store_lock: Mutex::new(()),
            min_consumed_position: AtomicU64::new(0),
            retention,
            scheduler: Mutex::new(None),
            config,
        })
    }

    /// Open the writer, start the drain thread and the background timers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.write_queue.read().is_some() {
            return Ok(());
        }
        self.writer.lock().open()?;

        let writer = self.writer.clone();
        let write_queue = BufferedWriteQueue::start_batched(
            WRITE_QUEUE_NAME,
            self.config.write_queue_threshold,
            self.config.max_write_batch,
            move |entries: Vec<WriteEntry>| {
                let mut writer = writer.lock();
                for entry in entries {
                    persist_entry(&mut writer, entry)?;
                }
                Ok(())
            },
        );
        *self.write_queue.write() = Some(Arc::new(write_queue));

        let mut scheduler = Scheduler::new();
        let store: Weak<Self> = Arc::downgrade(self);
        scheduler.schedule("message-retention", self.config.retention_interval, move || {
            if let Some(store) = store.upgrade()
                && let Err(e) = store.delete_messages()
            {
                warn!("Message retention sweep failed: {e}");
            }
        });
        if self.config.flush_mode == FlushMode::Periodic {
            let store: Weak<Self> = Arc::downgrade(self);
            scheduler.schedule("message-flush", self.config.flush_interval, move || {
                if let Some(store) = store.upgrade()
                    && let Err(e) = store.flush()
                {
                    warn!("Periodic flush of the message store failed: {e}");
                }
            });
        }
        *self.scheduler.lock() = Some(scheduler);

        info!(
            "Started message store at position {}",
            self.current_message_position()
        );
        Ok(())
    }

    /// Accept `message` for `queue` and return a handle to its completion.
    ///
    /// The queue offset is reserved before the message reaches the disk. A
    /// full write queue rejects the message with
    /// [`StoreError::WriteQueueFull`] without consuming an offset.
    pub fn store_message(
        &self,
        queue: &Arc<Queue>,
        message: Message,
        producer_address: &str,
    ) -> Result<StoreHandle<MessageStoreResult>> {
        check_target(queue, &message)?;
        let write_queue = self.write_queue()?;
        let threshold = self.config.write_queue_threshold;

        let _guard = self.store_lock.lock();
        write_queue.check_capacity(threshold)?;
        let queue_offset = queue.increment_next_offset();
        let record = MessageRecord::new(message, producer_address, queue.queue_id(), queue_offset);
        let (done, receiver) = oneshot::channel();
        write_queue.enqueue_within(
            WriteEntry::Single {
                message: PendingMessage {
                    record,
                    queue: queue.clone(),
                },
                done,
            },
            threshold,
        )?;

        Ok(StoreHandle {
            queue_offset,
            receiver,
        })
    }

    /// Accept `messages` for `queue` as one unit. They get consecutive queue
    /// offsets and are written back to back.
    pub fn batch_store_message(
        &self,
        queue: &Arc<Queue>,
        messages: Vec<Message>,
        producer_address: &str,
    ) -> Result<StoreHandle<Vec<MessageStoreResult>>> {
        if messages.is_empty() {
            return Err(StoreError::EmptyBatch);
        }
        for message in &messages {
            check_target(queue, message)?;
        }
        let write_queue = self.write_queue()?;
        let threshold = self.config.batch_write_queue_threshold;

        let _guard = self.store_lock.lock();
        write_queue.check_capacity(threshold)?;
        let first_offset = queue.reserve_offsets(messages.len() as u64);
        let pending = messages
            .into_iter()
            .zip(first_offset..)
            .map(|(message, offset)| PendingMessage {
                record: MessageRecord::new(message, producer_address, queue.queue_id(), offset),
                queue: queue.clone(),
            })
            .collect();
        let (done, receiver) = oneshot::channel();
        write_queue.enqueue_within(
            WriteEntry::Batch {
                messages: pending,
                done,
            },
            threshold,
        )?;

        Ok(StoreHandle {
            queue_offset: first_offset,
            receiver,
        })
    }

    /// Raw record bytes at `position`.
    pub fn get_message_buffer(&self, position: u64) -> Result<Option<Bytes>> {
        self.reader.try_read_raw(position, true)
    }

    pub fn get_message(&self, position: u64) -> Result<Option<MessageRecord>> {
        self.reader.try_read_at(position, true)
    }

    /// Whether the chunk covering `position` still exists.
    pub fn is_message_position_exist(&self, position: u64) -> bool {
        self.manager.chunk_for(position).is_some()
    }

    /// Raise the consumed watermark used by retention. Lower values are ignored.
    pub fn update_min_consumed_message_position(&self, position: u64) {
        let previous = self.min_consumed_position.fetch_max(position, Ordering::AcqRel);
        if position > previous {
            debug!("Min consumed message position {previous} -> {position}");
        }
    }

    pub fn min_consumed_message_position(&self) -> u64 {
        self.min_consumed_position.load(Ordering::Acquire)
    }

    /// Lowest position still held by the log.
    pub fn min_message_position(&self) -> u64 {
        self.manager.min_position()
    }

    /// Position the next message will be written at, ignoring rollover.
    pub fn current_message_position(&self) -> u64 {
        self.manager.data_position()
    }

    pub fn chunk_count(&self) -> usize {
        self.manager.chunk_count()
    }

    /// Entries accepted but not yet persisted.
    pub fn pending_writes(&self) -> usize {
        self.write_queue
            .read()
            .as_ref()
            .map(|q| q.pending())
            .unwrap_or(0)
    }

    /// One retention pass. Returns the number of chunks removed.
    pub fn delete_messages(&self) -> Result<usize> {
        let watermark = self.min_consumed_message_position();
        let deletable = self
            .retention
            .select_deletable(&self.manager.chunk_infos(), watermark);

        let mut removed = 0;
        for info in deletable {
            match self.manager.remove_chunk(info.seq) {
                Ok(true) => {
                    self.reader.forget_chunk(&info);
                    removed += 1;
                }
                Ok(false) => break,
                Err(e) => {
                    warn!("Retention stopped at message chunk #{}: {e}", info.seq);
                    break;
                }
            }
        }
        if removed > 0 {
            info!(
                "Removed {removed} message chunks, min position now {} (watermark {watermark})",
                self.min_message_position()
            );
        }
        Ok(removed)
    }

    pub fn flush(&self) -> Result<()> {
        self.writer.lock().flush()
    }

    /// Stop the timers, persist and index everything accepted so far, then
    /// close the writer and the chunks.
    ///
    /// The queues written to must stay open until this returns. A drain
    /// failure recorded at any point is returned after the chunks are closed.
    /// Calling it again is a no-op apart from repeating that failure.
    pub async fn shutdown(&self) -> Result<()> {
        let scheduler = self.scheduler.lock().take();
        if let Some(mut scheduler) = scheduler {
            scheduler.shutdown().await;
        }

        let write_queue = self.write_queue.read().clone();
        let drained = match write_queue {
            Some(write_queue) => write_queue.shutdown().await,
            None => Ok(()),
        };

        self.writer.lock().close()?;
        self.manager.close()?;
        match &drained {
            Ok(()) => info!("Message store shut down"),
            Err(e) => warn!("Message store shut down after a write failure: {e}"),
        }
        drained
    }

    fn write_queue(&self) -> Result<Arc<BufferedWriteQueue<WriteEntry>>> {
        self.write_queue
            .read()
            .clone()
            .ok_or_else(|| StoreError::NotStarted(WRITE_QUEUE_NAME.to_string()))
    }
}

fn check_target(queue: &Queue, message: &Message) -> Result<()> {
    queue.ensure_writable()?;
    if message.topic != queue.topic() {
        return Err(StoreError::InvalidTopic(format!(
            "{} (queue belongs to {})",
            message.topic,
            queue.topic()
        )));
    }
    Ok(())
}

/// Write one queued entry and complete it. Runs on the drain thread only.
fn persist_entry(writer: &mut ChunkWriter, entry: WriteEntry) -> Result<()> {
    match entry {
        WriteEntry::Single { message, done } => match persist_message(writer, message) {
            Ok(result) => {
                let _ = done.send(Ok(result));
                Ok(())
            }
            Err(e) => {
                let _ = done.send(Err(StoreError::StreamFaulted(e.to_string())));
                Err(e)
            }
        },
        WriteEntry::Batch { messages, done } => {
            let mut results = Vec::with_capacity(messages.len());
            for message in messages {
                match persist_message(writer, message) {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        let _ = done.send(Err(StoreError::StreamFaulted(e.to_string())));
                        return Err(e);
                    }
                }
            }
            let _ = done.send(Ok(results));
            Ok(())
        }
    }
}

fn persist_message(writer: &mut ChunkWriter, pending: PendingMessage) -> Result<MessageStoreResult> {
    let PendingMessage { mut record, queue } = pending;
    record.stored_ms = now_ms();
    let written = writer.write(&record)?;
    record.assign_position(written.position);

    let tag_code = record.tag_code();
    queue.add_message(record.queue_offset, written.position, tag_code)?;

    Ok(MessageStoreResult {
        message_id: record.message_id,
        position: written.position,
        size: written.size,
        topic: record.topic,
        queue_id: record.queue_id,
        queue_offset: record.queue_offset,
        tag_code,
        stored_ms: record.stored_ms,
    })
}
