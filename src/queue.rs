use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::codec::{QUEUE_INDEX_UNIT_SIZE, QueueIndexRecord};
use crate::config::StoreConfig;
use crate::manager::ChunkManager;
use crate::reader::ChunkReader;
use crate::types::{Result, StoreError};
use crate::writer::ChunkWriter;

pub const QUEUE_SETTINGS_FILE: &str = "queue.settings";

const UNIT: u64 = QUEUE_INDEX_UNIT_SIZE as u64;

/// Administrative flags of a queue, persisted next to its chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub producer_visible: bool,
    pub consumer_visible: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            producer_visible: true,
            consumer_visible: true,
            deleted: false,
        }
    }
}

/// The offset index of one (topic, queue id).
///
/// Entry `k` lives at address `k * 12` of the queue's own chunk stream and
/// holds the message log position of the message stored with queue offset
/// `k`. Lookups are arithmetic.
#[derive(Debug)]
pub struct Queue {
    topic: String,
    queue_id: u32,
    dir: PathBuf,
    memory_mode: bool,
    manager: Arc<ChunkManager>,
    writer: Mutex<ChunkWriter>,
    reader: ChunkReader,
    next_offset: AtomicU64,
    settings: Mutex<QueueSettings>,
}

impl Queue {
    /// Create or open the queue at its directory under `config.base_path`.
    ///
    /// A queue that was marked deleted is removed from disk instead and
    /// `None` is returned.
    pub fn open(topic: &str, queue_id: u32, config: &StoreConfig) -> Result<Option<Self>> {
        let chunk_config = config.queue_chunk_config(topic, queue_id);
        let dir = chunk_config.dir.clone();

        let settings = if config.memory_mode {
            QueueSettings::default()
        } else {
            match read_settings(&dir)? {
                Some(settings) if settings.deleted => {
                    info!("Queue {topic}-{queue_id} was deleted, removing '{}'", dir.display());
                    remove_dir(&dir)?;
                    return Ok(None);
                }
                Some(settings) => settings,
                None => {
                    std::fs::create_dir_all(&dir)?;
                    let settings = QueueSettings::default();
                    write_settings(&dir, &settings)?;
                    settings
                }
            }
        };

        let manager = Arc::new(ChunkManager::new(chunk_config)?);
        manager.load::<QueueIndexRecord>()?;
        let mut writer = ChunkWriter::new(manager.clone());
        writer.open()?;
        let next_offset = writer.data_position() / UNIT;
        let reader = ChunkReader::new(manager.clone());

        info!("Opened queue {topic}-{queue_id}, next offset {next_offset}");

        Ok(Some(Self {
            topic: topic.to_string(),
            queue_id,
            dir,
            memory_mode: config.memory_mode,
            manager,
            writer: Mutex::new(writer),
            reader,
            next_offset: AtomicU64::new(next_offset),
            settings: Mutex::new(settings),
        }))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Offset the next stored message will get.
    pub fn next_offset(&self) -> u64 {
        self.next_offset.load(Ordering::Acquire)
    }

    /// Reserve the next offset. Callers serialize this with enqueueing so
    /// offsets reach the index in order.
    pub fn increment_next_offset(&self) -> u64 {
        self.next_offset.fetch_add(1, Ordering::AcqRel)
    }

    /// Reserve `count` consecutive offsets and return the first.
    pub(crate) fn reserve_offsets(&self, count: u64) -> u64 {
        self.next_offset.fetch_add(count, Ordering::AcqRel)
    }

    /// Lowest offset still held by the index.
    pub fn min_offset(&self) -> u64 {
        self.manager.min_position() / UNIT
    }

    /// Highest offset with an index entry, or `None` when empty.
    pub fn max_offset(&self) -> Option<u64> {
        let end = self.manager.data_position() / UNIT;
        (end > self.min_offset()).then(|| end - 1)
    }

    /// Append the index entry of `queue_offset`.
    ///
    /// Entries must arrive in offset order without gaps. Entries for a queue
    /// deleted in the meantime are dropped; a closed queue rejects them.
    pub fn add_message(&self, queue_offset: u64, message_position: u64, tag_code: i32) -> Result<()> {
        // `delete` marks the queue before it takes the writer to close it
        let mut writer = self.writer.lock();
        if self.settings.lock().deleted {
            debug!(
                "Queue {}-{} is deleted, dropping index entry for offset {queue_offset}",
                self.topic, self.queue_id
            );
            return Ok(());
        }
        if !writer.is_open() {
            return Err(StoreError::NotStarted(format!(
                "queue {}-{}",
                self.topic, self.queue_id
            )));
        }
        let expected = writer.data_position() / UNIT;
        if expected != queue_offset {
            return Err(StoreError::QueueOffsetMismatch {
                topic: self.topic.clone(),
                queue_id: self.queue_id,
                expected,
                actual: queue_offset,
            });
        }
        writer.write(&QueueIndexRecord {
            message_position,
            tag_code,
        })?;
        Ok(())
    }

    /// Message log position stored for `queue_offset`, if that entry exists.
    pub fn get_message_position(&self, queue_offset: u64, auto_cache: bool) -> Result<Option<u64>> {
        Ok(self
            .get_entry(queue_offset, auto_cache)?
            .map(|entry| entry.message_position))
    }

    /// Full index entry for `queue_offset`.
    pub fn get_entry(&self, queue_offset: u64, auto_cache: bool) -> Result<Option<QueueIndexRecord>> {
        // offsets whose address overflows lie beyond any entry
        let Some(address) = queue_offset.checked_mul(UNIT) else {
            return Ok(None);
        };
        self.reader.try_read_at(address, auto_cache)
    }

    pub fn settings(&self) -> QueueSettings {
        *self.settings.lock()
    }

    pub fn set_producer_visible(&self, visible: bool) -> Result<()> {
        self.update_settings(|s| s.producer_visible = visible)
    }

    pub fn set_consumer_visible(&self, visible: bool) -> Result<()> {
        self.update_settings(|s| s.consumer_visible = visible)
    }

    /// Whether producers may store into this queue.
    pub fn is_writable(&self) -> bool {
        let settings = self.settings.lock();
        settings.producer_visible && !settings.deleted
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(StoreError::QueueNotWritable {
                topic: self.topic.clone(),
                queue_id: self.queue_id,
            })
        }
    }

    /// Remove the index chunks whose entries all point below
    /// `min_message_position`. Returns the number of chunks removed.
    pub fn delete_messages(&self, min_message_position: u64) -> Result<usize> {
        let chunks = self.manager.all_chunks();
        let closed = chunks.len().saturating_sub(1);
        let mut removed = 0;
        for chunk in &chunks[..closed] {
            if !chunk.is_completed() || chunk.data_size() < UNIT {
                break;
            }
            let last_entry = chunk.data_position() - UNIT;
            let Some(entry) = self.reader.try_read_at::<QueueIndexRecord>(last_entry, false)? else {
                break;
            };
            if entry.message_position >= min_message_position {
                break;
            }
            let info = chunk.info();
            if self.manager.remove_chunk(info.seq)? {
                self.reader.forget_chunk(&info);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(
                "Queue {}-{}: removed {removed} index chunks below message position {min_message_position}",
                self.topic, self.queue_id
            );
        }
        Ok(removed)
    }

    pub fn flush(&self) -> Result<()> {
        self.writer.lock().flush()
    }

    pub fn close(&self) -> Result<()> {
        self.writer.lock().close()?;
        self.manager.close()
    }

    /// Mark the queue deleted, close it and remove its directory.
    ///
    /// The mark is written first, so a crash halfway is finished by the next
    /// [`Queue::open`].
    pub fn delete(&self) -> Result<()> {
        self.update_settings(|s| {
            s.deleted = true;
            s.producer_visible = false;
            s.consumer_visible = false;
        })?;
        self.close()?;
        if !self.memory_mode {
            remove_dir(&self.dir)?;
        }
        info!("Deleted queue {}-{}", self.topic, self.queue_id);
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.manager.chunk_count()
    }

    fn update_settings(&self, change: impl FnOnce(&mut QueueSettings)) -> Result<()> {
        let mut settings = self.settings.lock();
        let mut updated = *settings;
        change(&mut updated);
        if !self.memory_mode {
            write_settings(&self.dir, &updated)?;
        }
        *settings = updated;
        Ok(())
    }
}

fn read_settings(dir: &Path) -> Result<Option<QueueSettings>> {
    match std::fs::read(dir.join(QUEUE_SETTINGS_FILE)) {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Settings are small; they are rewritten whole through a temporary file.
fn write_settings(dir: &Path, settings: &QueueSettings) -> Result<()> {
    let path = dir.join(QUEUE_SETTINGS_FILE);
    let tmp = dir.join(format!("{QUEUE_SETTINGS_FILE}.tmp"));
    std::fs::write(&tmp, serde_json::to_vec(settings)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

fn remove_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!("Failed to remove queue directory '{}': {e}", dir.display());
            Err(e.into())
        }
    }
}
