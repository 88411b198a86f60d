//! Store configuration.
//!
//! `StoreConfig` is the single configuration surface of the storage core. It is
//! deserializable so the host can read it from whatever source it likes; each
//! stream (the message log, one index log per queue) gets a [`ChunkConfig`]
//! derived from it.
//!
//! ```ignore
//! let config = StoreConfig {
//!     base_path: "/var/lib/broker/store".into(),
//!     flush_mode: FlushMode::Sync,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::QUEUE_INDEX_UNIT_SIZE;
use crate::types::{Result, StoreError};

pub const MESSAGE_CHUNK_DIR: &str = "message-chunks";
pub const QUEUE_CHUNK_DIR: &str = "queue-chunks";
pub const MESSAGE_CHUNK_PREFIX: &str = "message-chunk-";
pub const QUEUE_CHUNK_PREFIX: &str = "queue-chunk-";

/// When appended data is forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// fsync after every write.
    Sync,
    /// fsync on a timer, every `flush_interval`.
    Periodic,
    /// Leave durability to the OS page cache.
    OsBuffered,
}

/// Which chunks of the message log are eligible for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetentionRule {
    /// Every chunk that lies entirely below the consumed watermark.
    Consumed,
    /// Keep at most `count` chunks.
    MaxChunkCount { count: usize },
    /// Chunks whose last write is older than `max_age`.
    MaxAge {
        #[serde(with = "duration_ms")]
        max_age: Duration,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for every stream of this store.
    pub base_path: PathBuf,

    /// Keep every chunk in memory, never touching the file system.
    #[serde(default)]
    pub memory_mode: bool,

    /// Data capacity of one message chunk in bytes (default: 256MB)
    #[serde(default = "default_message_chunk_data_size")]
    pub message_chunk_data_size: u64,

    /// Index entries per queue chunk (default: 1,000,000)
    #[serde(default = "default_queue_chunk_unit_count")]
    pub queue_chunk_unit_count: u64,

    #[serde(default = "default_flush_mode")]
    pub flush_mode: FlushMode,

    /// Timer period for `FlushMode::Periodic` (default: 100ms)
    #[serde(default = "default_flush_interval", with = "duration_ms")]
    pub flush_interval: Duration,

    #[serde(default = "default_true")]
    pub enable_cache: bool,

    /// Record cache entries for the message log (default: 10,000)
    #[serde(default = "default_message_cache_size")]
    pub message_cache_size: usize,

    /// Cache entries per queue index (default: 1,024)
    #[serde(default = "default_queue_cache_size")]
    pub queue_cache_size: usize,

    /// Pending entries above which single stores are rejected (default: 10,000)
    #[serde(default = "default_write_queue_threshold")]
    pub write_queue_threshold: usize,

    /// Pending entries above which batch stores are rejected (default: 20,000)
    #[serde(default = "default_batch_write_queue_threshold")]
    pub batch_write_queue_threshold: usize,

    /// Most entries persisted by one pass of the drain loop (default: 512)
    #[serde(default = "default_max_write_batch")]
    pub max_write_batch: usize,

    /// Period of the retention sweep on both logs (default: 10s)
    #[serde(default = "default_retention_interval", with = "duration_ms")]
    pub retention_interval: Duration,

    #[serde(default = "default_retention_rule")]
    pub retention_rule: RetentionRule,

    /// Delete chunks selected by the retention rule even if not consumed yet.
    #[serde(default)]
    pub ignore_unconsumed_on_delete: bool,
}

fn default_message_chunk_data_size() -> u64 {
    256 * 1024 * 1024
}

fn default_queue_chunk_unit_count() -> u64 {
    1_000_000
}

fn default_flush_mode() -> FlushMode {
    FlushMode::Periodic
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_true() -> bool {
    true
}

fn default_message_cache_size() -> usize {
    10_000
}

fn default_queue_cache_size() -> usize {
    1_024
}

fn default_write_queue_threshold() -> usize {
    10_000
}

fn default_batch_write_queue_threshold() -> usize {
    20_000
}

fn default_max_write_batch() -> usize {
    512
}

fn default_retention_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_retention_rule() -> RetentionRule {
    RetentionRule::Consumed
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data/store"),
            memory_mode: false,
            message_chunk_data_size: default_message_chunk_data_size(),
            queue_chunk_unit_count: default_queue_chunk_unit_count(),
            flush_mode: default_flush_mode(),
            flush_interval: default_flush_interval(),
            enable_cache: true,
            message_cache_size: default_message_cache_size(),
            queue_cache_size: default_queue_cache_size(),
            write_queue_threshold: default_write_queue_threshold(),
            batch_write_queue_threshold: default_batch_write_queue_threshold(),
            max_write_batch: default_max_write_batch(),
            retention_interval: default_retention_interval(),
            retention_rule: default_retention_rule(),
            ignore_unconsumed_on_delete: false,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.message_chunk_data_size == 0 {
            return Err(StoreError::InvalidConfig(
                "message_chunk_data_size must be > 0".to_string(),
            ));
        }
        if self.queue_chunk_unit_count == 0 {
            return Err(StoreError::InvalidConfig(
                "queue_chunk_unit_count must be > 0".to_string(),
            ));
        }
        if self.write_queue_threshold == 0 || self.batch_write_queue_threshold == 0 {
            return Err(StoreError::InvalidConfig(
                "write queue thresholds must be > 0".to_string(),
            ));
        }
        if self.max_write_batch == 0 {
            return Err(StoreError::InvalidConfig(
                "max_write_batch must be > 0".to_string(),
            ));
        }
        if self.flush_mode == FlushMode::Periodic && self.flush_interval.is_zero() {
            return Err(StoreError::InvalidConfig(
                "flush_interval must be > 0 with periodic flushing".to_string(),
            ));
        }
        if self.retention_interval.is_zero() {
            return Err(StoreError::InvalidConfig(
                "retention_interval must be > 0".to_string(),
            ));
        }
        if let RetentionRule::MaxChunkCount { count: 0 } = self.retention_rule {
            return Err(StoreError::InvalidConfig(
                "retention chunk count must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn message_chunk_dir(&self) -> PathBuf {
        self.base_path.join(MESSAGE_CHUNK_DIR)
    }

    pub fn queue_root_dir(&self) -> PathBuf {
        self.base_path.join(QUEUE_CHUNK_DIR)
    }

    pub fn queue_dir(&self, topic: &str, queue_id: u32) -> PathBuf {
        self.queue_root_dir().join(topic).join(queue_id.to_string())
    }

    pub fn message_chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            dir: self.message_chunk_dir(),
            file_prefix: MESSAGE_CHUNK_PREFIX.to_string(),
            chunk_data_size: self.message_chunk_data_size,
            unit_size: None,
            flush_mode: self.flush_mode,
            memory_mode: self.memory_mode,
            cache_size: self.cache_size(self.message_cache_size),
        }
    }

    pub fn queue_chunk_config(&self, topic: &str, queue_id: u32) -> ChunkConfig {
        ChunkConfig {
            dir: self.queue_dir(topic, queue_id),
            file_prefix: QUEUE_CHUNK_PREFIX.to_string(),
            chunk_data_size: self.queue_chunk_unit_count * QUEUE_INDEX_UNIT_SIZE as u64,
            unit_size: Some(QUEUE_INDEX_UNIT_SIZE),
            flush_mode: self.flush_mode,
            memory_mode: self.memory_mode,
            cache_size: self.cache_size(self.queue_cache_size),
        }
    }

    fn cache_size(&self, entries: usize) -> Option<NonZeroUsize> {
        if self.enable_cache {
            NonZeroUsize::new(entries)
        } else {
            None
        }
    }
}

/// Settings of one chunk stream.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub dir: PathBuf,
    pub file_prefix: String,
    /// Data capacity of one chunk; headers and footers come on top.
    pub chunk_data_size: u64,
    /// `Some` for streams of fixed-size records stored without framing.
    pub unit_size: Option<u32>,
    pub flush_mode: FlushMode,
    pub memory_mode: bool,
    pub cache_size: Option<NonZeroUsize>,
}

impl ChunkConfig {
    pub fn new(dir: impl AsRef<Path>, file_prefix: &str, chunk_data_size: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            file_prefix: file_prefix.to_string(),
            chunk_data_size,
            unit_size: None,
            flush_mode: FlushMode::OsBuffered,
            memory_mode: false,
            cache_size: None,
        }
    }

    pub fn with_unit_size(mut self, unit_size: u32) -> Self {
        self.unit_size = Some(unit_size);
        self
    }

    pub fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }

    pub fn with_cache(mut self, entries: usize) -> Self {
        self.cache_size = NonZeroUsize::new(entries);
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.memory_mode = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_data_size == 0 {
            return Err(StoreError::InvalidConfig(format!(
                "chunk_data_size of '{}' must be > 0",
                self.dir.display()
            )));
        }
        if let Some(unit) = self.unit_size
            && (unit == 0 || self.chunk_data_size % unit as u64 != 0)
        {
            return Err(StoreError::InvalidConfig(format!(
                "chunk_data_size {} of '{}' is not a multiple of unit size {unit}",
                self.chunk_data_size,
                self.dir.display()
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: StoreConfig = serde_json::from_str(r#"{"base_path": "/tmp/store"}"#).unwrap();
        assert_eq!(config.flush_mode, FlushMode::Periodic);
        assert_eq!(config.flush_interval, Duration::from_millis(100));
        assert_eq!(config.retention_rule, RetentionRule::Consumed);
        assert!(config.enable_cache);
        config.validate().unwrap();
    }

    #[test]
    fn test_retention_rule_json() {
        let config: StoreConfig = serde_json::from_str(
            r#"{
                "base_path": "/tmp/store",
                "flush_mode": "os_buffered",
                "retention_rule": {"type": "max_age", "max_age": 3600000},
                "ignore_unconsumed_on_delete": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.flush_mode, FlushMode::OsBuffered);
        assert_eq!(
            config.retention_rule,
            RetentionRule::MaxAge {
                max_age: Duration::from_secs(3600)
            }
        );
        assert!(config.ignore_unconsumed_on_delete);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = StoreConfig {
            message_chunk_data_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StoreError::InvalidConfig(_))
        ));

        let config = StoreConfig {
            retention_rule: RetentionRule::MaxChunkCount { count: 0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_chunk_config_is_fixed_size() {
        let config = StoreConfig {
            base_path: PathBuf::from("/data"),
            queue_chunk_unit_count: 10,
            ..Default::default()
        };
        let chunk = config.queue_chunk_config("orders", 3);
        assert_eq!(chunk.unit_size, Some(12));
        assert_eq!(chunk.chunk_data_size, 120);
        assert_eq!(chunk.dir, PathBuf::from("/data/queue-chunks/orders/3"));
        chunk.validate().unwrap();

        let bad = ChunkConfig::new("/data", "x-", 100).with_unit_size(12);
        assert!(bad.validate().is_err());
    }
}
