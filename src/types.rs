use bytes::BytesMut;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue settings error: {0}")]
    Settings(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid topic name '{0}'")]
    InvalidTopic(String),

    #[error("Corrupt chunk '{path}': {reason}")]
    CorruptChunk { path: String, reason: String },

    #[error("Inconsistent chunk layout: {0}")]
    InconsistentChunks(String),

    #[error("Failed to append {size} bytes at address {address}: {source}")]
    PartialWrite {
        address: u64,
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Record of {size} bytes does not fit into a chunk of {capacity} bytes")]
    RecordTooLarge { size: u64, capacity: u64 },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Write queue '{name}' is full ({pending} pending, threshold {threshold})")]
    WriteQueueFull {
        name: String,
        pending: usize,
        threshold: usize,
    },

    #[error("Stream faulted: {0}")]
    StreamFaulted(String),

    #[error("'{0}' is not open for writing")]
    NotStarted(String),

    #[error("Queue {topic}-{queue_id} expected offset {expected} but got {actual}")]
    QueueOffsetMismatch {
        topic: String,
        queue_id: u32,
        expected: u64,
        actual: u64,
    },

    #[error("Queue {topic}-{queue_id} does not accept messages")]
    QueueNotWritable { topic: String, queue_id: u32 },

    #[error("Cannot store an empty batch")]
    EmptyBatch,
}

impl StoreError {
    /// True for the retryable flow-control rejection raised by a full write queue.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, StoreError::WriteQueueFull { .. })
    }
}

/// A record that can be appended to a chunk and read back from it.
///
/// `position` is the global logical address the record is stored at. It is
/// only known at write time, so encoders receive it instead of reading it
/// from `self`.
pub trait ChunkRecord: Sized {
    /// Fails when a field cannot be represented in the record layout.
    fn encode(&self, position: u64, buf: &mut BytesMut) -> Result<()>;
    fn decode(position: u64, buf: &[u8]) -> Result<Self>;
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
