//! A segmented, append-only chunk store for a message-queue broker.
//!
//! The store keeps two kinds of logs, both built from the same pieces:
//!
//! - the **message log** ([`MessageStore`]), shared by every topic, holding
//!   variable-size message records addressed by a global byte position;
//! - one **queue index** per (topic, queue id) ([`Queue`]), a dense array of
//!   12-byte entries mapping queue offsets to message positions.
//!
//! Each log is a sequence of fixed-capacity chunk files managed by a
//! [`ChunkManager`], appended to by a single [`ChunkWriter`] and read at random
//! by [`ChunkReader`]s. Chunks are contiguous: a chunk starts at the address
//! where its predecessor's capacity ends, so addresses never move.
//!
//! # Features
//!
//! - **Write-behind** – producers get their queue offset immediately; a single
//!   drain thread per store persists messages in enqueue order and completes
//!   each [`StoreHandle`].
//! - **Backpressure** – a full write queue rejects new messages with
//!   [`StoreError::WriteQueueFull`] instead of dropping or blocking.
//! - **Recoverable** – on load, an unfinished tail chunk is replayed and
//!   truncated after its last valid record; a damaged completed chunk is a
//!   hard error.
//! - **Retention** – whole chunks below the consumed watermark are removed on
//!   a timer, see [`RetentionPolicy`].
//! - **Memory mode** – the same semantics without touching the file system.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chunkstore::{Message, MessageStore, QueueStore, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StoreConfig {
//!         base_path: "./store_data".into(),
//!         ..Default::default()
//!     };
//!
//!     // 1. Recover both logs and start the background work.
//!     let messages = Arc::new(MessageStore::load(config.clone())?);
//!     let queues = Arc::new(QueueStore::load(config)?);
//!     messages.start()?;
//!     queues.start(&messages);
//!
//!     // 2. Store a message. The queue offset is known right away.
//!     let queue = queues.create_queue("orders", 0)?;
//!     let message = Message::new("orders", 0, &b"hello"[..]).with_tag("eu");
//!     let handle = messages.store_message(&queue, message, "10.0.0.7:5000")?;
//!     let offset = handle.queue_offset();
//!
//!     // 3. Wait until it is written and indexed.
//!     let stored = handle.wait().await?;
//!
//!     // 4. Read it back through the queue index.
//!     let position = queue.get_message_position(offset, true)?;
//!     assert_eq!(position, Some(stored.position));
//!     let record = messages.get_message(stored.position)?;
//!     println!("{:?}", record.map(|r| r.message_id));
//!
//!     // 5. Let retention reclaim what consumers are done with.
//!     messages.update_min_consumed_message_position(stored.position);
//!
//!     // 6. Drain the message store, then close the queues it indexes into.
//!     queues.shutdown(&messages).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Recovery
//!
//! Loading the same `base_path` again restores the message log's current
//! position and every queue's next offset from the chunk files. Offsets handed
//! out for messages that never reached the disk before a crash are reused.


pub mod chunk;
pub mod codec;
pub mod config;
pub mod manager;
pub mod message_store;
pub mod queue;
pub mod queue_store;
pub mod reader;
pub mod retention;
pub mod scheduler;
mod types;
pub mod write_queue;
pub mod writer;

pub use chunk::{ChunkInfo, chunk_filename};
pub use codec::{Message, MessageRecord, QueueIndexRecord, message_id, tag_code};
pub use config::{ChunkConfig, FlushMode, RetentionRule, StoreConfig};
pub use manager::ChunkManager;
pub use message_store::{MessageStore, MessageStoreResult, StoreHandle};
pub use queue::{Queue, QueueSettings};
pub use queue_store::{QueueKey, QueueStore};
pub use reader::ChunkReader;
pub use retention::{
    ChunkAgeRetention, ChunkCountRetention, ConsumedRetention, RetentionPolicy, build_policy,
};
pub use types::*;
pub use write_queue::{BufferedWriteQueue, DrainState};
pub use writer::{ChunkWriter, WriteResult};
