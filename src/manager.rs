use std::collections::VecDeque;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use crate::chunk::{Chunk, ChunkHeader, ChunkInfo, find_all_chunks};
use crate::config::ChunkConfig;
use crate::types::{ChunkRecord, Result, StoreError};

/// Owns the ordered set of chunks of one stream.
///
/// Chunks are contiguous: each one starts where its predecessor's capacity
/// ends, so a global address belongs to exactly one chunk. Only the last chunk
/// accepts writes.
#[derive(Debug)]
pub struct ChunkManager {
    config: ChunkConfig,
    chunks: RwLock<VecDeque<Arc<Chunk>>>,
}

impl ChunkManager {
    pub fn new(config: ChunkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            chunks: RwLock::new(VecDeque::new()),
        })
    }

    /// Discover and open the existing chunks of this stream, oldest first.
    ///
    /// The directory is created when missing. Every chunk but the last must
    /// have been completed; the last one is recovered by replaying `R`.
    pub fn load<R: ChunkRecord>(&self) -> Result<()> {
        if self.config.memory_mode {
            return Ok(());
        }

        std::fs::create_dir_all(&self.config.dir)?;
        let found = find_all_chunks(&self.config.dir, &self.config.file_prefix)?;
        let unit_size = self.config.unit_size.unwrap_or(0);

        let mut loaded: VecDeque<Arc<Chunk>> = VecDeque::with_capacity(found.len());
        let count = found.len();
        for (i, (seq, path)) in found.into_iter().enumerate() {
            let chunk = Chunk::open::<R>(&path, seq, unit_size, i + 1 == count)?;
            if let Some(prev) = loaded.back() {
                if chunk.seq() != prev.seq() + 1 {
                    return Err(StoreError::InconsistentChunks(format!(
                        "'{}': chunk #{} follows chunk #{}",
                        self.config.dir.display(),
                        chunk.seq(),
                        prev.seq()
                    )));
                }
                if chunk.start() != prev.end() {
                    return Err(StoreError::InconsistentChunks(format!(
                        "'{}': chunk #{} starts at {} but chunk #{} ends at {}",
                        self.config.dir.display(),
                        chunk.seq(),
                        chunk.start(),
                        prev.seq(),
                        prev.end()
                    )));
                }
            }
            loaded.push_back(Arc::new(chunk));
        }

        if let (Some(first), Some(last)) = (loaded.front(), loaded.back()) {
            info!(
                "Loaded {} chunks from '{}', addresses [{}, {})",
                loaded.len(),
                self.config.dir.display(),
                first.start(),
                last.data_position()
            );
        }

        *self.chunks.write() = loaded;
        Ok(())
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn first_chunk(&self) -> Option<Arc<Chunk>> {
        self.chunks.read().front().cloned()
    }

    pub fn last_chunk(&self) -> Option<Arc<Chunk>> {
        self.chunks.read().back().cloned()
    }

    /// The chunk whose range contains `address`.
    pub fn chunk_for(&self, address: u64) -> Option<Arc<Chunk>> {
        let chunks = self.chunks.read();
        let idx = chunks.partition_point(|c| c.end() <= address);
        chunks.get(idx).filter(|c| c.contains(address)).cloned()
    }

    pub fn all_chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks.read().iter().cloned().collect()
    }

    pub fn chunk_infos(&self) -> Vec<ChunkInfo> {
        self.chunks.read().iter().map(|c| c.info()).collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    /// Lowest address still held by this stream.
    pub fn min_position(&self) -> u64 {
        self.first_chunk().map(|c| c.start()).unwrap_or(0)
    }

    /// Address the next record will be written at, ignoring rollover.
    pub fn data_position(&self) -> u64 {
        self.last_chunk().map(|c| c.data_position()).unwrap_or(0)
    }

    /// Create the next chunk after the current last one and make it the tail.
    pub(crate) fn add_new_chunk(&self) -> Result<Arc<Chunk>> {
        let mut chunks = self.chunks.write();
        let header = match chunks.back() {
            Some(last) => {
                if !last.is_completed() {
                    return Err(StoreError::InconsistentChunks(format!(
                        "'{}': chunk #{} is still open",
                        self.config.dir.display(),
                        last.seq()
                    )));
                }
                ChunkHeader {
                    seq: last.seq() + 1,
                    start: last.end(),
                    capacity: self.config.chunk_data_size,
                    unit_size: self.config.unit_size.unwrap_or(0),
                }
            }
            None => ChunkHeader {
                seq: 0,
                start: 0,
                capacity: self.config.chunk_data_size,
                unit_size: self.config.unit_size.unwrap_or(0),
            },
        };

        let chunk = if self.config.memory_mode {
            Chunk::create_in_memory(header)
        } else {
            Chunk::create(&self.config.dir, &self.config.file_prefix, header)?
        };
        let chunk = Arc::new(chunk);
        chunks.push_back(chunk.clone());
        Ok(chunk)
    }

    /// Remove the oldest chunk if it is `seq`, completed and not the tail,
    /// deleting its file first.
    ///
    /// Returns `false` when the chunk is unknown, not the oldest, still open
    /// or the last one. Removing from the front only keeps the remaining
    /// chunks contiguous on the next load.
    pub(crate) fn remove_chunk(&self, seq: u64) -> Result<bool> {
        let mut chunks = self.chunks.write();
        let Some(first) = chunks.front() else {
            return Ok(false);
        };
        if first.seq() != seq || chunks.len() == 1 || !first.is_completed() {
            return Ok(false);
        }

        if let Err(e) = first.delete() {
            warn!(
                "Failed to delete chunk #{seq} of '{}': {e}",
                self.config.dir.display()
            );
            return Err(e);
        }
        if let Some(chunk) = chunks.pop_front() {
            info!(
                "Removed chunk #{seq} [{}, {}) of '{}'",
                chunk.start(),
                chunk.end(),
                self.config.dir.display()
            );
        }
        Ok(true)
    }

    /// Sync every chunk and drop them from memory.
    pub fn close(&self) -> Result<()> {
        let chunks = std::mem::take(&mut *self.chunks.write());
        for chunk in chunks {
            chunk.flush()?;
        }
        Ok(())
    }
}
