use std::sync::Arc;

use bytes::BytesMut;
use log::{debug, info};

use crate::chunk::{Chunk, FRAME_HEADER_SIZE, encode_record};
use crate::config::FlushMode;
use crate::manager::ChunkManager;
use crate::types::{ChunkRecord, Result, StoreError};

/// Where a record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Global address of the record.
    pub position: u64,
    /// Bytes occupied in the chunk, framing included.
    pub size: u64,
}

/// Appends records to the tail chunk of a stream, rolling over to a new
/// chunk when the current one cannot hold the next record.
///
/// A stream has a single writer; callers serialize access to it.
#[derive(Debug)]
pub struct ChunkWriter {
    manager: Arc<ChunkManager>,
    current: Option<Arc<Chunk>>,
    flush_mode: FlushMode,
    buf: BytesMut,
}

impl ChunkWriter {
    pub fn new(manager: Arc<ChunkManager>) -> Self {
        let flush_mode = manager.config().flush_mode;
        Self {
            manager,
            current: None,
            flush_mode,
            buf: BytesMut::new(),
        }
    }

    /// Attach to the tail chunk, creating the first chunk of an empty stream
    /// or a fresh one after a completed tail.
    pub fn open(&mut self) -> Result<()> {
        let chunk = match self.manager.last_chunk() {
            Some(last) if !last.is_completed() => last,
            Some(last) => {
                info!(
                    "Tail chunk #{} of '{}' is completed, starting a new one",
                    last.seq(),
                    self.manager.config().dir.display()
                );
                self.manager.add_new_chunk()?
            }
            None => self.manager.add_new_chunk()?,
        };
        debug!(
            "Writer of '{}' positioned at {}",
            self.manager.config().dir.display(),
            chunk.data_position()
        );
        self.current = Some(chunk);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Append `record` and return its global address.
    ///
    /// The encoder sees the address the record is actually written at, so if
    /// the record does not fit, the current chunk is completed and the record
    /// is encoded again for the start of the next chunk.
    pub fn write<R: ChunkRecord>(&mut self, record: &R) -> Result<WriteResult> {
        let mut chunk = self.current_or_err()?;
        let unit_size = self.manager.config().unit_size;
        let capacity = self.manager.config().chunk_data_size;

        encode_record(unit_size, record, chunk.data_position(), &mut self.buf)?;
        let size = self.buf.len() as u64;
        if size > capacity {
            return Err(StoreError::RecordTooLarge { size, capacity });
        }

        if size > chunk.remaining() {
            chunk.complete()?;
            let next = self.manager.add_new_chunk()?;
            self.current = Some(next.clone());
            chunk = next;
            encode_record(unit_size, record, chunk.data_position(), &mut self.buf)?;
        }

        let local = chunk.append(&self.buf)?;
        if self.flush_mode == FlushMode::Sync {
            chunk.flush()?;
        }

        Ok(WriteResult {
            position: chunk.start() + local,
            size,
        })
    }

    /// Address the next record would be written at if it fits.
    pub fn data_position(&self) -> u64 {
        match &self.current {
            Some(chunk) => chunk.data_position(),
            None => self.manager.data_position(),
        }
    }

    pub fn current_chunk(&self) -> Option<&Arc<Chunk>> {
        self.current.as_ref()
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(chunk) = &self.current {
            chunk.flush()?;
        }
        Ok(())
    }

    /// Flush and detach. The tail stays uncompleted so the next open resumes it.
    pub fn close(&mut self) -> Result<()> {
        if let Some(chunk) = self.current.take() {
            chunk.flush()?;
        }
        Ok(())
    }

    fn current_or_err(&self) -> Result<Arc<Chunk>> {
        self.current
            .clone()
            .ok_or_else(|| StoreError::NotStarted(self.manager.config().dir.display().to_string()))
    }
}

/// Bytes a variable-size record of `payload_len` occupies once framed.
pub fn framed_len(payload_len: usize) -> u64 {
    FRAME_HEADER_SIZE + payload_len as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{QUEUE_INDEX_UNIT_SIZE, QueueIndexRecord};
    use crate::config::ChunkConfig;
    use crate::tests::TestRecord;
    use tempfile::tempdir;

    fn writer(config: ChunkConfig) -> ChunkWriter {
        let manager = Arc::new(ChunkManager::new(config).unwrap());
        manager.load::<TestRecord>().unwrap();
        let mut writer = ChunkWriter::new(manager);
        writer.open().unwrap();
        writer
    }

    #[test]
    fn test_write_before_open_fails() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(ChunkManager::new(ChunkConfig::new(dir.path(), "c-", 64)).unwrap());
        let mut writer = ChunkWriter::new(manager);
        assert!(matches!(
            writer.write(&TestRecord::new(0, b"x")),
            Err(StoreError::NotStarted(_))
        ));
    }

    #[test]
    fn test_rollover_starts_at_next_chunk_boundary() {
        let dir = tempdir().unwrap();
        let mut writer = writer(ChunkConfig::new(dir.path(), "c-", 64));

        // 30 bytes each once framed
        let record = TestRecord::new(1, &[7u8; 10]);
        assert_eq!(record.framed_size(), 30);

        let positions: Vec<u64> = (0..3)
            .map(|_| writer.write(&record).unwrap().position)
            .collect();
        // the third record does not fit the 4 bytes left in chunk 0
        assert_eq!(positions, vec![0, 30, 64]);
        assert_eq!(writer.data_position(), 94);

        let chunks = writer.manager.all_chunks();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_completed());
        assert_eq!(chunks[0].data_size(), 60);
    }

    #[test]
    fn test_record_larger_than_chunk_is_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = writer(ChunkConfig::new(dir.path(), "c-", 64));
        let err = writer.write(&TestRecord::new(1, &[0u8; 100])).unwrap_err();
        assert!(matches!(err, StoreError::RecordTooLarge { capacity: 64, .. }));
        assert_eq!(writer.data_position(), 0);
        assert_eq!(writer.manager.chunk_count(), 1);
    }

    #[test]
    fn test_fixed_size_writes_are_unit_aligned() {
        let dir = tempdir().unwrap();
        let unit = QUEUE_INDEX_UNIT_SIZE as u64;
        let config = ChunkConfig::new(dir.path(), "q-", 2 * unit).with_unit_size(QUEUE_INDEX_UNIT_SIZE);
        let manager = Arc::new(ChunkManager::new(config).unwrap());
        manager.load::<QueueIndexRecord>().unwrap();
        let mut writer = ChunkWriter::new(manager);
        writer.open().unwrap();

        for offset in 0..5u64 {
            let result = writer
                .write(&QueueIndexRecord {
                    message_position: offset * 100,
                    tag_code: 0,
                })
                .unwrap();
            assert_eq!(result.position, offset * unit);
            assert_eq!(result.size, unit);
        }
        assert_eq!(writer.manager.chunk_count(), 3);
    }

    #[test]
    fn test_reopen_resumes_tail() {
        let dir = tempdir().unwrap();
        let config = ChunkConfig::new(dir.path(), "c-", 64).with_flush_mode(FlushMode::Sync);
        let record = TestRecord::new(1, &[7u8; 10]);
        {
            let mut writer = writer(config.clone());
            writer.write(&record).unwrap();
            writer.close().unwrap();
        }

        let mut writer = writer(config);
        assert_eq!(writer.write(&record).unwrap().position, 30);
    }

    #[test]
    fn test_framed_len() {
        assert_eq!(framed_len(22), 30);
    }
}
