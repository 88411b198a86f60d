use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use lru::LruCache;
use parking_lot::Mutex;

use crate::chunk::{ChunkInfo, FRAME_HEADER_SIZE};
use crate::manager::ChunkManager;
use crate::types::{ChunkRecord, Result};

/// Random-access reads of one stream by global address.
///
/// Reads never block the writer. An address the writer has not yet
/// published, or one whose chunk was removed, reads as `None`.
#[derive(Debug)]
pub struct ChunkReader {
    manager: Arc<ChunkManager>,
    cache: Option<Mutex<LruCache<u64, Bytes>>>,
}

impl ChunkReader {
    pub fn new(manager: Arc<ChunkManager>) -> Self {
        let cache = manager
            .config()
            .cache_size
            .map(|size: NonZeroUsize| Mutex::new(LruCache::new(size)));
        Self { manager, cache }
    }

    /// Raw payload of the record stored at `address`.
    ///
    /// With `cacheable` the payload is kept in the reader's LRU cache, if it
    /// has one.
    pub fn try_read_raw(&self, address: u64, cacheable: bool) -> Result<Option<Bytes>> {
        // resolved first, so records of removed chunks are never served from cache
        let Some(chunk) = self.manager.chunk_for(address) else {
            return Ok(None);
        };

        if let Some(cache) = &self.cache
            && let Some(hit) = cache.lock().get(&address)
        {
            return Ok(Some(hit.clone()));
        }

        let payload = chunk.read_record(address - chunk.start())?;
        if cacheable
            && let (Some(cache), Some(payload)) = (&self.cache, &payload)
        {
            cache.lock().put(address, payload.clone());
        }
        Ok(payload)
    }

    /// Decode the record stored at `address`.
    pub fn try_read_at<R: ChunkRecord>(&self, address: u64, cacheable: bool) -> Result<Option<R>> {
        match self.try_read_raw(address, cacheable)? {
            Some(payload) => R::decode(address, &payload).map(Some),
            None => Ok(None),
        }
    }

    /// Iterate the records from `address` up to the current write position,
    /// crossing into following chunks. `address` must be a record boundary.
    pub fn iter_from<R: ChunkRecord>(&self, address: u64) -> impl Iterator<Item = Result<(u64, R)>> + '_ {
        let mut next = Some(address);
        std::iter::from_fn(move || {
            loop {
                let address = next?;
                let Some(chunk) = self.manager.chunk_for(address) else {
                    next = None;
                    return None;
                };

                match chunk.read_record(address - chunk.start()) {
                    Ok(Some(payload)) => {
                        let size = match chunk.unit_size() {
                            Some(unit) => unit as u64,
                            None => FRAME_HEADER_SIZE + payload.len() as u64,
                        };
                        next = Some(address + size);
                        return Some(R::decode(address, &payload).map(|r| (address, r)));
                    }
                    // the rest of a completed chunk is unused, resume at the next one
                    Ok(None) if chunk.is_completed() => next = Some(chunk.end()),
                    Ok(None) => {
                        next = None;
                        return None;
                    }
                    Err(e) => {
                        next = None;
                        return Some(Err(e));
                    }
                }
            }
        })
    }

    /// Drop cached records that belong to a removed chunk.
    pub fn forget_chunk(&self, info: &ChunkInfo) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut cache = cache.lock();
        let stale: Vec<u64> = cache
            .iter()
            .map(|(address, _)| *address)
            .filter(|address| *address >= info.start && *address < info.end)
            .collect();
        for address in &stale {
            cache.pop(address);
        }
        if !stale.is_empty() {
            debug!(
                "Evicted {} cached records of chunk #{} of '{}'",
                stale.len(),
                info.seq,
                self.manager.config().dir.display()
            );
        }
    }

    pub fn manager(&self) -> &Arc<ChunkManager> {
        &self.manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkConfig;
    use crate::tests::TestRecord;
    use crate::writer::ChunkWriter;
    use tempfile::tempdir;

    fn stream(config: ChunkConfig) -> (ChunkWriter, ChunkReader) {
        let manager = Arc::new(ChunkManager::new(config).unwrap());
        manager.load::<TestRecord>().unwrap();
        let mut writer = ChunkWriter::new(manager.clone());
        writer.open().unwrap();
        (writer, ChunkReader::new(manager))
    }

    #[test]
    fn test_read_what_was_written() {
        let dir = tempdir().unwrap();
        let (mut writer, reader) = stream(ChunkConfig::new(dir.path(), "c-", 64));

        let records: Vec<TestRecord> = (0..5).map(|i| TestRecord::new(i, &[i as u8; 10])).collect();
        let positions: Vec<u64> = records
            .iter()
            .map(|r| writer.write(r).unwrap().position)
            .collect();

        for (record, position) in records.iter().zip(&positions) {
            let read: TestRecord = reader.try_read_at(*position, false).unwrap().unwrap();
            assert_eq!(&read, record);
        }
    }

    #[test]
    fn test_unpublished_and_unknown_addresses_are_none() {
        let dir = tempdir().unwrap();
        let (mut writer, reader) = stream(ChunkConfig::new(dir.path(), "c-", 64));
        let position = writer.write(&TestRecord::new(1, b"abc")).unwrap().position;

        let next = writer.data_position();
        assert!(reader.try_read_at::<TestRecord>(next, false).unwrap().is_none());
        assert!(reader.try_read_at::<TestRecord>(10_000, false).unwrap().is_none());
        assert!(reader.try_read_at::<TestRecord>(position, false).unwrap().is_some());
    }

    #[test]
    fn test_iter_from_crosses_chunks() {
        let dir = tempdir().unwrap();
        let (mut writer, reader) = stream(ChunkConfig::new(dir.path(), "c-", 64));
        for i in 0..5 {
            writer.write(&TestRecord::new(i, &[0u8; 10])).unwrap();
        }

        let read: Vec<(u64, TestRecord)> = reader
            .iter_from::<TestRecord>(0)
            .collect::<Result<_>>()
            .unwrap();
        let positions: Vec<u64> = read.iter().map(|(p, _)| *p).collect();
        assert_eq!(positions, vec![0, 30, 64, 94, 128]);
        let ids: Vec<u64> = read.iter().map(|(_, r)| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cache_never_outlives_removed_chunk() {
        let dir = tempdir().unwrap();
        let (mut writer, reader) = stream(ChunkConfig::new(dir.path(), "c-", 64).with_cache(16));
        let first = writer.write(&TestRecord::new(0, &[0u8; 10])).unwrap().position;
        for i in 1..4 {
            writer.write(&TestRecord::new(i, &[0u8; 10])).unwrap();
        }

        assert!(reader.try_read_at::<TestRecord>(first, true).unwrap().is_some());
        let info = reader.manager().first_chunk().unwrap().info();
        assert!(reader.manager().remove_chunk(info.seq).unwrap());

        assert!(reader.try_read_at::<TestRecord>(first, true).unwrap().is_none());
        reader.forget_chunk(&info);
        assert!(reader.cache.as_ref().unwrap().lock().is_empty());
    }
}
