use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, info};
use parking_lot::RwLock;

use crate::types::{ChunkRecord, Result, StoreError, now_ms};

/// `magic u32 | unit size u32 | seq u64 | start u64 | capacity u64`
pub const CHUNK_HEADER_SIZE: u64 = 32;
/// `magic u32 | reserved u32 | data size u64`, appended once a chunk is completed.
pub const CHUNK_FOOTER_SIZE: u64 = 16;
/// `payload length u32 | crc32 u32` in front of every variable-size record.
pub const FRAME_HEADER_SIZE: u64 = 8;

const HEADER_MAGIC: u32 = 0x4B4E_4843;
const FOOTER_MAGIC: u32 = 0x444E_4543;

/// Generate a chunk filename, e.g. `message-chunk-000000000000`
pub fn chunk_filename(prefix: &str, seq: u64) -> String {
    format!("{prefix}{seq:012}")
}

/// Return every `(seq, path)` in `base_dir` named `{prefix}{seq:012}`,
/// ordered by `seq` ascending. A missing directory holds no chunks.
pub fn find_all_chunks(base_dir: &Path, prefix: &str) -> Result<Vec<(u64, PathBuf)>> {
    let entries = match std::fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut chunks: Vec<(u64, PathBuf)> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name().into_string().ok()?;
            let seq_str = name.strip_prefix(prefix)?;
            if seq_str.len() != 12 || !seq_str.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let seq: u64 = seq_str.parse().ok()?;
            Some((seq, entry.path()))
        })
        .collect();

    chunks.sort_by_key(|(seq, _)| *seq);
    Ok(chunks)
}

/// Encode `record` as it will be stored at `position`: framed with length and
/// CRC32 for variable-size streams, raw for fixed-size ones.
pub(crate) fn encode_record<R: ChunkRecord>(
    unit_size: Option<u32>,
    record: &R,
    position: u64,
    buf: &mut BytesMut,
) -> Result<()> {
    buf.clear();
    match unit_size {
        Some(unit) => {
            record.encode(position, buf)?;
            if buf.len() != unit as usize {
                return Err(StoreError::Codec(format!(
                    "fixed-size record encoded to {} bytes, expected {unit}",
                    buf.len()
                )));
            }
        }
        None => {
            buf.put_u64_le(0);
            record.encode(position, buf)?;
            let len = buf.len() - FRAME_HEADER_SIZE as usize;
            let len = u32::try_from(len)
                .map_err(|_| StoreError::Codec(format!("record of {len} bytes is too large")))?;
            let crc = crc32fast::hash(&buf[FRAME_HEADER_SIZE as usize..]);
            buf[0..4].copy_from_slice(&len.to_le_bytes());
            buf[4..8].copy_from_slice(&crc.to_le_bytes());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub seq: u64,
    pub start: u64,
    pub capacity: u64,
    /// 0 for variable-size records.
    pub unit_size: u32,
}

impl ChunkHeader {
    pub fn end(&self) -> u64 {
        self.start + self.capacity
    }

    fn encode(&self) -> [u8; CHUNK_HEADER_SIZE as usize] {
        let mut raw = [0u8; CHUNK_HEADER_SIZE as usize];
        let mut cursor = &mut raw[..];
        cursor.put_u32_le(HEADER_MAGIC);
        cursor.put_u32_le(self.unit_size);
        cursor.put_u64_le(self.seq);
        cursor.put_u64_le(self.start);
        cursor.put_u64_le(self.capacity);
        raw
    }

    fn decode(mut raw: &[u8]) -> Option<Self> {
        if raw.len() < CHUNK_HEADER_SIZE as usize || raw.get_u32_le() != HEADER_MAGIC {
            return None;
        }
        let unit_size = raw.get_u32_le();
        let seq = raw.get_u64_le();
        let start = raw.get_u64_le();
        let capacity = raw.get_u64_le();
        Some(Self {
            seq,
            start,
            capacity,
            unit_size,
        })
    }
}

/// Point-in-time view of a chunk, the input of retention policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub seq: u64,
    pub start: u64,
    pub end: u64,
    /// Global address one past the last written byte.
    pub data_position: u64,
    pub completed: bool,
    pub last_write_ms: i64,
}

#[derive(Debug)]
enum ChunkStorage {
    File { path: PathBuf, file: File },
    Memory(RwLock<Vec<u8>>),
}

/// One fixed-capacity, append-only unit of a stream.
///
/// The chunk covers the global addresses `[start, start + capacity)`. Bytes
/// become readable once `data_size` is published, which happens only after
/// they are fully appended.
#[derive(Debug)]
pub struct Chunk {
    header: ChunkHeader,
    storage: ChunkStorage,
    data_size: AtomicU64,
    completed: AtomicBool,
    last_write_ms: AtomicI64,
}

impl Chunk {
    fn new(header: ChunkHeader, storage: ChunkStorage, data_size: u64, completed: bool) -> Self {
        Self {
            header,
            storage,
            data_size: AtomicU64::new(data_size),
            completed: AtomicBool::new(completed),
            last_write_ms: AtomicI64::new(now_ms()),
        }
    }

    pub(crate) fn create(dir: &Path, prefix: &str, header: ChunkHeader) -> Result<Self> {
        let path = dir.join(chunk_filename(prefix, header.seq));
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&header.encode())?;
        file.sync_all()?;

        info!(
            "Created chunk '{}' covering [{}, {})",
            path.display(),
            header.start,
            header.end()
        );

        Ok(Self::new(header, ChunkStorage::File { path, file }, 0, false))
    }

    pub(crate) fn create_in_memory(header: ChunkHeader) -> Self {
        debug!(
            "Created in-memory chunk #{} covering [{}, {})",
            header.seq,
            header.start,
            header.end()
        );
        Self::new(
            header,
            ChunkStorage::Memory(RwLock::new(Vec::new())),
            0,
            false,
        )
    }

    /// Open an existing chunk file.
    ///
    /// A chunk with a valid footer is completed. Without one, only the tail
    /// chunk is acceptable: its records are replayed with `R::decode` and the
    /// file is truncated after the last valid one.
    pub(crate) fn open<R: ChunkRecord>(
        path: &Path,
        seq: u64,
        unit_size: u32,
        is_tail: bool,
    ) -> Result<Self> {
        let corrupt = |reason: String| StoreError::CorruptChunk {
            path: path.display().to_string(),
            reason,
        };

        let file = OpenOptions::new().read(true).append(true).open(path)?;
        let metadata = file.metadata()?;
        let file_len = metadata.len();
        if file_len < CHUNK_HEADER_SIZE {
            return Err(corrupt(format!("file of {file_len} bytes has no header")));
        }

        let mut raw = [0u8; CHUNK_HEADER_SIZE as usize];
        read_exact_at(&file, &mut raw, 0)?;
        let header =
            ChunkHeader::decode(&raw).ok_or_else(|| corrupt("invalid header".to_string()))?;
        if header.seq != seq {
            return Err(corrupt(format!("header claims sequence {}", header.seq)));
        }
        if header.unit_size != unit_size {
            return Err(corrupt(format!(
                "unit size {} does not match the stream's {unit_size}",
                header.unit_size
            )));
        }
        if header.capacity == 0 || (unit_size > 0 && header.capacity % unit_size as u64 != 0) {
            return Err(corrupt(format!("invalid capacity {}", header.capacity)));
        }

        let last_write_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or_else(now_ms);

        if let Some(data_size) = read_footer(&file, &header, file_len)? {
            let chunk = Self::new(
                header,
                ChunkStorage::File {
                    path: path.to_path_buf(),
                    file,
                },
                data_size,
                true,
            );
            chunk.last_write_ms.store(last_write_ms, Ordering::Relaxed);
            return Ok(chunk);
        }

        if !is_tail {
            return Err(corrupt(
                "chunk is followed by another one but was never completed".to_string(),
            ));
        }

        let available = (file_len - CHUNK_HEADER_SIZE).min(header.capacity);
        let data_size = scan_records::<R>(&file, &header, available)?;
        if CHUNK_HEADER_SIZE + data_size < file_len {
            file.set_len(CHUNK_HEADER_SIZE + data_size)?;
            file.sync_all()?;
            info!(
                "Truncated tail chunk '{}' from {} to {} data bytes",
                path.display(),
                file_len - CHUNK_HEADER_SIZE,
                data_size
            );
        }

        let chunk = Self::new(
            header,
            ChunkStorage::File {
                path: path.to_path_buf(),
                file,
            },
            data_size,
            false,
        );
        chunk.last_write_ms.store(last_write_ms, Ordering::Relaxed);
        Ok(chunk)
    }

    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    pub fn start(&self) -> u64 {
        self.header.start
    }

    pub fn end(&self) -> u64 {
        self.header.end()
    }

    pub fn capacity(&self) -> u64 {
        self.header.capacity
    }

    pub fn unit_size(&self) -> Option<u32> {
        (self.header.unit_size > 0).then_some(self.header.unit_size)
    }

    /// Bytes written so far.
    pub fn data_size(&self) -> u64 {
        self.data_size.load(Ordering::Acquire)
    }

    /// Global address of the next byte to be written.
    pub fn data_position(&self) -> u64 {
        self.header.start + self.data_size()
    }

    pub fn remaining(&self) -> u64 {
        self.header.capacity - self.data_size()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.header.start && address < self.header.end()
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            ChunkStorage::File { path, .. } => Some(path),
            ChunkStorage::Memory(_) => None,
        }
    }

    pub fn info(&self) -> ChunkInfo {
        ChunkInfo {
            seq: self.header.seq,
            start: self.header.start,
            end: self.header.end(),
            data_position: self.data_position(),
            completed: self.is_completed(),
            last_write_ms: self.last_write_ms.load(Ordering::Relaxed),
        }
    }

    /// Append `bytes` and publish them. Returns the local offset they start at.
    ///
    /// Only the stream's single writer calls this.
    pub(crate) fn append(&self, bytes: &[u8]) -> Result<u64> {
        let local = self.data_size();
        let size = bytes.len() as u64;
        if self.is_completed() || local + size > self.header.capacity {
            return Err(StoreError::InconsistentChunks(format!(
                "append of {size} bytes to chunk #{} at local offset {local} (capacity {}, completed {})",
                self.header.seq,
                self.header.capacity,
                self.is_completed()
            )));
        }

        match &self.storage {
            ChunkStorage::File { file, .. } => {
                let mut file: &File = file;
                file.write_all(bytes)
                    .map_err(|source| StoreError::PartialWrite {
                        address: self.header.start + local,
                        size: bytes.len(),
                        source,
                    })?;
            }
            ChunkStorage::Memory(data) => data.write().extend_from_slice(bytes),
        }

        self.data_size.store(local + size, Ordering::Release);
        self.last_write_ms.store(now_ms(), Ordering::Relaxed);
        Ok(local)
    }

    /// Close the chunk for writing: write the footer and sync.
    pub(crate) fn complete(&self) -> Result<()> {
        if self.is_completed() {
            return Ok(());
        }

        if let ChunkStorage::File { path, file } = &self.storage {
            let mut footer = [0u8; CHUNK_FOOTER_SIZE as usize];
            let mut cursor = &mut footer[..];
            cursor.put_u32_le(FOOTER_MAGIC);
            cursor.put_u32_le(0);
            cursor.put_u64_le(self.data_size());

            let mut writer: &File = file;
            writer.write_all(&footer)?;
            file.sync_all()?;
            info!(
                "Completed chunk '{}' with {} data bytes",
                path.display(),
                self.data_size()
            );
        }

        self.completed.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn flush(&self) -> Result<()> {
        if let ChunkStorage::File { file, .. } = &self.storage {
            file.sync_data()?;
        }
        Ok(())
    }

    pub(crate) fn delete(&self) -> Result<()> {
        if let ChunkStorage::File { path, .. } = &self.storage {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Read the payload of the record starting at `local`.
    ///
    /// Offsets at or beyond the published data size are `None`. For
    /// fixed-size chunks a misaligned offset is `None` as well.
    pub(crate) fn read_record(&self, local: u64) -> Result<Option<Bytes>> {
        let data_size = self.data_size();
        if local >= data_size {
            return Ok(None);
        }

        if let Some(unit) = self.unit_size() {
            let unit = unit as u64;
            if local % unit != 0 || local + unit > data_size {
                return Ok(None);
            }
            return self.read_bytes(local, unit as usize).map(Some);
        }

        let address = self.header.start + local;
        if local + FRAME_HEADER_SIZE > data_size {
            return Err(StoreError::Codec(format!(
                "no frame header fits at address {address}"
            )));
        }
        let mut frame = self.read_bytes(local, FRAME_HEADER_SIZE as usize)?;
        let len = frame.get_u32_le() as u64;
        let crc = frame.get_u32_le();
        if local + FRAME_HEADER_SIZE + len > data_size {
            return Err(StoreError::Codec(format!(
                "frame of {len} bytes at address {address} overruns the chunk"
            )));
        }
        let payload = self.read_bytes(local + FRAME_HEADER_SIZE, len as usize)?;
        if crc32fast::hash(&payload) != crc {
            return Err(StoreError::Codec(format!(
                "checksum mismatch for frame at address {address}"
            )));
        }
        Ok(Some(payload))
    }

    fn read_bytes(&self, local: u64, len: usize) -> Result<Bytes> {
        match &self.storage {
            ChunkStorage::File { file, .. } => {
                let mut buf = vec![0u8; len];
                read_exact_at(file, &mut buf, CHUNK_HEADER_SIZE + local)?;
                Ok(Bytes::from(buf))
            }
            ChunkStorage::Memory(data) => {
                let data = data.read();
                let start = local as usize;
                Ok(Bytes::copy_from_slice(&data[start..start + len]))
            }
        }
    }
}

fn read_footer(file: &File, header: &ChunkHeader, file_len: u64) -> Result<Option<u64>> {
    if file_len < CHUNK_HEADER_SIZE + CHUNK_FOOTER_SIZE {
        return Ok(None);
    }
    let mut raw = [0u8; CHUNK_FOOTER_SIZE as usize];
    read_exact_at(file, &mut raw, file_len - CHUNK_FOOTER_SIZE)?;
    let mut cursor = &raw[..];
    if cursor.get_u32_le() != FOOTER_MAGIC {
        return Ok(None);
    }
    cursor.advance(4);
    let data_size = cursor.get_u64_le();
    if data_size > header.capacity
        || CHUNK_HEADER_SIZE + data_size + CHUNK_FOOTER_SIZE != file_len
    {
        return Ok(None);
    }
    Ok(Some(data_size))
}

/// Replay the records of an uncompleted chunk and return the size of the
/// valid prefix. Stops at the first short, unchecksummed or undecodable record.
fn scan_records<R: ChunkRecord>(file: &File, header: &ChunkHeader, available: u64) -> Result<u64> {
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(CHUNK_HEADER_SIZE))?;

    let mut valid = 0u64;
    let mut payload = Vec::new();
    loop {
        let position = header.start + valid;
        let consumed = if header.unit_size > 0 {
            let unit = header.unit_size as u64;
            if valid + unit > available {
                break;
            }
            payload.resize(unit as usize, 0);
            if !read_fully(&mut reader, &mut payload)? || R::decode(position, &payload).is_err() {
                break;
            }
            unit
        } else {
            if valid + FRAME_HEADER_SIZE > available {
                break;
            }
            let mut frame = [0u8; FRAME_HEADER_SIZE as usize];
            if !read_fully(&mut reader, &mut frame)? {
                break;
            }
            let mut cursor = &frame[..];
            let len = cursor.get_u32_le() as u64;
            let crc = cursor.get_u32_le();
            if len == 0 || valid + FRAME_HEADER_SIZE + len > available {
                break;
            }
            payload.resize(len as usize, 0);
            if !read_fully(&mut reader, &mut payload)?
                || crc32fast::hash(&payload) != crc
                || R::decode(position, &payload).is_err()
            {
                break;
            }
            FRAME_HEADER_SIZE + len
        };
        valid += consumed;
    }
    Ok(valid)
}

fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{QUEUE_INDEX_UNIT_SIZE, QueueIndexRecord};
    use crate::tests::TestRecord;
    use tempfile::tempdir;

    fn header(seq: u64, capacity: u64, unit_size: u32) -> ChunkHeader {
        ChunkHeader {
            seq,
            start: seq * capacity,
            capacity,
            unit_size,
        }
    }

    fn append_record<R: ChunkRecord>(chunk: &Chunk, record: &R) -> u64 {
        let mut buf = BytesMut::new();
        encode_record(chunk.unit_size(), record, chunk.data_position(), &mut buf).unwrap();
        chunk.append(&buf).unwrap() + chunk.start()
    }

    #[test]
    fn test_chunk_filename() {
        assert_eq!(
            chunk_filename("message-chunk-", 0),
            "message-chunk-000000000000"
        );
        assert_eq!(chunk_filename("queue-chunk-", 42), "queue-chunk-000000000042");
    }

    #[test]
    fn test_find_all_chunks_ignores_foreign_files() {
        let dir = tempdir().unwrap();
        for name in [
            "message-chunk-000000000002",
            "message-chunk-000000000000",
            "message-chunk-000000000001",
            "message-chunk-12",
            "queue.settings",
            "queue-chunk-000000000000",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let seqs: Vec<u64> = find_all_chunks(dir.path(), "message-chunk-")
            .unwrap()
            .into_iter()
            .map(|(seq, _)| seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        let missing = find_all_chunks(&dir.path().join("nope"), "message-chunk-").unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let chunk = Chunk::create(dir.path(), "c-", header(0, 1024, 0)).unwrap();

        let first = TestRecord::new(1, b"alpha");
        let second = TestRecord::new(2, b"beta");
        let p1 = append_record(&chunk, &first);
        let p2 = append_record(&chunk, &second);
        assert_eq!(p1, 0);
        assert_eq!(p2, first.framed_size());

        let payload = chunk.read_record(p2).unwrap().unwrap();
        assert_eq!(TestRecord::decode(p2, &payload).unwrap(), second);

        // past the published data
        assert!(chunk.read_record(chunk.data_size()).unwrap().is_none());
        // in the middle of a record
        assert!(chunk.read_record(3).is_err());
    }

    #[test]
    fn test_completed_chunk_reopens_with_footer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(chunk_filename("c-", 0));
        {
            let chunk = Chunk::create(dir.path(), "c-", header(0, 1024, 0)).unwrap();
            append_record(&chunk, &TestRecord::new(1, b"alpha"));
            chunk.complete().unwrap();
            assert!(chunk.is_completed());
        }

        let chunk = Chunk::open::<TestRecord>(&path, 0, 0, false).unwrap();
        assert!(chunk.is_completed());
        assert_eq!(chunk.data_size(), TestRecord::new(1, b"alpha").framed_size());
    }

    #[test]
    fn test_uncompleted_non_tail_chunk_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(chunk_filename("c-", 0));
        {
            let chunk = Chunk::create(dir.path(), "c-", header(0, 1024, 0)).unwrap();
            append_record(&chunk, &TestRecord::new(1, b"alpha"));
        }

        let err = Chunk::open::<TestRecord>(&path, 0, 0, false).unwrap_err();
        assert!(matches!(err, StoreError::CorruptChunk { .. }));
    }

    #[test]
    fn test_tail_with_garbage_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(chunk_filename("c-", 0));
        let valid = {
            let chunk = Chunk::create(dir.path(), "c-", header(0, 1024, 0)).unwrap();
            append_record(&chunk, &TestRecord::new(1, b"alpha"));
            append_record(&chunk, &TestRecord::new(2, b"beta"));
            chunk.data_size()
        };

        // half of a third record
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let chunk = Chunk::open::<TestRecord>(&path, 0, 0, true).unwrap();
        assert!(!chunk.is_completed());
        assert_eq!(chunk.data_size(), valid);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            CHUNK_HEADER_SIZE + valid
        );
    }

    #[test]
    fn test_fixed_size_chunk_scan_stops_at_capacity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(chunk_filename("q-", 0));
        let unit = QUEUE_INDEX_UNIT_SIZE;
        {
            let chunk = Chunk::create(dir.path(), "q-", header(0, 2 * unit as u64, unit)).unwrap();
            for position in [10, 20] {
                append_record(
                    &chunk,
                    &QueueIndexRecord {
                        message_position: position,
                        tag_code: 0,
                    },
                );
            }
            // a torn footer after a full chunk
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&FOOTER_MAGIC.to_le_bytes()).unwrap();
        }

        let chunk = Chunk::open::<QueueIndexRecord>(&path, 0, unit, true).unwrap();
        assert_eq!(chunk.data_size(), 2 * unit as u64);
        assert!(!chunk.is_completed());
        assert_eq!(chunk.remaining(), 0);

        let raw = chunk.read_record(unit as u64).unwrap().unwrap();
        let entry = QueueIndexRecord::decode(unit as u64, &raw).unwrap();
        assert_eq!(entry.message_position, 20);
        // misaligned address
        assert!(chunk.read_record(5).unwrap().is_none());
    }

    #[test]
    fn test_header_mismatch_is_corrupt() {
        let dir = tempdir().unwrap();
        Chunk::create(dir.path(), "c-", header(3, 1024, 0)).unwrap();
        let path = dir.path().join(chunk_filename("c-", 3));
        assert!(matches!(
            Chunk::open::<TestRecord>(&path, 3, 12, true),
            Err(StoreError::CorruptChunk { .. })
        ));
    }

    #[test]
    fn test_memory_chunk() {
        let chunk = Chunk::create_in_memory(header(1, 256, 0));
        let record = TestRecord::new(5, b"in memory");
        let position = append_record(&chunk, &record);
        assert_eq!(position, 256);
        let payload = chunk.read_record(0).unwrap().unwrap();
        assert_eq!(TestRecord::decode(position, &payload).unwrap(), record);
        assert!(chunk.path().is_none());
        chunk.complete().unwrap();
        assert!(chunk.is_completed());
        assert!(chunk.append(b"late").is_err());
    }
}
