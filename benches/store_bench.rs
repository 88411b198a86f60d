use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use chunkstore::{
    ChunkConfig, ChunkManager, ChunkReader, ChunkRecord, ChunkWriter, FlushMode, Message,
    MessageStore, QueueStore, StoreConfig, StoreError,
};
use criterion::{Criterion, criterion_group, criterion_main};
use tempfile::tempdir;

#[derive(Clone, Debug, PartialEq)]
struct BenchRecord {
    key: Vec<u8>,
    value: Vec<u8>,
}

impl ChunkRecord for BenchRecord {
    fn encode(&self, _position: u64, buf: &mut BytesMut) -> chunkstore::Result<()> {
        buf.put_u32_le(self.key.len() as u32);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        Ok(())
    }

    fn decode(_position: u64, buf: &[u8]) -> chunkstore::Result<Self> {
        let key_len = buf
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or_else(|| StoreError::Codec("short bench record".to_string()))?;
        let rest = &buf[4..];
        if rest.len() < key_len {
            return Err(StoreError::Codec("short bench record".to_string()));
        }
        Ok(Self {
            key: rest[..key_len].to_vec(),
            value: rest[key_len..].to_vec(),
        })
    }
}

fn bench_record() -> BenchRecord {
    let value = r#"{"user": "123456", "name": "bob", "number": "123456789"}"#.to_string();
    BenchRecord {
        key: b"123456789".to_vec(),
        value: value.into_bytes(),
    }
}

fn bench_writer_append(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let manager = Arc::new(
        ChunkManager::new(ChunkConfig::new(dir.path(), "bench-", 64 * 1024 * 1024)).unwrap(),
    );
    manager.load::<BenchRecord>().unwrap();
    let mut writer = ChunkWriter::new(manager);
    writer.open().unwrap();
    let record = bench_record();

    c.bench_function("chunk_writer_append", |b| {
        b.iter(|| writer.write(&record).unwrap());
    });
}

fn bench_reader(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let config = ChunkConfig::new(dir.path(), "bench-", 1024 * 1024).with_cache(1_024);
    let manager = Arc::new(ChunkManager::new(config).unwrap());
    manager.load::<BenchRecord>().unwrap();
    let mut writer = ChunkWriter::new(manager.clone());
    writer.open().unwrap();

    let record = bench_record();
    let positions: Vec<u64> = (0..10_000)
        .map(|_| writer.write(&record).unwrap().position)
        .collect();
    let reader = ChunkReader::new(manager);

    c.bench_function("chunk_reader_random_read", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 7_919) % positions.len();
            reader
                .try_read_at::<BenchRecord>(positions[i], false)
                .unwrap()
        });
    });

    c.bench_function("chunk_reader_scan_10k", |b| {
        b.iter(|| reader.iter_from::<BenchRecord>(0).count());
    });
}

fn bench_store_message(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        base_path: dir.path().to_path_buf(),
        flush_mode: FlushMode::OsBuffered,
        ..Default::default()
    };

    let (messages, queue) = rt.block_on(async {
        let messages = Arc::new(MessageStore::load(config.clone()).unwrap());
        messages.start().unwrap();
        let queues = QueueStore::load(config).unwrap();
        let queue = queues.create_queue("bench", 0).unwrap();
        (messages, queue)
    });
    let body = bench_record().value;

    c.bench_function("message_store_store_and_wait", |b| {
        b.to_async(&rt).iter(|| async {
            let message = Message::new("bench", 0, body.clone());
            messages
                .store_message(&queue, message, "127.0.0.1:9000")
                .unwrap()
                .wait()
                .await
                .unwrap()
        });
    });

    rt.block_on(messages.shutdown()).unwrap();
}

criterion_group!(benches, bench_writer_append, bench_reader, bench_store_message);
criterion_main!(benches);
