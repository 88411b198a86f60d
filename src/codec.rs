//! Byte layouts of the two record kinds stored in chunks.
//!
//! ## Message record
//!
//! Variable length, little-endian, every variable field prefixed with an
//! `i32` length:
//!
//! ```text
//! position i64 | id len+utf8 | topic len+utf8 | tag len+utf8 (0 = none)
//! | producer address len+utf8 | code i32 | body len+bytes | queue id i32
//! | queue offset i64 | created ms i64 | stored ms i64
//! ```
//!
//! The chunk adds its own frame (length + CRC32) around this payload.
//!
//! ## Queue index record
//!
//! Exactly [`QUEUE_INDEX_UNIT_SIZE`] bytes: message position plus one (`i64`)
//! and tag code (`i32`). A stored position of 0 means "absent".

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{ChunkRecord, Result, StoreError, now_ms};

pub const QUEUE_INDEX_UNIT_SIZE: u32 = 12;

/// Message id for the record stored at `position`.
pub fn message_id(position: u64) -> String {
    format!("{position:016X}")
}

/// Tag code kept in the queue index so consumers can filter without reading the message log.
pub fn tag_code(tag: Option<&str>) -> i32 {
    match tag {
        Some(tag) if !tag.is_empty() => crc32fast::hash(tag.as_bytes()) as i32,
        _ => 0,
    }
}

/// A message as handed over by a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub tag: Option<String>,
    pub code: i32,
    pub body: Bytes,
    pub created_ms: i64,
}

impl Message {
    pub fn new(topic: impl Into<String>, code: i32, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            tag: None,
            code,
            body: body.into(),
            created_ms: now_ms(),
        }
    }

    /// An empty tag is the same as no tag on disk, so it is normalised to `None`.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.tag = (!tag.is_empty()).then_some(tag);
        self
    }
}

/// A message as stored in the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub position: u64,
    pub message_id: String,
    pub topic: String,
    pub tag: Option<String>,
    pub producer_address: String,
    pub code: i32,
    pub body: Bytes,
    pub queue_id: u32,
    pub queue_offset: u64,
    pub created_ms: i64,
    pub stored_ms: i64,
}

impl MessageRecord {
    /// Builds a record that has not been written yet; position and id are
    /// filled in by [`MessageRecord::assign_position`].
    pub fn new(message: Message, producer_address: &str, queue_id: u32, queue_offset: u64) -> Self {
        Self {
            position: 0,
            message_id: String::new(),
            topic: message.topic,
            tag: message.tag,
            producer_address: producer_address.to_string(),
            code: message.code,
            body: message.body,
            queue_id,
            queue_offset,
            created_ms: message.created_ms,
            stored_ms: 0,
        }
    }

    pub fn assign_position(&mut self, position: u64) {
        self.position = position;
        self.message_id = message_id(position);
    }

    pub fn tag_code(&self) -> i32 {
        tag_code(self.tag.as_deref())
    }
}

impl ChunkRecord for MessageRecord {
    fn encode(&self, position: u64, buf: &mut BytesMut) -> Result<()> {
        buf.put_i64_le(position as i64);
        put_bytes(buf, message_id(position).as_bytes(), "message id")?;
        put_bytes(buf, self.topic.as_bytes(), "topic")?;
        put_bytes(buf, self.tag.as_deref().unwrap_or("").as_bytes(), "tag")?;
        put_bytes(buf, self.producer_address.as_bytes(), "producer address")?;
        buf.put_i32_le(self.code);
        put_bytes(buf, &self.body, "body")?;
        buf.put_i32_le(self.queue_id as i32);
        buf.put_i64_le(self.queue_offset as i64);
        buf.put_i64_le(self.created_ms);
        buf.put_i64_le(self.stored_ms);
        Ok(())
    }

    fn decode(position: u64, mut buf: &[u8]) -> Result<Self> {
        let stored_position = get_i64(&mut buf, "position")?;
        if stored_position != position as i64 {
            return Err(StoreError::Codec(format!(
                "record claims position {stored_position} but was read at {position}"
            )));
        }
        let message_id = get_string(&mut buf, "message id")?;
        let topic = get_string(&mut buf, "topic")?;
        let tag = get_string(&mut buf, "tag")?;
        let producer_address = get_string(&mut buf, "producer address")?;
        let code = get_i32(&mut buf, "code")?;
        let body_len = get_len(&mut buf, "body")?;
        let body = Bytes::copy_from_slice(&buf[..body_len]);
        buf.advance(body_len);
        let queue_id = get_i32(&mut buf, "queue id")? as u32;
        let queue_offset = get_i64(&mut buf, "queue offset")? as u64;
        let created_ms = get_i64(&mut buf, "created timestamp")?;
        let stored_ms = get_i64(&mut buf, "stored timestamp")?;
        if buf.has_remaining() {
            return Err(StoreError::Codec(format!(
                "{} trailing bytes after message record at {position}",
                buf.remaining()
            )));
        }

        Ok(Self {
            position,
            message_id,
            topic,
            tag: (!tag.is_empty()).then_some(tag),
            producer_address,
            code,
            body,
            queue_id,
            queue_offset,
            created_ms,
            stored_ms,
        })
    }
}

/// One entry of a queue index: where the message of a queue offset lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueIndexRecord {
    pub message_position: u64,
    pub tag_code: i32,
}

impl ChunkRecord for QueueIndexRecord {
    fn encode(&self, _position: u64, buf: &mut BytesMut) -> Result<()> {
        let stored = i64::try_from(self.message_position)
            .ok()
            .and_then(|p| p.checked_add(1))
            .ok_or_else(|| {
                StoreError::Codec(format!(
                    "message position {} does not fit a queue index entry",
                    self.message_position
                ))
            })?;
        buf.put_i64_le(stored);
        buf.put_i32_le(self.tag_code);
        Ok(())
    }

    fn decode(position: u64, mut buf: &[u8]) -> Result<Self> {
        if buf.len() != QUEUE_INDEX_UNIT_SIZE as usize {
            return Err(StoreError::Codec(format!(
                "queue index entry at {position} has {} bytes",
                buf.len()
            )));
        }
        let stored = buf.get_i64_le();
        if stored <= 0 {
            return Err(StoreError::Codec(format!(
                "queue index entry at {position} is empty"
            )));
        }
        Ok(Self {
            message_position: (stored - 1) as u64,
            tag_code: buf.get_i32_le(),
        })
    }
}

fn put_bytes(buf: &mut BytesMut, value: &[u8], field: &str) -> Result<()> {
    let len = i32::try_from(value.len()).map_err(|_| {
        StoreError::Codec(format!("{field} of {} bytes is too long", value.len()))
    })?;
    buf.put_i32_le(len);
    buf.put_slice(value);
    Ok(())
}

fn ensure(buf: &[u8], needed: usize, field: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(StoreError::Codec(format!(
            "truncated {field}: need {needed} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_i32(buf: &mut &[u8], field: &str) -> Result<i32> {
    ensure(buf, 4, field)?;
    Ok(buf.get_i32_le())
}

fn get_i64(buf: &mut &[u8], field: &str) -> Result<i64> {
    ensure(buf, 8, field)?;
    Ok(buf.get_i64_le())
}

fn get_len(buf: &mut &[u8], field: &str) -> Result<usize> {
    let len = get_i32(buf, field)?;
    if len < 0 {
        return Err(StoreError::Codec(format!("negative length for {field}")));
    }
    let len = len as usize;
    ensure(buf, len, field)?;
    Ok(len)
}

fn get_string(buf: &mut &[u8], field: &str) -> Result<String> {
    let len = get_len(buf, field)?;
    let value = std::str::from_utf8(&buf[..len])
        .map_err(|e| StoreError::Codec(format!("{field} is not valid UTF-8: {e}")))?
        .to_string();
    buf.advance(len);
    Ok(value)
}
