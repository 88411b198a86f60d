//! Deciding which chunks of a stream may be reclaimed.
//!
//! Policies are pure: they look at a snapshot of [`ChunkInfo`]s and a
//! consumption watermark and return the chunks to delete. The caller does the
//! deleting. Whatever the rule, a policy only ever selects a prefix of the
//! completed chunks and never the tail.

use std::time::Duration;

use crate::chunk::ChunkInfo;
use crate::config::{RetentionRule, StoreConfig};
use crate::types::now_ms;

pub trait RetentionPolicy: Send + Sync + std::fmt::Debug {
    /// Chunks to delete, oldest first. `chunks` must be ordered by sequence.
    fn select_deletable(&self, chunks: &[ChunkInfo], watermark: u64) -> Vec<ChunkInfo>;
}

/// Leading chunks that are completed and not the last chunk of the stream.
fn candidates(chunks: &[ChunkInfo]) -> impl Iterator<Item = &ChunkInfo> {
    let closed = chunks.len().saturating_sub(1);
    chunks[..closed].iter().take_while(|c| c.completed)
}

fn consumed(chunk: &ChunkInfo, watermark: u64) -> bool {
    chunk.end <= watermark
}

/// Deletes every chunk that lies entirely below the watermark.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsumedRetention;

impl RetentionPolicy for ConsumedRetention {
    fn select_deletable(&self, chunks: &[ChunkInfo], watermark: u64) -> Vec<ChunkInfo> {
        candidates(chunks)
            .take_while(|c| consumed(c, watermark))
            .copied()
            .collect()
    }
}

/// Keeps at most `max_chunk_count` chunks.
#[derive(Debug, Clone, Copy)]
pub struct ChunkCountRetention {
    pub max_chunk_count: usize,
    /// Delete excess chunks even when they hold unconsumed data.
    pub ignore_unconsumed: bool,
}

impl RetentionPolicy for ChunkCountRetention {
    fn select_deletable(&self, chunks: &[ChunkInfo], watermark: u64) -> Vec<ChunkInfo> {
        let excess = chunks.len().saturating_sub(self.max_chunk_count);
        candidates(chunks)
            .take(excess)
            .take_while(|c| self.ignore_unconsumed || consumed(c, watermark))
            .copied()
            .collect()
    }
}

/// Deletes chunks whose last write is older than `max_age`.
#[derive(Debug, Clone, Copy)]
pub struct ChunkAgeRetention {
    pub max_age: Duration,
    pub ignore_unconsumed: bool,
}

impl ChunkAgeRetention {
    pub fn select_deletable_at(
        &self,
        chunks: &[ChunkInfo],
        watermark: u64,
        now_ms: i64,
    ) -> Vec<ChunkInfo> {
        let max_age_ms = i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(max_age_ms);
        candidates(chunks)
            .take_while(|c| c.last_write_ms <= cutoff)
            .take_while(|c| self.ignore_unconsumed || consumed(c, watermark))
            .copied()
            .collect()
    }
}

impl RetentionPolicy for ChunkAgeRetention {
    fn select_deletable(&self, chunks: &[ChunkInfo], watermark: u64) -> Vec<ChunkInfo> {
        self.select_deletable_at(chunks, watermark, now_ms())
    }
}

pub fn build_policy(config: &StoreConfig) -> Box<dyn RetentionPolicy> {
    match config.retention_rule {
        RetentionRule::Consumed => Box::new(ConsumedRetention),
        RetentionRule::MaxChunkCount { count } => Box::new(ChunkCountRetention {
            max_chunk_count: count,
            ignore_unconsumed: config.ignore_unconsumed_on_delete,
        }),
        RetentionRule::MaxAge { max_age } => Box::new(ChunkAgeRetention {
            max_age,
            ignore_unconsumed: config.ignore_unconsumed_on_delete,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Four 100-byte chunks, the last one open.
    fn layout() -> Vec<ChunkInfo> {
        (0..4u64)
            .map(|seq| ChunkInfo {
                seq,
                start: seq * 100,
                end: seq * 100 + 100,
                data_position: seq * 100 + 90,
                completed: seq < 3,
                last_write_ms: 1_000 * (seq as i64 + 1),
            })
            .collect()
    }

    fn seqs(chunks: Vec<ChunkInfo>) -> Vec<u64> {
        chunks.into_iter().map(|c| c.seq).collect()
    }

    #[test]
    fn test_consumed_only_below_watermark() {
        let chunks = layout();
        assert_eq!(seqs(ConsumedRetention.select_deletable(&chunks, 0)), Vec::<u64>::new());
        assert_eq!(seqs(ConsumedRetention.select_deletable(&chunks, 199)), vec![0]);
        assert_eq!(seqs(ConsumedRetention.select_deletable(&chunks, 200)), vec![0, 1]);
        // the tail is never selected
        assert_eq!(seqs(ConsumedRetention.select_deletable(&chunks, u64::MAX)), vec![0, 1, 2]);
    }

    #[test]
    fn test_open_chunk_blocks_its_successors() {
        let mut chunks = layout();
        chunks[1].completed = false;
        assert_eq!(seqs(ConsumedRetention.select_deletable(&chunks, u64::MAX)), vec![0]);
    }

    #[test]
    fn test_count_respects_watermark_unless_ignored() {
        let chunks = layout();
        let keep_two = ChunkCountRetention {
            max_chunk_count: 2,
            ignore_unconsumed: false,
        };
        assert_eq!(seqs(keep_two.select_deletable(&chunks, 100)), vec![0]);
        assert_eq!(seqs(keep_two.select_deletable(&chunks, 1_000)), vec![0, 1]);

        let forced = ChunkCountRetention {
            max_chunk_count: 2,
            ignore_unconsumed: true,
        };
        assert_eq!(seqs(forced.select_deletable(&chunks, 0)), vec![0, 1]);

        let keep_one = ChunkCountRetention {
            max_chunk_count: 1,
            ignore_unconsumed: true,
        };
        assert_eq!(seqs(keep_one.select_deletable(&chunks, 0)), vec![0, 1, 2]);
    }

    #[test]
    fn test_age_uses_last_write_time() {
        let chunks = layout();
        let policy = ChunkAgeRetention {
            max_age: Duration::from_millis(500),
            ignore_unconsumed: false,
        };
        // chunk 0 last written at 1000, chunk 1 at 2000
        assert_eq!(seqs(policy.select_deletable_at(&chunks, u64::MAX, 1_400)), Vec::<u64>::new());
        assert_eq!(seqs(policy.select_deletable_at(&chunks, u64::MAX, 2_600)), vec![0, 1]);
        assert_eq!(seqs(policy.select_deletable_at(&chunks, 100, 2_600)), vec![0]);
    }

    #[test]
    fn test_age_beyond_clock_range_keeps_everything() {
        let chunks = layout();
        let policy = ChunkAgeRetention {
            max_age: Duration::MAX,
            ignore_unconsumed: true,
        };
        assert!(policy.select_deletable_at(&chunks, u64::MAX, 2_600).is_empty());
        assert!(policy.select_deletable_at(&chunks, u64::MAX, i64::MIN + 1).is_empty());
    }

    #[test]
    fn test_build_policy_follows_config() {
        let config = StoreConfig {
            retention_rule: RetentionRule::MaxChunkCount { count: 3 },
            ignore_unconsumed_on_delete: true,
            ..Default::default()
        };
        let policy = build_policy(&config);
        assert_eq!(seqs(policy.select_deletable(&layout(), 0)), vec![0]);
    }
}
