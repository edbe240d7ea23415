//! Index queue: fixed-width `log_index -> log_file_position` entries.
//!
//! The entry for log index `i` lives at stream position `(i - 1) * 8`.
//! Recent entries are served from a mem-cache; everything at or above the
//! commit index stays cached so restore and truncation never wait on a
//! read for hot entries. Disk writes are batched per append and fsynced.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use skf_core::{RaftError, Result};
use skf_fiber::IoExecutor;

use crate::file_queue::FileQueue;

pub const IDX_ENTRY_LEN: u64 = 8;

/// Cached entries above this count are dropped once flushed and below
/// the commit index.
const CACHE_MAX_ENTRIES: usize = 64 * 1024;

struct IdxInner {
    /// Next log index to be recorded.
    next_index: u64,
    /// First index held in the cache.
    cache_first: u64,
    cache: VecDeque<u64>,
    /// Entries up to and including this index are on disk.
    flushed_index: u64,
    /// Retention floor: cached entries at or above it are never evicted.
    commit_index: u64,
}

pub struct IdxFileQueue {
    files: FileQueue,
    inner: RefCell<IdxInner>,
}

impl IdxFileQueue {
    pub fn new(
        dir: PathBuf,
        file_size: u64,
        io: Arc<IoExecutor>,
        retry_intervals: Vec<Duration>,
    ) -> Result<Self> {
        if file_size % IDX_ENTRY_LEN != 0 {
            return Err(RaftError::Config(format!(
                "idx segment size must be a multiple of {IDX_ENTRY_LEN}"
            )));
        }
        Ok(Self {
            files: FileQueue::new(dir, file_size, io, retry_intervals)?,
            inner: RefCell::new(IdxInner {
                next_index: 1,
                cache_first: 1,
                cache: VecDeque::new(),
                flushed_index: 0,
                commit_index: 0,
            }),
        })
    }

    pub async fn init(&self) -> Result<()> {
        self.files.init().await
    }

    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.inner.borrow().next_index
    }

    pub fn set_commit_index(&self, commit_index: u64) {
        self.inner.borrow_mut().commit_index = commit_index;
    }

    /// Reset in-memory state before a restore scan beginning at
    /// `first_index`. On-disk entries below it stay valid.
    pub fn begin_restore(&self, first_index: u64) {
        let mut inner = self.inner.borrow_mut();
        inner.next_index = first_index;
        inner.cache_first = first_index;
        inner.cache.clear();
        inner.flushed_index = first_index.saturating_sub(1);
    }

    /// Record the position of the next log index. Indexes are strictly
    /// contiguous; a gap is a caller bug.
    pub fn put(&self, index: u64, pos: u64) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if index != inner.next_index {
            skf_core::bug("idx put out of order");
            return Err(RaftError::LogGap {
                first: index,
                expected: inner.next_index,
            });
        }
        inner.cache.push_back(pos);
        inner.next_index += 1;
        Ok(())
    }

    #[must_use]
    pub fn lookup_cached(&self, index: u64) -> Option<u64> {
        let inner = self.inner.borrow();
        if index < inner.cache_first || index >= inner.next_index {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let offset = (index - inner.cache_first) as usize;
        inner.cache.get(offset).copied()
    }

    /// Position of `index`'s log record: mem-cache first, disk otherwise.
    pub async fn load_log_pos(&self, index: u64) -> Result<u64> {
        if index == 0 {
            return Err(RaftError::Internal("index 0 has no position".into()));
        }
        if let Some(pos) = self.lookup_cached(index) {
            return Ok(pos);
        }
        {
            let inner = self.inner.borrow();
            if index >= inner.next_index {
                return Err(RaftError::Internal(format!(
                    "index {index} beyond next index {}",
                    inner.next_index
                )));
            }
        }
        let stream_pos = (index - 1) * IDX_ENTRY_LEN;
        let buf = self
            .files
            .read_exact_at(stream_pos, IDX_ENTRY_LEN as usize)
            .await?;
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf);
        Ok(u64::from_le_bytes(b))
    }

    /// Raw 8-byte read at a stream position, bypassing the `next_index`
    /// bound. Used during init, before the restore scan has rebuilt the
    /// in-memory state.
    pub async fn load_raw(&self, stream_pos: u64) -> Result<[u8; 8]> {
        let buf = self
            .files
            .read_exact_at(stream_pos, IDX_ENTRY_LEN as usize)
            .await?;
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf);
        Ok(b)
    }

    /// Flush unpersisted entries, fsync the touched segments and shrink
    /// the cache.
    pub async fn flush(&self) -> Result<()> {
        let (start_index, entries) = {
            let inner = self.inner.borrow();
            let start = inner.flushed_index + 1;
            if start >= inner.next_index {
                return Ok(());
            }
            if start < inner.cache_first {
                return Err(RaftError::Internal(
                    "unflushed idx entries evicted from cache".into(),
                ));
            }
            #[allow(clippy::cast_possible_truncation)]
            let from = (start - inner.cache_first) as usize;
            let entries: Vec<u64> = inner.cache.iter().skip(from).copied().collect();
            (start, entries)
        };

        let first_pos = (start_index - 1) * IDX_ENTRY_LEN;
        let end_pos = first_pos + entries.len() as u64 * IDX_ENTRY_LEN;
        self.files.ensure_write_pos_ready(end_pos - 1).await?;

        let mut buf = Vec::with_capacity(entries.len() * 8);
        for pos in &entries {
            buf.extend_from_slice(&pos.to_le_bytes());
        }

        let file_size = self.files.file_size();
        let mut pos = first_pos;
        let mut offset = 0usize;
        while offset < buf.len() {
            let file_end = (pos / file_size + 1) * file_size;
            #[allow(clippy::cast_possible_truncation)]
            let chunk = ((file_end - pos) as usize).min(buf.len() - offset);
            self.files
                .write_retry(pos, buf[offset..offset + chunk].to_vec())
                .await?;
            self.files.sync_retry(pos).await?;
            pos += chunk as u64;
            offset += chunk;
        }

        let mut inner = self.inner.borrow_mut();
        inner.flushed_index = start_index + entries.len() as u64 - 1;
        // Evict flushed entries below the commit floor, oldest first.
        while inner.cache.len() > CACHE_MAX_ENTRIES
            || (inner.cache_first < inner.commit_index
                && inner.cache_first <= inner.flushed_index
                && !inner.cache.is_empty())
        {
            if inner.cache_first > inner.flushed_index {
                break;
            }
            if inner.cache.pop_front().is_none() {
                break;
            }
            inner.cache_first += 1;
        }
        Ok(())
    }

    /// Drop entries from `first_removed` on, returning the data position
    /// of `first_removed` so the log tail can be truncated to match.
    pub async fn truncate_tail(&self, first_removed: u64) -> Result<u64> {
        let pos = self.load_log_pos(first_removed).await?;
        let mut inner = self.inner.borrow_mut();
        if first_removed >= inner.next_index {
            return Err(RaftError::Internal(format!(
                "truncate beyond tail: {first_removed} >= {}",
                inner.next_index
            )));
        }
        if first_removed <= inner.commit_index {
            skf_core::bug("idx truncate below commit index");
        }
        if first_removed >= inner.cache_first {
            #[allow(clippy::cast_possible_truncation)]
            let keep = (first_removed - inner.cache_first) as usize;
            inner.cache.truncate(keep);
        } else {
            inner.cache.clear();
            inner.cache_first = first_removed;
        }
        inner.next_index = first_removed;
        inner.flushed_index = inner.flushed_index.min(first_removed - 1);
        Ok(pos)
    }

    /// Reclaim head segments whose entries all reference log positions
    /// below the log queue's current start.
    pub async fn delete_head_files(&self, log_start_pos: u64) -> Result<usize> {
        let mut removed = 0usize;
        loop {
            let head = {
                let inner = self.files.inner.borrow();
                if inner.queue.len() <= 1 {
                    break;
                }
                inner.queue.front().map(|f| (f.start_pos, f.end_pos))
            };
            let Some((head_start, head_end)) = head else { break };
            // Last entry of the head segment.
            let flushed_limit = self.inner.borrow().flushed_index * IDX_ENTRY_LEN;
            if head_end > flushed_limit {
                break;
            }
            let buf = self
                .files
                .read_exact_at(head_end - IDX_ENTRY_LEN, IDX_ENTRY_LEN as usize)
                .await?;
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf);
            let last_ref = u64::from_le_bytes(b);
            if last_ref >= log_start_pos {
                break;
            }
            let round = self
                .files
                .delete_head_while(|f| f.start_pos == head_start)
                .await?;
            if round == 0 {
                break;
            }
            removed += round;
        }
        Ok(removed)
    }

    /// Drop everything and restart the stream so the next recorded index
    /// is `next_index`. Used after a snapshot install replaces the log.
    pub async fn reset_to(&self, next_index: u64) -> Result<()> {
        self.files.reset_to((next_index - 1) * IDX_ENTRY_LEN).await?;
        let mut inner = self.inner.borrow_mut();
        inner.next_index = next_index;
        inner.cache_first = next_index;
        inner.cache.clear();
        inner.flushed_index = next_index - 1;
        Ok(())
    }
}
