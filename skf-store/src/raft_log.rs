//! The group-facing log: log segments plus index plus reclamation.

use std::cell::Cell;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use skf_core::{RaftError, Result, Term};
use skf_fiber::IoExecutor;

use crate::idx_queue::IdxFileQueue;
use crate::log_queue::LogFileQueue;
use crate::record::LogItem;

/// Minimum spacing between reclamation rounds.
const DELETE_ROUND_INTERVAL: Duration = Duration::from_secs(10);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

pub struct RaftLog {
    log_files: LogFileQueue,
    idx_files: IdxFileQueue,
    last_delete_round: Cell<Option<Instant>>,
}

impl RaftLog {
    pub fn new(
        data_dir: &Path,
        log_file_size: u64,
        idx_file_size: u64,
        max_body_size: usize,
        io: Arc<IoExecutor>,
        retry_intervals: Vec<Duration>,
    ) -> Result<Self> {
        Ok(Self {
            log_files: LogFileQueue::new(
                data_dir.join("log"),
                log_file_size,
                Arc::clone(&io),
                retry_intervals.clone(),
                max_body_size,
            )?,
            idx_files: IdxFileQueue::new(
                data_dir.join("idx"),
                idx_file_size,
                io,
                retry_intervals,
            )?,
            last_delete_round: Cell::new(None),
        })
    }

    /// Open both queues and recover. When the commit index lies beyond
    /// the snapshot boundary its record must exist: the scan starts
    /// there, located through the index. Otherwise the committed prefix
    /// lives in the snapshot and the log holds only entries after it.
    /// Returns the last `(term, index)` actually recovered.
    pub async fn init(&self, commit_index: u64, snapshot_index: u64) -> Result<(Term, u64)> {
        self.log_files.init().await?;
        self.idx_files.init().await?;
        self.idx_files.set_commit_index(commit_index);

        let strict = commit_index > snapshot_index && commit_index > 0;
        let (first_expected, scan_pos) = if strict {
            // The restore scan has not rebuilt the cache yet; the entry
            // must come from disk.
            let stream_pos = (commit_index - 1) * crate::idx_queue::IDX_ENTRY_LEN;
            let buf = self
                .idx_read_raw(stream_pos)
                .await
                .map_err(|e| RaftError::Corrupted {
                    offset: stream_pos,
                    reason: format!("commit index {commit_index} not in idx: {e}"),
                })?;
            (commit_index, u64::from_le_bytes(buf))
        } else {
            (snapshot_index + 1, self.log_files.start_pos())
        };

        let (last_term, last_index) = self
            .log_files
            .restore(&self.idx_files, first_expected, scan_pos, strict)
            .await?;
        Ok((last_term, last_index))
    }

    async fn idx_read_raw(&self, stream_pos: u64) -> Result<[u8; 8]> {
        self.idx_files.load_raw(stream_pos).await
    }

    /// Next index to be appended.
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.idx_files.next_index()
    }

    #[must_use]
    pub fn log_segment_count(&self) -> usize {
        self.log_files.file_count()
    }

    /// Keep the index retention floor in step with the commit index.
    pub fn set_commit_index(&self, commit_index: u64) {
        self.idx_files.set_commit_index(commit_index);
    }

    /// Append a batch with contiguous indexes.
    ///
    /// `first == next`: plain append. `first < next`: the caller is
    /// overwriting a divergent tail; truncate index and log to the first
    /// index, then append. `first > next`: fatal gap.
    pub async fn append(&self, items: Vec<LogItem>) -> Result<()> {
        let Some(first) = items.first().map(|i| i.index) else {
            skf_core::bug("append with empty batch");
            return Ok(());
        };
        let next = self.idx_files.next_index();
        if first == next {
            self.log_files.append(&self.idx_files, &items).await
        } else if first < next {
            let data_pos = self.idx_files.truncate_tail(first).await?;
            self.log_files.truncate_tail(data_pos);
            self.log_files.append(&self.idx_files, &items).await
        } else {
            Err(RaftError::LogGap {
                first,
                expected: next,
            })
        }
    }

    /// Load up to `limit` items / `bytes_limit` payload bytes from
    /// `index`.
    pub async fn load(&self, index: u64, limit: usize, bytes_limit: usize) -> Result<Vec<LogItem>> {
        self.log_files
            .load(&self.idx_files, index, limit, bytes_limit)
            .await
    }

    pub async fn term_at(&self, index: u64) -> Result<Term> {
        self.log_files.term_at(&self.idx_files, index).await
    }

    /// Mark segments holding only entries at or below `max_index` for
    /// deletion after `delay_millis`. Capped at `commit_index - 1`.
    pub async fn mark_truncate_by_index(
        &self,
        max_index: u64,
        commit_index: u64,
        delay_millis: u64,
    ) -> Result<()> {
        let max_index = max_index.min(commit_index.saturating_sub(1));
        if max_index == 0 {
            return Ok(());
        }
        let bound_pos = self.idx_files.load_log_pos(max_index + 1).await?;
        self.log_files
            .mark_delete_below(bound_pos, now_millis() + delay_millis);
        Ok(())
    }

    /// Mark committed segments whose newest record is at or before
    /// `timestamp_millis`.
    pub async fn mark_truncate_by_timestamp(
        &self,
        commit_index: u64,
        timestamp_millis: u64,
        delay_millis: u64,
    ) -> Result<()> {
        if commit_index <= 1 {
            return Ok(());
        }
        let bound_pos = self.idx_files.load_log_pos(commit_index).await?;
        self.log_files.mark_delete_by_timestamp(
            bound_pos,
            timestamp_millis,
            now_millis() + delay_millis,
        );
        Ok(())
    }

    /// One reclamation round: delete due log segments, then index
    /// segments whose entries all reference reclaimed log positions.
    /// Rounds are spaced at least [`DELETE_ROUND_INTERVAL`] apart.
    pub async fn do_delete(&self) -> Result<()> {
        let now = Instant::now();
        if let Some(last) = self.last_delete_round.get() {
            if now.duration_since(last) < DELETE_ROUND_INTERVAL {
                return Ok(());
            }
        }
        self.do_delete_now().await
    }

    /// Run a reclamation round immediately, bypassing the interval.
    pub async fn do_delete_now(&self) -> Result<()> {
        self.last_delete_round.set(Some(Instant::now()));
        let removed = self.log_files.delete_due(now_millis()).await?;
        if removed > 0 {
            self.idx_files
                .delete_head_files(self.log_files.start_pos())
                .await?;
        }
        Ok(())
    }

    /// Replace the whole log with a snapshot boundary: everything is
    /// dropped and the next append is `last_included_index + 1`.
    pub async fn install_snapshot_reset(&self, last_included_index: u64) -> Result<()> {
        let next = last_included_index + 1;
        self.idx_files.reset_to(next).await?;
        // Rebase the log at a fresh segment boundary; the index entry for
        // the first post-snapshot record will point here.
        self.log_files.reset_to(0).await?;
        Ok(())
    }
}
