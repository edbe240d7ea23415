//! Log segment queue: record layout, append, restore and truncation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use skf_core::{RaftError, Result, Term};
use skf_fiber::IoExecutor;

use crate::file_queue::FileQueue;
use crate::idx_queue::IdxFileQueue;
use crate::record::{
    self, LogItem, MIN_RECORD_LEN, PADDING_MAGIC, PADDING_MIN_LEN, RECORD_FIXED_LEN, RECORD_MAGIC,
    RecordHeader,
};

struct LogInner {
    write_pos: u64,
}

pub struct LogFileQueue {
    files: FileQueue,
    max_body_size: usize,
    inner: RefCell<LogInner>,
}

impl LogFileQueue {
    pub fn new(
        dir: PathBuf,
        file_size: u64,
        io: Arc<IoExecutor>,
        retry_intervals: Vec<Duration>,
        max_body_size: usize,
    ) -> Result<Self> {
        if file_size < MIN_RECORD_LEN as u64 {
            return Err(RaftError::Config(format!(
                "log segment size {file_size} smaller than one record"
            )));
        }
        Ok(Self {
            files: FileQueue::new(dir, file_size, io, retry_intervals)?,
            max_body_size,
            inner: RefCell::new(LogInner { write_pos: 0 }),
        })
    }

    pub async fn init(&self) -> Result<()> {
        self.files.init().await
    }

    #[must_use]
    pub fn write_pos(&self) -> u64 {
        self.inner.borrow().write_pos
    }

    #[must_use]
    pub fn start_pos(&self) -> u64 {
        self.files.start_pos()
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.file_count()
    }

    fn file_end(&self, pos: u64) -> u64 {
        let file_size = self.files.file_size();
        (pos / file_size + 1) * file_size
    }

    /// Append an index-contiguous batch: lay records out (padding at
    /// segment tails), write through the I/O executor, fsync every
    /// touched segment, then record and flush the index entries.
    pub async fn append(&self, idx: &IdxFileQueue, items: &[LogItem]) -> Result<()> {
        if items.is_empty() {
            skf_core::bug("append with empty batch");
            return Ok(());
        }
        let file_size = self.files.file_size();
        let mut pos = self.inner.borrow().write_pos;
        let mut batches: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut buf = Vec::new();
        let mut buf_start = pos;
        let mut positions = Vec::with_capacity(items.len());
        // file start -> (first index, last index, last timestamp)
        let mut meta: HashMap<u64, (u64, u64, u64)> = HashMap::new();

        for item in items {
            if item.body.len() > self.max_body_size {
                return Err(RaftError::BodyTooLarge {
                    size: item.body.len(),
                    max: self.max_body_size,
                });
            }
            let need = item.encoded_len() as u64;
            if need > file_size {
                return Err(RaftError::BodyTooLarge {
                    size: item.encoded_len(),
                    max: usize::try_from(file_size).unwrap_or(usize::MAX),
                });
            }
            let rem = self.file_end(pos) - pos;
            if need > rem {
                // The record would straddle the boundary: pad the tail.
                #[allow(clippy::cast_possible_truncation)]
                let rem = rem as usize;
                if rem >= PADDING_MIN_LEN {
                    record::encode_padding(&mut buf, rem);
                } else {
                    buf.resize(buf.len() + rem, 0);
                }
                pos += rem as u64;
                if !buf.is_empty() {
                    batches.push((buf_start, std::mem::take(&mut buf)));
                }
                buf_start = pos;
            }
            positions.push((item.index, pos));
            let file_start = pos & !(file_size - 1);
            let entry = meta.entry(file_start).or_insert((item.index, 0, 0));
            entry.1 = item.index;
            entry.2 = item.timestamp;
            item.encode_into(&mut buf);
            pos += need;
        }
        if !buf.is_empty() {
            batches.push((buf_start, buf));
        }

        for (start, data) in batches {
            self.files
                .ensure_write_pos_ready(start + data.len() as u64 - 1)
                .await?;
            self.files.write_retry(start, data).await?;
            self.files.sync_retry(start).await?;
        }

        for (index, record_pos) in positions {
            idx.put(index, record_pos)?;
        }
        idx.flush().await?;

        self.files.for_each_file(|file| {
            if let Some((first, last, ts)) = meta.get(&file.start_pos) {
                if file.first_index == 0 {
                    file.first_index = *first;
                }
                file.last_index = *last;
                file.last_timestamp = *ts;
            }
        });
        self.inner.borrow_mut().write_pos = pos;
        Ok(())
    }

    /// Read and CRC-validate the record at `pos`.
    async fn read_record(&self, pos: u64) -> Result<LogItem> {
        let head = self
            .files
            .read_exact_at(pos, RECORD_FIXED_LEN)
            .await?;
        let header = RecordHeader::decode(&head)?;
        if header.magic != RECORD_MAGIC {
            return Err(RaftError::Corrupted {
                offset: pos,
                reason: format!("bad magic {:#x}", header.magic),
            });
        }
        let total = header.expected_len()?;
        let buf = self.files.read_exact_at(pos, total).await?;
        record::decode_record(&buf)
    }

    /// Load up to `limit` items (or `bytes_limit` payload bytes) starting
    /// at `index`. Always returns at least one item on success.
    pub async fn load(
        &self,
        idx: &IdxFileQueue,
        index: u64,
        limit: usize,
        bytes_limit: usize,
    ) -> Result<Vec<LogItem>> {
        let mut items = Vec::new();
        let mut bytes = 0usize;
        let mut next = index;
        while items.len() < limit && next < idx.next_index() {
            let pos = idx.load_log_pos(next).await?;
            let item = self.read_record(pos).await?;
            if item.index != next {
                return Err(RaftError::Corrupted {
                    offset: pos,
                    reason: format!("index mismatch: record {} expected {next}", item.index),
                });
            }
            bytes += item.payload_len();
            items.push(item);
            next += 1;
            if bytes >= bytes_limit && !items.is_empty() {
                break;
            }
        }
        if items.is_empty() {
            return Err(RaftError::Internal(format!(
                "no items at index {index}, next {}",
                idx.next_index()
            )));
        }
        Ok(items)
    }

    /// Term of the record at `index`.
    pub async fn term_at(&self, idx: &IdxFileQueue, index: u64) -> Result<Term> {
        let pos = idx.load_log_pos(index).await?;
        let head = self.files.read_exact_at(pos, RECORD_FIXED_LEN).await?;
        let header = RecordHeader::decode(&head)?;
        if header.magic != RECORD_MAGIC || header.index != index {
            return Err(RaftError::Corrupted {
                offset: pos,
                reason: "term lookup hit an invalid record".into(),
            });
        }
        Ok(header.term)
    }

    /// Scan forward from `scan_pos`, validating CRC and index
    /// continuity, and truncate at the first broken record. The first
    /// valid record must carry `first_expected`; with `strict` (the scan
    /// starts at a committed record) a missing or broken first record is
    /// data loss rather than a torn tail. Returns the `(term, index)` of
    /// the last valid record.
    pub async fn restore(
        &self,
        idx: &IdxFileQueue,
        first_expected: u64,
        scan_pos: u64,
        strict: bool,
    ) -> Result<(Term, u64)> {
        if self.files.file_count() == 0 {
            if strict {
                return Err(RaftError::Corrupted {
                    offset: 0,
                    reason: format!("log empty but record {first_expected} is committed"),
                });
            }
            idx.begin_restore(first_expected);
            return Ok((0, 0));
        }

        idx.begin_restore(first_expected);
        let mut pos = scan_pos;
        let end_pos = self.files.end_pos();
        let mut last_term: Term = 0;
        let mut last_index: u64 = 0;
        let mut first_record = true;

        'scan: while pos < end_pos {
            let rem = self.file_end(pos) - pos;
            #[allow(clippy::cast_possible_truncation)]
            let rem_usize = rem as usize;
            if rem_usize < PADDING_MIN_LEN {
                pos += rem;
                continue;
            }
            let probe_len = rem_usize.min(RECORD_FIXED_LEN);
            let probe = self.files.read_exact_at(pos, probe_len).await?;
            let magic = u32::from_le_bytes([probe[0], probe[1], probe[2], probe[3]]);
            if magic == PADDING_MAGIC {
                // Padding always runs to the end of the segment.
                pos = self.file_end(pos);
                continue;
            }
            if magic != RECORD_MAGIC || probe_len < RECORD_FIXED_LEN {
                break;
            }
            let Ok(header) = RecordHeader::decode(&probe) else {
                break;
            };
            let Ok(total) = header.expected_len() else {
                break;
            };
            if total as u64 > rem {
                break;
            }
            let buf = self.files.read_exact_at(pos, total).await?;
            let item = match record::decode_record(&buf) {
                Ok(item) => item,
                Err(e) => {
                    if first_record && strict {
                        // The committed record itself is broken; this is
                        // data loss, not a torn tail.
                        return Err(e);
                    }
                    tracing::warn!(
                        target: "skiff::store",
                        pos,
                        "stopping restore at broken record: {e}"
                    );
                    break 'scan;
                }
            };
            if first_record {
                if item.index != first_expected {
                    if strict {
                        return Err(RaftError::Corrupted {
                            offset: pos,
                            reason: format!(
                                "commit record index {} expected {first_expected}",
                                item.index
                            ),
                        });
                    }
                    break;
                }
            } else if item.index != last_index + 1 || item.prev_log_term != last_term {
                tracing::warn!(
                    target: "skiff::store",
                    pos,
                    index = item.index,
                    "stopping restore at continuity break"
                );
                break;
            }
            idx.put(item.index, pos)?;
            let file_size = self.files.file_size();
            let file_start = pos & !(file_size - 1);
            self.files.for_each_file(|file| {
                if file.start_pos == file_start {
                    if file.first_index == 0 {
                        file.first_index = item.index;
                    }
                    file.last_index = item.index;
                    file.last_timestamp = item.timestamp;
                }
            });
            last_term = item.term;
            last_index = item.index;
            first_record = false;
            pos += total as u64;
        }

        if first_record && strict {
            return Err(RaftError::Corrupted {
                offset: pos,
                reason: format!("commit record {first_expected} not found"),
            });
        }
        self.inner.borrow_mut().write_pos = pos;
        idx.flush().await?;
        tracing::info!(
            target: "skiff::store",
            last_term,
            last_index,
            write_pos = pos,
            "log restored"
        );
        Ok((last_term, last_index))
    }

    /// Move the write position back to `data_pos`; later appends
    /// overwrite the abandoned tail.
    pub fn truncate_tail(&self, data_pos: u64) {
        let mut inner = self.inner.borrow_mut();
        tracing::warn!(
            target: "skiff::store",
            from = inner.write_pos,
            to = data_pos,
            "truncating log tail"
        );
        inner.write_pos = data_pos;
        self.files.for_each_file(|file| {
            if file.start_pos >= data_pos {
                file.first_index = 0;
                file.last_index = 0;
                file.last_timestamp = 0;
                file.delete_at_millis = None;
            }
        });
    }

    /// Mark head segments wholly below `bound_pos` for deletion at
    /// `delete_at_millis`.
    pub fn mark_delete_below(&self, bound_pos: u64, delete_at_millis: u64) {
        self.files.for_each_file(|file| {
            if file.end_pos <= bound_pos && file.delete_at_millis.is_none() {
                file.delete_at_millis = Some(delete_at_millis);
            }
        });
    }

    /// Mark head segments whose last record is at or before `timestamp`
    /// and wholly below `bound_pos`.
    pub fn mark_delete_by_timestamp(&self, bound_pos: u64, timestamp: u64, delete_at_millis: u64) {
        self.files.for_each_file(|file| {
            if file.end_pos <= bound_pos
                && file.last_timestamp <= timestamp
                && file.delete_at_millis.is_none()
            {
                file.delete_at_millis = Some(delete_at_millis);
            }
        });
    }

    /// Delete marked, due head segments. At most one round runs at a
    /// time; the queue always keeps its last segment.
    pub async fn delete_due(&self, now_millis: u64) -> Result<usize> {
        self.files
            .delete_head_while(|file| {
                file.delete_at_millis
                    .is_some_and(|due| now_millis >= due)
            })
            .await
    }

    /// Drop all segments and restart the stream at `base_pos` after a
    /// snapshot install replaced the prefix.
    pub async fn reset_to(&self, base_pos: u64) -> Result<()> {
        self.files.reset_to(base_pos).await?;
        self.inner.borrow_mut().write_pos = base_pos;
        Ok(())
    }
}
