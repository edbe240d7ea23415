//! Ordered queue of fixed-size append-only segment files.
//!
//! Filenames are the zero-padded byte offset of the segment's first byte
//! within the logical stream. The queue verifies on init that every file
//! has exactly `file_size` bytes, starts on a `file_size` boundary and
//! follows its predecessor without gaps.
//!
//! One allocation and one head deletion may be in flight at a time; both
//! run on the I/O executor and are applied back on the owning fiber.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use skf_core::{RaftError, Result};
use skf_fiber::{FiberFuture, IoExecutor, io_retry};

/// One fixed-size segment plus the record metadata reclamation needs.
pub struct LogFile {
    pub start_pos: u64,
    pub end_pos: u64,
    pub path: PathBuf,
    pub file: Arc<File>,
    /// Index of the first record in this segment; 0 when unknown.
    pub first_index: u64,
    /// Index of the last record in this segment; 0 when unknown.
    pub last_index: u64,
    /// Timestamp of the last record in this segment.
    pub last_timestamp: u64,
    /// Wall-clock millis after which this segment may be reclaimed.
    pub delete_at_millis: Option<u64>,
}

pub(crate) struct QueueInner {
    pub(crate) queue: VecDeque<LogFile>,
    pub(crate) start_pos: u64,
    pub(crate) end_pos: u64,
    allocating: Option<FiberFuture<LogFile>>,
    deleting: bool,
}

pub struct FileQueue {
    dir: PathBuf,
    file_size: u64,
    shift_bits: u32,
    io: Arc<IoExecutor>,
    retry_intervals: Vec<Duration>,
    pub(crate) inner: RefCell<QueueInner>,
}

fn file_name_for(pos: u64) -> String {
    format!("{pos:020}")
}

fn parse_file_name(name: &str) -> Option<u64> {
    if name.len() != 20 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

fn open_segment(path: &Path, create: bool) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .open(path)
}

impl FileQueue {
    pub fn new(
        dir: PathBuf,
        file_size: u64,
        io: Arc<IoExecutor>,
        retry_intervals: Vec<Duration>,
    ) -> Result<Self> {
        if file_size == 0 || !file_size.is_power_of_two() {
            return Err(RaftError::Config(format!(
                "segment size must be a power of two, got {file_size}"
            )));
        }
        Ok(Self {
            dir,
            file_size,
            shift_bits: file_size.trailing_zeros(),
            io,
            retry_intervals,
            inner: RefCell::new(QueueInner {
                queue: VecDeque::new(),
                start_pos: 0,
                end_pos: 0,
                allocating: None,
                deleting: false,
            }),
        })
    }

    #[inline]
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[inline]
    #[must_use]
    pub fn shift_bits(&self) -> u32 {
        self.shift_bits
    }

    #[must_use]
    pub fn start_pos(&self) -> u64 {
        self.inner.borrow().start_pos
    }

    #[must_use]
    pub fn end_pos(&self) -> u64 {
        self.inner.borrow().end_pos
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Scan the directory, open every segment and verify size, alignment
    /// and contiguity.
    pub async fn init(&self) -> Result<()> {
        let dir = self.dir.clone();
        let file_size = self.file_size;
        let scanned = self
            .io
            .submit(move || {
                std::fs::create_dir_all(&dir)?;
                let mut found: Vec<(u64, PathBuf)> = Vec::new();
                for entry in std::fs::read_dir(&dir)? {
                    let entry = entry?;
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if let Some(start_pos) = parse_file_name(name) {
                        found.push((start_pos, entry.path()));
                    }
                }
                found.sort_by_key(|(pos, _)| *pos);
                let last = found.len().saturating_sub(1);
                let mut files = Vec::with_capacity(found.len());
                for (i, (start_pos, path)) in found.into_iter().enumerate() {
                    let file = open_segment(&path, false)?;
                    let len = file.metadata()?.len();
                    if len != file_size {
                        if i == last {
                            // A crash mid-allocation leaves a short tail
                            // segment; drop it and carry on.
                            tracing::warn!(
                                target: "skiff::store",
                                path = %path.display(),
                                len,
                                "removing partially allocated tail segment"
                            );
                            drop(file);
                            std::fs::remove_file(&path)?;
                            break;
                        }
                        return Err(RaftError::Corrupted {
                            offset: start_pos,
                            reason: format!(
                                "segment {} has {len} bytes, expected {file_size}",
                                path.display()
                            ),
                        });
                    }
                    files.push((start_pos, path, file));
                }
                Ok(files)
            })
            .await?;

        let mut inner = self.inner.borrow_mut();
        for (start_pos, path, file) in scanned {
            if start_pos & (self.file_size - 1) != 0 {
                return Err(RaftError::Corrupted {
                    offset: start_pos,
                    reason: format!("segment {} start not aligned", path.display()),
                });
            }
            if let Some(prev) = inner.queue.back() {
                if start_pos != prev.end_pos {
                    return Err(RaftError::Corrupted {
                        offset: start_pos,
                        reason: format!(
                            "segment {} does not follow previous end {}",
                            path.display(),
                            prev.end_pos
                        ),
                    });
                }
            }
            inner.queue.push_back(LogFile {
                start_pos,
                end_pos: start_pos + self.file_size,
                path,
                file: Arc::new(file),
                first_index: 0,
                last_index: 0,
                last_timestamp: 0,
                delete_at_millis: None,
            });
        }
        if let (Some(first_start_pos), Some(last_end_pos)) = (
            inner.queue.front().map(|f| f.start_pos),
            inner.queue.back().map(|l| l.end_pos),
        ) {
            inner.start_pos = first_start_pos;
            inner.end_pos = last_end_pos;
            tracing::info!(
                target: "skiff::store",
                dir = %self.dir.display(),
                files = inner.queue.len(),
                start = inner.start_pos,
                end = inner.end_pos,
                "loaded segment queue"
            );
        }
        Ok(())
    }

    /// Locate the segment containing stream position `pos`. Returns the
    /// file handle, the segment start and the offset inside the file.
    pub fn locate(&self, pos: u64) -> Result<(Arc<File>, u64, u64)> {
        let inner = self.inner.borrow();
        if pos < inner.start_pos || pos >= inner.end_pos {
            return Err(RaftError::Corrupted {
                offset: pos,
                reason: format!(
                    "position outside queue [{}, {})",
                    inner.start_pos, inner.end_pos
                ),
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let idx = ((pos - inner.start_pos) >> self.shift_bits) as usize;
        let file = &inner.queue[idx];
        Ok((Arc::clone(&file.file), file.start_pos, pos - file.start_pos))
    }

    /// Await any in-flight allocation until `pos` is writable, then kick
    /// off pre-allocation of the next segment.
    pub async fn ensure_write_pos_ready(&self, pos: u64) -> Result<()> {
        loop {
            let pending = {
                let mut inner = self.inner.borrow_mut();
                if pos < inner.end_pos {
                    break;
                }
                match inner.allocating.take() {
                    Some(f) => f,
                    None => {
                        let end_pos = inner.end_pos;
                        drop(inner);
                        self.start_allocation(end_pos)
                    }
                }
            };
            let intervals = self.retry_intervals.clone();
            // The allocation future is single-shot; on failure restart it.
            let file = io_retry(&intervals, {
                let mut pending = Some(pending);
                move || {
                    let fut = pending.take().map_or_else(
                        || {
                            let end_pos = self.inner.borrow().end_pos;
                            self.start_allocation(end_pos)
                        },
                        |f| f,
                    );
                    fut
                }
            })
            .await?;
            let mut inner = self.inner.borrow_mut();
            inner.end_pos = file.end_pos;
            inner.queue.push_back(file);
            if inner.queue.len() == 1 {
                inner.start_pos = inner.queue[0].start_pos;
            }
        }
        // Eagerly pre-allocate the next segment.
        let mut inner = self.inner.borrow_mut();
        if inner.allocating.is_none() {
            let end_pos = inner.end_pos;
            drop(inner);
            let fut = self.start_allocation(end_pos);
            self.inner.borrow_mut().allocating = Some(fut);
        }
        Ok(())
    }

    fn start_allocation(&self, start_pos: u64) -> FiberFuture<LogFile> {
        let path = self.dir.join(file_name_for(start_pos));
        let file_size = self.file_size;
        self.io.submit(move || {
            let file = open_segment(&path, true)?;
            // Reserve the blocks by touching the last byte.
            file.write_all_at(&[0u8], file_size - 1)?;
            file.sync_all()?;
            tracing::info!(
                target: "skiff::store",
                path = %path.display(),
                "allocated segment"
            );
            Ok(LogFile {
                start_pos,
                end_pos: start_pos + file_size,
                path,
                file: Arc::new(file),
                first_index: 0,
                last_index: 0,
                last_timestamp: 0,
                delete_at_millis: None,
            })
        })
    }

    /// Write `buf` at stream position `pos`. Writes to one file are
    /// serialised by keying the submission on the segment start.
    pub fn submit_write(&self, pos: u64, buf: Vec<u8>) -> Result<FiberFuture<()>> {
        let (file, file_start, offset) = self.locate(pos)?;
        debug_assert!(offset + buf.len() as u64 <= self.file_size);
        Ok(self.io.submit_keyed(file_start, move || {
            file.write_all_at(&buf, offset)?;
            Ok(())
        }))
    }

    /// Flush one segment's data to stable storage, ordered after all
    /// writes submitted to it.
    pub fn submit_sync(&self, pos: u64) -> Result<FiberFuture<()>> {
        let (file, file_start, _) = self.locate(pos)?;
        Ok(self.io.submit_keyed(file_start, move || {
            file.sync_data()?;
            Ok(())
        }))
    }

    /// Write with the group's backoff schedule. Retries re-submit the
    /// whole buffer; positional writes make that idempotent.
    pub async fn write_retry(&self, pos: u64, data: Vec<u8>) -> Result<()> {
        let intervals = self.retry_intervals.clone();
        io_retry(&intervals, || match self.submit_write(pos, data.clone()) {
            Ok(future) => future,
            Err(e) => FiberFuture::ready(Err(e)),
        })
        .await
    }

    /// Fsync with the group's backoff schedule.
    pub async fn sync_retry(&self, pos: u64) -> Result<()> {
        let intervals = self.retry_intervals.clone();
        io_retry(&intervals, || match self.submit_sync(pos) {
            Ok(future) => future,
            Err(e) => FiberFuture::ready(Err(e)),
        })
        .await
    }

    /// Read exactly `len` bytes at stream position `pos`. Records never
    /// straddle segments, so a read never does either.
    pub async fn read_exact_at(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let (file, _, offset) = self.locate(pos)?;
        self.io
            .submit(move || {
                let mut buf = vec![0u8; len];
                file.read_exact_at(&mut buf, offset)?;
                Ok(buf)
            })
            .await
    }

    /// Delete head segments for which `should_delete` answers true, one
    /// at a time, always retaining the last segment. Returns the number
    /// of segments removed.
    pub async fn delete_head_while<F>(&self, should_delete: F) -> Result<usize>
    where
        F: Fn(&LogFile) -> bool,
    {
        let mut removed = 0usize;
        loop {
            let job = {
                let mut inner = self.inner.borrow_mut();
                if inner.deleting || inner.queue.len() <= 1 {
                    break;
                }
                let Some(head) = inner.queue.front() else {
                    break;
                };
                if !should_delete(head) {
                    break;
                }
                let path = head.path.clone();
                inner.deleting = true;
                path
            };
            let path = job.clone();
            let result = self
                .io
                .submit(move || {
                    std::fs::remove_file(&path)?;
                    Ok(())
                })
                .await;
            let mut inner = self.inner.borrow_mut();
            inner.deleting = false;
            match result {
                Ok(()) => {
                    inner.queue.pop_front();
                    if let Some(head) = inner.queue.front() {
                        inner.start_pos = head.start_pos;
                    }
                    removed += 1;
                    tracing::info!(
                        target: "skiff::store",
                        path = %job.display(),
                        "deleted segment"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        target: "skiff::store",
                        path = %job.display(),
                        "delete segment failed: {e}"
                    );
                    break;
                }
            }
        }
        Ok(removed)
    }

    /// Drop every segment and rebase the stream at the segment boundary
    /// at or below `pos`. Used when a snapshot replaces the whole prefix.
    pub async fn reset_to(&self, pos: u64) -> Result<()> {
        let paths: Vec<PathBuf> = {
            let inner = self.inner.borrow();
            inner.queue.iter().map(|f| f.path.clone()).collect()
        };
        self.io
            .submit(move || {
                for path in paths {
                    std::fs::remove_file(&path)?;
                }
                Ok(())
            })
            .await?;
        let mut inner = self.inner.borrow_mut();
        inner.queue.clear();
        let base = pos & !(self.file_size - 1);
        inner.start_pos = base;
        inner.end_pos = base;
        inner.allocating = None;
        Ok(())
    }

    /// Run `f` over every segment, oldest first.
    pub fn for_each_file<F: FnMut(&mut LogFile)>(&self, mut f: F) {
        let mut inner = self.inner.borrow_mut();
        for file in &mut inner.queue {
            f(file);
        }
    }
}
