//! Fsynced per-group status record: `{current_term, voted_for,
//! commit_index, crc32}`.
//!
//! The commit index stored here is a restart hint; the restore scan is
//! the authority. Updates go write-temp-then-rename so a crash never
//! leaves a half-written record.

use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::Arc;

use skf_core::{NodeId, RaftError, Result, Term, crc32};
use skf_fiber::IoExecutor;

const STATUS_LEN: usize = 4 + 4 + 8 + 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusRecord {
    pub current_term: Term,
    /// 0 encodes "none".
    pub voted_for: NodeId,
    pub commit_index: u64,
}

impl StatusRecord {
    fn encode(self) -> [u8; STATUS_LEN] {
        let mut buf = [0u8; STATUS_LEN];
        buf[0..4].copy_from_slice(&self.current_term.to_le_bytes());
        buf[4..8].copy_from_slice(&self.voted_for.to_le_bytes());
        buf[8..16].copy_from_slice(&self.commit_index.to_le_bytes());
        let crc = crc32(&buf[..16]);
        buf[16..20].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < STATUS_LEN {
            return Err(RaftError::Corrupted {
                offset: 0,
                reason: format!("status file has {} bytes, need {STATUS_LEN}", buf.len()),
            });
        }
        let stored = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let actual = crc32(&buf[..16]);
        if stored != actual {
            return Err(RaftError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }
        Ok(Self {
            current_term: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            voted_for: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            commit_index: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
        })
    }
}

pub struct StatusManager {
    path: PathBuf,
    io: Arc<IoExecutor>,
    cached: RefCell<StatusRecord>,
}

impl StatusManager {
    pub fn new(path: PathBuf, io: Arc<IoExecutor>) -> Self {
        Self {
            path,
            io,
            cached: RefCell::new(StatusRecord::default()),
        }
    }

    /// Load the record, or start fresh when the file does not exist.
    pub async fn init(&self) -> Result<StatusRecord> {
        let path = self.path.clone();
        let record = self
            .io
            .submit(move || {
                if !path.exists() {
                    return Ok(StatusRecord::default());
                }
                let buf = std::fs::read(&path)?;
                StatusRecord::decode(&buf)
            })
            .await?;
        *self.cached.borrow_mut() = record;
        tracing::info!(
            target: "skiff::store",
            term = record.current_term,
            voted_for = record.voted_for,
            commit_index = record.commit_index,
            "status loaded"
        );
        Ok(record)
    }

    #[must_use]
    pub fn current(&self) -> StatusRecord {
        *self.cached.borrow()
    }

    /// Persist a new record: write to a temp file, fsync, rename.
    /// Writes are keyed on the path so overlapping updates apply in
    /// submission order.
    pub async fn persist(&self, record: StatusRecord) -> Result<()> {
        *self.cached.borrow_mut() = record;
        let path = self.path.clone();
        let key = {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            path.hash(&mut hasher);
            hasher.finish()
        };
        self.io
            .submit_keyed(key, move || {
                let tmp = path.with_extension("tmp");
                {
                    let mut file = std::fs::File::create(&tmp)?;
                    use std::io::Write;
                    file.write_all(&record.encode())?;
                    file.sync_all()?;
                }
                std::fs::rename(&tmp, &path)?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_record_round_trip() {
        let record = StatusRecord {
            current_term: 9,
            voted_for: 2,
            commit_index: 1234,
        };
        let buf = record.encode();
        assert_eq!(StatusRecord::decode(&buf).unwrap(), record);
    }

    #[test]
    fn test_status_record_corruption_detected() {
        let record = StatusRecord {
            current_term: 9,
            voted_for: 2,
            commit_index: 1234,
        };
        let mut buf = record.encode();
        buf[5] ^= 0x10;
        assert!(StatusRecord::decode(&buf).is_err());
    }
}
