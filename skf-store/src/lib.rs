//! Segmented persistent log store.
//!
//! The on-disk layout per group:
//!
//! ```text
//! <datadir>/status       fsynced term + voted_for + commit_index
//! <datadir>/log/<20d>    log segments, each exactly log_file_size bytes
//! <datadir>/idx/<20d>    index segments, each exactly idx_file_size bytes
//! ```
//!
//! Segment filenames are the byte offset of the segment's first byte in
//! the logical append-only stream, zero-padded to 20 decimal digits.
//! Log records never straddle a segment boundary; a padding record fills
//! the tail instead. The index maps `log_index -> log_file_position` as
//! fixed 8-byte entries fronted by a mem-cache.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod file_queue;
mod idx_queue;
mod log_queue;
mod raft_log;
mod record;
mod status;

pub use file_queue::{FileQueue, LogFile};
pub use idx_queue::{IDX_ENTRY_LEN, IdxFileQueue};
pub use log_queue::LogFileQueue;
pub use raft_log::RaftLog;
pub use record::{
    LogItem, MIN_RECORD_LEN, PADDING_MAGIC, RECORD_FIXED_LEN, RECORD_MAGIC, RecordHeader,
    decode_record, encode_padding,
};
pub use status::{StatusManager, StatusRecord};
