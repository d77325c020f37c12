//! Segmented, CRC-framed command journal.
//!
//! The journal is the durable total order of accepted commands. Segments are
//! ordinal: segment k+1 is created by the rotation that follows a snapshot,
//! so recovery loads the snapshot and replays entries from its associated
//! segment through the tail.

pub mod file;
pub mod frame;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::CodecError;
use crate::model::Model;

pub use file::FileJournal;
pub use frame::{encode_frame, FrameReader};

pub type JournalResult<T> = Result<T, JournalError>;

/// Ordinal position of a journal segment. Strictly increasing; segment 0 is
/// the one an initial snapshot resumes from.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SegmentId(u64);

impl SegmentId {
    pub const ZERO: SegmentId = SegmentId(0);

    pub fn new(ordinal: u64) -> Self {
        SegmentId(ordinal)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> SegmentId {
        SegmentId(self.0.saturating_add(1))
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One accepted command with its acceptance sequence number. Sequences are
/// strictly increasing across segments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry<Cmd> {
    pub sequence: u64,
    pub command: Cmd,
}

/// What `open` found and repaired.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JournalOpenStats {
    pub segments: usize,
    /// Byte offset a torn tail was truncated from, if any.
    pub truncated_from_offset: Option<u64>,
}

pub type JournalEntries<'a, Cmd> =
    Box<dyn Iterator<Item = JournalResult<JournalEntry<Cmd>>> + 'a>;

/// Ordered, durable, segmented log of accepted commands.
///
/// `append` is called strictly under the engine's write lock, so append order
/// equals acceptance order.
pub trait CommandJournal<M: Model>: Send {
    /// Scan segments, repair a torn tail, recover the next sequence number,
    /// and ensure the tail segment id is at least `resume_floor` (covers a
    /// crash between snapshot write and rotation).
    fn open(&mut self, resume_floor: SegmentId) -> JournalResult<JournalOpenStats>;

    /// Flush and seal the current segment. Idempotent.
    fn close(&mut self) -> JournalResult<()>;

    /// Durably append one command; returns its sequence number only after
    /// the bytes are recoverable.
    fn append(&mut self, command: &M::Command) -> JournalResult<u64>;

    /// Lazy, ordered stream of entries from `segment` through the tail.
    fn entries_from(&self, segment: SegmentId) -> JournalResult<JournalEntries<'_, M::Command>>;

    fn current_segment(&self) -> SegmentId;

    /// Seal the current segment and start the next one. Called immediately
    /// after a successful snapshot write; the new segment is the one that
    /// snapshot resumes from.
    fn create_next_segment(&mut self) -> JournalResult<SegmentId>;
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("journal is not open")]
    Closed,

    #[error("entry exceeds max bytes {max_bytes} (got {got_bytes})")]
    EntryTooLarge { max_bytes: usize, got_bytes: usize },

    #[error("frame magic mismatch: got {got:#x}")]
    FrameMagicMismatch { got: u32 },

    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },

    #[error("frame crc32c mismatch: expected {expected:#x}, got {got:#x}")]
    FrameCrcMismatch { expected: u32, got: u32 },

    #[error("segment header invalid at {path:?}: {reason}")]
    SegmentHeaderInvalid { path: PathBuf, reason: String },

    /// Mid-file damage. Fatal to open: skipping entries would make replay
    /// diverge from the accepted command order.
    #[error("journal corrupt at {path:?} offset {offset}: {reason}")]
    Corrupt {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),
}
