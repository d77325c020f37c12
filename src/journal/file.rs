//! File-backed journal: ordinal segment files, open-time tail repair,
//! fsynced appends, snapshot-driven rotation.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crc32c::crc32c;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{Codec, JsonCodec};
use crate::model::Model;

use super::frame::{encode_frame, FrameReader, FRAME_HEADER_LEN, FRAME_MAGIC};
use super::{
    CommandJournal, JournalEntries, JournalEntry, JournalError, JournalOpenStats, JournalResult,
    SegmentId,
};

const SEGMENT_MAGIC: &[u8; 6] = b"PVSEG1";
const SEGMENT_FORMAT_VERSION: u32 = 1;
const SEGMENT_HEADER_LEN: usize = SEGMENT_MAGIC.len() + 4 + 8 + 4;
const DEFAULT_MAX_ENTRY_BYTES: usize = 16 << 20;

/// Journal over ordinal `segment-NNN.log` files under `<location>/journal`.
pub struct FileJournal<C: Codec = JsonCodec> {
    dir: PathBuf,
    codec: C,
    max_entry_bytes: usize,
    active: Option<ActiveSegment>,
    current_id: SegmentId,
    next_sequence: u64,
}

struct ActiveSegment {
    path: PathBuf,
    file: File,
}

/// Borrowed twin of [`JournalEntry`] so appends serialize without cloning
/// the command. Field names must match.
#[derive(Serialize)]
struct EntryRef<'a, Cmd> {
    sequence: u64,
    command: &'a Cmd,
}

struct TailScan {
    last_sequence: Option<u64>,
    truncated_from: Option<u64>,
}

impl<C: Codec> FileJournal<C> {
    pub fn new(location: impl Into<PathBuf>, codec: C) -> Self {
        FileJournal {
            dir: location.into().join("journal"),
            codec,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            active: None,
            current_id: SegmentId::ZERO,
            next_sequence: 1,
        }
    }

    pub fn with_max_entry_bytes(mut self, max_entry_bytes: usize) -> Self {
        self.max_entry_bytes = max_entry_bytes;
        self
    }

    fn segment_path(&self, id: SegmentId) -> PathBuf {
        self.dir.join(segment_file_name(id))
    }

    fn list_segments(&self) -> JournalResult<Vec<SegmentId>> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|source| io_err(&self.dir, source))?;
        for entry in entries {
            let entry = entry.map_err(|source| io_err(&self.dir, source))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = parse_segment_file_name(name) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn create_segment(&self, id: SegmentId) -> JournalResult<ActiveSegment> {
        let file_name = segment_file_name(id);
        let tmp_path = self.dir.join(format!("{file_name}.tmp"));
        let final_path = self.dir.join(&file_name);

        // Truncate rather than create_new: a crash between temp write and
        // rename may leave a stale temp file under the same name.
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|source| io_err(&tmp_path, source))?;
        file.write_all(&encode_segment_header(id))
            .map_err(|source| io_err(&tmp_path, source))?;
        file.sync_all().map_err(|source| io_err(&tmp_path, source))?;

        fs::rename(&tmp_path, &final_path).map_err(|source| io_err(&final_path, source))?;
        fsync_dir(&self.dir)?;

        let file = OpenOptions::new()
            .append(true)
            .open(&final_path)
            .map_err(|source| io_err(&final_path, source))?;
        Ok(ActiveSegment {
            path: final_path,
            file,
        })
    }

    fn rotate(&mut self) -> JournalResult<SegmentId> {
        let active = self.active.as_mut().ok_or(JournalError::Closed)?;
        active
            .file
            .sync_all()
            .map_err(|source| io_err(&active.path, source))?;

        let next = self.current_id.next();
        self.active = Some(self.create_segment(next)?);
        self.current_id = next;
        tracing::info!(segment = %next, "journal segment rotated");
        Ok(next)
    }

    /// Walk one segment frame by frame, validating every entry.
    ///
    /// A short frame at end of file, or a crc mismatch on the final frame,
    /// is a torn write: truncated when `repair_tail` is set, fatal
    /// otherwise. Any other bad frame is mid-file corruption and always
    /// fatal.
    fn scan_segment<Cmd: DeserializeOwned>(
        &self,
        id: SegmentId,
        repair_tail: bool,
    ) -> JournalResult<TailScan> {
        let path = self.segment_path(id);
        let mut file = OpenOptions::new()
            .read(true)
            .write(repair_tail)
            .open(&path)
            .map_err(|source| io_err(&path, source))?;
        let file_len = file
            .metadata()
            .map_err(|source| io_err(&path, source))?
            .len();

        let mut header = [0u8; SEGMENT_HEADER_LEN];
        if file_len < SEGMENT_HEADER_LEN as u64 {
            return Err(JournalError::SegmentHeaderInvalid {
                path,
                reason: "segment file shorter than header".to_string(),
            });
        }
        file.read_exact(&mut header)
            .map_err(|source| io_err(&path, source))?;
        check_segment_header(&path, id, &header)?;

        let mut offset = SEGMENT_HEADER_LEN as u64;
        let mut last_sequence = None;
        let mut truncated_from = None;

        while offset < file_len {
            let remaining = file_len - offset;
            if remaining < FRAME_HEADER_LEN as u64 {
                truncated_from = Some(offset);
                break;
            }

            let mut frame_header = [0u8; FRAME_HEADER_LEN];
            file.read_exact(&mut frame_header)
                .map_err(|source| io_err(&path, source))?;
            let magic = u32::from_le_bytes([
                frame_header[0],
                frame_header[1],
                frame_header[2],
                frame_header[3],
            ]);
            let length = u32::from_le_bytes([
                frame_header[4],
                frame_header[5],
                frame_header[6],
                frame_header[7],
            ]);
            let expected_crc = u32::from_le_bytes([
                frame_header[8],
                frame_header[9],
                frame_header[10],
                frame_header[11],
            ]);

            let frame_len = FRAME_HEADER_LEN as u64 + length as u64;
            if frame_len > remaining {
                truncated_from = Some(offset);
                break;
            }

            if magic != FRAME_MAGIC || length == 0 {
                return Err(JournalError::Corrupt {
                    path,
                    offset,
                    reason: format!("invalid frame header (magic {magic:#x}, length {length})"),
                });
            }
            if length as usize > self.max_entry_bytes {
                return Err(JournalError::Corrupt {
                    path,
                    offset,
                    reason: format!(
                        "frame length {length} exceeds max entry bytes {}",
                        self.max_entry_bytes
                    ),
                });
            }

            let mut body = vec![0u8; length as usize];
            file.read_exact(&mut body)
                .map_err(|source| io_err(&path, source))?;
            let actual_crc = crc32c(&body);
            if actual_crc != expected_crc {
                if offset.saturating_add(frame_len) == file_len {
                    truncated_from = Some(offset);
                    break;
                }
                return Err(JournalError::Corrupt {
                    path,
                    offset,
                    reason: format!(
                        "frame crc mismatch (expected {expected_crc:#x}, got {actual_crc:#x})"
                    ),
                });
            }

            let entry: JournalEntry<Cmd> =
                self.codec
                    .decode(&body)
                    .map_err(|source| JournalError::Corrupt {
                        path: path.clone(),
                        offset,
                        reason: format!("entry decode failed: {source}"),
                    })?;
            last_sequence = Some(entry.sequence);
            offset = offset.saturating_add(frame_len);
        }

        if let Some(from) = truncated_from {
            if !repair_tail {
                return Err(JournalError::Corrupt {
                    path,
                    offset: from,
                    reason: "torn frame in sealed segment".to_string(),
                });
            }
            file.set_len(offset).map_err(|source| io_err(&path, source))?;
            file.sync_all().map_err(|source| io_err(&path, source))?;
        }

        Ok(TailScan {
            last_sequence,
            truncated_from,
        })
    }
}

impl<M: Model, C: Codec> CommandJournal<M> for FileJournal<C> {
    fn open(&mut self, resume_floor: SegmentId) -> JournalResult<JournalOpenStats> {
        fs::create_dir_all(&self.dir).map_err(|source| io_err(&self.dir, source))?;

        let ids = self.list_segments()?;
        let mut stats = JournalOpenStats {
            segments: ids.len(),
            truncated_from_offset: None,
        };

        match ids.last().copied() {
            Some(tail) => {
                let scan = self.scan_segment::<M::Command>(tail, true)?;
                if let Some(offset) = scan.truncated_from {
                    stats.truncated_from_offset = Some(offset);
                    tracing::warn!(segment = %tail, offset, "truncated torn journal tail");
                }

                let mut last_sequence = scan.last_sequence;
                if last_sequence.is_none() {
                    for &id in ids.iter().rev().skip(1) {
                        let scan = self.scan_segment::<M::Command>(id, false)?;
                        if scan.last_sequence.is_some() {
                            last_sequence = scan.last_sequence;
                            break;
                        }
                    }
                }
                self.next_sequence = last_sequence.map_or(1, |seq| seq.saturating_add(1));

                let path = self.segment_path(tail);
                let file = OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .map_err(|source| io_err(&path, source))?;
                self.active = Some(ActiveSegment { path, file });
                self.current_id = tail;

                // A snapshot referencing a segment past the tail means the
                // rotation after that snapshot never completed.
                while self.current_id < resume_floor {
                    self.rotate()?;
                }
            }
            None => {
                self.active = Some(self.create_segment(resume_floor)?);
                self.current_id = resume_floor;
                self.next_sequence = 1;
            }
        }

        Ok(stats)
    }

    fn close(&mut self) -> JournalResult<()> {
        if let Some(active) = self.active.take() {
            active
                .file
                .sync_all()
                .map_err(|source| io_err(&active.path, source))?;
        }
        Ok(())
    }

    fn append(&mut self, command: &M::Command) -> JournalResult<u64> {
        let sequence = self.next_sequence;
        let body = self.codec.encode(&EntryRef { sequence, command })?;
        let frame = encode_frame(&body, self.max_entry_bytes)?;

        let active = self.active.as_mut().ok_or(JournalError::Closed)?;
        active
            .file
            .write_all(&frame)
            .map_err(|source| io_err(&active.path, source))?;
        // Full fsync: the append is acknowledged only once recoverable.
        active
            .file
            .sync_all()
            .map_err(|source| io_err(&active.path, source))?;

        self.next_sequence = sequence.saturating_add(1);
        Ok(sequence)
    }

    fn entries_from(&self, segment: SegmentId) -> JournalResult<JournalEntries<'_, M::Command>> {
        let mut ids = self.list_segments()?;
        ids.retain(|id| *id >= segment);
        let segments = ids
            .into_iter()
            .map(|id| (id, self.segment_path(id)))
            .collect();
        Ok(Box::new(EntryIter {
            codec: &self.codec,
            max_entry_bytes: self.max_entry_bytes,
            segments,
            current: None,
            _command: PhantomData,
        }))
    }

    fn current_segment(&self) -> SegmentId {
        self.current_id
    }

    fn create_next_segment(&mut self) -> JournalResult<SegmentId> {
        self.rotate()
    }
}

struct EntryIter<'a, Cmd, C> {
    codec: &'a C,
    max_entry_bytes: usize,
    segments: VecDeque<(SegmentId, PathBuf)>,
    current: Option<(PathBuf, FrameReader<BufReader<File>>)>,
    _command: PhantomData<Cmd>,
}

impl<Cmd: DeserializeOwned, C: Codec> EntryIter<'_, Cmd, C> {
    fn open_next_segment(&mut self) -> JournalResult<bool> {
        let Some((id, path)) = self.segments.pop_front() else {
            return Ok(false);
        };
        let mut file = File::open(&path).map_err(|source| io_err(&path, source))?;
        let mut header = [0u8; SEGMENT_HEADER_LEN];
        file.read_exact(&mut header)
            .map_err(|source| io_err(&path, source))?;
        check_segment_header(&path, id, &header)?;
        file.seek(SeekFrom::Start(SEGMENT_HEADER_LEN as u64))
            .map_err(|source| io_err(&path, source))?;
        let reader = FrameReader::new(BufReader::new(file), self.max_entry_bytes);
        self.current = Some((path, reader));
        Ok(true)
    }
}

impl<Cmd: DeserializeOwned, C: Codec> Iterator for EntryIter<'_, Cmd, C> {
    type Item = JournalResult<JournalEntry<Cmd>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                match self.open_next_segment() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(err) => return Some(Err(err)),
                }
            }

            let (path, reader) = self.current.as_mut()?;
            match reader.read_next() {
                Ok(Some(body)) => {
                    let offset = reader.offset();
                    return Some(self.codec.decode(&body).map_err(|source| {
                        JournalError::Corrupt {
                            path: path.clone(),
                            offset,
                            reason: format!("entry decode failed: {source}"),
                        }
                    }));
                }
                Ok(None) => {
                    self.current = None;
                }
                Err(err) => {
                    let offset = reader.offset();
                    let path = path.clone();
                    self.current = None;
                    return Some(Err(JournalError::Corrupt {
                        path,
                        offset,
                        reason: err.to_string(),
                    }));
                }
            }
        }
    }
}

fn segment_file_name(id: SegmentId) -> String {
    format!("segment-{:020}.log", id.get())
}

fn parse_segment_file_name(name: &str) -> Option<SegmentId> {
    let digits = name.strip_prefix("segment-")?.strip_suffix(".log")?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(SegmentId::new)
}

fn encode_segment_header(id: SegmentId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SEGMENT_HEADER_LEN);
    buf.extend_from_slice(SEGMENT_MAGIC);
    buf.extend_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&id.get().to_le_bytes());
    let crc = crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn check_segment_header(
    path: &Path,
    expected: SegmentId,
    header: &[u8; SEGMENT_HEADER_LEN],
) -> JournalResult<()> {
    let invalid = |reason: String| JournalError::SegmentHeaderInvalid {
        path: path.to_path_buf(),
        reason,
    };

    if &header[..SEGMENT_MAGIC.len()] != SEGMENT_MAGIC {
        return Err(invalid("segment magic mismatch".to_string()));
    }
    let mut offset = SEGMENT_MAGIC.len();
    let version = u32::from_le_bytes([
        header[offset],
        header[offset + 1],
        header[offset + 2],
        header[offset + 3],
    ]);
    if version != SEGMENT_FORMAT_VERSION {
        return Err(invalid(format!(
            "unsupported segment format {version}, supported {SEGMENT_FORMAT_VERSION}"
        )));
    }
    offset += 4;
    let id = u64::from_le_bytes([
        header[offset],
        header[offset + 1],
        header[offset + 2],
        header[offset + 3],
        header[offset + 4],
        header[offset + 5],
        header[offset + 6],
        header[offset + 7],
    ]);
    offset += 8;
    let expected_crc = u32::from_le_bytes([
        header[offset],
        header[offset + 1],
        header[offset + 2],
        header[offset + 3],
    ]);
    let actual_crc = crc32c(&header[..offset]);
    if actual_crc != expected_crc {
        return Err(invalid(format!(
            "segment header crc mismatch (expected {expected_crc:#x}, got {actual_crc:#x})"
        )));
    }
    if id != expected.get() {
        return Err(invalid(format!(
            "segment id {id} does not match file name {expected}"
        )));
    }
    Ok(())
}

fn fsync_dir(dir: &Path) -> JournalResult<()> {
    let file = File::open(dir).map_err(|source| io_err(dir, source))?;
    file.sync_all().map_err(|source| io_err(dir, source))?;
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> JournalError {
    JournalError::Io {
        path: path.to_path_buf(),
        source,
    }
}
