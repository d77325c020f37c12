//! Store location: metadata plus atomically-visible snapshots.
//!
//! Layout under the configured location:
//! `store.json` (identity and format versions), `snapshots/` (model images,
//! one file per snapshot), `journal/` (owned by [`crate::journal`]).
//! Snapshot writes are temp-then-rename with a directory fsync, so a crash
//! mid-write leaves the previous snapshot intact.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::codec::{Codec, CodecError, JsonCodec};
use crate::journal::SegmentId;
use crate::model::Model;

const STORE_FORMAT_VERSION: u32 = 1;
const JOURNAL_FORMAT_VERSION: u32 = 1;
const META_FILE: &str = "store.json";
const SNAPSHOT_DIR: &str = "snapshots";
const MAX_SNAPSHOT_NAME_LEN: usize = 64;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no store at {location:?}")]
    NotFound { location: PathBuf },

    #[error("store already exists at {location:?}")]
    AlreadyExists { location: PathBuf },

    #[error("store at {location:?} cannot be loaded: {reason}")]
    Incompatible { location: PathBuf, reason: String },

    #[error("store meta parse failed at {path:?}: {source}")]
    MetaParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A named location holding at most one snapshot head plus store metadata.
pub trait Storage<M: Model>: Send + Sync {
    fn exists(&self) -> bool;

    fn can_create(&self) -> bool;

    /// Fails with `Incompatible` when the location holds a store this build
    /// cannot load.
    fn verify_can_load(&self) -> StorageResult<()>;

    /// Initialize the location: metadata plus an initial snapshot associated
    /// with segment 0. Fails with `AlreadyExists` on a populated location.
    fn create(&self, initial: &M) -> StorageResult<()>;

    /// The most recent complete snapshot and the journal segment recovery
    /// resumes from; `(None, segment 0)` when no snapshot exists.
    fn latest_snapshot(&self) -> StorageResult<(Option<M>, SegmentId)>;

    /// Write a snapshot atomically. `resume` is the segment the journal will
    /// rotate to immediately after this write.
    fn write_snapshot(&self, model: &M, name: &str, resume: SegmentId) -> StorageResult<()>;

    fn list_snapshots(&self) -> StorageResult<Vec<SnapshotInfo>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub resume_segment: SegmentId,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoreMeta {
    store_id: Uuid,
    store_format_version: u32,
    journal_format_version: u32,
    created_at_ms: u64,
}

/// Directory-backed storage using the engine's codec for model images and
/// plain JSON for its own metadata.
pub struct FileStorage<C: Codec = JsonCodec> {
    root: PathBuf,
    codec: C,
}

impl<C: Codec> FileStorage<C> {
    pub fn new(root: impl Into<PathBuf>, codec: C) -> Self {
        FileStorage {
            root: root.into(),
            codec,
        }
    }

    fn meta_path(&self) -> PathBuf {
        self.root.join(META_FILE)
    }

    fn snapshot_dir(&self) -> PathBuf {
        self.root.join(SNAPSHOT_DIR)
    }

    fn read_meta(&self) -> StorageResult<StoreMeta> {
        let path = self.meta_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound {
                    location: self.root.clone(),
                });
            }
            Err(source) => return Err(io_err(&path, source)),
        };
        serde_json::from_slice(&bytes).map_err(|source| StorageError::MetaParse { path, source })
    }

    fn write_file_atomic(&self, dir: &Path, file_name: &str, bytes: &[u8]) -> StorageResult<()> {
        let tmp_path = dir.join(format!("{file_name}.tmp"));
        let final_path = dir.join(file_name);

        // Truncate rather than create_new: a crash between temp write and
        // rename may leave a stale temp file under the same name.
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|source| io_err(&tmp_path, source))?;
        file.write_all(bytes)
            .map_err(|source| io_err(&tmp_path, source))?;
        file.sync_all().map_err(|source| io_err(&tmp_path, source))?;

        fs::rename(&tmp_path, &final_path).map_err(|source| io_err(&final_path, source))?;
        fsync_dir(dir)
    }
}

impl<M: Model, C: Codec> Storage<M> for FileStorage<C> {
    fn exists(&self) -> bool {
        self.meta_path().is_file()
    }

    fn can_create(&self) -> bool {
        !self.meta_path().exists()
    }

    fn verify_can_load(&self) -> StorageResult<()> {
        let meta = self.read_meta()?;
        if meta.store_format_version != STORE_FORMAT_VERSION {
            return Err(StorageError::Incompatible {
                location: self.root.clone(),
                reason: format!(
                    "store format {} unsupported (expected {STORE_FORMAT_VERSION})",
                    meta.store_format_version
                ),
            });
        }
        if meta.journal_format_version != JOURNAL_FORMAT_VERSION {
            return Err(StorageError::Incompatible {
                location: self.root.clone(),
                reason: format!(
                    "journal format {} unsupported (expected {JOURNAL_FORMAT_VERSION})",
                    meta.journal_format_version
                ),
            });
        }
        Ok(())
    }

    fn create(&self, initial: &M) -> StorageResult<()> {
        if <Self as Storage<M>>::exists(self) {
            return Err(StorageError::AlreadyExists {
                location: self.root.clone(),
            });
        }
        fs::create_dir_all(&self.root).map_err(|source| io_err(&self.root, source))?;
        fs::create_dir_all(self.snapshot_dir())
            .map_err(|source| io_err(&self.snapshot_dir(), source))?;

        let meta = StoreMeta {
            store_id: new_store_id(),
            store_format_version: STORE_FORMAT_VERSION,
            journal_format_version: JOURNAL_FORMAT_VERSION,
            created_at_ms: now_ms(),
        };
        let bytes = serde_json::to_vec(&meta).map_err(|source| StorageError::MetaParse {
            path: self.meta_path(),
            source,
        })?;
        self.write_file_atomic(&self.root, META_FILE, &bytes)?;

        <Self as Storage<M>>::write_snapshot(self, initial, "initial", SegmentId::ZERO)
    }

    fn latest_snapshot(&self) -> StorageResult<(Option<M>, SegmentId)> {
        let snapshots = <Self as Storage<M>>::list_snapshots(self)?;
        let Some(info) = snapshots.last() else {
            return Ok((None, SegmentId::ZERO));
        };
        let bytes = fs::read(&info.path).map_err(|source| io_err(&info.path, source))?;
        let model = self.codec.decode(&bytes)?;
        Ok((Some(model), info.resume_segment))
    }

    fn write_snapshot(&self, model: &M, name: &str, resume: SegmentId) -> StorageResult<()> {
        let dir = self.snapshot_dir();
        fs::create_dir_all(&dir).map_err(|source| io_err(&dir, source))?;

        let bytes = self.codec.encode(model)?;
        let file_name = snapshot_file_name(resume, name);
        self.write_file_atomic(&dir, &file_name, &bytes)?;
        tracing::info!(snapshot = %file_name, segment = %resume, "snapshot written");
        Ok(())
    }

    fn list_snapshots(&self) -> StorageResult<Vec<SnapshotInfo>> {
        let dir = self.snapshot_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_err(&dir, source)),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| io_err(&dir, source))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some((resume_segment, snapshot_name)) = parse_snapshot_file_name(name) {
                snapshots.push(SnapshotInfo {
                    resume_segment,
                    name: snapshot_name,
                    path: entry.path(),
                });
            }
        }
        snapshots.sort_by(|a, b| {
            (a.resume_segment, &a.name).cmp(&(b.resume_segment, &b.name))
        });
        Ok(snapshots)
    }
}

fn snapshot_file_name(resume: SegmentId, name: &str) -> String {
    let sanitized = sanitize_snapshot_name(name);
    if sanitized.is_empty() {
        format!("snapshot-{:020}.db", resume.get())
    } else {
        format!("snapshot-{:020}-{sanitized}.db", resume.get())
    }
}

fn parse_snapshot_file_name(file_name: &str) -> Option<(SegmentId, String)> {
    let rest = file_name.strip_prefix("snapshot-")?.strip_suffix(".db")?;
    let digits = rest.get(..20)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let resume = SegmentId::new(digits.parse().ok()?);
    let name = match rest.get(20..) {
        None | Some("") => String::new(),
        Some(tail) => tail.strip_prefix('-')?.to_string(),
    };
    Some((resume, name))
}

fn sanitize_snapshot_name(name: &str) -> String {
    name.chars()
        .take(MAX_SNAPSHOT_NAME_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn new_store_id() -> Uuid {
    let mut rng = rand::rng();
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    Uuid::from_bytes(bytes)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn fsync_dir(dir: &Path) -> StorageResult<()> {
    let file = File::open(dir).map_err(|source| io_err(dir, source))?;
    file.sync_all().map_err(|source| io_err(dir, source))?;
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}
