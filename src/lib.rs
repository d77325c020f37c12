#![forbid(unsafe_code)]

pub mod auth;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod journal;
pub mod model;
pub mod storage;

pub use auth::{AllowAll, Authorizer, Identity, Operation};
pub use codec::{Codec, CodecError, JsonCodec};
pub use config::{EngineConfig, SnapshotBehavior};
pub use engine::{Engine, EngineBuilder, RestoreStats};
pub use error::{CommandError, EngineError};
pub use journal::{
    CommandJournal, FileJournal, JournalEntry, JournalError, JournalOpenStats, SegmentId,
};
pub use model::{Command, Model, Query};
pub use storage::{FileStorage, SnapshotInfo, Storage, StorageError};

pub type Result<T> = std::result::Result<T, EngineError>;
