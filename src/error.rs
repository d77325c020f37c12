//! Engine-level and command-level error surfaces.
//!
//! Capability errors (`StorageError`, `JournalError`, `CodecError`) live next
//! to their capability; `EngineError` is a thin wrapper over them plus the
//! execution-pipeline failures the engine itself raises.

use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::journal::JournalError;
use crate::storage::StorageError;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by user command code from `prepare`, `execute`, or `redo`.
///
/// The two variants carry different contracts: `Rejected` promises the model
/// was not modified, `Failed` makes no such promise and triggers rollback.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommandError {
    /// Clean refusal. Surfaced to the caller unchanged; no rollback.
    #[error("command rejected: {reason}")]
    Rejected { reason: String },

    /// Failure that may have left the model partially mutated. The engine
    /// discards the live model and rebuilds it from snapshot plus journal.
    #[error("command failed: {source}")]
    Failed {
        #[source]
        source: BoxedError,
    },
}

impl CommandError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        CommandError::Rejected {
            reason: reason.into(),
        }
    }

    pub fn failed(source: impl Into<BoxedError>) -> Self {
        CommandError::Failed {
            source: source.into(),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("engine is closed")]
    Disposed,

    #[error("identity `{identity}` may not run {operation}")]
    Unauthorized { operation: String, identity: String },

    #[error("timed out after {waited:?} waiting for the {mode} lock")]
    LockTimeout {
        mode: &'static str,
        waited: Duration,
    },

    /// User-signalled refusal, surfaced unchanged. The model is unmodified
    /// by the `CommandError::Rejected` contract.
    #[error("command rejected: {reason}")]
    CommandRejected { reason: String },

    /// The command failed after it may have mutated the model. The model has
    /// been restored from the latest snapshot plus journal replay.
    #[error("command failed, state rolled back: {source}")]
    CommandFailed {
        #[source]
        source: BoxedError,
    },

    /// The rollback rebuild itself failed. The engine has been closed; the
    /// durable state remains a consistent prefix of accepted commands.
    #[error("rollback failed, engine closed: {source}")]
    RollbackFailed {
        #[source]
        source: BoxedError,
    },

    #[error("no snapshot found and no initial model constructor supplied")]
    NoInitialSnapshot,

    #[error("replay of journaled command {sequence} failed: {source}")]
    ReplayFailed {
        sequence: u64,
        #[source]
        source: BoxedError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
