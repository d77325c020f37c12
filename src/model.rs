//! User-facing model, command, and query abstractions.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::Authorizer;
use crate::error::CommandError;

/// The aggregate root the engine owns: the sole mutable state.
///
/// A model must be serializable (snapshots, replay) and deterministic under
/// its commands: replaying the same command sequence from the same starting
/// point must always yield the same state.
///
/// `Command` is the journal representation of every mutation this model
/// accepts — conventionally an enum with one variant per command type.
/// Individual command structs implement [`Command`] with a typed output plus
/// `Into<Model::Command>` for their canonical journal form.
pub trait Model: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Command: Command<Self> + Send;

    /// Called after the model was loaded from a snapshot, before replay.
    fn snapshot_restored(&mut self) {}

    /// Called after journal replay completed.
    fn journal_restored(&mut self) {}

    /// Optional authorization handle, probed once at engine construction.
    ///
    /// Rules that depend on live model state should share it with the model
    /// through interior `Arc`s; the handle is consulted without any lock.
    fn authorizer(&self) -> Option<Arc<dyn Authorizer>> {
        None
    }
}

/// A deterministic, serializable mutation of the model.
///
/// `prepare` validates against a consistent read view and runs under the
/// upgrade lock; taking `&M` makes it side-effect-free by construction.
/// `execute` runs under the exclusive write lock and must be total once
/// `prepare` succeeded. `redo` is `execute` in replay context; override it
/// when live execution has effects (notifications, external side channels)
/// that must not repeat during recovery.
pub trait Command<M: Model>: Serialize + DeserializeOwned + Send {
    type Output;

    fn prepare(&self, model: &M) -> Result<(), CommandError> {
        let _ = model;
        Ok(())
    }

    fn execute(&self, model: &mut M) -> Result<Self::Output, CommandError>;

    fn redo(&self, model: &mut M) -> Result<(), CommandError> {
        self.execute(model).map(|_| ())
    }
}

/// A read-only function over the model. Never journaled.
pub trait Query<M: Model> {
    type Output;

    fn execute(&self, model: &M) -> Self::Output;
}

impl<M, F, R> Query<M> for F
where
    M: Model,
    F: Fn(&M) -> R,
{
    type Output = R;

    fn execute(&self, model: &M) -> R {
        self(model)
    }
}
