//! The engine: single-writer execution pipeline over one in-memory model.
//!
//! Commands run in two phases: `prepare` under the upgrade lock (consistent
//! reads, other readers keep running), then `execute` under the exclusive
//! write lock, then the durable journal append. The append happens only
//! after a successful execute: a command that failed live is never replayed.
//! The price is that a crash between execute and append loses that command's
//! effect, which the caller observes as a missing acknowledgement; durable
//! state always remains a prefix of accepted commands.
//!
//! When execute fails after it may have mutated the model, the engine
//! discards the live model and rebuilds it from the latest snapshot plus
//! journal replay. The failing command was never appended, so the rebuild
//! yields exact pre-command state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::{AllowAll, Authorizer, Identity, Operation};
use crate::codec::{Codec, JsonCodec};
use crate::config::{EngineConfig, SnapshotBehavior};
use crate::error::{BoxedError, CommandError, EngineError};
use crate::journal::{CommandJournal, FileJournal, SegmentId};
use crate::model::{Command, Model, Query};
use crate::storage::{FileStorage, Storage};

const STATE_RUNNING: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// What restore found and replayed while opening the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub resume_segment: SegmentId,
    pub commands_replayed: u64,
    pub tail_truncated: bool,
}

/// Cloneable handle to one open store. All clones share the same model,
/// journal, and lock; the engine is designed to be shared across threads.
pub struct Engine<M: Model, C: Codec = JsonCodec> {
    inner: Arc<EngineInner<M, C>>,
}

impl<M: Model, C: Codec> Clone for Engine<M, C> {
    fn clone(&self) -> Self {
        Engine {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Model, C: Codec> std::fmt::Debug for Engine<M, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

struct EngineInner<M: Model, C: Codec> {
    config: EngineConfig,
    codec: C,
    authorizer: Arc<dyn Authorizer>,
    model: RwLock<M>,
    journal: Mutex<Box<dyn CommandJournal<M>>>,
    storage: Box<dyn Storage<M>>,
    state: AtomicU8,
    restore_stats: RestoreStats,
    snapshot_worker: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Model> Engine<M> {
    pub fn builder(config: EngineConfig) -> EngineBuilder<M> {
        EngineBuilder::new(config)
    }

    /// Open an existing store; fails if the location is absent or
    /// incompatible.
    pub fn load(config: EngineConfig) -> crate::Result<Self> {
        EngineBuilder::new(config).load()
    }

    /// Initialize a fresh store from `initial`, then open it. Fails if the
    /// location is already populated.
    pub fn create(initial: M, config: EngineConfig) -> crate::Result<Self> {
        EngineBuilder::new(config).create(initial)
    }

    /// Open the store if it exists, otherwise create it from `constructor`.
    pub fn load_or_create(
        constructor: impl FnOnce() -> M,
        config: EngineConfig,
    ) -> crate::Result<Self> {
        EngineBuilder::new(config).load_or_create(constructor)
    }

    /// [`Engine::load`] at the location derived from the model type name.
    pub fn load_default() -> crate::Result<Self> {
        Self::load(EngineConfig::for_model::<M>())
    }

    /// [`Engine::create`] at the location derived from the model type name.
    pub fn create_default(initial: M) -> crate::Result<Self> {
        Self::create(initial, EngineConfig::for_model::<M>())
    }

    /// [`Engine::load_or_create`] at the location derived from the model
    /// type name.
    pub fn load_or_create_default(constructor: impl FnOnce() -> M) -> crate::Result<Self> {
        Self::load_or_create(constructor, EngineConfig::for_model::<M>())
    }
}

impl<M: Model, C: Codec> Engine<M, C> {
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn restore_stats(&self) -> RestoreStats {
        self.inner.restore_stats.clone()
    }

    /// Run a read-only query under the read lock.
    pub fn query<Q>(&self, query: Q) -> crate::Result<Q::Output>
    where
        Q: Query<M>,
        Q::Output: Serialize + DeserializeOwned,
    {
        self.inner.ensure_running()?;
        self.inner.authorize(Operation::Query {
            type_name: short_type_name::<Q>(),
        })?;

        let guard = self.inner.read_guard()?;
        let result = query.execute(&guard);
        if self.inner.config.clone_results {
            return Ok(self.inner.codec.deep_clone(&result)?);
        }
        Ok(result)
    }

    /// Run a command: authorize, prepare under the upgrade lock, execute
    /// under the write lock, journal on success.
    pub fn execute<Cmd>(&self, command: Cmd) -> crate::Result<Cmd::Output>
    where
        Cmd: Command<M> + Into<M::Command>,
        Cmd::Output: Serialize + DeserializeOwned,
    {
        self.inner.ensure_running()?;
        self.inner.authorize(Operation::Command {
            type_name: short_type_name::<Cmd>(),
        })?;

        // The runner may diverge from the journaled original through
        // interior mutability; only the original is persisted.
        let runner_clone = if self.inner.config.clone_commands {
            Some(self.inner.codec.deep_clone(&command)?)
        } else {
            None
        };
        let runner = runner_clone.as_ref().unwrap_or(&command);

        let upgradable = self.inner.upgradable_guard()?;
        if let Err(err) = runner.prepare(&upgradable) {
            return Err(match err {
                CommandError::Rejected { reason } => EngineError::CommandRejected { reason },
                CommandError::Failed { source } => {
                    let mut write = RwLockUpgradableReadGuard::upgrade(upgradable);
                    self.inner.rollback(&mut write, source)
                }
            });
        }

        let mut write = match RwLockUpgradableReadGuard::try_upgrade_for(
            upgradable,
            self.inner.config.lock_timeout,
        ) {
            Ok(guard) => guard,
            Err(_upgradable) => return Err(self.inner.lock_timeout_error("write")),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| runner.execute(&mut write)));
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(CommandError::Rejected { reason })) => {
                return Err(EngineError::CommandRejected { reason });
            }
            Ok(Err(CommandError::Failed { source })) => {
                return Err(self.inner.rollback(&mut write, source));
            }
            Err(panic) => {
                return Err(self.inner.rollback(&mut write, panic_message(panic).into()));
            }
        };

        let result = if self.inner.config.clone_results {
            match self.inner.codec.deep_clone(&result) {
                Ok(clone) => clone,
                Err(err) => return Err(self.inner.rollback(&mut write, Box::new(err))),
            }
        } else {
            result
        };

        let appended = self.inner.journal.lock().append(&command.into());
        if let Err(err) = appended {
            return Err(self.inner.rollback(&mut write, Box::new(err)));
        }
        Ok(result)
    }

    /// Take a snapshot and rotate the journal. Runs concurrently with
    /// queries; blocks commands for the duration of the write.
    pub fn create_snapshot(&self, name: &str) -> crate::Result<()> {
        self.inner.ensure_running()?;
        self.inner.authorize(Operation::Snapshot)?;
        let guard = self.inner.read_guard()?;
        self.inner.write_snapshot_locked(&guard, name)
    }

    /// Close the engine. Double-close is a no-op; any further operation
    /// fails with `Disposed`.
    pub fn close(&self) -> crate::Result<()> {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_CLOSING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }

        let worker = self.inner.snapshot_worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }

        let result = if self.inner.config.snapshot_behavior == SnapshotBehavior::OnShutdown {
            // Readers stay admitted while the shutdown snapshot serializes;
            // the upgrade afterwards fences out everything before sealing.
            let guard = self.inner.model.upgradable_read();
            let snapshot_result = self.inner.write_snapshot_locked(&guard, "auto");
            let _write = RwLockUpgradableReadGuard::upgrade(guard);
            let close_result = self.inner.journal.lock().close();
            snapshot_result.and(close_result.map_err(EngineError::from))
        } else {
            let _write = self.inner.model.write();
            self.inner.journal.lock().close().map_err(EngineError::from)
        };

        self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
        result
    }
}

impl<M: Model, C: Codec> EngineInner<M, C> {
    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.state.load(Ordering::Acquire) == STATE_RUNNING {
            Ok(())
        } else {
            Err(EngineError::Disposed)
        }
    }

    fn authorize(&self, operation: Operation<'_>) -> Result<(), EngineError> {
        let identity = Identity::current();
        if self.authorizer.allows(&operation, &identity) {
            Ok(())
        } else {
            Err(EngineError::Unauthorized {
                operation: operation.to_string(),
                identity: identity.name().to_string(),
            })
        }
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, M>, EngineError> {
        self.model
            .try_read_for(self.config.lock_timeout)
            .ok_or_else(|| self.lock_timeout_error("read"))
    }

    fn upgradable_guard(&self) -> Result<RwLockUpgradableReadGuard<'_, M>, EngineError> {
        self.model
            .try_upgradable_read_for(self.config.lock_timeout)
            .ok_or_else(|| self.lock_timeout_error("upgrade"))
    }

    /// A timeout observed while the engine is closing reports as disposal.
    fn lock_timeout_error(&self, mode: &'static str) -> EngineError {
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            EngineError::Disposed
        } else {
            EngineError::LockTimeout {
                mode,
                waited: self.config.lock_timeout,
            }
        }
    }

    /// Snapshot the model and rotate the journal. The journal mutex is held
    /// across both steps: rotation must follow the snapshot durability
    /// barrier, and concurrent snapshots must serialize.
    fn write_snapshot_locked(&self, model: &M, name: &str) -> crate::Result<()> {
        let mut journal = self.journal.lock();
        let resume = journal.current_segment().next();
        self.storage.write_snapshot(model, name, resume)?;
        let created = journal.create_next_segment()?;
        debug_assert_eq!(created, resume);
        Ok(())
    }

    /// Replace the live model with a rebuild from durable state, then report
    /// the command failure. A failed rebuild poisons the engine.
    fn rollback(&self, model: &mut M, cause: BoxedError) -> EngineError {
        tracing::error!(error = %cause, "command failed, restoring model from durable state");
        match self.rebuild_model() {
            Ok(fresh) => {
                *model = fresh;
                EngineError::CommandFailed { source: cause }
            }
            Err(err) => {
                self.state.store(STATE_CLOSED, Ordering::SeqCst);
                tracing::error!(error = %err, "rollback failed, engine closed");
                EngineError::RollbackFailed {
                    source: Box::new(err),
                }
            }
        }
    }

    fn rebuild_model(&self) -> Result<M, EngineError> {
        let (snapshot, resume) = self.storage.latest_snapshot()?;
        let mut model = snapshot.ok_or(EngineError::NoInitialSnapshot)?;
        model.snapshot_restored();
        let journal = self.journal.lock();
        replay_journal(&mut model, &**journal, resume)?;
        model.journal_restored();
        Ok(model)
    }
}

impl<M: Model, C: Codec> Drop for EngineInner<M, C> {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) != STATE_CLOSED {
            if let Err(err) = self.journal.get_mut().close() {
                tracing::warn!(error = %err, "journal close on drop failed");
            }
        }
    }
}

/// Assembles an engine with optional collaborator overrides. Defaults:
/// [`FileStorage`] and [`FileJournal`] at the configured location,
/// [`JsonCodec`], and [`AllowAll`] unless the model supplies an authorizer.
pub struct EngineBuilder<M: Model, C: Codec = JsonCodec> {
    config: EngineConfig,
    codec: C,
    storage: Option<Box<dyn Storage<M>>>,
    journal: Option<Box<dyn CommandJournal<M>>>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl<M: Model> EngineBuilder<M> {
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder {
            config,
            codec: JsonCodec,
            storage: None,
            journal: None,
            authorizer: None,
        }
    }
}

impl<M: Model, C: Codec> EngineBuilder<M, C> {
    pub fn codec<C2: Codec>(self, codec: C2) -> EngineBuilder<M, C2> {
        EngineBuilder {
            config: self.config,
            codec,
            storage: self.storage,
            journal: self.journal,
            authorizer: self.authorizer,
        }
    }

    pub fn storage(mut self, storage: impl Storage<M> + 'static) -> Self {
        self.storage = Some(Box::new(storage));
        self
    }

    pub fn journal(mut self, journal: impl CommandJournal<M> + 'static) -> Self {
        self.journal = Some(Box::new(journal));
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn load(self) -> crate::Result<Engine<M, C>> {
        let (config, codec, storage, journal, authorizer) = self.into_parts();
        storage.verify_can_load()?;
        open(config, codec, storage, journal, authorizer, None::<fn() -> M>)
    }

    pub fn create(self, initial: M) -> crate::Result<Engine<M, C>> {
        let (config, codec, storage, journal, authorizer) = self.into_parts();
        storage.create(&initial)?;
        open(config, codec, storage, journal, authorizer, None::<fn() -> M>)
    }

    pub fn load_or_create(self, constructor: impl FnOnce() -> M) -> crate::Result<Engine<M, C>> {
        let (config, codec, storage, journal, authorizer) = self.into_parts();
        if storage.exists() {
            storage.verify_can_load()?;
            open(config, codec, storage, journal, authorizer, Some(constructor))
        } else {
            storage.create(&constructor())?;
            open(config, codec, storage, journal, authorizer, None::<fn() -> M>)
        }
    }

    #[allow(clippy::type_complexity)]
    fn into_parts(
        self,
    ) -> (
        EngineConfig,
        C,
        Box<dyn Storage<M>>,
        Box<dyn CommandJournal<M>>,
        Option<Arc<dyn Authorizer>>,
    ) {
        let EngineBuilder {
            config,
            codec,
            storage,
            journal,
            authorizer,
        } = self;
        let storage = storage
            .unwrap_or_else(|| Box::new(FileStorage::new(&config.location, codec.clone())));
        let journal = journal
            .unwrap_or_else(|| Box::new(FileJournal::new(&config.location, codec.clone())));
        (config, codec, storage, journal, authorizer)
    }
}

fn open<M: Model, C: Codec>(
    config: EngineConfig,
    codec: C,
    storage: Box<dyn Storage<M>>,
    mut journal: Box<dyn CommandJournal<M>>,
    authorizer_override: Option<Arc<dyn Authorizer>>,
    constructor: Option<impl FnOnce() -> M>,
) -> crate::Result<Engine<M, C>> {
    let (snapshot, resume) = storage.latest_snapshot()?;
    let mut model = match snapshot {
        Some(model) => model,
        None => match constructor {
            Some(constructor) => constructor(),
            None => return Err(EngineError::NoInitialSnapshot),
        },
    };
    model.snapshot_restored();

    let open_stats = journal.open(resume)?;
    let commands_replayed = replay_journal(&mut model, &*journal, resume)?;
    model.journal_restored();

    let restore_stats = RestoreStats {
        resume_segment: resume,
        commands_replayed,
        tail_truncated: open_stats.truncated_from_offset.is_some(),
    };
    tracing::info!(segment = %resume, replayed = commands_replayed, "store restored");

    let authorizer = model
        .authorizer()
        .or(authorizer_override)
        .unwrap_or_else(|| Arc::new(AllowAll));

    let engine = Engine {
        inner: Arc::new(EngineInner {
            config,
            codec,
            authorizer,
            model: RwLock::new(model),
            journal: Mutex::new(journal),
            storage,
            state: AtomicU8::new(STATE_RUNNING),
            restore_stats,
            snapshot_worker: Mutex::new(None),
        }),
    };

    if engine.inner.config.snapshot_behavior == SnapshotBehavior::AfterRestore {
        spawn_restore_snapshot(&engine);
    }

    Ok(engine)
}

/// Take the restore-time snapshot on a worker thread. The worker holds the
/// read lock before this function returns, so every command issued after
/// construction orders behind the snapshot.
fn spawn_restore_snapshot<M: Model, C: Codec>(engine: &Engine<M, C>) {
    let inner = Arc::clone(&engine.inner);
    let (ready_tx, ready_rx) = crossbeam::channel::bounded::<()>(1);
    let spawned = std::thread::Builder::new()
        .name("prevail-snapshot".to_string())
        .spawn(move || {
            let guard = inner.model.read();
            let _ = ready_tx.send(());
            if let Err(err) = inner.write_snapshot_locked(&guard, "auto") {
                tracing::error!(error = %err, "restore-time snapshot failed");
            }
        });

    match spawned {
        Ok(handle) => {
            let _ = ready_rx.recv();
            *engine.inner.snapshot_worker.lock() = Some(handle);
        }
        Err(err) => {
            tracing::warn!(error = %err, "snapshot worker spawn failed, snapshotting inline");
            let guard = engine.inner.model.read();
            if let Err(err) = engine.inner.write_snapshot_locked(&guard, "auto") {
                tracing::error!(error = %err, "restore-time snapshot failed");
            }
        }
    }
}

fn replay_journal<M: Model>(
    model: &mut M,
    journal: &dyn CommandJournal<M>,
    resume: SegmentId,
) -> Result<u64, EngineError> {
    let mut replayed = 0u64;
    for entry in journal.entries_from(resume)? {
        let entry = entry?;
        entry
            .command
            .redo(model)
            .map_err(|source| EngineError::ReplayFailed {
                sequence: entry.sequence,
                source: Box::new(source),
            })?;
        replayed += 1;
    }
    Ok(replayed)
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("command panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("command panicked: {message}")
    } else {
        "command panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Register {
        value: String,
    }

    impl Model for Register {
        type Command = RegisterCommand;
    }

    #[derive(Debug, Serialize, Deserialize)]
    enum RegisterCommand {
        Set(SetValue),
    }

    impl Command<Register> for RegisterCommand {
        type Output = ();

        fn execute(&self, model: &mut Register) -> Result<(), CommandError> {
            match self {
                RegisterCommand::Set(set) => set.execute(model).map(|_| ()),
            }
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct SetValue {
        value: String,
    }

    impl Command<Register> for SetValue {
        type Output = ();

        fn execute(&self, model: &mut Register) -> Result<(), CommandError> {
            model.value = self.value.clone();
            Ok(())
        }
    }

    impl From<SetValue> for RegisterCommand {
        fn from(set: SetValue) -> Self {
            RegisterCommand::Set(set)
        }
    }

    struct DenyCommands;

    impl Authorizer for DenyCommands {
        fn allows(&self, operation: &Operation<'_>, _identity: &Identity) -> bool {
            !matches!(operation, Operation::Command { .. })
        }
    }

    fn engine_at(temp: &TempDir) -> Engine<Register> {
        Engine::create(
            Register::default(),
            EngineConfig::new(temp.path().join("store")),
        )
        .unwrap()
    }

    #[test]
    fn operations_after_close_fail_disposed() {
        let temp = TempDir::new().unwrap();
        let engine = engine_at(&temp);
        engine.close().unwrap();
        engine.close().unwrap();

        let err = engine.query(|model: &Register| model.value.clone()).unwrap_err();
        assert!(matches!(err, EngineError::Disposed));
        let err = engine
            .execute(SetValue {
                value: "x".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Disposed));
    }

    #[test]
    fn denied_commands_do_not_reach_the_model() {
        let temp = TempDir::new().unwrap();
        let engine = Engine::builder(EngineConfig::new(temp.path().join("store")))
            .authorizer(Arc::new(DenyCommands))
            .create(Register::default())
            .unwrap();

        let err = engine
            .execute(SetValue {
                value: "x".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { .. }));
        let value = engine.query(|model: &Register| model.value.clone()).unwrap();
        assert_eq!(value, "");
    }

    #[test]
    fn load_missing_store_fails() {
        let temp = TempDir::new().unwrap();
        let err =
            Engine::<Register>::load(EngineConfig::new(temp.path().join("absent"))).unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }
}
