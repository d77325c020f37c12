//! End-to-end engine scenarios: durability, rollback, isolation, snapshots.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use prevail::{
    auth, Authorizer, Command, CommandError, Engine, EngineConfig, EngineError, FileStorage,
    Identity, JsonCodec, Model, Operation, SegmentId, SnapshotBehavior, Storage,
};

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct Counter {
    n: i64,
}

impl Counter {
    fn with(n: i64) -> Self {
        Counter { n }
    }
}

impl Model for Counter {
    type Command = CounterCommand;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum CounterCommand {
    Increment(Increment),
    FaultySet(FaultySet),
    GuardedIncrement(GuardedIncrement),
    SlowSet(SlowSet),
    PanickySet(PanickySet),
}

impl Command<Counter> for CounterCommand {
    type Output = ();

    fn prepare(&self, model: &Counter) -> Result<(), CommandError> {
        match self {
            CounterCommand::GuardedIncrement(command) => command.prepare(model),
            _ => Ok(()),
        }
    }

    fn execute(&self, model: &mut Counter) -> Result<(), CommandError> {
        match self {
            CounterCommand::Increment(command) => command.execute(model).map(|_| ()),
            CounterCommand::FaultySet(command) => command.execute(model),
            CounterCommand::GuardedIncrement(command) => command.execute(model).map(|_| ()),
            CounterCommand::SlowSet(command) => command.execute(model),
            CounterCommand::PanickySet(command) => command.execute(model),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Increment {
    by: i64,
}

impl Command<Counter> for Increment {
    type Output = i64;

    fn execute(&self, model: &mut Counter) -> Result<i64, CommandError> {
        model.n += self.by;
        Ok(model.n)
    }
}

impl From<Increment> for CounterCommand {
    fn from(command: Increment) -> Self {
        CounterCommand::Increment(command)
    }
}

/// Mutates the model, then fails: the engine must roll the mutation back.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FaultySet {
    value: i64,
}

impl Command<Counter> for FaultySet {
    type Output = ();

    fn execute(&self, model: &mut Counter) -> Result<(), CommandError> {
        model.n = self.value;
        Err(CommandError::failed("boom"))
    }
}

impl From<FaultySet> for CounterCommand {
    fn from(command: FaultySet) -> Self {
        CounterCommand::FaultySet(command)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GuardedIncrement {
    by: i64,
    max: i64,
}

impl Command<Counter> for GuardedIncrement {
    type Output = i64;

    fn prepare(&self, model: &Counter) -> Result<(), CommandError> {
        if model.n + self.by > self.max {
            return Err(CommandError::rejected("invalid"));
        }
        Ok(())
    }

    fn execute(&self, model: &mut Counter) -> Result<i64, CommandError> {
        model.n += self.by;
        Ok(model.n)
    }
}

impl From<GuardedIncrement> for CounterCommand {
    fn from(command: GuardedIncrement) -> Self {
        CounterCommand::GuardedIncrement(command)
    }
}

/// Holds the write lock for a while; used to provoke lock timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SlowSet {
    value: i64,
    hold_ms: u64,
}

impl Command<Counter> for SlowSet {
    type Output = ();

    fn execute(&self, model: &mut Counter) -> Result<(), CommandError> {
        thread::sleep(Duration::from_millis(self.hold_ms));
        model.n = self.value;
        Ok(())
    }
}

impl From<SlowSet> for CounterCommand {
    fn from(command: SlowSet) -> Self {
        CounterCommand::SlowSet(command)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PanickySet {
    value: i64,
}

impl Command<Counter> for PanickySet {
    type Output = ();

    fn execute(&self, model: &mut Counter) -> Result<(), CommandError> {
        model.n = self.value;
        panic!("wild command");
    }
}

impl From<PanickySet> for CounterCommand {
    fn from(command: PanickySet) -> Self {
        CounterCommand::PanickySet(command)
    }
}

fn get_n(engine: &Engine<Counter>) -> i64 {
    engine.query(|counter: &Counter| counter.n).unwrap()
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn create_execute_reopen() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path().join("store")).with_clone_commands(true);

    let engine = Engine::create(Counter::with(0), config.clone()).unwrap();
    let result = engine.execute(Increment { by: 3 }).unwrap();
    assert_eq!(result, 3);
    engine.close().unwrap();

    let engine = Engine::<Counter>::load(config).unwrap();
    assert_eq!(get_n(&engine), 3);
}

#[test]
fn failed_command_rolls_back_and_leaves_no_journal_trace() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path().join("store"));

    let engine = Engine::create(Counter::with(5), config.clone()).unwrap();
    let err = engine.execute(FaultySet { value: 99 }).unwrap_err();
    assert!(matches!(err, EngineError::CommandFailed { .. }));
    assert_eq!(get_n(&engine), 5);

    // The engine stays usable after the rollback.
    assert_eq!(engine.execute(Increment { by: 1 }).unwrap(), 6);
    engine.close().unwrap();

    // The failed command was never journaled.
    let engine = Engine::<Counter>::load(config).unwrap();
    assert_eq!(get_n(&engine), 6);
}

#[test]
fn panicking_command_rolls_back() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::create(
        Counter::with(7),
        EngineConfig::new(temp.path().join("store")),
    )
    .unwrap();

    let err = engine.execute(PanickySet { value: 41 }).unwrap_err();
    assert!(matches!(err, EngineError::CommandFailed { .. }));
    assert_eq!(get_n(&engine), 7);
}

#[test]
fn rejected_command_surfaces_unchanged() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::create(
        Counter::with(10),
        EngineConfig::new(temp.path().join("store")),
    )
    .unwrap();

    let err = engine.execute(GuardedIncrement { by: 5, max: 12 }).unwrap_err();
    match err {
        EngineError::CommandRejected { reason } => assert_eq!(reason, "invalid"),
        other => panic!("expected CommandRejected, got {other:?}"),
    }
    assert_eq!(get_n(&engine), 10);

    assert_eq!(
        engine.execute(GuardedIncrement { by: 2, max: 12 }).unwrap(),
        12
    );
}

#[test]
fn after_restore_snapshot_empties_the_replay_path() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path().join("store"))
        .with_snapshot_behavior(SnapshotBehavior::AfterRestore);

    let engine = Engine::create(Counter::with(0), config.clone()).unwrap();
    for _ in 0..10 {
        engine.execute(Increment { by: 1 }).unwrap();
    }
    engine.close().unwrap();

    // Reopen replays the ten commands, then checkpoints them away.
    let engine = Engine::<Counter>::load(config.clone()).unwrap();
    assert_eq!(engine.restore_stats().commands_replayed, 10);
    assert_eq!(get_n(&engine), 10);
    engine.close().unwrap();

    let storage = FileStorage::new(temp.path().join("store"), JsonCodec);
    let snapshots = Storage::<Counter>::list_snapshots(&storage).unwrap();
    assert!(
        snapshots.iter().any(|info| info.name == "auto"),
        "expected an auto snapshot, got {snapshots:?}"
    );

    // A second reopen starts from that snapshot and replays nothing.
    let engine = Engine::<Counter>::load(config).unwrap();
    assert_eq!(engine.restore_stats().commands_replayed, 0);
    assert_eq!(get_n(&engine), 10);
}

#[test]
fn on_shutdown_snapshot_is_taken_at_close() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path().join("store"))
        .with_snapshot_behavior(SnapshotBehavior::OnShutdown);

    let engine = Engine::create(Counter::with(0), config.clone()).unwrap();
    for _ in 0..4 {
        engine.execute(Increment { by: 2 }).unwrap();
    }
    engine.close().unwrap();

    let engine = Engine::<Counter>::load(config).unwrap();
    assert_eq!(engine.restore_stats().commands_replayed, 0);
    assert_eq!(get_n(&engine), 8);
}

#[test]
fn concurrent_readers_observe_monotonic_prefixes() {
    const READERS: usize = 8;
    const QUERIES_PER_READER: usize = 10_000;
    const INCREMENTS: i64 = 1_000;

    init_tracing();
    let temp = TempDir::new().unwrap();
    let engine = Engine::create(
        Counter::with(0),
        EngineConfig::new(temp.path().join("store")),
    )
    .unwrap();

    thread::scope(|scope| {
        for _ in 0..READERS {
            scope.spawn(|| {
                let mut last = 0i64;
                for _ in 0..QUERIES_PER_READER {
                    let n = get_n(&engine);
                    assert!((0..=INCREMENTS).contains(&n), "observed n out of range: {n}");
                    assert!(n >= last, "observed n went backwards: {n} < {last}");
                    last = n;
                }
            });
        }

        scope.spawn(|| {
            for _ in 0..INCREMENTS {
                engine.execute(Increment { by: 1 }).unwrap();
            }
        });
    });

    assert_eq!(get_n(&engine), INCREMENTS);
}

#[test]
fn lock_timeout_surfaces_and_engine_recovers() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path().join("store"))
        .with_lock_timeout(Duration::from_millis(50));
    let engine = Engine::create(Counter::with(0), config).unwrap();

    let slow_engine = engine.clone();
    let slow = thread::spawn(move || {
        slow_engine
            .execute(SlowSet {
                value: 1,
                hold_ms: 400,
            })
            .unwrap();
    });

    // Let the slow command take the write lock first.
    thread::sleep(Duration::from_millis(100));
    let err = engine.execute(Increment { by: 1 }).unwrap_err();
    assert!(matches!(err, EngineError::LockTimeout { .. }));

    slow.join().unwrap();
    assert_eq!(engine.execute(Increment { by: 1 }).unwrap(), 2);
}

#[test]
fn cloned_results_are_detached_from_the_model() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::create(
        Counter::with(3),
        EngineConfig::new(temp.path().join("store")).with_clone_results(true),
    )
    .unwrap();

    let mut digits = engine
        .query(|counter: &Counter| vec![counter.n, counter.n * 10])
        .unwrap();
    digits.push(-1);
    assert_eq!(
        engine
            .query(|counter: &Counter| vec![counter.n, counter.n * 10])
            .unwrap(),
        vec![3, 30]
    );
    assert_eq!(engine.execute(Increment { by: 1 }).unwrap(), 4);
}

#[test]
fn consecutive_snapshots_decode_equal() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");
    let engine = Engine::create(Counter::with(0), EngineConfig::new(&root)).unwrap();
    engine.execute(Increment { by: 2 }).unwrap();

    engine.create_snapshot("first").unwrap();
    engine.create_snapshot("second").unwrap();
    engine.close().unwrap();

    let storage = FileStorage::new(&root, JsonCodec);
    let snapshots = Storage::<Counter>::list_snapshots(&storage).unwrap();
    let mut tail = snapshots.iter().rev();
    let second = tail.next().unwrap();
    let first = tail.next().unwrap();
    assert_eq!(second.name, "second");
    assert_eq!(first.name, "first");
    assert_eq!(second.resume_segment, first.resume_segment.next());

    let first_model: Counter =
        serde_json::from_slice(&std::fs::read(&first.path).unwrap()).unwrap();
    let second_model: Counter =
        serde_json::from_slice(&std::fs::read(&second.path).unwrap()).unwrap();
    assert_eq!(first_model, second_model);
}

#[test]
fn snapshot_rotation_starts_a_fresh_segment() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path().join("store"));

    let engine = Engine::create(Counter::with(0), config.clone()).unwrap();
    engine.execute(Increment { by: 1 }).unwrap();
    engine.create_snapshot("mark").unwrap();
    engine.close().unwrap();

    // Recovery resumes at the rotated segment and replays nothing.
    let engine = Engine::<Counter>::load(config.clone()).unwrap();
    let stats = engine.restore_stats();
    assert_eq!(stats.resume_segment, SegmentId::new(1));
    assert_eq!(stats.commands_replayed, 0);

    // The next accepted command lands in the rotated segment.
    engine.execute(Increment { by: 1 }).unwrap();
    engine.close().unwrap();

    let engine = Engine::<Counter>::load(config).unwrap();
    assert_eq!(engine.restore_stats().commands_replayed, 1);
    assert_eq!(get_n(&engine), 2);
}

#[test]
fn load_or_create_round_trip() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path().join("store"));

    let engine = Engine::load_or_create(|| Counter::with(100), config.clone()).unwrap();
    assert_eq!(get_n(&engine), 100);
    engine.execute(Increment { by: 1 }).unwrap();
    engine.close().unwrap();

    // Second call loads; the constructor must not run again.
    let engine = Engine::load_or_create(|| Counter::with(0), config).unwrap();
    assert_eq!(get_n(&engine), 101);
}

struct AdminOnlyCommands;

impl Authorizer for AdminOnlyCommands {
    fn allows(&self, operation: &Operation<'_>, identity: &Identity) -> bool {
        match operation {
            Operation::Command { .. } => identity.name() == "admin",
            _ => true,
        }
    }
}

#[test]
fn identity_scopes_authorization() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::builder(EngineConfig::new(temp.path().join("store")))
        .authorizer(Arc::new(AdminOnlyCommands))
        .create(Counter::with(0))
        .unwrap();

    let err = engine.execute(Increment { by: 1 }).unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized { .. }));

    let n = auth::run_as(Identity::named("admin"), || {
        engine.execute(Increment { by: 1 }).unwrap()
    });
    assert_eq!(n, 1);

    // Queries stay open to everyone under this policy.
    assert_eq!(get_n(&engine), 1);
}
