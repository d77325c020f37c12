//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When the engine takes snapshots on its own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotBehavior {
    /// No automatic snapshots; the caller drives.
    #[default]
    None,
    /// After a successful open, take a snapshot named `"auto"` on a
    /// background worker. The worker holds the read lock before the
    /// constructor returns, so the snapshot orders ahead of any command
    /// issued after construction.
    AfterRestore,
    /// On `close()`, take a snapshot named `"auto"` before sealing the
    /// journal.
    OnShutdown,
}

/// Engine options, cloned at construction and immutable thereafter.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backing-store directory.
    pub location: PathBuf,
    /// Clone each command before running it, so mutations inside the command
    /// value cannot leak into the copy written to the journal.
    pub clone_commands: bool,
    /// Deep-clone query/command results before returning them, so callers
    /// cannot retain shared structure into the live model.
    pub clone_results: bool,
    pub snapshot_behavior: SnapshotBehavior,
    /// Maximum wait on any lock acquisition.
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            location: PathBuf::from("prevail-store"),
            clone_commands: false,
            clone_results: false,
            snapshot_behavior: SnapshotBehavior::default(),
            lock_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        EngineConfig {
            location: location.into(),
            ..EngineConfig::default()
        }
    }

    /// Configuration with the location derived from the model's type name.
    pub fn for_model<M: ?Sized>() -> Self {
        EngineConfig::new(location_for_type::<M>())
    }

    pub fn with_clone_commands(mut self, on: bool) -> Self {
        self.clone_commands = on;
        self
    }

    pub fn with_clone_results(mut self, on: bool) -> Self {
        self.clone_results = on;
        self
    }

    pub fn with_snapshot_behavior(mut self, behavior: SnapshotBehavior) -> Self {
        self.snapshot_behavior = behavior;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// Default store directory for a model type: the unqualified type name with
/// a `.prevail` suffix, sanitized for the filesystem.
pub fn location_for_type<M: ?Sized>() -> PathBuf {
    let full = std::any::type_name::<M>();
    let tail = full.rsplit("::").next().unwrap_or(full);
    let sanitized: String = tail
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    PathBuf::from(format!("{sanitized}.prevail"))
}
