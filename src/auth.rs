//! Caller identity and operation authorization.
//!
//! Identity is ambient per thread: callers establish who they are with
//! [`run_as`] and the engine reads [`Identity::current`] before taking any
//! lock. Authorization therefore costs nothing when it denies.

use std::cell::RefCell;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    name: String,
}

impl Identity {
    pub fn named(name: impl Into<String>) -> Self {
        Identity { name: name.into() }
    }

    pub fn anonymous() -> Self {
        Identity::named("anonymous")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The identity established on the current thread, or anonymous.
    pub fn current() -> Identity {
        CURRENT.with(|cell| cell.borrow().clone().unwrap_or_else(Identity::anonymous))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Identity>> = const { RefCell::new(None) };
}

/// Run `f` with `identity` as the current thread's caller identity.
///
/// The previous identity is restored on exit, including on panic.
pub fn run_as<R>(identity: Identity, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Identity>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            CURRENT.with(|cell| *cell.borrow_mut() = previous);
        }
    }

    let previous = CURRENT.with(|cell| cell.borrow_mut().replace(identity));
    let _restore = Restore(previous);
    f()
}

/// Classification of an engine call for authorization purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation<'a> {
    Command { type_name: &'a str },
    Query { type_name: &'a str },
    Snapshot,
}

impl fmt::Display for Operation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Command { type_name } => write!(f, "command `{type_name}`"),
            Operation::Query { type_name } => write!(f, "query `{type_name}`"),
            Operation::Snapshot => f.write_str("snapshot"),
        }
    }
}

/// Decides whether an identity may run an operation class.
///
/// Resolved once at engine construction: a model that exposes its own
/// authorizer handle wins over the builder-configured one, which wins over
/// [`AllowAll`]. Checks run before locking or cloning.
pub trait Authorizer: Send + Sync {
    fn allows(&self, operation: &Operation<'_>, identity: &Identity) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn allows(&self, _operation: &Operation<'_>, _identity: &Identity) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_defaults_to_anonymous() {
        assert_eq!(Identity::current(), Identity::anonymous());
    }

    #[test]
    fn run_as_scopes_identity() {
        let seen = run_as(Identity::named("alice"), Identity::current);
        assert_eq!(seen.name(), "alice");
        assert_eq!(Identity::current(), Identity::anonymous());
    }

    #[test]
    fn run_as_nests_and_restores() {
        run_as(Identity::named("outer"), || {
            assert_eq!(Identity::current().name(), "outer");
            run_as(Identity::named("inner"), || {
                assert_eq!(Identity::current().name(), "inner");
            });
            assert_eq!(Identity::current().name(), "outer");
        });
    }

    #[test]
    fn operation_display() {
        let op = Operation::Command {
            type_name: "Increment",
        };
        assert_eq!(op.to_string(), "command `Increment`");
        assert_eq!(Operation::Snapshot.to_string(), "snapshot");
    }
}
