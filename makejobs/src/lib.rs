//! Parallel job scheduling for a make-style build tool.
//!
//! The graph of targets is someone else's business: a [`Graph`] hands the
//! [`Scheduler`] targets that are ready, and hears back when each one is
//! done. The scheduler turns recipes into shell scripts, runs as many at a
//! time as it holds slots for, collects their output and reacts to signals.
//! Slots can be shared with recursive builds through a token FIFO whose path
//! travels in [`JOBS_FIFO_VAR`].

pub mod compat;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod job;
pub mod output;
pub mod proc;
pub mod scheduler;
pub mod script;
pub mod shell;
pub mod signals;
pub mod table;
pub mod target;
pub mod token;
pub mod types;

pub use compat::CompatRunner;
pub use config::Config;
pub use error::{Error, Result};
pub use events::JobStatus;
pub use graph::{Expander, Graph, MemoryGraph, Special, TargetAttrs, Verbatim};
pub use job::JobFlags;
pub use output::{Console, SharedBuffer};
pub use scheduler::{Abort, JobState, Scheduler};
pub use shell::Shell;
pub use token::{Role, TokenCoordinator};
pub use types::{TargetId, JOBS_FIFO_VAR};

use std::sync::{Mutex, MutexGuard};

static CHILDREN: Mutex<()> = Mutex::new(());

/// Serializes tests that start child processes. The scheduler reaps with
/// `waitpid(-1)`, which would happily collect another test's children.
///
/// Public only because the integration tests under `tests/` are separate
/// crates and cannot see `#[cfg(test)]` items. Hidden from the docs and
/// not part of the API; the `mkjobs` tests run the binary and never call it.
#[doc(hidden)]
pub fn test_lock() -> MutexGuard<'static, ()> {
    CHILDREN.lock().unwrap_or_else(|e| e.into_inner())
}
