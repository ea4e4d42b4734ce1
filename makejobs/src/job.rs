use std::fs::File;

use bitflags::bitflags;
use nix::unistd::Pid;

use crate::output::OutputChannel;
use crate::types::{Recipe, TargetId};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct JobFlags: u16 {
        /// A non-zero exit is reported but not fatal.
        const IGNERR = 0x001;
        /// Commands are not echoed.
        const SILENT = 0x002;
        /// May run while the table is full (`.BEGIN`, `.END`, `.INTERRUPT`).
        const SPECIAL = 0x004;
        /// `...` lines are skipped instead of deferring the rest.
        const IGNDOTS = 0x008;
        /// First start of this job for its target.
        const FIRST = 0x020;
        /// Queued before its shell was ever started.
        const RESTART = 0x080;
        /// Stopped by job control; needs a `SIGCONT`.
        const RESUME = 0x100;
        /// Set while a resume is being processed.
        const CONTINUING = 0x200;
    }
}

/// A target's recipe in flight: one shell, its script and its output.
pub struct Job {
    pub(crate) pid: Option<Pid>,
    pub(crate) target: TargetId,
    pub(crate) name: String,
    pub(crate) flags: JobFlags,
    /// Commands after `...`, appended to `.END` once the job succeeds.
    pub(crate) deferred: Recipe,
    /// The generated script; handed to the shell as stdin and dropped once
    /// the shell has started.
    pub(crate) script: Option<File>,
    pub(crate) output: OutputChannel,
}

impl Job {
    pub(crate) fn new(
        target: TargetId,
        name: String,
        flags: JobFlags,
        deferred: Recipe,
        script: File,
        output: OutputChannel,
    ) -> Self {
        Self {
            pid: None,
            target,
            name,
            flags,
            deferred,
            script: Some(script),
            output,
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> JobFlags {
        self.flags
    }

    pub fn deferred(&self) -> &[String] {
        &self.deferred
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("pid", &self.pid)
            .field("target", &self.target)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}
