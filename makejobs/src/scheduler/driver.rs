use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::{Abort, Scheduler};
use crate::error::{Error, Result};
use crate::events::JobStatus;
use crate::graph::{Graph, Special};
use crate::job::JobFlags;
use crate::output::Source;

/// Longest time spent waiting for output before looking at signals and
/// children again.
const POLL_TIMEOUT_MS: u16 = 2000;

impl<G: Graph> Scheduler<G> {
    /// True when no further job may start. A table that is full only for
    /// lack of a shared token first tries to take one.
    pub fn is_full(&mut self) -> bool {
        self.table.is_full(self.aborting.is_some())
    }

    /// True when nothing runs and nothing waits to run. An idle table with
    /// queued jobs restarts them instead, unless the run is aborting.
    pub fn is_empty(&mut self) -> Result<bool> {
        if !self.table.is_empty() {
            return Ok(false);
        }
        if self.table.stopped_len() > 0 && self.aborting.is_none() {
            if self.table.max_jobs() > 0 {
                self.table.tokens_mut().clear_full();
            }
            self.restart_queued()?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Waits up to two seconds for job output (and, with `want_token`,
    /// for a token to turn up in the shared pool) and forwards what
    /// arrived.
    pub fn catch_output(&mut self, want_token: bool) -> Result<()> {
        self.console.flush()?;
        if self.table.running().iter().any(|j| j.output.at_eof()) {
            // Somebody is about to be reaped; don't sleep on the others.
            return Ok(());
        }

        let ready: Vec<usize> = {
            let mut owners = Vec::new();
            let mut fds = Vec::new();
            if self.config.use_pipes {
                for (i, job) in self.table.running().iter().enumerate() {
                    if let Some(fd) = job.output.poll_fd() {
                        owners.push(i);
                        fds.push(PollFd::new(fd, PollFlags::POLLIN));
                    }
                }
            }
            let token_fd = if want_token && (self.config.use_pipes || self.table.is_empty()) {
                self.table.tokens().wait_fd()
            } else {
                None
            };
            if let Some(fd) = token_fd {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
            }
            if fds.is_empty() {
                Vec::new()
            } else {
                match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                    Ok(0) | Err(Errno::EINTR) => Vec::new(),
                    Ok(_) => owners
                        .iter()
                        .zip(fds.iter())
                        .filter(|(_, fd)| {
                            fd.revents().map_or(false, |r| {
                                r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)
                            })
                        })
                        .map(|(&i, _)| i)
                        .collect(),
                    Err(e) => return Err(Error::Sys(e)),
                }
            }
        };

        for i in ready {
            let job = &mut self.table.running_mut()[i];
            let src = Source {
                target: job.target,
                name: &job.name,
                noise: &self.shell.no_print,
            };
            job.output.drain(&mut self.console, src, false)?;
        }
        self.handle_signals()
    }

    /// Reaps children and settles their jobs. With `block` the first wait
    /// sleeps until some child changes state or a signal arrives.
    pub fn catch_children(&mut self, block: bool) -> Result<()> {
        if self.table.is_empty() {
            return Ok(());
        }
        let mut flags = WaitPidFlag::WUNTRACED;
        if !block {
            flags |= WaitPidFlag::WNOHANG;
        }
        loop {
            match waitpid(Pid::from_raw(-1), Some(flags)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    if let Some((pid, status)) = JobStatus::from_wait(status) {
                        debug!(%pid, ?status, "child changed state");
                        self.reaped(pid, status)?;
                    }
                }
                Err(Errno::EINTR) | Err(Errno::ECHILD) => break,
                Err(e) => return Err(Error::Wait(e)),
            }
            flags = WaitPidFlag::WUNTRACED | WaitPidFlag::WNOHANG;
        }
        self.handle_signals()
    }

    fn reaped(&mut self, pid: Pid, status: JobStatus) -> Result<()> {
        if let Some(job) = self.table.remove(pid) {
            return self.finish_job(job, status);
        }
        match self.table.remove_stopped(pid) {
            Some(job) => self.finish_job(job, status),
            None => {
                warn!("child {} not in table?", pid);
                Ok(())
            }
        }
    }

    /// Whether reaping should sleep rather than poll output first.
    fn reap_blocks(&self) -> bool {
        !self.config.use_pipes || self.table.running().iter().any(|j| j.output.at_eof())
    }

    /// One round of the event loop: output, then children.
    pub fn step(&mut self, want_token: bool) -> Result<()> {
        self.catch_output(want_token)?;
        let block = self.reap_blocks();
        self.catch_children(block)
    }

    pub(super) fn drain_table(&mut self) -> Result<()> {
        while !self.table.is_empty() {
            self.step(false)?;
        }
        Ok(())
    }

    /// Lets every running job finish while admitting nothing new.
    pub fn wait(&mut self) -> Result<()> {
        self.aborting = Some(Abort::Wait);
        let drained = self.drain_table();
        self.aborting = None;
        drained
    }

    /// Kills every running job without collecting its output, then reaps
    /// whatever has already died.
    pub fn abort_all(&mut self) {
        self.aborting = Some(Abort::Error);
        let pids: Vec<Pid> = self.table.running().iter().filter_map(|j| j.pid).collect();
        for pid in pids {
            let _ = killpg(pid, Signal::SIGINT);
            let _ = killpg(pid, Signal::SIGKILL);
            self.table.remove(pid);
        }
        while let Ok(status) = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            if status == WaitStatus::StillAlive {
                break;
            }
        }
    }

    /// Runs `.BEGIN`, if there is one, to completion.
    pub fn begin(&mut self) -> Result<()> {
        if let Some(begin) = self.graph.special(Special::Begin) {
            self.start(begin, JobFlags::SPECIAL)?;
            self.drain_table()?;
        }
        Ok(())
    }

    /// Builds everything the graph has to offer: admits ready targets while
    /// there is room, then services output and children, until nothing is
    /// left or an abort has drained the table.
    pub fn run(&mut self) -> Result<()> {
        loop {
            while !self.is_full() {
                match self.graph.next_ready() {
                    Some(target) => {
                        self.make(target)?;
                    }
                    None => break,
                }
            }
            if self.is_empty()? && (self.aborting.is_some() || !self.table.tokens().marked_full()) {
                break;
            }
            self.step(true)?;
        }
        Ok(())
    }

    /// Runs `.END` unless something failed, releases the token pool and
    /// returns the number of errors.
    pub fn finish(mut self) -> Result<usize> {
        if !self.graph.commands(self.end).is_empty() {
            if self.errors > 0 {
                self.console.line(format_args!("Errors reported so .END ignored"))?;
            } else {
                self.start(self.end, JobFlags::SPECIAL | JobFlags::IGNDOTS)?;
                self.drain_table()?;
            }
        }
        self.console.flush()?;
        self.table.tokens_mut().teardown()?;
        Ok(self.errors)
    }
}
