use std::collections::VecDeque;

use nix::unistd::Pid;
use tracing::debug;

use crate::job::{Job, JobFlags};
use crate::token::TokenCoordinator;

/// Running and stopped jobs, and the slot accounting that decides whether
/// another one may start.
///
/// Jobs move between the two collections by value, so a job is never in
/// both at once.
#[derive(Debug)]
pub struct JobTable {
    running: Vec<Job>,
    stopped: VecDeque<Job>,
    tokens: TokenCoordinator,
}

impl JobTable {
    pub fn new(tokens: TokenCoordinator) -> Self {
        Self {
            running: Vec::new(),
            stopped: VecDeque::new(),
            tokens,
        }
    }

    /// Number of running jobs.
    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn running(&self) -> &[Job] {
        &self.running
    }

    pub(crate) fn running_mut(&mut self) -> &mut [Job] {
        &mut self.running
    }

    pub fn stopped(&self) -> impl Iterator<Item = &Job> {
        self.stopped.iter()
    }

    pub fn stopped_len(&self) -> usize {
        self.stopped.len()
    }

    pub fn tokens(&self) -> &TokenCoordinator {
        &self.tokens
    }

    pub fn tokens_mut(&mut self) -> &mut TokenCoordinator {
        &mut self.tokens
    }

    pub fn max_jobs(&self) -> usize {
        self.tokens.max_jobs()
    }

    /// True when nothing more may start, after trying for a shared token.
    pub fn is_full(&mut self, aborting: bool) -> bool {
        self.tokens.acquire(aborting)
    }

    /// Whether a job with `flags` may start right now. Special jobs get in
    /// regardless of the limit.
    pub fn admits(&self, flags: JobFlags) -> bool {
        flags.contains(JobFlags::SPECIAL) || self.running.len() < self.tokens.max_jobs()
    }

    pub(crate) fn insert(&mut self, job: Job) {
        debug!(job = %job.name, pid = ?job.pid, "job running");
        self.running.push(job);
        self.tokens.admitted(self.running.len());
    }

    /// Removes the running job with `pid`, handing back its slot.
    pub(crate) fn remove(&mut self, pid: Pid) -> Option<Job> {
        let idx = self.running.iter().position(|j| j.pid == Some(pid))?;
        let job = self.running.remove(idx);
        self.tokens.release(self.running.len());
        Some(job)
    }

    /// Removes a stopped job with `pid`, for a resume the kernel reported
    /// before we did it ourselves.
    pub(crate) fn remove_stopped(&mut self, pid: Pid) -> Option<Job> {
        let idx = self.stopped.iter().position(|j| j.pid == Some(pid))?;
        self.stopped.remove(idx)
    }

    /// Parks a job at the back of the queue. A job that never got to run
    /// also marks the table full.
    pub(crate) fn park(&mut self, job: Job) {
        if job.flags.contains(JobFlags::RESTART) {
            self.tokens.hold();
        }
        debug!(job = %job.name, flags = ?job.flags, "job queued");
        self.stopped.push_back(job);
    }

    /// Puts a job back at the head of the queue when it still cannot run.
    pub(crate) fn hold(&mut self, job: Job) {
        self.tokens.hold();
        self.stopped.push_front(job);
    }

    pub(crate) fn pop_stopped(&mut self) -> Option<Job> {
        self.stopped.pop_front()
    }
}
