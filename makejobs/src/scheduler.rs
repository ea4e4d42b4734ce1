//! The parallel job scheduler.
//!
//! A [`Scheduler`] owns the job table, the console and the run-wide
//! counters for one build process. Targets are handed to it by the graph;
//! each becomes one shell reading a generated script, supervised until it
//! exits. Everything happens on the calling thread: concurrency comes from
//! the child processes alone.

mod driver;
mod interrupt;

use std::fmt;
use std::io::{self, ErrorKind, Seek, SeekFrom, Write};
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, error};

use crate::compat;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::JobStatus;
use crate::graph::{Expander, Graph, Special, TargetAttrs, Verbatim};
use crate::job::{Job, JobFlags};
use crate::output::{Console, OutputChannel, Source};
use crate::script::{Script, ScriptBuilder};
use crate::shell::Shell;
use crate::table::JobTable;
use crate::target;
use crate::token::TokenCoordinator;
use crate::types::TargetId;

/// Why no new jobs are being admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Abort {
    /// A job failed and keep-going is off.
    Error,
    /// A terminating signal arrived.
    Interrupt,
    /// [`Scheduler::wait`] is draining the table.
    Wait,
}

/// Outcome of asking for a target to be built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// A shell was started.
    Running,
    /// Nothing had to run; the graph has been told.
    Finished,
    /// The target cannot be built.
    Error,
    /// No free slot; the job waits in the stopped queue.
    Stopped,
}

pub struct Scheduler<G: Graph> {
    graph: G,
    expander: Box<dyn Expander>,
    shell: Shell,
    config: Config,
    table: JobTable,
    console: Console,
    aborting: Option<Abort>,
    errors: usize,
    end: TargetId,
}

impl<G: Graph> Scheduler<G> {
    /// Sets up a scheduler whose token role comes from the environment.
    pub fn new(graph: G, config: Config) -> Result<Self> {
        let tokens = TokenCoordinator::init(config.max_jobs)?;
        Ok(Self::with_tokens(graph, config, tokens))
    }

    pub fn with_tokens(mut graph: G, config: Config, tokens: TokenCoordinator) -> Self {
        let end = graph.special_or_create(Special::End);
        let mut scheduler = Self {
            graph,
            expander: Box::new(Verbatim),
            shell: Shell::default(),
            config,
            table: JobTable::new(tokens),
            console: Console::stdout(),
            aborting: None,
            errors: 0,
            end,
        };
        scheduler.update_banners();
        scheduler
    }

    pub fn with_shell(mut self, shell: Shell) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_expander(mut self, expander: impl Expander + 'static) -> Self {
        self.expander = Box::new(expander);
        self
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self.update_banners();
        self
    }

    /// Banners only help when output from several jobs can interleave.
    fn update_banners(&mut self) {
        let tokens = self.table.tokens();
        let single = tokens.max_jobs() == 1 && !tokens.shared();
        self.console.set_banners(self.config.verbose && !single);
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut G {
        &mut self.graph
    }

    pub fn table(&self) -> &JobTable {
        &self.table
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fatal job errors so far.
    pub fn errors(&self) -> usize {
        self.errors
    }

    pub fn aborting(&self) -> Option<Abort> {
        self.aborting
    }

    /// Starts building `target`.
    pub fn make(&mut self, target: TargetId) -> Result<JobState> {
        self.start(target, JobFlags::empty())
    }

    /// Builds the script for `target` and runs it, queues it, or settles it
    /// on the spot when there is nothing to run.
    pub fn start(&mut self, target: TargetId, flags: JobFlags) -> Result<JobState> {
        let attrs = self.graph.attrs(target);
        let mut flags = flags | JobFlags::FIRST;
        if self.config.ignore_errors || attrs.contains(TargetAttrs::IGNORE) {
            flags |= JobFlags::IGNERR;
        }
        if self.config.silent || attrs.contains(TargetAttrs::SILENT) {
            flags |= JobFlags::SILENT;
        }
        let name = self.graph.name(target).to_string();
        let commands_ok =
            target::check_commands(&mut self.graph, &mut self.console, &self.config, target)?;

        let executing =
            attrs.contains(TargetAttrs::MAKE) || (!self.config.no_execute && !self.config.touch);
        let mut deferred = Vec::new();
        if executing {
            if !commands_ok {
                return Ok(self.unbuildable(target));
            }
            let script = ScriptBuilder::new(&self.shell, &*self.expander, flags)
                .loud(self.config.loud)
                .build(&name, self.graph.commands(target));
            if script.commands > 0 {
                return self.launch(target, name, flags, script);
            }
            deferred = script.deferred;
        } else if self.config.no_execute {
            self.console.banner(target, &name)?;
            if commands_ok {
                let script = ScriptBuilder::new(&self.shell, &*self.expander, flags)
                    .loud(self.config.loud)
                    .dry_run(true)
                    .build(&name, self.graph.commands(target));
                self.console.write_bytes(script.text.as_bytes())?;
                for line in &script.forced {
                    compat::run_forced(
                        &self.shell,
                        &self.config,
                        &mut self.console,
                        line,
                        flags.contains(JobFlags::SILENT),
                        flags.contains(JobFlags::IGNERR),
                    )?;
                }
                deferred = script.deferred;
            }
        } else if commands_ok {
            target::touch(
                &self.graph,
                &mut self.console,
                &self.config,
                target,
                flags.contains(JobFlags::SILENT),
            )?;
        }

        if !commands_ok {
            return Ok(self.unbuildable(target));
        }
        if self.aborting.is_none() {
            self.defer(&name, &deferred);
            self.graph.job_complete(target);
        }
        Ok(JobState::Finished)
    }

    fn unbuildable(&mut self, target: TargetId) -> JobState {
        self.errors += 1;
        self.graph.job_failed(target);
        JobState::Error
    }

    /// Appends commands found after `...` to `.END`.
    fn defer(&mut self, name: &str, deferred: &[String]) {
        for command in deferred {
            let line = self.expander.expand(command, name);
            self.graph.push_command(self.end, line);
        }
    }

    fn launch(
        &mut self,
        target: TargetId,
        name: String,
        flags: JobFlags,
        script: Script,
    ) -> Result<JobState> {
        let mut file = tempfile::tempfile().map_err(Error::TempFile)?;
        file.write_all(script.text.as_bytes())?;
        file.seek(SeekFrom::Start(0))?;

        let output = if self.config.use_pipes {
            OutputChannel::pipe()?
        } else {
            self.console.line(format_args!("Remaking `{}'", name))?;
            OutputChannel::temp_file()?
        };

        let mut job = Job::new(target, name, flags, script.deferred, file, output);
        if !self.table.admits(job.flags) {
            job.flags |= JobFlags::RESTART;
            self.table.park(job);
            return Ok(JobState::Stopped);
        }
        self.exec(job)?;
        Ok(JobState::Running)
    }

    /// Starts the job's shell and enters it into the table.
    fn exec(&mut self, mut job: Job) -> Result<()> {
        self.spawn(&mut job)?;
        self.table.insert(job);
        Ok(())
    }

    fn spawn(&mut self, job: &mut Job) -> Result<()> {
        let argv = self.shell.argv(job.flags);
        debug!(job = %job.name, command = ?argv, "running");

        if job.flags.contains(JobFlags::FIRST) && !job.flags.contains(JobFlags::SILENT) {
            self.console.banner(job.target, &job.name)?;
        }

        let script = job
            .script
            .take()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "job script already used"))?;
        let (stdout, stderr) = job.output.child_stdio()?;
        let child = Command::new(&self.shell.path)
            .arg0(&argv[0])
            .args(&argv[1..])
            .stdin(script)
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|source| Error::Spawn {
                shell: self.shell.path.clone(),
                source,
            })?;
        job.output.spawned();
        job.pid = Some(Pid::from_raw(child.id() as i32));
        // From here on a stop means resume, not start over.
        job.flags.remove(JobFlags::RESTART);
        Ok(())
    }

    fn report(&mut self, target: TargetId, name: &str, message: fmt::Arguments<'_>) -> Result<()> {
        if self.config.use_pipes {
            self.console.banner(target, name)?;
        }
        self.console.line(message)?;
        Ok(())
    }

    /// Settles a job the table no longer holds, according to what became
    /// of its shell.
    pub(crate) fn finish_job(&mut self, mut job: Job, status: JobStatus) -> Result<()> {
        let (target, name) = (job.target, job.name.clone());
        let success = match status {
            JobStatus::Stopped { signal } => {
                debug!(job = %name, "stopped");
                self.report(
                    target,
                    &name,
                    format_args!("*** Stopped -- signal {}", signal as i32),
                )?;
                job.flags |= JobFlags::RESUME;
                self.table.park(job);
                return Ok(());
            }
            JobStatus::Continued => {
                if job.flags.intersects(JobFlags::RESUME | JobFlags::RESTART) {
                    self.report(target, &name, format_args!("*** Continued"))?;
                }
                job.flags.remove(JobFlags::RESUME | JobFlags::CONTINUING);
                self.table.insert(job);
                return Ok(());
            }
            JobStatus::Exited { code } => {
                self.close_output(&mut job)?;
                if code == 0 {
                    if self.config.debug_jobs {
                        self.report(target, &name, format_args!("*** Completed successfully"))?;
                    }
                    true
                } else {
                    let ignored = job.flags.contains(JobFlags::IGNERR);
                    let note = if ignored { "(ignored)" } else { "" };
                    self.report(target, &name, format_args!("*** Error code {}{}", code, note))?;
                    ignored
                }
            }
            JobStatus::Killed { signal } => {
                self.close_output(&mut job)?;
                self.report(target, &name, format_args!("*** Signal {}", signal as i32))?;
                false
            }
        };

        if !success {
            self.errors += 1;
            self.graph.job_failed(target);
        } else if !matches!(self.aborting, Some(Abort::Error) | Some(Abort::Interrupt)) {
            self.defer(&name, &job.deferred);
            self.graph.job_complete(target);
        }
        drop(job);

        self.restart_queued()?;
        if self.errors > 0 && !self.config.keep_going && self.aborting != Some(Abort::Interrupt) {
            self.aborting = Some(Abort::Error);
        }
        Ok(())
    }

    fn close_output(&mut self, job: &mut Job) -> Result<()> {
        let src = Source {
            target: job.target,
            name: &job.name,
            noise: &self.shell.no_print,
        };
        job.output.close(&mut self.console, src)?;
        Ok(())
    }

    /// Restarts queued jobs for as long as there is room.
    pub fn restart_queued(&mut self) -> Result<()> {
        if self.aborting == Some(Abort::Interrupt) {
            return Ok(());
        }
        while self.table.stopped_len() > 0 && !self.table.is_full(false) {
            match self.table.pop_stopped() {
                Some(job) => {
                    debug!(job = %job.name, "restarting a stopped job");
                    self.restart_job(job)?;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Starts a job that never ran, or continues one that was stopped.
    fn restart_job(&mut self, mut job: Job) -> Result<()> {
        if !self.table.admits(job.flags) {
            debug!(job = %job.name, "table full, holding");
            self.table.hold(job);
            return Ok(());
        }
        let pid = match job.pid {
            Some(pid) if !job.flags.contains(JobFlags::RESTART) => pid,
            _ => {
                return match self.spawn(&mut job) {
                    Ok(()) => {
                        self.table.insert(job);
                        Ok(())
                    }
                    Err(e) => {
                        error!("couldn't restart {}: {}", job.name, e);
                        self.finish_job(job, JobStatus::Exited { code: 1 })
                    }
                };
            }
        };
        match killpg(pid, Signal::SIGCONT) {
            Ok(()) => {
                job.flags |= JobFlags::CONTINUING;
                self.finish_job(job, JobStatus::Continued)
            }
            Err(e) => {
                error!("couldn't resume {}: {}", job.name, e);
                self.finish_job(job, JobStatus::Exited { code: 1 })
            }
        }
    }
}
